//! Channel name normalization
//!
//! The single normalization used by every matching tier. Kept pure so the
//! exact behavior is pinned by tests:
//! 1. lowercase
//! 2. strip a leading country tag ("US: ", "UK |", ...)
//! 3. strip quality and noise tokens (hd, uhd, 4k, fhd, sd, raw, 1080p, ...)
//! 4. strip punctuation (keep alphanumeric and spaces)
//! 5. collapse whitespace and trim

use std::sync::LazyLock;

use regex::Regex;

/// Quality / noise tokens removed wherever they appear.
static NOISE_TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(raw|uhd|fhd|4k|hd|sd|2160p|1080p|1080i|720p|576p|480p|h265|hevc)\b").unwrap()
});

/// Leading country tag, e.g. "US: ESPN", "UK | BBC One", "CA - TSN".
static COUNTRY_PREFIX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(us|usa|uk|ca|au|nz|de|fr|es|it|nl|se|no|dk|fi|pl|pt|br|mx|in|intl)\s*[:|\-]\s*")
        .unwrap()
});

static NON_ALNUM_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9\s]").unwrap());

static MULTI_SPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalize a channel name for matching.
///
/// # Examples
///
/// ```
/// use tunebridge::enrich::normalize::normalize_channel_name;
///
/// assert_eq!(normalize_channel_name("US: ESPN HD"), "espn");
/// assert_eq!(normalize_channel_name("BBC One (UK)"), "bbc one uk");
/// assert_eq!(normalize_channel_name("CNN  4K"), "cnn");
/// ```
pub fn normalize_channel_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let without_country = COUNTRY_PREFIX_REGEX.replace(&lowered, "");
    let without_noise = NOISE_TOKEN_REGEX.replace_all(&without_country, " ");
    let without_punct = NON_ALNUM_REGEX.replace_all(&without_noise, " ");
    let collapsed = MULTI_SPACE_REGEX.replace_all(&without_punct, " ");
    collapsed.trim().to_string()
}

/// Normalization with country/region words stripped from anywhere in the
/// name, used by the looser iptv-org sub-tier.
pub fn normalize_stripped(name: &str) -> String {
    static COUNTRY_WORD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(usa?|uk|canada|america|east|west|intl|international)\b").unwrap()
    });

    let base = normalize_channel_name(name);
    let stripped = COUNTRY_WORD_REGEX.replace_all(&base, " ");
    MULTI_SPACE_REGEX.replace_all(&stripped, " ").trim().to_string()
}

/// The last dot-separated segment of a tvg-id, lowercased.
pub fn tvg_short_code(tvg_id: &str) -> Option<String> {
    let last = tvg_id.rsplit('.').next()?.trim().to_lowercase();
    if last.is_empty() {
        None
    } else {
        Some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize_channel_name("ESPN HD"), "espn");
        assert_eq!(normalize_channel_name("ESPN FHD"), "espn");
        assert_eq!(normalize_channel_name("ESPN - 4K"), "espn");
        assert_eq!(normalize_channel_name("CNN  News"), "cnn news");
    }

    #[test]
    fn test_normalize_country_prefix() {
        assert_eq!(normalize_channel_name("US: ESPN"), "espn");
        assert_eq!(normalize_channel_name("UK | BBC One"), "bbc one");
        assert_eq!(normalize_channel_name("CA - TSN 1"), "tsn 1");
    }

    #[test]
    fn test_normalize_keeps_inline_country_words() {
        // Only the *prefix* form is removed by the strict normalization
        assert_eq!(normalize_channel_name("BBC One (UK)"), "bbc one uk");
    }

    #[test]
    fn test_normalize_stripped_removes_country_words() {
        assert_eq!(normalize_stripped("BBC One (UK)"), "bbc one");
        assert_eq!(normalize_stripped("ABC East USA"), "abc");
    }

    #[test]
    fn test_normalize_raw_and_codec_tokens() {
        assert_eq!(normalize_channel_name("TSN1 RAW"), "tsn1");
        assert_eq!(normalize_channel_name("Sky Sports HEVC 1080p"), "sky sports");
    }

    #[test]
    fn test_normalize_idempotent() {
        for name in ["US: ESPN HD", "BBC One (UK)", "Sky  Cinema +1"] {
            let once = normalize_channel_name(name);
            assert_eq!(normalize_channel_name(&once), once);
        }
    }

    #[test]
    fn test_tvg_short_code() {
        assert_eq!(tvg_short_code("guide.espn"), Some("espn".into()));
        assert_eq!(tvg_short_code("BBC1"), Some("bbc1".into()));
        assert_eq!(tvg_short_code(""), None);
    }
}
