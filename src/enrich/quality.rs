//! Quality marker detection
//!
//! Maps the quality markers providers embed in channel names (RAW / 4K / UHD
//! / FHD / HD / SD / resolution suffixes) onto the integer tier used by
//! best-stream selection. "HD" must not fire inside "FHD" or "UHD".

use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::QualityTier;

static UHD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(4K|UHD|2160[pi]?)\b").unwrap());

static HD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(FHD|1080[pi]|720[pi])\b").unwrap());

static SD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSD\b|\b(480[pi]|576[pi])\b").unwrap());

static RAW_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bRAW\b").unwrap());

/// Standalone "HD" that is not the tail of "FHD" or "UHD".
fn has_standalone_hd(name: &str) -> bool {
    let upper = name.to_uppercase();
    let bytes = upper.as_bytes();

    let mut idx = 0;
    while let Some(pos) = upper[idx..].find("HD") {
        let at = idx + pos;
        let preceded_by_f_or_u = at > 0 && matches!(bytes[at - 1], b'F' | b'U');
        let at_word_start = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        let after = at + 2;
        let at_word_end = after >= bytes.len() || !bytes[after].is_ascii_alphanumeric();

        if at_word_start && at_word_end && !preceded_by_f_or_u {
            return true;
        }
        idx = at + 2;
        if idx >= upper.len() {
            break;
        }
    }
    false
}

/// Whether the name carries any explicit quality marker at all.
pub fn has_quality_marker(name: &str) -> bool {
    RAW_REGEX.is_match(name)
        || UHD_REGEX.is_match(name)
        || HD_REGEX.is_match(name)
        || SD_REGEX.is_match(name)
        || has_standalone_hd(name)
}

/// Detect the quality tier of a channel name. Channels without a marker are
/// assumed SD.
pub fn detect_tier(name: &str) -> QualityTier {
    if RAW_REGEX.is_match(name) {
        return QualityTier::Raw;
    }
    if UHD_REGEX.is_match(name) {
        return QualityTier::Uhd;
    }
    if HD_REGEX.is_match(name) || has_standalone_hd(name) {
        return QualityTier::Hd;
    }
    QualityTier::Sd
}
