//! Brand clustering and best-stream selection
//!
//! Variants of one brand ("ABC East", "ABC HD", "ABC 2") share a canonical
//! brand key. Guide links propagate within a cluster only when the link is
//! unambiguous; once channels are linked, same-tvg_id groups collapse to the
//! best encoding.

use std::collections::{HashMap, HashSet};

use crate::catalog::LiveChannel;

use super::normalize::normalize_channel_name;

/// Trailing variant tokens dropped when deriving the brand key.
const VARIANT_TOKENS: &[&str] = &["east", "west", "plus", "extra", "backup", "alt", "feed"];

fn is_variant_token(token: &str) -> bool {
    VARIANT_TOKENS.contains(&token) || token.chars().all(|c| c.is_ascii_digit())
}

/// Canonical brand of a channel name: normalized, with trailing variant
/// tokens removed. A name that is nothing but variant tokens keeps its
/// normalized form.
pub fn canonical_brand(name: &str) -> String {
    let normalized = normalize_channel_name(name);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    let mut end = tokens.len();
    while end > 1 && is_variant_token(tokens[end - 1]) {
        end -= 1;
    }

    if end == 0 {
        normalized
    } else {
        tokens[..end].join(" ")
    }
}

/// Tier 7: propagate a tvg_id within each brand cluster when exactly one
/// member is already linked. Returns how many channels were linked.
pub fn inherit_brand_links(channels: &mut [LiveChannel]) -> usize {
    let mut clusters: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, ch) in channels.iter().enumerate() {
        let brand = canonical_brand(&ch.guide_name);
        if !brand.is_empty() {
            clusters.entry(brand).or_default().push(idx);
        }
    }

    let mut affected = 0;
    for indices in clusters.values() {
        let linked: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| channels[i].epg_linked && !channels[i].tvg_id.is_empty())
            .collect();
        if linked.len() != 1 {
            continue;
        }

        let tvg_id = channels[linked[0]].tvg_id.clone();
        for &i in indices {
            if channels[i].tvg_id.is_empty() {
                channels[i].tvg_id = tvg_id.clone();
                channels[i].epg_linked = true;
                affected += 1;
            }
        }
    }
    affected
}

/// Tier 8: within each non-empty tvg_id group keep only the channel with the
/// highest quality tier; ties go to first occurrence. Unlinked channels pass
/// through. Returns (survivors, dropped count).
pub fn select_best_streams(channels: Vec<LiveChannel>) -> (Vec<LiveChannel>, usize) {
    // First pass: the winning index per tvg_id group
    let mut best: HashMap<&str, usize> = HashMap::new();
    for (idx, ch) in channels.iter().enumerate() {
        if ch.tvg_id.is_empty() {
            continue;
        }
        match best.get(ch.tvg_id.as_str()) {
            Some(&winner) if channels[winner].quality_tier >= ch.quality_tier => {}
            _ => {
                best.insert(ch.tvg_id.as_str(), idx);
            }
        }
    }

    let keep: HashSet<usize> = best.values().copied().collect();
    let before = channels.len();
    let survivors: Vec<LiveChannel> = channels
        .into_iter()
        .enumerate()
        .filter(|(idx, ch)| ch.tvg_id.is_empty() || keep.contains(idx))
        .map(|(_, ch)| ch)
        .collect();
    let dropped = before - survivors.len();
    (survivors, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::QualityTier;

    fn channel(name: &str, tvg: &str, tier: QualityTier) -> LiveChannel {
        LiveChannel {
            channel_id: format!("id-{name}"),
            guide_number: "1".into(),
            guide_name: name.to_string(),
            tvg_id: tvg.to_string(),
            tvg_logo: String::new(),
            group_title: String::new(),
            epg_linked: !tvg.is_empty(),
            quality_tier: tier,
            primary_stream_url: format!("http://host/{name}.ts"),
            backup_stream_urls: vec![],
            source_tag: String::new(),
            sdt: None,
        }
    }

    // =========================================================================
    // Brand keys
    // =========================================================================

    #[test]
    fn test_canonical_brand_strips_variants() {
        assert_eq!(canonical_brand("ABC East"), "abc");
        assert_eq!(canonical_brand("ABC HD"), "abc");
        assert_eq!(canonical_brand("ABC 2"), "abc");
        assert_eq!(canonical_brand("ABC"), "abc");
    }

    #[test]
    fn test_canonical_brand_keeps_inner_tokens() {
        assert_eq!(canonical_brand("Sky Sports Main Event"), "sky sports main event");
        // A pure number name keeps itself
        assert_eq!(canonical_brand("5"), "5");
    }

    // =========================================================================
    // Brand inheritance
    // =========================================================================

    #[test]
    fn test_inherit_with_single_linked_member() {
        let mut channels = vec![
            channel("ABC", "abc.us", QualityTier::Hd),
            channel("ABC East", "", QualityTier::Sd),
            channel("ABC 2", "", QualityTier::Sd),
        ];

        let affected = inherit_brand_links(&mut channels);
        assert_eq!(affected, 2);
        assert!(channels.iter().all(|c| c.tvg_id == "abc.us" && c.epg_linked));
    }

    #[test]
    fn test_no_inherit_with_ambiguous_links() {
        let mut channels = vec![
            channel("NBC", "nbc.us", QualityTier::Hd),
            channel("NBC West", "nbc-west.us", QualityTier::Hd),
            channel("NBC 2", "", QualityTier::Sd),
        ];

        let affected = inherit_brand_links(&mut channels);
        assert_eq!(affected, 0);
        assert!(channels[2].tvg_id.is_empty());
    }

    #[test]
    fn test_no_inherit_across_brands() {
        let mut channels = vec![
            channel("ABC", "abc.us", QualityTier::Hd),
            channel("CBS", "", QualityTier::Sd),
        ];

        inherit_brand_links(&mut channels);
        assert!(channels[1].tvg_id.is_empty());
    }

    // =========================================================================
    // Best-stream selection
    // =========================================================================

    #[test]
    fn test_best_stream_keeps_highest_tier() {
        let channels = vec![
            channel("ESPN SD", "espn.us", QualityTier::Sd),
            channel("ESPN HD", "espn.us", QualityTier::Hd),
            channel("ESPN 4K", "espn.us", QualityTier::Uhd),
        ];

        let (survivors, dropped) = select_best_streams(channels);
        assert_eq!(survivors.len(), 1);
        assert_eq!(dropped, 2);
        assert_eq!(survivors[0].guide_name, "ESPN 4K");
    }

    #[test]
    fn test_best_stream_tie_keeps_first() {
        let channels = vec![
            channel("CNN A", "cnn.us", QualityTier::Hd),
            channel("CNN B", "cnn.us", QualityTier::Hd),
        ];

        let (survivors, _) = select_best_streams(channels);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].guide_name, "CNN A");
    }

    #[test]
    fn test_best_stream_passes_unlinked_through() {
        let channels = vec![
            channel("Mystery 1", "", QualityTier::Sd),
            channel("Mystery 2", "", QualityTier::Sd),
        ];

        let (survivors, dropped) = select_best_streams(channels);
        assert_eq!(survivors.len(), 2);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_best_stream_idempotent() {
        let channels = vec![
            channel("ESPN SD", "espn.us", QualityTier::Sd),
            channel("ESPN HD", "espn.us", QualityTier::Hd),
            channel("Solo", "", QualityTier::Sd),
        ];

        let (once, _) = select_best_streams(channels);
        let (twice, dropped) = select_best_streams(once.clone());
        assert_eq!(once, twice);
        assert_eq!(dropped, 0);
    }
}
