//! Lineup shaping
//!
//! The deterministic pipeline that turns the full live catalog into the
//! channel set a tuner instance serves, applied strictly in this order:
//! exclude-regex, category filter, music drop, regional sort profile,
//! skip/take sharding, channel cap, guide number offset.
//!
//! Guide number offsets exist so multiple tuner instances served from one
//! process do not collide in Plex's guide cache.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::LiveChannel;
use crate::config::Config;

/// Plex's DVR setup wizard degrades above ~480 channels; stay under it
/// unless explicitly uncapped.
pub const DEFAULT_MAX_CHANNELS: usize = 479;

/// Region buckets recognized by the classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Region {
    Us,
    Canada,
    Na,
    Uk,
    Europe,
    Nordics,
    EuSouth,
    EuEast,
    Latam,
    Intl,
    Unclassified,
}

impl Region {
    fn from_tag(tag: &str) -> Option<Region> {
        match tag {
            "us" | "usa" => Some(Region::Us),
            "ca" | "canada" => Some(Region::Canada),
            "na" => Some(Region::Na),
            "uk" => Some(Region::Uk),
            "europe" | "eu" => Some(Region::Europe),
            "nordics" => Some(Region::Nordics),
            "eusouth" => Some(Region::EuSouth),
            "eueast" => Some(Region::EuEast),
            "latam" => Some(Region::Latam),
            "intl" | "international" => Some(Region::Intl),
            _ => None,
        }
    }
}

/// Content categories for the `lineup_category` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Sports,
    Movies,
    News,
    Kids,
    Music,
}

static MUSIC_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(music|mtv|vh1|radio|hits|karaoke|concert)\b").unwrap()
});

static CATEGORY_KEYWORDS: &[(Category, &[&str])] = &[
    (Category::Sports, &["sport", "espn", "nfl", "nba", "nhl", "mlb", "golf", "tennis", "racing", "football", "soccer", "fight", "ufc"]),
    (Category::Movies, &["movie", "cinema", "film", "hbo", "showtime", "starz"]),
    (Category::News, &["news", "cnbc", "bloomberg", "weather"]),
    (Category::Kids, &["kids", "cartoon", "nick", "disney", "junior", "family"]),
    (Category::Music, &["music", "mtv", "vh1", "radio"]),
];

fn parse_category(raw: &str) -> Option<Category> {
    match raw.to_ascii_lowercase().as_str() {
        "sports" => Some(Category::Sports),
        "movies" => Some(Category::Movies),
        "news" => Some(Category::News),
        "kids" => Some(Category::Kids),
        "music" => Some(Category::Music),
        _ => None,
    }
}

/// Classify a channel's region from its group-title prefix or name tags.
pub fn classify_region(channel: &LiveChannel) -> Region {
    // Group titles commonly lead with a region tag: "US | Sports", "UK: News"
    let group = channel.group_title.to_ascii_lowercase();
    if let Some(tag) = group.split(|c: char| c == '|' || c == ':' || c == '-').next() {
        if let Some(region) = Region::from_tag(tag.trim()) {
            return region;
        }
    }
    for word in group.split_whitespace() {
        if let Some(region) = Region::from_tag(word) {
            return region;
        }
    }

    // Fall back to a leading tag in the channel name: "US: ESPN"
    let name = channel.guide_name.to_ascii_lowercase();
    if let Some(tag) = name.split(|c: char| c == '|' || c == ':' || c == '-').next() {
        if tag.len() <= 6 {
            if let Some(region) = Region::from_tag(tag.trim()) {
                return region;
            }
        }
    }
    Region::Unclassified
}

fn matches_category(channel: &LiveChannel, category: Category) -> bool {
    // Region tags are also valid category filters
    let haystack = format!(
        "{} {}",
        channel.group_title.to_ascii_lowercase(),
        channel.guide_name.to_ascii_lowercase()
    );
    CATEGORY_KEYWORDS
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k)))
        .unwrap_or(false)
}

/// The music heuristic used by `lineup_drop_music`.
pub fn is_music(channel: &LiveChannel) -> bool {
    MUSIC_REGEX.is_match(&channel.guide_name) || MUSIC_REGEX.is_match(&channel.group_title)
}

#[derive(Debug, Default, Clone)]
pub struct LineupOptions {
    pub exclude_regex: Option<String>,
    pub category: Option<String>,
    pub drop_music: bool,
    pub sort_profile: Option<String>,
    pub skip: usize,
    pub take: Option<usize>,
    pub max_channels: usize,
    pub guide_number_offset: u32,
}

impl LineupOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exclude_regex: config.lineup_exclude_regex.clone(),
            category: config.lineup_category.clone(),
            drop_music: config.lineup_drop_music,
            sort_profile: config.lineup_shape.clone(),
            skip: config.lineup_skip,
            take: config.lineup_take,
            max_channels: config.lineup_max_channels,
            guide_number_offset: config.guide_number_offset,
        }
    }
}

/// Apply the shaping pipeline. Output guide numbers are unique and already
/// offset.
pub fn shape_lineup(channels: &[LiveChannel], opts: &LineupOptions) -> Vec<LiveChannel> {
    let exclude = opts
        .exclude_regex
        .as_deref()
        .and_then(|re| Regex::new(re).ok());

    // 1. exclude regex over name + tvg_id
    let mut shaped: Vec<LiveChannel> = channels
        .iter()
        .filter(|c| match &exclude {
            Some(re) => !re.is_match(&format!("{} {}", c.guide_name, c.tvg_id)),
            None => true,
        })
        .cloned()
        .collect();

    // 2. category filter (content category or region tag)
    if let Some(raw) = opts.category.as_deref() {
        if let Some(category) = parse_category(raw) {
            shaped.retain(|c| matches_category(c, category));
        } else if let Some(region) = Region::from_tag(&raw.to_ascii_lowercase()) {
            shaped.retain(|c| classify_region(c) == region);
        }
    }

    // 3. music drop
    if opts.drop_music {
        shaped.retain(|c| !is_music(c));
    }

    // 4. regional sort profile
    if opts.sort_profile.as_deref() == Some("na_en") {
        shaped.sort_by(|a, b| {
            classify_region(a)
                .cmp(&classify_region(b))
                .then_with(|| a.guide_name.to_ascii_lowercase().cmp(&b.guide_name.to_ascii_lowercase()))
        });
    }

    // 5. sharding
    let shaped: Vec<LiveChannel> = shaped
        .into_iter()
        .skip(opts.skip)
        .take(opts.take.unwrap_or(usize::MAX))
        .collect();

    // 6. cap
    let mut shaped = shaped;
    if opts.max_channels > 0 && shaped.len() > opts.max_channels {
        shaped.truncate(opts.max_channels);
    }

    // 7. offset + uniqueness
    apply_guide_numbers(&mut shaped, opts.guide_number_offset);
    shaped
}

/// Offset every parseable guide number, then renumber empties and
/// collisions deterministically.
fn apply_guide_numbers(channels: &mut [LiveChannel], offset: u32) {
    let mut used: HashSet<String> = HashSet::new();
    let mut next_free = offset as u64 + 1;

    for ch in channels.iter_mut() {
        let offset_number = offset_guide_number(&ch.guide_number, offset);
        let number = match offset_number {
            Some(n) if !used.contains(&n) => n,
            _ => {
                while used.contains(&next_free.to_string()) {
                    next_free += 1;
                }
                let n = next_free.to_string();
                next_free += 1;
                n
            }
        };
        used.insert(number.clone());
        ch.guide_number = number;
    }
}

/// "12" + 100 -> "112"; "5.1" + 100 -> "105.1"; unparseable -> None.
fn offset_guide_number(raw: &str, offset: u32) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(n) = raw.parse::<u64>() {
        return Some((n + offset as u64).to_string());
    }
    if let Some((major, minor)) = raw.split_once('.') {
        if let (Ok(major), true) = (major.parse::<u64>(), minor.chars().all(|c| c.is_ascii_digit())) {
            if !minor.is_empty() {
                return Some(format!("{}.{}", major + offset as u64, minor));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::QualityTier;

    fn channel(name: &str, group: &str, number: &str) -> LiveChannel {
        LiveChannel {
            channel_id: format!("id-{name}"),
            guide_number: number.to_string(),
            guide_name: name.to_string(),
            tvg_id: String::new(),
            tvg_logo: String::new(),
            group_title: group.to_string(),
            epg_linked: false,
            quality_tier: QualityTier::Sd,
            primary_stream_url: format!("http://host/{name}.ts"),
            backup_stream_urls: vec![],
            source_tag: String::new(),
            sdt: None,
        }
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn test_region_from_group_prefix() {
        assert_eq!(classify_region(&channel("ESPN", "US | Sports", "1")), Region::Us);
        assert_eq!(classify_region(&channel("TSN", "CA: Sports", "1")), Region::Canada);
        assert_eq!(classify_region(&channel("BBC", "UK - News", "1")), Region::Uk);
        assert_eq!(classify_region(&channel("X", "General", "1")), Region::Unclassified);
    }

    #[test]
    fn test_region_from_name_prefix() {
        assert_eq!(classify_region(&channel("US: ESPN", "", "1")), Region::Us);
    }

    #[test]
    fn test_music_heuristic() {
        assert!(is_music(&channel("MTV Hits", "", "1")));
        assert!(is_music(&channel("Chill", "Music Channels", "1")));
        assert!(!is_music(&channel("ESPN", "Sports", "1")));
    }

    // =========================================================================
    // Shaping order and determinism
    // =========================================================================

    #[test]
    fn test_exclude_regex_matches_name_and_tvg() {
        let mut adult = channel("XXX Gold", "", "1");
        adult.tvg_id = "adult.x".into();
        let channels = vec![adult, channel("ESPN", "", "2")];

        let opts = LineupOptions {
            exclude_regex: Some("(?i)xxx|adult".into()),
            ..Default::default()
        };
        let shaped = shape_lineup(&channels, &opts);
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].guide_name, "ESPN");
    }

    #[test]
    fn test_category_filter_sports() {
        let channels = vec![
            channel("ESPN", "US | Sports", "1"),
            channel("CNN", "US | News", "2"),
        ];
        let opts = LineupOptions { category: Some("sports".into()), ..Default::default() };
        let shaped = shape_lineup(&channels, &opts);
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].guide_name, "ESPN");
    }

    #[test]
    fn test_category_filter_region_tag() {
        let channels = vec![
            channel("TSN", "CA | Sports", "1"),
            channel("ESPN", "US | Sports", "2"),
        ];
        let opts = LineupOptions { category: Some("canada".into()), ..Default::default() };
        let shaped = shape_lineup(&channels, &opts);
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].guide_name, "TSN");
    }

    #[test]
    fn test_na_en_sort_profile() {
        let channels = vec![
            channel("Zeta", "UK | General", "1"),
            channel("Beta", "US | General", "2"),
            channel("Alpha", "US | General", "3"),
            channel("TSN", "CA | Sports", "4"),
        ];
        let opts = LineupOptions {
            sort_profile: Some("na_en".into()),
            ..Default::default()
        };
        let shaped = shape_lineup(&channels, &opts);
        let names: Vec<&str> = shaped.iter().map(|c| c.guide_name.as_str()).collect();
        // US first (name asc), then Canada, then UK
        assert_eq!(names, vec!["Alpha", "Beta", "TSN", "Zeta"]);
    }

    #[test]
    fn test_shard_and_cap() {
        let channels: Vec<LiveChannel> =
            (0..10).map(|i| channel(&format!("Ch{i:02}"), "", &i.to_string())).collect();
        let opts = LineupOptions {
            skip: 2,
            take: Some(6),
            max_channels: 4,
            ..Default::default()
        };
        let shaped = shape_lineup(&channels, &opts);
        assert_eq!(shaped.len(), 4);
        assert_eq!(shaped[0].guide_name, "Ch02");
    }

    #[test]
    fn test_guide_number_offset_and_uniqueness() {
        let channels = vec![
            channel("A", "", "5"),
            channel("B", "", "5"),   // duplicate raw number
            channel("C", "", "7.1"), // dotted
            channel("D", "", ""),    // empty
        ];
        let opts = LineupOptions { guide_number_offset: 100, ..Default::default() };
        let shaped = shape_lineup(&channels, &opts);

        let numbers: Vec<&str> = shaped.iter().map(|c| c.guide_number.as_str()).collect();
        assert_eq!(numbers[0], "105");
        assert_eq!(numbers[2], "107.1");
        // duplicate and empty got fresh unique numbers above the offset
        let unique: HashSet<&&str> = numbers.iter().collect();
        assert_eq!(unique.len(), numbers.len());
        assert!(numbers[1].parse::<f64>().unwrap() > 100.0);
        assert!(numbers[3].parse::<f64>().unwrap() > 100.0);
    }

    #[test]
    fn test_shaping_is_deterministic() {
        let channels: Vec<LiveChannel> = (0..50)
            .map(|i| channel(&format!("Ch{i:02}"), if i % 2 == 0 { "US | A" } else { "UK | B" }, ""))
            .collect();
        let opts = LineupOptions {
            sort_profile: Some("na_en".into()),
            max_channels: 20,
            guide_number_offset: 1000,
            ..Default::default()
        };
        assert_eq!(shape_lineup(&channels, &opts), shape_lineup(&channels, &opts));
    }

    #[test]
    fn test_wizard_safe_default_cap() {
        let channels: Vec<LiveChannel> =
            (0..600).map(|i| channel(&format!("Ch{i}"), "US | All", "")).collect();
        let opts = LineupOptions {
            max_channels: DEFAULT_MAX_CHANNELS,
            drop_music: true,
            sort_profile: Some("na_en".into()),
            ..Default::default()
        };
        let shaped = shape_lineup(&channels, &opts);
        assert_eq!(shaped.len(), DEFAULT_MAX_CHANNELS);
        assert!(shaped.iter().all(|c| !is_music(c)));
    }
}
