//! Catalog data model
//!
//! Defines the persisted shapes for live channels, movies and series.
//! Xtream APIs are inconsistent about numeric fields (strings vs ints), so
//! the provider layer owns the tolerant deserializers; everything in here is
//! already normalized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream resolution class used for best-stream selection.
///
/// Ordered so that a plain integer comparison picks the better encoding:
/// UHD > HD > SD > RAW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i8", into = "i8")]
pub enum QualityTier {
    Raw,
    Sd,
    Hd,
    Uhd,
}

impl QualityTier {
    pub fn as_i8(self) -> i8 {
        match self {
            QualityTier::Raw => -1,
            QualityTier::Sd => 0,
            QualityTier::Hd => 1,
            QualityTier::Uhd => 2,
        }
    }
}

impl From<i8> for QualityTier {
    fn from(v: i8) -> Self {
        match v {
            2 => QualityTier::Uhd,
            1 => QualityTier::Hd,
            0 => QualityTier::Sd,
            _ => QualityTier::Raw,
        }
    }
}

impl From<QualityTier> for i8 {
    fn from(v: QualityTier) -> Self {
        v.as_i8()
    }
}

/// DVB identity bundle extracted from a Service Description Table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdtIdentity {
    pub onid: u16,
    pub tsid: u16,
    pub sid: u16,
    pub provider_name: String,
    pub service_name: String,
    pub eit_schedule: bool,
    pub eit_present_following: bool,
    #[serde(default)]
    pub now_title: Option<String>,
    #[serde(default)]
    pub next_title: Option<String>,
    pub probed_at: DateTime<Utc>,
}

/// A live TV channel as served in the tuner lineup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveChannel {
    /// Stable identity; unique across the catalog.
    pub channel_id: String,
    /// Channel number as Plex sees it (dotted or integer string).
    pub guide_number: String,
    pub guide_name: String,
    /// XMLTV channel key; empty when the channel is unlinked.
    #[serde(default)]
    pub tvg_id: String,
    #[serde(default)]
    pub tvg_logo: String,
    #[serde(default)]
    pub group_title: String,
    #[serde(default)]
    pub epg_linked: bool,
    #[serde(default = "default_tier")]
    pub quality_tier: QualityTier,
    pub primary_stream_url: String,
    /// Ranked alternates reaching the same logical service.
    #[serde(default)]
    pub backup_stream_urls: Vec<String>,
    /// Which provider supplied the channel (e.g. "provider2").
    #[serde(default)]
    pub source_tag: String,
    #[serde(default)]
    pub sdt: Option<SdtIdentity>,
}

fn default_tier() -> QualityTier {
    QualityTier::Sd
}

impl LiveChannel {
    /// All stream URLs in failover order, primary first, deduplicated.
    pub fn stream_urls(&self) -> Vec<&str> {
        let mut urls = Vec::with_capacity(1 + self.backup_stream_urls.len());
        urls.push(self.primary_stream_url.as_str());
        for b in &self.backup_stream_urls {
            if !urls.contains(&b.as_str()) {
                urls.push(b.as_str());
            }
        }
        urls
    }
}

/// On-demand movie entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub id: String,
    #[serde(default)]
    pub category: String,
    pub title: String,
    pub stream_url: String,
    #[serde(default)]
    pub poster: Option<String>,
    #[serde(default)]
    pub container_ext: Option<String>,
    #[serde(default)]
    pub added: Option<String>,
}

/// A series with its ordered seasons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: String,
    #[serde(default)]
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub plot: Option<String>,
    #[serde(default)]
    pub seasons: Vec<Season>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub season_num: u32,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub season_num: u32,
    pub episode_num: u32,
    pub title: String,
    pub stream_url: String,
    #[serde(default)]
    pub container_ext: Option<String>,
}

impl Series {
    /// Sort seasons and episodes into their canonical order.
    pub fn sort_entries(&mut self) {
        self.seasons.sort_by_key(|s| s.season_num);
        for season in &mut self.seasons {
            season
                .episodes
                .sort_by(|a, b| (a.season_num, a.episode_num, &a.id).cmp(&(b.season_num, b.episode_num, &b.id)));
        }
    }
}

/// The complete catalog: everything downstream consumers read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub live: Vec<LiveChannel>,
    #[serde(default)]
    pub movies: Vec<Movie>,
    #[serde(default)]
    pub series: Vec<Series>,
}

impl Catalog {
    pub fn live_by_id(&self, channel_id: &str) -> Option<&LiveChannel> {
        self.live.iter().find(|c| c.channel_id == channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_tier_ordering() {
        assert!(QualityTier::Uhd > QualityTier::Hd);
        assert!(QualityTier::Hd > QualityTier::Sd);
        assert!(QualityTier::Sd > QualityTier::Raw);
    }

    #[test]
    fn test_quality_tier_roundtrip_serde() {
        for tier in [QualityTier::Raw, QualityTier::Sd, QualityTier::Hd, QualityTier::Uhd] {
            let json = serde_json::to_string(&tier).unwrap();
            let back: QualityTier = serde_json::from_str(&json).unwrap();
            assert_eq!(tier, back);
        }
        // Serialized form is the bare integer
        assert_eq!(serde_json::to_string(&QualityTier::Uhd).unwrap(), "2");
        assert_eq!(serde_json::to_string(&QualityTier::Raw).unwrap(), "-1");
    }

    #[test]
    fn test_stream_urls_dedup_and_order() {
        let ch = LiveChannel {
            channel_id: "c1".into(),
            guide_number: "100".into(),
            guide_name: "Test".into(),
            tvg_id: String::new(),
            tvg_logo: String::new(),
            group_title: String::new(),
            epg_linked: false,
            quality_tier: QualityTier::Sd,
            primary_stream_url: "http://a/1.ts".into(),
            backup_stream_urls: vec![
                "http://b/1.ts".into(),
                "http://a/1.ts".into(),
                "http://c/1.ts".into(),
            ],
            source_tag: String::new(),
            sdt: None,
        };

        assert_eq!(ch.stream_urls(), vec!["http://a/1.ts", "http://b/1.ts", "http://c/1.ts"]);
    }

    #[test]
    fn test_series_sort_entries() {
        let mut series = Series {
            id: "s1".into(),
            category: String::new(),
            title: "Show".into(),
            cover: None,
            plot: None,
            seasons: vec![
                Season {
                    season_num: 2,
                    episodes: vec![
                        Episode {
                            id: "e3".into(),
                            season_num: 2,
                            episode_num: 2,
                            title: "b".into(),
                            stream_url: String::new(),
                            container_ext: None,
                        },
                        Episode {
                            id: "e2".into(),
                            season_num: 2,
                            episode_num: 1,
                            title: "a".into(),
                            stream_url: String::new(),
                            container_ext: None,
                        },
                    ],
                },
                Season { season_num: 1, episodes: vec![] },
            ],
        };

        series.sort_entries();
        assert_eq!(series.seasons[0].season_num, 1);
        assert_eq!(series.seasons[1].episodes[0].episode_num, 1);
    }
}
