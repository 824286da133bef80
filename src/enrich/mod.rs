//! EPG enrichment pipeline
//!
//! An ordered eight-tier matcher that attaches guide identifiers to unlinked
//! channels and collapses duplicate-quality encodings. Tiers 2-6 only touch
//! channels without a confirmed guide link; tiers 1, 7 and 8 are sweeps.
//!
//! A provider-supplied tvg-id is treated as a hint: it is kept on the channel
//! but `epg_linked` only becomes true once a tier confirms an identifier.

pub mod brand;
pub mod normalize;
pub mod quality;
pub mod refdb;

use std::collections::HashMap;

use tracing::{info, warn};

use crate::catalog::LiveChannel;
use crate::config::Config;

use normalize::normalize_channel_name;
use refdb::{DvbDb, GracenoteDb, IptvOrgDb, SdDb};

/// How many channels each tier touched, for the refresh log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierReport {
    pub tier: &'static str,
    pub affected: usize,
}

#[derive(Default)]
pub struct EnrichmentPipeline {
    gracenote: Option<GracenoteDb>,
    iptvorg: Option<IptvOrgDb>,
    sd: Option<SdDb>,
    dvb: Option<DvbDb>,
}

impl EnrichmentPipeline {
    /// Build the pipeline from configured reference DB paths. A missing or
    /// unreadable DB disables its tier; the rest of the pipeline still runs.
    pub fn from_config(config: &Config) -> Self {
        fn load<T>(
            path: Option<&std::path::Path>,
            name: &str,
            loader: impl Fn(&std::path::Path) -> Result<T, refdb::RefDbError>,
        ) -> Option<T> {
            let path = path?;
            match loader(path) {
                Ok(db) => Some(db),
                Err(e) => {
                    warn!(db = name, path = %path.display(), error = %e, "reference db unavailable, tier disabled");
                    None
                }
            }
        }

        Self {
            gracenote: load(config.gracenote_db.as_deref(), "gracenote", GracenoteDb::load),
            iptvorg: load(config.iptvorg_db.as_deref(), "iptv-org", IptvOrgDb::load),
            sd: load(config.sd_db.as_deref(), "schedules-direct", SdDb::load),
            dvb: load(config.dvb_db.as_deref(), "dvb", DvbDb::load),
        }
    }

    #[cfg(test)]
    pub fn with_dbs(
        gracenote: Option<GracenoteDb>,
        iptvorg: Option<IptvOrgDb>,
        sd: Option<SdDb>,
        dvb: Option<DvbDb>,
    ) -> Self {
        Self { gracenote, iptvorg, sd, dvb }
    }

    /// Run all tiers in order. Idempotent: a second run over its own output
    /// changes nothing.
    pub fn run(&self, channels: Vec<LiveChannel>) -> (Vec<LiveChannel>, Vec<TierReport>) {
        let mut channels = channels;
        let mut reports = Vec::with_capacity(8);

        reports.push(TierReport {
            tier: "reencode-inheritance",
            affected: tier_reencode_inheritance(&mut channels),
        });
        reports.push(TierReport {
            tier: "gracenote",
            affected: self.tier_gracenote(&mut channels),
        });
        reports.push(TierReport {
            tier: "iptv-org",
            affected: self.tier_iptvorg(&mut channels),
        });
        reports.push(TierReport {
            tier: "sdt-name",
            affected: tier_sdt_name_propagation(&mut channels),
        });
        reports.push(TierReport {
            tier: "schedules-direct",
            affected: self.tier_schedules_direct(&mut channels),
        });
        reports.push(TierReport {
            tier: "dvb",
            affected: self.tier_dvb(&mut channels),
        });
        reports.push(TierReport {
            tier: "brand-inheritance",
            affected: brand::inherit_brand_links(&mut channels),
        });

        let (channels, dropped) = brand::select_best_streams(channels);
        reports.push(TierReport {
            tier: "best-stream",
            affected: dropped,
        });

        for report in &reports {
            if report.affected > 0 {
                info!(tier = report.tier, affected = report.affected, "enrichment tier");
            }
        }

        (channels, reports)
    }

    fn tier_gracenote(&self, channels: &mut [LiveChannel]) -> usize {
        let Some(db) = &self.gracenote else { return 0 };
        let mut affected = 0;
        for ch in channels.iter_mut().filter(|c| !c.epg_linked) {
            if let Some(tvg_id) = db.lookup(&ch.guide_name) {
                ch.tvg_id = tvg_id.to_string();
                ch.epg_linked = true;
                affected += 1;
            }
        }
        affected
    }

    fn tier_iptvorg(&self, channels: &mut [LiveChannel]) -> usize {
        let Some(db) = &self.iptvorg else { return 0 };
        let mut affected = 0;
        for ch in channels.iter_mut().filter(|c| !c.epg_linked) {
            let matched = db
                .lookup_exact(&ch.guide_name)
                .or_else(|| db.lookup_stripped(&ch.guide_name))
                .or_else(|| {
                    if ch.tvg_id.is_empty() {
                        None
                    } else {
                        db.lookup_short_code(&ch.tvg_id)
                    }
                });
            if let Some(tvg_id) = matched {
                ch.tvg_id = tvg_id;
                ch.epg_linked = true;
                affected += 1;
            }
        }
        affected
    }

    fn tier_schedules_direct(&self, channels: &mut [LiveChannel]) -> usize {
        let Some(db) = &self.sd else { return 0 };
        let mut affected = 0;
        for ch in channels.iter_mut().filter(|c| !c.epg_linked) {
            if let Some(tvg_id) = db.lookup(&ch.guide_name) {
                ch.tvg_id = tvg_id;
                ch.epg_linked = true;
                affected += 1;
            }
        }
        affected
    }

    fn tier_dvb(&self, channels: &mut [LiveChannel]) -> usize {
        let Some(db) = &self.dvb else { return 0 };
        let mut affected = 0;
        for ch in channels.iter_mut().filter(|c| !c.epg_linked) {
            let Some(sdt) = &ch.sdt else { continue };
            if let Some(tvg_id) = db.lookup(sdt.onid, sdt.tsid, sdt.sid) {
                ch.tvg_id = tvg_id.to_string();
                ch.epg_linked = true;
                affected += 1;
            }
        }
        affected
    }
}

/// Tier 1: every channel gets its quality tier from the name; channels with
/// a quality marker but no tvg_id inherit from a marker-free sibling with
/// the same base name.
fn tier_reencode_inheritance(channels: &mut [LiveChannel]) -> usize {
    for ch in channels.iter_mut() {
        ch.quality_tier = quality::detect_tier(&ch.guide_name);
    }

    // Marker-free siblings that can donate a tvg_id, best donor first
    let mut donors: HashMap<String, (String, bool)> = HashMap::new();
    for ch in channels.iter() {
        if quality::has_quality_marker(&ch.guide_name) || ch.tvg_id.is_empty() {
            continue;
        }
        let key = normalize_channel_name(&ch.guide_name);
        let entry = donors.entry(key).or_insert_with(|| (ch.tvg_id.clone(), ch.epg_linked));
        // A linked donor beats an unlinked hint
        if ch.epg_linked && !entry.1 {
            *entry = (ch.tvg_id.clone(), true);
        }
    }

    let mut affected = 0;
    for ch in channels.iter_mut() {
        if ch.tvg_id.is_empty() && quality::has_quality_marker(&ch.guide_name) {
            if let Some((tvg_id, linked)) = donors.get(&normalize_channel_name(&ch.guide_name)) {
                ch.tvg_id = tvg_id.clone();
                ch.epg_linked = *linked;
                affected += 1;
            }
        }
    }
    affected
}

/// Tier 4: a garbage display name is replaced in place by the SDT service
/// name so the name-matching tiers after it have something to work with.
fn tier_sdt_name_propagation(channels: &mut [LiveChannel]) -> usize {
    let mut affected = 0;
    for ch in channels.iter_mut().filter(|c| !c.epg_linked) {
        let Some(sdt) = &ch.sdt else { continue };
        let service_name = sdt.service_name.trim();
        if service_name.is_empty() {
            continue;
        }
        if crate::catalog::store::is_garbage_name(&ch.guide_name) {
            ch.guide_name = service_name.to_string();
            affected += 1;
        }
    }
    affected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{QualityTier, SdtIdentity};
    use chrono::Utc;

    fn channel(name: &str, tvg: &str) -> LiveChannel {
        LiveChannel {
            channel_id: format!("id-{name}"),
            guide_number: "1".into(),
            guide_name: name.to_string(),
            tvg_id: tvg.to_string(),
            tvg_logo: String::new(),
            group_title: String::new(),
            epg_linked: false,
            quality_tier: QualityTier::Sd,
            primary_stream_url: format!("http://host/{name}.ts"),
            backup_stream_urls: vec![],
            source_tag: String::new(),
            sdt: None,
        }
    }

    fn linked(name: &str, tvg: &str) -> LiveChannel {
        let mut ch = channel(name, tvg);
        ch.epg_linked = true;
        ch
    }

    fn sdt(onid: u16, tsid: u16, sid: u16, service: &str) -> SdtIdentity {
        SdtIdentity {
            onid,
            tsid,
            sid,
            provider_name: "P".into(),
            service_name: service.into(),
            eit_schedule: false,
            eit_present_following: false,
            now_title: None,
            next_title: None,
            probed_at: Utc::now(),
        }
    }

    // =========================================================================
    // Tier 1
    // =========================================================================

    #[test]
    fn test_reencode_inheritance_sets_tiers_and_inherits() {
        let mut channels = vec![
            linked("ESPN", "espn.us"),
            channel("ESPN HD", ""),
            channel("ESPN 4K", ""),
        ];

        let affected = tier_reencode_inheritance(&mut channels);
        assert_eq!(affected, 2);
        assert_eq!(channels[1].tvg_id, "espn.us");
        assert!(channels[1].epg_linked);
        assert_eq!(channels[1].quality_tier, QualityTier::Hd);
        assert_eq!(channels[2].quality_tier, QualityTier::Uhd);
        assert_eq!(channels[0].quality_tier, QualityTier::Sd);
    }

    #[test]
    fn test_reencode_inheritance_needs_marker_free_donor() {
        let mut channels = vec![channel("CNN HD", ""), channel("CNN 4K", "")];
        assert_eq!(tier_reencode_inheritance(&mut channels), 0);
        assert!(channels[0].tvg_id.is_empty());
    }

    // =========================================================================
    // Tier 4
    // =========================================================================

    #[test]
    fn test_sdt_name_propagation() {
        let mut garbage = channel("83921", "");
        garbage.sdt = Some(sdt(1, 1, 1, "Das Erste HD"));
        let mut good = channel("BBC One", "");
        good.sdt = Some(sdt(1, 1, 2, "Other"));
        let mut channels = vec![garbage, good];

        let affected = tier_sdt_name_propagation(&mut channels);
        assert_eq!(affected, 1);
        assert_eq!(channels[0].guide_name, "Das Erste HD");
        assert_eq!(channels[1].guide_name, "BBC One");
    }

    // =========================================================================
    // Full pipeline
    // =========================================================================

    fn iptvorg_db(records: &str) -> IptvOrgDb {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iptv.json");
        std::fs::write(&path, records).unwrap();
        IptvOrgDb::load(&path).unwrap()
    }

    fn dvb_db(records: &str) -> DvbDb {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dvb.json");
        std::fs::write(&path, records).unwrap();
        DvbDb::load(&path).unwrap()
    }

    #[test]
    fn test_pipeline_links_and_collapses() {
        let pipeline = EnrichmentPipeline::with_dbs(
            None,
            Some(iptvorg_db(r#"[{"id": "guide.espn", "name": "ESPN"}]"#)),
            None,
            None,
        );

        let channels = vec![
            channel("ESPN", ""),
            channel("ESPN HD", ""),
            channel("Unmatched", ""),
        ];

        let (out, reports) = pipeline.run(channels);

        // ESPN and ESPN HD link to the same id; best-stream keeps the HD one
        assert_eq!(out.len(), 2);
        let espn = out.iter().find(|c| c.tvg_id == "guide.espn").unwrap();
        assert_eq!(espn.guide_name, "ESPN HD");
        assert_eq!(espn.quality_tier, QualityTier::Hd);

        let by_tier: std::collections::HashMap<_, _> =
            reports.iter().map(|r| (r.tier, r.affected)).collect();
        assert_eq!(by_tier["iptv-org"], 2);
        assert_eq!(by_tier["best-stream"], 1);
    }

    #[test]
    fn test_pipeline_dvb_tier_uses_sdt_triplet() {
        let pipeline = EnrichmentPipeline::with_dbs(
            None,
            None,
            None,
            Some(dvb_db(
                r#"[{"onid": 8468, "tsid": 259, "sid": 769, "tvg_id": "DasErste.de"}]"#,
            )),
        );

        let mut ch = channel("1931", "");
        ch.sdt = Some(sdt(8468, 259, 769, "Das Erste"));
        let (out, _) = pipeline.run(vec![ch]);

        assert_eq!(out[0].tvg_id, "DasErste.de");
        assert!(out[0].epg_linked);
        // Tier 4 renamed the garbage display name on the way
        assert_eq!(out[0].guide_name, "Das Erste");
    }

    #[test]
    fn test_pipeline_idempotent() {
        let pipeline = EnrichmentPipeline::with_dbs(
            None,
            Some(iptvorg_db(
                r#"[{"id": "guide.espn", "name": "ESPN"}, {"id": "cnn.us", "name": "CNN"}]"#,
            )),
            None,
            None,
        );

        let channels = vec![
            channel("ESPN", ""),
            channel("ESPN HD", ""),
            channel("CNN", ""),
            channel("Mystery", ""),
        ];

        let (once, _) = pipeline.run(channels);
        let (twice, reports) = pipeline.run(once.clone());
        assert_eq!(once, twice);
        assert_eq!(
            reports.iter().find(|r| r.tier == "best-stream").unwrap().affected,
            0
        );
    }

    #[test]
    fn test_pipeline_without_dbs_still_runs_sweeps() {
        let pipeline = EnrichmentPipeline::default();
        let channels = vec![linked("ABC", "abc.us"), channel("ABC East", "")];
        let (out, _) = pipeline.run(channels);

        // Brand inheritance still linked the sibling
        assert!(out.iter().all(|c| c.tvg_id == "abc.us"));
    }
}
