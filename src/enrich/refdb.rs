//! Reference databases for guide-identifier matching
//!
//! Four JSON-backed lookup tables: Gracenote, the iptv-org community DB,
//! Schedules Direct and a DVB triplet DB. Missing files disable the tier;
//! malformed files are a hard error (a half-loaded DB would mismatch
//! silently).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::normalize::normalize_channel_name;

#[derive(Debug, thiserror::Error)]
pub enum RefDbError {
    #[error("reference db io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reference db parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

// =============================================================================
// Gracenote
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct GracenoteRecord {
    pub call_sign: String,
    #[serde(default)]
    pub grid_key: Option<String>,
    pub tvg_id: String,
}

#[derive(Debug, Default)]
pub struct GracenoteDb {
    by_call_sign: HashMap<String, String>,
    by_grid_key: HashMap<String, String>,
}

impl GracenoteDb {
    pub fn load(path: &Path) -> Result<Self, RefDbError> {
        let records: Vec<GracenoteRecord> = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut db = Self::default();
        for r in records {
            db.by_call_sign
                .insert(normalize_channel_name(&r.call_sign), r.tvg_id.clone());
            if let Some(grid) = r.grid_key {
                db.by_grid_key.insert(normalize_channel_name(&grid), r.tvg_id);
            }
        }
        Ok(db)
    }

    /// Match a channel's call sign or grid key.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        let key = normalize_channel_name(name);
        self.by_call_sign
            .get(&key)
            .or_else(|| self.by_grid_key.get(&key))
            .map(String::as_str)
    }
}

// =============================================================================
// iptv-org
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct IptvOrgRecord {
    /// iptv-org channel id, e.g. "ESPN.us"
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
}

#[derive(Debug, Default)]
pub struct IptvOrgDb {
    /// strict-normalized name -> ids (a name shared by several channels
    /// disqualifies itself; tiers only accept single matches)
    by_name: HashMap<String, Vec<String>>,
    by_stripped: HashMap<String, Vec<String>>,
    by_short_code: HashMap<String, Vec<String>>,
}

impl IptvOrgDb {
    pub fn load(path: &Path) -> Result<Self, RefDbError> {
        let records: Vec<IptvOrgRecord> = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut db = Self::default();
        for r in &records {
            for name in std::iter::once(&r.name).chain(r.alt_names.iter()) {
                db.by_name
                    .entry(normalize_channel_name(name))
                    .or_default()
                    .push(r.id.clone());
                db.by_stripped
                    .entry(super::normalize::normalize_stripped(name))
                    .or_default()
                    .push(r.id.clone());
            }
            if let Some(code) = super::normalize::tvg_short_code(&r.id) {
                db.by_short_code.entry(code).or_default().push(r.id.clone());
            }
        }
        Ok(db)
    }

    fn single(map: &HashMap<String, Vec<String>>, key: &str) -> Option<String> {
        match map.get(key) {
            Some(ids) if ids.len() == 1 => Some(ids[0].clone()),
            _ => None,
        }
    }

    /// (a) exact normalized name, single match only.
    pub fn lookup_exact(&self, name: &str) -> Option<String> {
        Self::single(&self.by_name, &normalize_channel_name(name))
    }

    /// (b) normalized with country/quality tokens stripped, single match only.
    pub fn lookup_stripped(&self, name: &str) -> Option<String> {
        Self::single(&self.by_stripped, &super::normalize::normalize_stripped(name))
    }

    /// (c) short code from a tvg-id's last segment, single match only.
    pub fn lookup_short_code(&self, tvg_id: &str) -> Option<String> {
        let code = super::normalize::tvg_short_code(tvg_id)?;
        Self::single(&self.by_short_code, &code)
    }
}

// =============================================================================
// Schedules Direct
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SdRecord {
    pub station_id: String,
    #[serde(default)]
    pub call_sign: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default)]
pub struct SdDb {
    by_key: HashMap<String, String>,
}

impl SdDb {
    pub fn load(path: &Path) -> Result<Self, RefDbError> {
        let records: Vec<SdRecord> = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut db = Self::default();
        for r in records {
            if let Some(cs) = &r.call_sign {
                db.by_key
                    .insert(normalize_channel_name(cs), r.station_id.clone());
            }
            if let Some(name) = &r.name {
                db.by_key
                    .insert(normalize_channel_name(name), r.station_id.clone());
            }
        }
        Ok(db)
    }

    /// Station lookup; the produced guide id carries the `SD-` prefix.
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.by_key
            .get(&normalize_channel_name(name))
            .map(|id| format!("SD-{id}"))
    }
}

// =============================================================================
// DVB triplets
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DvbRecord {
    pub onid: u16,
    pub tsid: u16,
    pub sid: u16,
    pub tvg_id: String,
}

#[derive(Debug, Default)]
pub struct DvbDb {
    by_triplet: HashMap<(u16, u16, u16), String>,
}

impl DvbDb {
    pub fn load(path: &Path) -> Result<Self, RefDbError> {
        let records: Vec<DvbRecord> = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut db = Self::default();
        for r in records {
            db.by_triplet.insert((r.onid, r.tsid, r.sid), r.tvg_id);
        }
        Ok(db)
    }

    pub fn lookup(&self, onid: u16, tsid: u16, sid: u16) -> Option<&str> {
        self.by_triplet.get(&(onid, tsid, sid)).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_json(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_gracenote_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "gn.json",
            r#"[{"call_sign": "ESPNHD", "grid_key": "espn east", "tvg_id": "gn.espn"}]"#,
        );

        let db = GracenoteDb::load(&path).unwrap();
        assert_eq!(db.lookup("ESPNHD"), Some("gn.espn"));
        assert_eq!(db.lookup("Espn East"), Some("gn.espn"));
        assert_eq!(db.lookup("CNN"), None);
    }

    #[test]
    fn test_iptvorg_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "iptv.json",
            r#"[
                {"id": "guide.espn", "name": "ESPN", "alt_names": []},
                {"id": "BBCOne.uk", "name": "BBC One", "alt_names": ["BBC 1"]},
                {"id": "Dup1.us", "name": "Duplicate", "alt_names": []},
                {"id": "Dup2.us", "name": "Duplicate", "alt_names": []}
            ]"#,
        );

        let db = IptvOrgDb::load(&path).unwrap();
        assert_eq!(db.lookup_exact("ESPN HD"), Some("guide.espn".into()));
        assert_eq!(db.lookup_exact("BBC 1"), Some("BBCOne.uk".into()));
        // Ambiguous names never match
        assert_eq!(db.lookup_exact("Duplicate"), None);
        // Short code is the id's last segment
        assert_eq!(db.lookup_short_code("x.espn"), Some("guide.espn".into()));
        // "us" is shared by Dup1/Dup2 -> ambiguous
        assert_eq!(db.lookup_short_code("anything.us"), None);
    }

    #[test]
    fn test_iptvorg_stripped_tier() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "iptv.json",
            r#"[{"id": "ABC.us", "name": "ABC", "alt_names": []}]"#,
        );

        let db = IptvOrgDb::load(&path).unwrap();
        assert_eq!(db.lookup_exact("ABC East"), None);
        assert_eq!(db.lookup_stripped("ABC East"), Some("ABC.us".into()));
    }

    #[test]
    fn test_sd_lookup_prefixes_station_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "sd.json",
            r#"[{"station_id": "10021", "call_sign": "WABC", "name": "ABC 7 New York"}]"#,
        );

        let db = SdDb::load(&path).unwrap();
        assert_eq!(db.lookup("WABC"), Some("SD-10021".into()));
        assert_eq!(db.lookup("ABC 7 New York"), Some("SD-10021".into()));
        assert_eq!(db.lookup("nope"), None);
    }

    #[test]
    fn test_dvb_triplet_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "dvb.json",
            r#"[{"onid": 8468, "tsid": 259, "sid": 769, "tvg_id": "DasErste.de"}]"#,
        );

        let db = DvbDb::load(&path).unwrap();
        assert_eq!(db.lookup(8468, 259, 769), Some("DasErste.de"));
        assert_eq!(db.lookup(1, 2, 3), None);
    }

    #[test]
    fn test_malformed_db_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(&dir, "bad.json", "{nope");
        assert!(matches!(GracenoteDb::load(&path), Err(RefDbError::Parse(_))));
    }
}
