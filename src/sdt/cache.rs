//! SDT probe cache
//!
//! Remembers when each channel was last probed and whether it yielded an
//! identity, so restarts do not re-read streams that were checked recently.
//! One writer (the prober); atomic replace on save.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::store::write_atomic;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sdt cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sdt cache parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub last_probed: DateTime<Utc>,
    pub ok: bool,
    #[serde(default)]
    pub ttl_secs: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SdtProbeCache {
    #[serde(default)]
    entries: HashMap<String, CacheEntry>,
}

impl SdtProbeCache {
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        match std::fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Whether this channel is due for a probe.
    pub fn is_due(&self, channel_id: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(channel_id) {
            None => true,
            Some(entry) => {
                let ttl = Duration::seconds(entry.ttl_secs as i64);
                now - entry.last_probed >= ttl
            }
        }
    }

    pub fn record_success(&mut self, channel_id: &str, ttl_secs: u64) {
        self.entries.insert(
            channel_id.to_string(),
            CacheEntry { last_probed: Utc::now(), ok: true, ttl_secs },
        );
    }

    pub fn record_failure(&mut self, channel_id: &str, ttl_secs: u64) {
        self.entries.insert(
            channel_id.to_string(),
            CacheEntry { last_probed: Utc::now(), ok: false, ttl_secs },
        );
    }

    /// Forced rescan: every entry becomes due immediately.
    pub fn clear_ttls(&mut self) {
        for entry in self.entries.values_mut() {
            entry.ttl_secs = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_channel_is_due() {
        let cache = SdtProbeCache::default();
        assert!(cache.is_due("ch1", Utc::now()));
    }

    #[test]
    fn test_fresh_entry_is_not_due() {
        let mut cache = SdtProbeCache::default();
        cache.record_success("ch1", 3600);
        assert!(!cache.is_due("ch1", Utc::now()));
        // ...but becomes due after the TTL
        assert!(cache.is_due("ch1", Utc::now() + Duration::seconds(3601)));
    }

    #[test]
    fn test_failures_are_cached_too() {
        let mut cache = SdtProbeCache::default();
        cache.record_failure("ch1", 600);
        assert!(!cache.is_due("ch1", Utc::now()));
    }

    #[test]
    fn test_clear_ttls_makes_everything_due() {
        let mut cache = SdtProbeCache::default();
        cache.record_success("ch1", 999_999);
        cache.record_failure("ch2", 999_999);
        cache.clear_ttls();
        assert!(cache.is_due("ch1", Utc::now()));
        assert!(cache.is_due("ch2", Utc::now()));
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdt_cache.json");

        let mut cache = SdtProbeCache::default();
        cache.record_success("ch1", 3600);
        cache.save(&path).unwrap();

        let restored = SdtProbeCache::load(&path).unwrap();
        assert_eq!(restored.len(), 1);
        assert!(!restored.is_due("ch1", Utc::now()));
    }
}
