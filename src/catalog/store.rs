//! Catalog store: single serialized owner of mutable catalog state
//!
//! Readers take cheap `Arc` snapshots; writers swap the whole catalog under a
//! short lock. Persistence is always snapshot-then-atomic-write (temp file in
//! the target directory, then rename), so a crash mid-save leaves the
//! previous catalog intact and readers never observe a torn file.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::model::{Catalog, LiveChannel, Movie, SdtIdentity, Series};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Heuristic for display names that carry no information: numeric stream ids,
/// UUID-ish blobs, or names with almost no letters in them.
pub fn is_garbage_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return true;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let hexish = trimmed
        .chars()
        .filter(|c| c.is_ascii_hexdigit() || *c == '-')
        .count();
    if trimmed.len() >= 16 && hexish == trimmed.chars().count() {
        return true;
    }
    trimmed.chars().filter(|c| c.is_alphabetic()).count() <= 2
}

/// Shared, swap-on-write catalog store.
pub struct CatalogStore {
    inner: RwLock<Arc<Catalog>>,
}

impl Default for CatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Catalog::default())),
        }
    }

    /// Immutable view of the current catalog. Never blocks on I/O.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.inner.read().expect("catalog lock poisoned").clone()
    }

    /// Replace the entire catalog with the result of a fetch+enrichment run.
    ///
    /// SDT identities arrive out of band from the prober, so entries already
    /// attached to channels that survive the replace are carried over.
    pub fn replace(&self, movies: Vec<Movie>, series: Vec<Series>, mut live: Vec<LiveChannel>) {
        let previous = self.snapshot();
        for ch in &mut live {
            if ch.sdt.is_none() {
                if let Some(prev) = previous.live_by_id(&ch.channel_id) {
                    ch.sdt = prev.sdt.clone();
                }
            }
        }

        let next = Arc::new(Catalog { live, movies, series });
        *self.inner.write().expect("catalog lock poisoned") = next;
    }

    /// Attach or refresh a channel's SDT identity.
    ///
    /// When `use_name_fallback` is set and the channel's display name is
    /// garbage, the SDT service name replaces it so the enrichment tiers have
    /// something to match on. Returns whether anything changed.
    pub fn update_live_sdt(
        &self,
        channel_id: &str,
        identity: SdtIdentity,
        use_name_fallback: bool,
    ) -> bool {
        let mut guard = self.inner.write().expect("catalog lock poisoned");
        let current = guard.as_ref();

        let Some(idx) = current.live.iter().position(|c| c.channel_id == channel_id) else {
            return false;
        };

        let existing = &current.live[idx];
        let rename = use_name_fallback
            && !identity.service_name.trim().is_empty()
            && is_garbage_name(&existing.guide_name);

        if existing.sdt.as_ref() == Some(&identity) && !rename {
            return false;
        }

        let mut next = current.clone();
        if rename {
            next.live[idx].guide_name = identity.service_name.trim().to_string();
        }
        next.live[idx].sdt = Some(identity);
        *guard = Arc::new(next);
        true
    }

    /// Persist the current snapshot atomically.
    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(snapshot.as_ref())?;
        write_atomic(path, &json)?;
        debug!(path = %path.display(), live = snapshot.live.len(), "catalog saved");
        Ok(())
    }

    /// Load the catalog from disk.
    ///
    /// A missing file yields an empty store; malformed JSON is a hard error
    /// for this file (the caller decides whether to continue empty).
    pub fn load(&self, path: &Path) -> Result<(), CatalogError> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no catalog on disk, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let catalog: Catalog = serde_json::from_slice(&data)?;
        info!(
            path = %path.display(),
            live = catalog.live.len(),
            movies = catalog.movies.len(),
            series = catalog.series.len(),
            "catalog loaded"
        );
        *self.inner.write().expect("catalog lock poisoned") = Arc::new(catalog);
        Ok(())
    }
}

/// Write `data` to `path` via a temp file in the same directory plus rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::QualityTier;
    use chrono::Utc;

    fn channel(id: &str, name: &str) -> LiveChannel {
        LiveChannel {
            channel_id: id.to_string(),
            guide_number: "1".into(),
            guide_name: name.to_string(),
            tvg_id: String::new(),
            tvg_logo: String::new(),
            group_title: String::new(),
            epg_linked: false,
            quality_tier: QualityTier::Sd,
            primary_stream_url: format!("http://host/{id}.ts"),
            backup_stream_urls: vec![],
            source_tag: String::new(),
            sdt: None,
        }
    }

    fn identity(service: &str) -> SdtIdentity {
        SdtIdentity {
            onid: 1,
            tsid: 2,
            sid: 3,
            provider_name: "Prov".into(),
            service_name: service.to_string(),
            eit_schedule: false,
            eit_present_following: true,
            now_title: None,
            next_title: None,
            probed_at: Utc::now(),
        }
    }

    // =========================================================================
    // Garbage-name heuristic
    // =========================================================================

    #[test]
    fn test_garbage_names() {
        assert!(is_garbage_name("12345"));
        assert!(is_garbage_name("  "));
        assert!(is_garbage_name("a1"));
        assert!(is_garbage_name("d1b2c3d4-e5f6-a7b8-c9d0-112233445566"));
        assert!(!is_garbage_name("BBC One"));
        assert!(!is_garbage_name("ABC 2"));
    }

    // =========================================================================
    // Snapshot / replace semantics
    // =========================================================================

    #[test]
    fn test_replace_swaps_whole_catalog() {
        let store = CatalogStore::new();
        store.replace(vec![], vec![], vec![channel("a", "A"), channel("b", "B")]);

        let before = store.snapshot();
        store.replace(vec![], vec![], vec![channel("c", "C")]);
        let after = store.snapshot();

        // The old snapshot is unaffected by the replace
        assert_eq!(before.live.len(), 2);
        assert_eq!(after.live.len(), 1);
        assert_eq!(after.live[0].channel_id, "c");
    }

    #[test]
    fn test_replace_preserves_sdt_for_surviving_channels() {
        let store = CatalogStore::new();
        store.replace(vec![], vec![], vec![channel("a", "A")]);
        assert!(store.update_live_sdt("a", identity("Svc A"), false));

        store.replace(vec![], vec![], vec![channel("a", "A"), channel("b", "B")]);
        let snap = store.snapshot();
        assert!(snap.live_by_id("a").unwrap().sdt.is_some());
        assert!(snap.live_by_id("b").unwrap().sdt.is_none());
    }

    #[test]
    fn test_update_sdt_reports_change() {
        let store = CatalogStore::new();
        store.replace(vec![], vec![], vec![channel("a", "A")]);

        let id = identity("Svc");
        assert!(store.update_live_sdt("a", id.clone(), false));
        // Same identity again is a no-op
        assert!(!store.update_live_sdt("a", id, false));
        // Unknown channel is a no-op
        assert!(!store.update_live_sdt("zz", identity("x"), false));
    }

    #[test]
    fn test_update_sdt_name_fallback_only_for_garbage_names() {
        let store = CatalogStore::new();
        store.replace(
            vec![],
            vec![],
            vec![channel("num", "48213"), channel("ok", "BBC One")],
        );

        store.update_live_sdt("num", identity("Das Erste HD"), true);
        store.update_live_sdt("ok", identity("Other Name"), true);

        let snap = store.snapshot();
        assert_eq!(snap.live_by_id("num").unwrap().guide_name, "Das Erste HD");
        assert_eq!(snap.live_by_id("ok").unwrap().guide_name, "BBC One");
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let store = CatalogStore::new();
        store.replace(vec![], vec![], vec![channel("a", "A")]);
        store.save(&path).unwrap();

        let restored = CatalogStore::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.snapshot().as_ref(), store.snapshot().as_ref());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new();
        store.load(&dir.path().join("nope.json")).unwrap();
        assert!(store.snapshot().live.is_empty());
    }

    #[test]
    fn test_load_malformed_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = CatalogStore::new();
        assert!(matches!(store.load(&path), Err(CatalogError::Parse(_))));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let store = CatalogStore::new();
        store.save(&path).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
