//! Shared server state

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::catalog::{CatalogStore, LiveChannel};
use crate::config::Config;
use crate::control::ControlHandle;
use crate::gateway::StreamGateway;

use super::lineup::{shape_lineup, LineupOptions};

/// Cached rendered guide.xml with its ETag.
#[derive(Debug, Clone)]
pub struct CachedGuide {
    pub content: String,
    pub etag: String,
    pub built_at: Instant,
}

/// One-slot cache for the rendered guide; refreshes invalidate it so the
/// next request rebuilds against the new lineup.
#[derive(Debug, Default)]
pub struct GuideCache {
    slot: Mutex<Option<CachedGuide>>,
}

impl GuideCache {
    pub fn get(&self, ttl: Duration) -> Option<CachedGuide> {
        let guard = self.slot.lock().expect("guide cache lock poisoned");
        guard
            .as_ref()
            .filter(|cached| cached.built_at.elapsed() < ttl)
            .cloned()
    }

    pub fn set(&self, content: String, etag: String) {
        let mut guard = self.slot.lock().expect("guide cache lock poisoned");
        *guard = Some(CachedGuide { content, etag, built_at: Instant::now() });
    }

    pub fn invalidate(&self) {
        let mut guard = self.slot.lock().expect("guide cache lock poisoned");
        *guard = None;
    }
}

/// Application state for the HTTP server. Cheap to clone; all heavy members
/// are shared handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<CatalogStore>,
    pub gateway: Arc<StreamGateway>,
    pub control: ControlHandle,
    pub guide_cache: Arc<GuideCache>,
}

impl AppState {
    /// The lineup this instance serves right now: the shaping pipeline
    /// applied to the current catalog snapshot.
    pub fn shaped_lineup(&self) -> Vec<LiveChannel> {
        let snapshot = self.catalog.snapshot();
        shape_lineup(&snapshot.live, &LineupOptions::from_config(&self.config))
    }
}
