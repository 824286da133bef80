//! Fetch checkpoint state
//!
//! Persisted after every completed category so a crash mid-run resumes where
//! it left off instead of refetching the whole provider. One writer (the
//! fetcher); atomic temp+rename like every other persisted file.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::store::write_atomic;
use crate::catalog::LiveChannel;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("fetch state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch state parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Cache validators and content hash for one upstream endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointState {
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub body_sha256: Option<String>,
}

/// Per-category checkpoint for the live-stream fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryState {
    pub category_id: String,
    pub category_name: String,
    #[serde(default)]
    pub complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchState {
    /// Validators keyed by a stable endpoint name ("live_categories",
    /// "cat:<id>", "m3u", "vod", "series").
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointState>,
    /// Categories known from the last categories fetch, with completion.
    #[serde(default)]
    pub categories: Vec<CategoryState>,
    /// channel_id -> stream hash from the previous successful run.
    #[serde(default)]
    pub stream_hashes: HashMap<String, String>,
    /// Channels checkpointed so far in an interrupted run.
    #[serde(default)]
    pub partial_live: Vec<LiveChannel>,
    #[serde(default)]
    pub runs: u64,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl FetchState {
    pub fn load(path: &Path) -> Result<Self, StateError> {
        match std::fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }

    pub fn endpoint(&self, key: &str) -> EndpointState {
        self.endpoints.get(key).cloned().unwrap_or_default()
    }

    pub fn set_endpoint(&mut self, key: &str, state: EndpointState) {
        self.endpoints.insert(key.to_string(), state);
    }

    /// True when a previous run checkpointed some categories but not all.
    pub fn has_incomplete_run(&self) -> bool {
        !self.categories.is_empty()
            && self.categories.iter().any(|c| c.complete)
            && self.categories.iter().any(|c| !c.complete)
    }

    pub fn mark_category_complete(&mut self, category_id: &str) {
        if let Some(cat) = self.categories.iter_mut().find(|c| c.category_id == category_id) {
            cat.complete = true;
        }
    }

    /// Reset per-run checkpoints while keeping validators and stream hashes.
    pub fn begin_run(&mut self) {
        for cat in &mut self.categories {
            cat.complete = false;
        }
        self.partial_live.clear();
    }

    /// Close out a successful run.
    pub fn finish_run(&mut self, stream_hashes: HashMap<String, String>) {
        self.stream_hashes = stream_hashes;
        self.partial_live.clear();
        for cat in &mut self.categories {
            cat.complete = false;
        }
        self.runs += 1;
        self.last_run_at = Some(Utc::now());
    }
}
