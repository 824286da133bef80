//! Synthetic VOD filesystem
//!
//! Exposes the catalog's movies and series as a lazy file tree:
//!
//! ```text
//! <mount>/Movies/<title>.<ext>
//! <mount>/TV/<series>/Season NN/SxxEyy - <title>.<ext>
//! ```
//!
//! The tree model is pure and platform independent; the FUSE wiring lives in
//! `fs` and only exists on Linux. Everywhere else mounting reports
//! `Unsupported`.

pub mod materialize;

#[cfg(target_os = "linux")]
pub mod fs;

use std::sync::Arc;

use crate::catalog::Catalog;

#[derive(Debug, thiserror::Error)]
pub enum VodFsError {
    #[error("vodfs is not supported on this platform")]
    Unsupported,

    #[error("mount error: {0}")]
    Mount(String),
}

/// Size reported for files the materializer has not sized yet. Plausible
/// enough that Plex scans the entry instead of skipping it.
pub const PLACEHOLDER_FILE_SIZE: u64 = 1_400_000_000;

/// One entry in a synthetic directory listing.
#[derive(Debug, Clone, PartialEq)]
pub enum VodEntry {
    Dir(String),
    File {
        name: String,
        /// Catalog id, also the materializer cache key.
        id: String,
        url: String,
    },
}

impl VodEntry {
    pub fn name(&self) -> &str {
        match self {
            VodEntry::Dir(name) => name,
            VodEntry::File { name, .. } => name,
        }
    }
}

/// Strip characters that cannot appear in a path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' => '-',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').to_string();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

fn movie_file_name(movie: &crate::catalog::Movie) -> String {
    let ext = movie.container_ext.as_deref().unwrap_or("mp4");
    format!("{}.{}", sanitize_component(&movie.title), ext)
}

fn episode_file_name(episode: &crate::catalog::Episode) -> String {
    let ext = episode.container_ext.as_deref().unwrap_or("mp4");
    format!(
        "S{:02}E{:02} - {}.{}",
        episode.season_num,
        episode.episode_num,
        sanitize_component(&episode.title),
        ext
    )
}

fn season_dir_name(season_num: u32) -> String {
    format!("Season {season_num:02}")
}

/// List the two top-level directories.
pub fn list_root() -> Vec<VodEntry> {
    vec![
        VodEntry::Dir("Movies".to_string()),
        VodEntry::Dir("TV".to_string()),
    ]
}

pub fn list_movies(catalog: &Catalog) -> Vec<VodEntry> {
    let mut entries: Vec<VodEntry> = catalog
        .movies
        .iter()
        .map(|m| VodEntry::File {
            name: movie_file_name(m),
            id: m.id.clone(),
            url: m.stream_url.clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.name().cmp(b.name()));
    entries.dedup_by(|a, b| a.name() == b.name());
    entries
}

pub fn list_series(catalog: &Catalog) -> Vec<VodEntry> {
    let mut entries: Vec<VodEntry> = catalog
        .series
        .iter()
        .map(|s| VodEntry::Dir(sanitize_component(&s.title)))
        .collect();
    entries.sort_by(|a, b| a.name().cmp(b.name()));
    entries.dedup_by(|a, b| a.name() == b.name());
    entries
}

pub fn list_seasons(catalog: &Catalog, series_dir: &str) -> Vec<VodEntry> {
    let Some(series) = catalog
        .series
        .iter()
        .find(|s| sanitize_component(&s.title) == series_dir)
    else {
        return vec![];
    };
    series
        .seasons
        .iter()
        .map(|s| VodEntry::Dir(season_dir_name(s.season_num)))
        .collect()
}

pub fn list_episodes(catalog: &Catalog, series_dir: &str, season_dir: &str) -> Vec<VodEntry> {
    let Some(series) = catalog
        .series
        .iter()
        .find(|s| sanitize_component(&s.title) == series_dir)
    else {
        return vec![];
    };
    let Some(season) = series
        .seasons
        .iter()
        .find(|s| season_dir_name(s.season_num) == season_dir)
    else {
        return vec![];
    };
    season
        .episodes
        .iter()
        .map(|e| VodEntry::File {
            name: episode_file_name(e),
            id: e.id.clone(),
            url: e.stream_url.clone(),
        })
        .collect()
}

/// Resolve a directory path (components below the mount point) to its
/// listing.
pub fn list_dir(catalog: &Catalog, components: &[&str]) -> Option<Vec<VodEntry>> {
    match components {
        [] => Some(list_root()),
        ["Movies"] => Some(list_movies(catalog)),
        ["TV"] => Some(list_series(catalog)),
        ["TV", series] => {
            let seasons = list_seasons(catalog, series);
            (!seasons.is_empty()).then_some(seasons)
        }
        ["TV", series, season] => {
            let episodes = list_episodes(catalog, series, season);
            (!episodes.is_empty()).then_some(episodes)
        }
        _ => None,
    }
}

/// Mount the filesystem and serve until unmounted.
#[cfg(target_os = "linux")]
pub fn mount(
    catalog: Arc<crate::catalog::CatalogStore>,
    materializer: Arc<dyn materialize::Materializer>,
    mount_point: &std::path::Path,
    allow_other: bool,
) -> Result<(), VodFsError> {
    fs::mount(catalog, materializer, mount_point, allow_other)
}

#[cfg(not(target_os = "linux"))]
pub fn mount(
    _catalog: Arc<crate::catalog::CatalogStore>,
    _materializer: Arc<dyn materialize::Materializer>,
    _mount_point: &std::path::Path,
    _allow_other: bool,
) -> Result<(), VodFsError> {
    Err(VodFsError::Unsupported)
}
