//! Plex library registration for the VOD filesystem
//!
//! Creates or reuses the library sections pointing at the synthetic mount
//! and applies the VOD-safe preset: every media-analysis generator Plex
//! would otherwise run against the lazy files is disabled.

use tracing::{info, warn};

use super::plex::{PlexClient, PlexError, PlexSection};

/// Preference keys disabled by the VOD-safe preset, when present on the
/// section.
pub const VOD_SAFE_PREFS: &[&str] = &[
    "enableBIFGeneration",
    "enableChapterThumbGeneration",
    "enableIntroMarkerGeneration",
    "enableCreditsMarkerGeneration",
    "enableAdMarkerGeneration",
    "enableVoiceActivityGeneration",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryType {
    Movie,
    Show,
}

impl LibraryType {
    pub fn kind(self) -> &'static str {
        match self {
            LibraryType::Movie => "movie",
            LibraryType::Show => "show",
        }
    }

    pub fn agent(self) -> &'static str {
        match self {
            LibraryType::Movie => "tv.plex.agents.movie",
            LibraryType::Show => "tv.plex.agents.series",
        }
    }

    pub fn scanner(self) -> &'static str {
        match self {
            LibraryType::Movie => "Plex Movie",
            LibraryType::Show => "Plex TV Series",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error(transparent)]
    Plex(#[from] PlexError),

    #[error("library '{0}' exists with a different type or path; refusing to change it")]
    Conflict(String),

    #[error("vod preset verification failed for '{0}'")]
    PresetVerification(String),
}

/// Decide whether an existing section satisfies (or conflicts with) the
/// request. Matching is by title; a title match with the wrong type or path
/// is a hard conflict, never mutated.
pub fn match_section<'a>(
    sections: &'a [PlexSection],
    name: &str,
    kind: LibraryType,
    path: &str,
) -> Result<Option<&'a PlexSection>, LibraryError> {
    let Some(section) = sections.iter().find(|s| s.title == name) else {
        return Ok(None);
    };

    let path_matches = section.locations.iter().any(|l| l.path == path);
    if section.kind == kind.kind() && path_matches {
        Ok(Some(section))
    } else {
        Err(LibraryError::Conflict(name.to_string()))
    }
}

/// Ensure a library section exists for the given mount path; reuse on exact
/// match, create otherwise. Optionally applies the VOD-safe preset and
/// triggers a scan.
pub async fn ensure_library_section(
    plex: &PlexClient,
    name: &str,
    kind: LibraryType,
    path: &str,
    apply_vod_preset: bool,
    trigger_refresh: bool,
) -> Result<String, LibraryError> {
    let sections = plex.get_sections().await?;

    let key = match match_section(&sections, name, kind, path)? {
        Some(existing) => {
            info!(library = name, key = %existing.key, "reusing existing library section");
            existing.key.clone()
        }
        None => {
            let created = plex
                .create_section(name, kind.kind(), kind.agent(), kind.scanner(), path)
                .await?;
            info!(library = name, key = %created.key, "library section created");
            created.key
        }
    };

    if apply_vod_preset {
        apply_preset(plex, &key, name).await?;
    }
    if trigger_refresh {
        if let Err(e) = plex.refresh_section(&key).await {
            warn!(library = name, error = %e, "section refresh trigger failed");
        }
    }
    Ok(key)
}

/// Disable every VOD-unsafe generator present on the section, then verify
/// by re-reading the prefs.
async fn apply_preset(plex: &PlexClient, key: &str, name: &str) -> Result<(), LibraryError> {
    let prefs = plex.get_section_prefs(key).await?;

    let mut touched = Vec::new();
    for pref in &prefs {
        if VOD_SAFE_PREFS.contains(&pref.id.as_str()) && pref.value != "0" {
            plex.set_section_pref(key, &pref.id, "0").await?;
            touched.push(pref.id.clone());
        }
    }

    if touched.is_empty() {
        return Ok(());
    }

    let verify = plex.get_section_prefs(key).await?;
    for id in &touched {
        let ok = verify
            .iter()
            .find(|p| &p.id == id)
            .map(|p| p.value == "0")
            .unwrap_or(false);
        if !ok {
            return Err(LibraryError::PresetVerification(name.to_string()));
        }
    }
    info!(library = name, disabled = touched.len(), "vod-safe preset applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::plex::PlexLocation;

    fn section(title: &str, kind: &str, path: &str) -> PlexSection {
        PlexSection {
            key: "7".into(),
            title: title.to_string(),
            kind: kind.to_string(),
            locations: vec![PlexLocation { path: path.to_string() }],
        }
    }

    #[test]
    fn test_match_reuses_exact_section() {
        let sections = vec![section("IPTV Movies", "movie", "/mnt/vod/Movies")];
        let matched =
            match_section(&sections, "IPTV Movies", LibraryType::Movie, "/mnt/vod/Movies").unwrap();
        assert!(matched.is_some());
    }

    #[test]
    fn test_match_missing_is_none() {
        let matched = match_section(&[], "IPTV Movies", LibraryType::Movie, "/mnt/vod/Movies").unwrap();
        assert!(matched.is_none());
    }

    #[test]
    fn test_match_conflicting_type_errors() {
        let sections = vec![section("IPTV Movies", "show", "/mnt/vod/Movies")];
        assert!(matches!(
            match_section(&sections, "IPTV Movies", LibraryType::Movie, "/mnt/vod/Movies"),
            Err(LibraryError::Conflict(_))
        ));
    }

    #[test]
    fn test_match_conflicting_path_errors() {
        let sections = vec![section("IPTV Movies", "movie", "/elsewhere")];
        assert!(matches!(
            match_section(&sections, "IPTV Movies", LibraryType::Movie, "/mnt/vod/Movies"),
            Err(LibraryError::Conflict(_))
        ));
    }

    #[test]
    fn test_library_type_fixed_agents() {
        assert_eq!(LibraryType::Movie.agent(), "tv.plex.agents.movie");
        assert_eq!(LibraryType::Movie.scanner(), "Plex Movie");
        assert_eq!(LibraryType::Show.agent(), "tv.plex.agents.series");
        assert_eq!(LibraryType::Show.scanner(), "Plex TV Series");
    }
}
