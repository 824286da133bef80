//! Streaming M3U playlist parser
//!
//! Parses `#EXTINF` playlists line by line so large provider exports never
//! have to be held as one parsed document. The caller feeds lines (and
//! usually hashes the raw body alongside); the parser accumulates channels.

use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::{LiveChannel, QualityTier};

/// `key="value"` attribute pairs on an `#EXTINF` line.
static EXTINF_ATTR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z][A-Za-z0-9-]*)="([^"]*)""#).unwrap());

/// Attributes parsed from one `#EXTINF` line.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtInf {
    pub name: String,
    pub tvg_id: String,
    pub tvg_name: String,
    pub tvg_logo: String,
    pub group_title: String,
}

/// Parse the `key="value"` attribute list and trailing display name of an
/// `#EXTINF:-1 ...` line.
pub fn parse_extinf(line: &str) -> ExtInf {
    let rest = line.trim_start_matches("#EXTINF:");
    // The display name follows the last comma outside of quotes
    let mut in_quotes = false;
    let mut name_start = None;
    for (i, c) in rest.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => name_start = Some(i + 1),
            _ => {}
        }
    }

    let (attr_part, name) = match name_start {
        Some(i) => (&rest[..i - 1], rest[i..].trim().to_string()),
        None => (rest, String::new()),
    };

    let mut info = ExtInf {
        name,
        ..Default::default()
    };
    for cap in EXTINF_ATTR_REGEX.captures_iter(attr_part) {
        let value = cap[2].to_string();
        match cap[1].to_ascii_lowercase().as_str() {
            "tvg-id" => info.tvg_id = value,
            "tvg-name" => info.tvg_name = value,
            "tvg-logo" => info.tvg_logo = value,
            "group-title" => info.group_title = value,
            _ => {}
        }
    }
    info
}

/// Incremental playlist parser: feed lines, collect channels.
#[derive(Debug, Default)]
pub struct M3uParser {
    pending: Option<ExtInf>,
    channels: Vec<LiveChannel>,
    counter: u64,
    source_tag: String,
}

impl M3uParser {
    pub fn new(source_tag: &str) -> Self {
        Self {
            source_tag: source_tag.to_string(),
            ..Default::default()
        }
    }

    pub fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line == "#EXTM3U" {
            return;
        }
        if line.starts_with("#EXTINF:") {
            self.pending = Some(parse_extinf(line));
            return;
        }
        if line.starts_with('#') {
            // #EXTGRP and friends are ignored
            return;
        }

        // A bare URL line closes the pending entry
        if let Some(info) = self.pending.take() {
            self.counter += 1;
            let display_name = if info.name.is_empty() { info.tvg_name.clone() } else { info.name.clone() };
            let channel_id = if info.tvg_id.is_empty() {
                format!("m3u-{}", self.counter)
            } else {
                format!("m3u-{}", info.tvg_id)
            };

            // A playlist tvg-id is a hint; the enrichment pipeline decides
            // whether it becomes a confirmed guide link.
            self.channels.push(LiveChannel {
                channel_id,
                guide_number: self.counter.to_string(),
                guide_name: display_name,
                epg_linked: false,
                tvg_id: info.tvg_id,
                tvg_logo: info.tvg_logo,
                group_title: info.group_title,
                quality_tier: QualityTier::Sd,
                primary_stream_url: line.to_string(),
                backup_stream_urls: vec![],
                source_tag: self.source_tag.clone(),
                sdt: None,
            });
        }
    }

    pub fn finish(self) -> Vec<LiveChannel> {
        self.channels
    }
}

/// Convenience entry point for an in-memory playlist body.
pub fn parse_m3u(body: &str, source_tag: &str) -> Vec<LiveChannel> {
    let mut parser = M3uParser::new(source_tag);
    for line in body.lines() {
        parser.push_line(line);
    }
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"#EXTM3U
#EXTINF:-1 tvg-id="espn.us" tvg-name="ESPN" tvg-logo="http://logo/espn.png" group-title="US Sports",ESPN HD
http://host/live/u/p/1.ts
#EXTINF:-1 tvg-id="" tvg-name="Mystery" group-title="Misc",Mystery Channel
http://host/live/u/p/2.ts
"#;

    #[test]
    fn test_parse_extinf_attributes() {
        let info = parse_extinf(
            r#"#EXTINF:-1 tvg-id="espn.us" tvg-name="ESPN" tvg-logo="http://logo/espn.png" group-title="US Sports",ESPN HD"#,
        );
        assert_eq!(info.tvg_id, "espn.us");
        assert_eq!(info.tvg_name, "ESPN");
        assert_eq!(info.tvg_logo, "http://logo/espn.png");
        assert_eq!(info.group_title, "US Sports");
        assert_eq!(info.name, "ESPN HD");
    }

    #[test]
    fn test_parse_extinf_comma_inside_quotes() {
        let info = parse_extinf(r#"#EXTINF:-1 group-title="News, World",BBC World"#);
        assert_eq!(info.group_title, "News, World");
        assert_eq!(info.name, "BBC World");
    }

    #[test]
    fn test_parse_extinf_without_attributes() {
        let info = parse_extinf("#EXTINF:-1,Plain Channel");
        assert_eq!(info.name, "Plain Channel");
        assert!(info.tvg_id.is_empty());
    }

    #[test]
    fn test_parse_playlist() {
        let channels = parse_m3u(SAMPLE, "provider1");
        assert_eq!(channels.len(), 2);

        assert_eq!(channels[0].channel_id, "m3u-espn.us");
        assert_eq!(channels[0].guide_name, "ESPN HD");
        assert_eq!(channels[0].tvg_id, "espn.us");
        assert_eq!(channels[0].primary_stream_url, "http://host/live/u/p/1.ts");
        assert_eq!(channels[0].source_tag, "provider1");

        assert_eq!(channels[1].channel_id, "m3u-2");
        assert!(channels[1].tvg_id.is_empty());
    }

    #[test]
    fn test_incremental_matches_batch() {
        let mut parser = M3uParser::new("provider1");
        for line in SAMPLE.lines() {
            parser.push_line(line);
        }
        assert_eq!(parser.finish(), parse_m3u(SAMPLE, "provider1"));
    }

    #[test]
    fn test_orphan_url_lines_are_skipped() {
        let channels = parse_m3u("http://host/loose.ts\n", "x");
        assert!(channels.is_empty());
    }
}
