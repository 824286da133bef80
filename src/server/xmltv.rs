//! XMLTV guide: parsing, remapping and generation
//!
//! The served `guide.xml` is either a placeholder generated from the current
//! lineup or a remap of an upstream XMLTV feed: channels are filtered to the
//! lineup, ids are rewritten to the local guide numbers, display names and
//! titles honor the configured language / Latin-script preferences, and
//! channels without programme data can be backfilled with dummy blocks.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::catalog::LiveChannel;

#[derive(Debug, thiserror::Error)]
pub enum XmltvError {
    #[error("xmltv download error: {0}")]
    Download(String),

    #[error("xmltv decompress error: {0}")]
    Decompress(String),

    #[error("xmltv parse error: {0}")]
    Parse(String),

    #[error("xmltv write error: {0}")]
    Write(String),
}

/// A text node with its language attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct TextAlt {
    pub lang: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChannel {
    pub id: String,
    pub display_names: Vec<TextAlt>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedProgramme {
    pub channel: String,
    pub start: String,
    pub stop: String,
    pub titles: Vec<TextAlt>,
    pub descs: Vec<TextAlt>,
    pub categories: Vec<String>,
}

/// Output shaping options, mirroring the `xmltv_*` configuration surface.
#[derive(Debug, Clone, Default)]
pub struct GuideOptions {
    pub prefer_langs: Vec<String>,
    pub prefer_latin: bool,
    pub non_latin_title_fallback: bool,
    pub dummy_guide: bool,
    /// Drop channels without a tvg_id from the guide entirely.
    pub prune_unlinked: bool,
    /// Only channels with actual upstream programme data appear.
    pub live_epg_only: bool,
}

pub fn detect_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1F && data[1] == 0x8B
}

/// Fetch an upstream XMLTV document, transparently decompressing gzip
/// (magic bytes or content-type).
pub async fn fetch_xmltv(url: &str, timeout: Duration) -> Result<Vec<u8>, XmltvError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| XmltvError::Download(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| XmltvError::Download(e.to_string()))?;
    if !response.status().is_success() {
        return Err(XmltvError::Download(format!("http {}", response.status().as_u16())));
    }

    let gzip_content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("gzip"))
        .unwrap_or(false);

    let data = response
        .bytes()
        .await
        .map_err(|e| XmltvError::Download(e.to_string()))?
        .to_vec();

    if detect_gzip(&data) || gzip_content_type {
        let mut decoder = GzDecoder::new(data.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| XmltvError::Decompress(e.to_string()))?;
        Ok(out)
    } else {
        Ok(data)
    }
}

fn get_attr(start: &BytesStart, name: &[u8]) -> Option<String> {
    start.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name {
            String::from_utf8(a.value.to_vec()).ok()
        } else {
            None
        }
    })
}

fn read_text(reader: &mut Reader<&[u8]>) -> Result<String, XmltvError> {
    let mut buf = Vec::new();
    let mut out = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(t)) => {
                out.push_str(&t.unescape().map_err(|e| XmltvError::Parse(e.to_string()))?);
            }
            Ok(Event::End(_)) => return Ok(out),
            Ok(Event::Eof) => return Err(XmltvError::Parse("unexpected eof in text".into())),
            Err(e) => return Err(XmltvError::Parse(e.to_string())),
            _ => {}
        }
    }
}

/// Streaming parse of an XMLTV document. Channels are deduplicated by id
/// (first occurrence wins).
pub fn parse_xmltv(data: &[u8]) -> Result<(Vec<ParsedChannel>, Vec<ParsedProgramme>), XmltvError> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut channels_map: HashMap<String, ParsedChannel> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut programmes = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"channel" => {
                    let channel = parse_channel(&mut reader, &e)?;
                    if !channels_map.contains_key(&channel.id) {
                        order.push(channel.id.clone());
                        channels_map.insert(channel.id.clone(), channel);
                    }
                }
                b"programme" => programmes.push(parse_programme(&mut reader, &e)?),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(XmltvError::Parse(format!(
                    "xml error at {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    let channels = order
        .into_iter()
        .filter_map(|id| channels_map.remove(&id))
        .collect();
    Ok((channels, programmes))
}

fn parse_channel(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<ParsedChannel, XmltvError> {
    let id = get_attr(start, b"id")
        .ok_or_else(|| XmltvError::Parse("channel missing id".into()))?;

    let mut channel = ParsedChannel { id, ..Default::default() };
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"display-name" => {
                    let lang = get_attr(&e, b"lang");
                    let text = read_text(reader)?;
                    channel.display_names.push(TextAlt { lang, text });
                }
                _ => {
                    // skip unknown subtree
                    let mut depth = 1;
                    let mut skip_buf = Vec::new();
                    while depth > 0 {
                        match reader.read_event_into(&mut skip_buf) {
                            Ok(Event::Start(_)) => depth += 1,
                            Ok(Event::End(_)) => depth -= 1,
                            Ok(Event::Eof) => {
                                return Err(XmltvError::Parse("eof in channel".into()))
                            }
                            Err(e) => return Err(XmltvError::Parse(e.to_string())),
                            _ => {}
                        }
                        skip_buf.clear();
                    }
                }
            },
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"icon" {
                    channel.icon = get_attr(&e, b"src");
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"channel" => break,
            Ok(Event::Eof) => return Err(XmltvError::Parse("eof in channel".into())),
            Err(e) => return Err(XmltvError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(channel)
}

fn parse_programme(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
) -> Result<ParsedProgramme, XmltvError> {
    let mut programme = ParsedProgramme {
        channel: get_attr(start, b"channel")
            .ok_or_else(|| XmltvError::Parse("programme missing channel".into()))?,
        start: get_attr(start, b"start")
            .ok_or_else(|| XmltvError::Parse("programme missing start".into()))?,
        stop: get_attr(start, b"stop").unwrap_or_default(),
        ..Default::default()
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let lang = get_attr(&e, b"lang");
                match e.name().as_ref() {
                    b"title" => {
                        let text = read_text(reader)?;
                        programme.titles.push(TextAlt { lang, text });
                    }
                    b"desc" => {
                        let text = read_text(reader)?;
                        programme.descs.push(TextAlt { lang, text });
                    }
                    b"category" => programme.categories.push(read_text(reader)?),
                    _ => {
                        let mut depth = 1;
                        let mut skip_buf = Vec::new();
                        while depth > 0 {
                            match reader.read_event_into(&mut skip_buf) {
                                Ok(Event::Start(_)) => depth += 1,
                                Ok(Event::End(_)) => depth -= 1,
                                Ok(Event::Eof) => {
                                    return Err(XmltvError::Parse("eof in programme".into()))
                                }
                                Err(e) => return Err(XmltvError::Parse(e.to_string())),
                                _ => {}
                            }
                            skip_buf.clear();
                        }
                    }
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"programme" => break,
            Ok(Event::Eof) => return Err(XmltvError::Parse("eof in programme".into())),
            Err(e) => return Err(XmltvError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(programme)
}

/// Share of alphabetic characters that must be Latin for a string to count
/// as Latin-script.
fn is_mostly_latin(text: &str) -> bool {
    let mut alpha = 0usize;
    let mut latin = 0usize;
    for c in text.chars() {
        if c.is_alphabetic() {
            alpha += 1;
            if c.is_ascii_alphabetic() || ('\u{00C0}'..='\u{024F}').contains(&c) {
                latin += 1;
            }
        }
    }
    alpha == 0 || latin * 5 >= alpha * 4
}

/// Pick the text to serve from a set of language alternatives.
///
/// Returns the chosen text plus, when the Latin preference displaced a
/// non-Latin original and the fallback is enabled, that original.
pub fn select_text(
    alternatives: &[TextAlt],
    opts: &GuideOptions,
) -> Option<(String, Option<String>)> {
    if alternatives.is_empty() {
        return None;
    }

    // Candidates in preference order: configured languages first, input
    // order otherwise
    let mut ordered: Vec<&TextAlt> = Vec::with_capacity(alternatives.len());
    for lang in &opts.prefer_langs {
        for alt in alternatives {
            if alt.lang.as_deref() == Some(lang.as_str()) && !ordered.iter().any(|o| *o == alt) {
                ordered.push(alt);
            }
        }
    }
    for alt in alternatives {
        if !ordered.iter().any(|o| *o == alt) {
            ordered.push(alt);
        }
    }

    let first = ordered[0];
    if opts.prefer_latin && !is_mostly_latin(&first.text) {
        if let Some(latin) = ordered.iter().find(|a| is_mostly_latin(&a.text)) {
            let fallback = opts
                .non_latin_title_fallback
                .then(|| first.text.clone());
            return Some((latin.text.clone(), fallback));
        }
    }
    Some((first.text.clone(), None))
}

fn format_xmltv_time(t: DateTime<Utc>) -> String {
    t.format("%Y%m%d%H%M%S +0000").to_string()
}

/// Render the served guide.
///
/// `lineup` is the already-shaped channel list; `upstream` the parsed
/// upstream feed (empty for a pure placeholder guide). Channel ids in the
/// output are the local guide numbers.
pub fn write_guide(
    lineup: &[LiveChannel],
    upstream_channels: &[ParsedChannel],
    upstream_programmes: &[ParsedProgramme],
    opts: &GuideOptions,
    now: DateTime<Utc>,
) -> Result<String, XmltvError> {
    let bytes = render_guide(lineup, upstream_channels, upstream_programmes, opts, now)
        .map_err(|e| XmltvError::Write(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| XmltvError::Write(e.to_string()))
}

fn render_guide(
    lineup: &[LiveChannel],
    upstream_channels: &[ParsedChannel],
    upstream_programmes: &[ParsedProgramme],
    opts: &GuideOptions,
    now: DateTime<Utc>,
) -> Result<Vec<u8>, quick_xml::Error> {
    let by_tvg: HashMap<&str, &ParsedChannel> = upstream_channels
        .iter()
        .map(|c| (c.id.as_str(), c))
        .collect();
    let has_programmes: HashSet<&str> = upstream_programmes
        .iter()
        .map(|p| p.channel.as_str())
        .collect();

    let mut writer = Writer::new(Vec::new());

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("generator-info-name", "tunebridge"));
    writer.write_event(Event::Start(tv))?;

    // tvg_id -> local guide number, for programme remapping
    let mut remap: HashMap<&str, &str> = HashMap::new();

    for ch in lineup {
        let upstream = (!ch.tvg_id.is_empty())
            .then(|| by_tvg.get(ch.tvg_id.as_str()).copied())
            .flatten();
        let linked = upstream.is_some() && has_programmes.contains(ch.tvg_id.as_str());

        if opts.prune_unlinked && ch.tvg_id.is_empty() {
            continue;
        }
        if opts.live_epg_only && !linked {
            continue;
        }

        if let Some(up) = upstream {
            remap.insert(up.id.as_str(), ch.guide_number.as_str());
        }

        let mut channel_el = BytesStart::new("channel");
        channel_el.push_attribute(("id", ch.guide_number.as_str()));
        writer.write_event(Event::Start(channel_el))?;

        let display_name = upstream
            .and_then(|up| select_text(&up.display_names, opts))
            .map(|(text, _)| text)
            .unwrap_or_else(|| ch.guide_name.clone());
        write_text_element(&mut writer, "display-name", &display_name, None)?;

        let icon = upstream
            .and_then(|up| up.icon.clone())
            .or_else(|| (!ch.tvg_logo.is_empty()).then(|| ch.tvg_logo.clone()));
        if let Some(icon) = icon {
            let mut icon_el = BytesStart::new("icon");
            icon_el.push_attribute(("src", icon.as_str()));
            writer.write_event(Event::Empty(icon_el))?;
        }

        writer.write_event(Event::End(BytesEnd::new("channel")))?;
    }

    // Remapped upstream programmes
    for programme in upstream_programmes {
        let Some(local_id) = remap.get(programme.channel.as_str()) else {
            continue;
        };
        let mut el = BytesStart::new("programme");
        el.push_attribute(("start", programme.start.as_str()));
        if !programme.stop.is_empty() {
            el.push_attribute(("stop", programme.stop.as_str()));
        }
        el.push_attribute(("channel", *local_id));
        writer.write_event(Event::Start(el))?;

        if let Some((title, fallback)) = select_text(&programme.titles, opts) {
            write_text_element(&mut writer, "title", &title, None)?;
            if let Some(original) = fallback {
                write_text_element(&mut writer, "sub-title", &original, None)?;
            }
        }
        if let Some((desc, _)) = select_text(&programme.descs, opts) {
            write_text_element(&mut writer, "desc", &desc, None)?;
        }
        for category in &programme.categories {
            write_text_element(&mut writer, "category", category, None)?;
        }

        writer.write_event(Event::End(BytesEnd::new("programme")))?;
    }

    // Dummy backfill: 2-hour blocks for the next 24h on channels that have
    // no upstream data
    if opts.dummy_guide {
        for ch in lineup {
            let covered = !ch.tvg_id.is_empty() && has_programmes.contains(ch.tvg_id.as_str());
            if covered || (opts.prune_unlinked && ch.tvg_id.is_empty()) {
                continue;
            }
            if opts.live_epg_only {
                continue;
            }
            let base = now - chrono::Duration::minutes(now.minute() as i64)
                - chrono::Duration::seconds(now.second() as i64);
            for block in 0..12 {
                let start = base + chrono::Duration::hours(block * 2);
                let stop = start + chrono::Duration::hours(2);

                let mut el = BytesStart::new("programme");
                el.push_attribute(("start", format_xmltv_time(start).as_str()));
                el.push_attribute(("stop", format_xmltv_time(stop).as_str()));
                el.push_attribute(("channel", ch.guide_number.as_str()));
                writer.write_event(Event::Start(el))?;
                write_text_element(&mut writer, "title", &ch.guide_name, None)?;
                writer.write_event(Event::End(BytesEnd::new("programme")))?;
            }
        }
    }

    writer.write_event(Event::End(BytesEnd::new("tv")))?;

    Ok(writer.into_inner())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
    lang: Option<&str>,
) -> Result<(), quick_xml::Error> {
    let mut el = BytesStart::new(name);
    if let Some(lang) = lang {
        el.push_attribute(("lang", lang));
    }
    writer.write_event(Event::Start(el))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Placeholder guide straight from the lineup, dummy blocks included.
pub fn placeholder_guide(lineup: &[LiveChannel], now: DateTime<Utc>) -> Result<String, XmltvError> {
    let opts = GuideOptions { dummy_guide: true, ..Default::default() };
    write_guide(lineup, &[], &[], &opts, now)
}

use chrono::Timelike;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::QualityTier;
    use chrono::TimeZone;

    fn lineup_channel(number: &str, name: &str, tvg: &str) -> LiveChannel {
        LiveChannel {
            channel_id: format!("id-{number}"),
            guide_number: number.to_string(),
            guide_name: name.to_string(),
            tvg_id: tvg.to_string(),
            tvg_logo: String::new(),
            group_title: String::new(),
            epg_linked: !tvg.is_empty(),
            quality_tier: QualityTier::Sd,
            primary_stream_url: String::new(),
            backup_stream_urls: vec![],
            source_tag: String::new(),
            sdt: None,
        }
    }

    const UPSTREAM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="espn.us">
    <display-name lang="en">ESPN</display-name>
    <icon src="http://logo/espn.png"/>
  </channel>
  <channel id="other.us">
    <display-name>Other</display-name>
  </channel>
  <programme start="20260801120000 +0000" stop="20260801130000 +0000" channel="espn.us">
    <title lang="en">SportsCenter</title>
    <desc lang="en">News and highlights.</desc>
    <category>Sports</category>
  </programme>
  <programme start="20260801130000 +0000" stop="20260801140000 +0000" channel="other.us">
    <title>Elsewhere</title>
  </programme>
</tv>"#;

    #[test]
    fn test_parse_xmltv() {
        let (channels, programmes) = parse_xmltv(UPSTREAM.as_bytes()).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].id, "espn.us");
        assert_eq!(channels[0].display_names[0].text, "ESPN");
        assert_eq!(channels[0].icon.as_deref(), Some("http://logo/espn.png"));
        assert_eq!(programmes.len(), 2);
        assert_eq!(programmes[0].titles[0].text, "SportsCenter");
        assert_eq!(programmes[0].categories, vec!["Sports"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_xmltv(b"<tv><channel></tv>").is_err());
    }

    #[test]
    fn test_remap_keeps_only_lineup_channels() {
        let (channels, programmes) = parse_xmltv(UPSTREAM.as_bytes()).unwrap();
        let lineup = vec![lineup_channel("101", "ESPN HD", "espn.us")];
        let opts = GuideOptions::default();

        let xml = write_guide(&lineup, &channels, &programmes, &opts, Utc::now()).unwrap();

        // The lineup channel is present under its local guide number
        assert!(xml.contains(r#"<channel id="101">"#));
        assert!(xml.contains(r#"channel="101""#));
        assert!(xml.contains("SportsCenter"));
        // The non-lineup channel and its programme are gone
        assert!(!xml.contains("other.us"));
        assert!(!xml.contains("Elsewhere"));
        assert!(!xml.contains("espn.us"));
    }

    #[test]
    fn test_placeholder_guide_has_dummy_blocks() {
        let lineup = vec![lineup_channel("5", "Mystery", "")];
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 0).unwrap();
        let xml = placeholder_guide(&lineup, now).unwrap();

        assert!(xml.contains(r#"<channel id="5">"#));
        // Blocks snap to the hour
        assert!(xml.contains(r#"start="20260801090000 +0000""#));
        assert!(xml.contains("<title>Mystery</title>"));
        // 12 two-hour blocks
        assert_eq!(xml.matches("<programme").count(), 12);
    }

    #[test]
    fn test_prune_unlinked() {
        let lineup = vec![
            lineup_channel("1", "Linked", "espn.us"),
            lineup_channel("2", "Unlinked", ""),
        ];
        let (channels, programmes) = parse_xmltv(UPSTREAM.as_bytes()).unwrap();
        let opts = GuideOptions { prune_unlinked: true, dummy_guide: true, ..Default::default() };

        let xml = write_guide(&lineup, &channels, &programmes, &opts, Utc::now()).unwrap();
        assert!(xml.contains(r#"<channel id="1">"#));
        assert!(!xml.contains(r#"<channel id="2">"#));
    }

    // =========================================================================
    // Language / script selection
    // =========================================================================

    fn alt(lang: Option<&str>, text: &str) -> TextAlt {
        TextAlt { lang: lang.map(String::from), text: text.to_string() }
    }

    #[test]
    fn test_select_text_prefers_configured_language() {
        let opts = GuideOptions {
            prefer_langs: vec!["en".into()],
            ..Default::default()
        };
        let alts = vec![alt(Some("ru"), "Новости"), alt(Some("en"), "News")];
        let (text, fallback) = select_text(&alts, &opts).unwrap();
        assert_eq!(text, "News");
        assert!(fallback.is_none());
    }

    #[test]
    fn test_select_text_latin_preference_with_fallback() {
        let opts = GuideOptions {
            prefer_latin: true,
            non_latin_title_fallback: true,
            ..Default::default()
        };
        let alts = vec![alt(Some("ru"), "Новости"), alt(Some("en"), "News")];
        let (text, fallback) = select_text(&alts, &opts).unwrap();
        assert_eq!(text, "News");
        assert_eq!(fallback.as_deref(), Some("Новости"));
    }

    #[test]
    fn test_select_text_keeps_non_latin_when_no_alternative() {
        let opts = GuideOptions { prefer_latin: true, ..Default::default() };
        let alts = vec![alt(Some("ru"), "Новости")];
        let (text, _) = select_text(&alts, &opts).unwrap();
        assert_eq!(text, "Новости");
    }

    #[test]
    fn test_is_mostly_latin() {
        assert!(is_mostly_latin("SportsCenter"));
        assert!(is_mostly_latin("Fútbol Club"));
        assert!(!is_mostly_latin("Новости дня"));
        assert!(is_mostly_latin("12345"));
    }
}
