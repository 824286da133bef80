//! Native HLS to MPEG-TS remux
//!
//! Concatenates the segments of an unencrypted HLS media playlist into one
//! continuous transport stream, rewriting continuity counters so the joined
//! output is valid. Encrypted playlists are punted to the external remuxer;
//! the native path never decrypts.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sdt::section::TS_PACKET_SIZE;

/// Segments buffered between the downloader task and the HTTP response.
const SEGMENT_CHANNEL_DEPTH: usize = 4;

/// Fallback playlist refresh interval when no target duration is declared.
const DEFAULT_TARGET_DURATION_SECS: u64 = 6;

#[derive(Debug, thiserror::Error)]
pub enum RemuxError {
    /// Playlist needs tooling we do not do natively (encryption, fMP4).
    #[error("playlist requires external remux")]
    NeedsExternalRemux,

    #[error("upstream error: {0}")]
    Upstream(String),
}

/// A parsed media playlist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaPlaylist {
    pub media_sequence: u64,
    pub target_duration_secs: u64,
    pub ended: bool,
    pub encrypted: bool,
    pub fmp4: bool,
    /// Segment URIs in playlist order, resolved against the playlist URL.
    pub segments: Vec<String>,
    /// First variant URI when this is a master playlist.
    pub variant: Option<String>,
}

/// Resolve a possibly-relative playlist URI.
fn resolve_uri(base: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    match url::Url::parse(base).and_then(|b| b.join(uri)) {
        Ok(joined) => joined.to_string(),
        Err(_) => uri.to_string(),
    }
}

/// Parse an HLS playlist body.
pub fn parse_playlist(base_url: &str, body: &str) -> MediaPlaylist {
    let mut playlist = MediaPlaylist {
        target_duration_secs: DEFAULT_TARGET_DURATION_SECS,
        ..Default::default()
    };
    let mut next_is_variant = false;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            playlist.media_sequence = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            playlist.target_duration_secs = rest.trim().parse().unwrap_or(DEFAULT_TARGET_DURATION_SECS);
        } else if line.starts_with("#EXT-X-ENDLIST") {
            playlist.ended = true;
        } else if line.starts_with("#EXT-X-KEY:") && !line.contains("METHOD=NONE") {
            playlist.encrypted = true;
        } else if line.starts_with("#EXT-X-MAP:") {
            playlist.fmp4 = true;
        } else if line.starts_with("#EXT-X-STREAM-INF:") {
            next_is_variant = true;
        } else if !line.starts_with('#') {
            let resolved = resolve_uri(base_url, line);
            if next_is_variant {
                if playlist.variant.is_none() {
                    playlist.variant = Some(resolved);
                }
                next_is_variant = false;
            } else {
                playlist.segments.push(resolved);
            }
        }
    }
    playlist
}

/// Rewrites TS continuity counters to be monotonic per PID across segment
/// boundaries, and keeps per-PID state between segments.
#[derive(Debug, Default)]
pub struct ContinuityFixer {
    counters: HashMap<u16, u8>,
}

impl ContinuityFixer {
    /// Fix one segment in place. Packets without payload keep their counter
    /// untouched, matching the TS rule that only payload packets increment.
    pub fn fix(&mut self, segment: &mut [u8]) {
        for packet in segment.chunks_exact_mut(TS_PACKET_SIZE) {
            if packet[0] != 0x47 {
                continue;
            }
            let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
            let has_payload = packet[3] & 0x10 != 0;
            if !has_payload {
                continue;
            }
            let counter = self.counters.entry(pid).or_insert(0);
            packet[3] = (packet[3] & 0xF0) | *counter;
            *counter = (*counter + 1) & 0x0F;
        }
    }
}

/// Streams a live or VOD HLS playlist as one continuous TS.
pub struct HlsRemuxer {
    rx: mpsc::Receiver<Result<Bytes, io::Error>>,
    task: tokio::task::JoinHandle<()>,
}

impl HlsRemuxer {
    pub async fn start(
        http: reqwest::Client,
        playlist_url: String,
        initial_body: String,
    ) -> Result<Self, RemuxError> {
        let mut playlist_url = playlist_url;
        let mut playlist = parse_playlist(&playlist_url, &initial_body);

        // One level of master -> variant indirection
        if let Some(variant) = playlist.variant.clone() {
            let body = fetch_text(&http, &variant)
                .await
                .map_err(RemuxError::Upstream)?;
            playlist = parse_playlist(&variant, &body);
            playlist_url = variant;
        }

        if playlist.encrypted || playlist.fmp4 {
            return Err(RemuxError::NeedsExternalRemux);
        }
        if playlist.segments.is_empty() && playlist.ended {
            return Err(RemuxError::Upstream("empty playlist".into()));
        }

        let (tx, rx) = mpsc::channel(SEGMENT_CHANNEL_DEPTH);
        let task = tokio::spawn(segment_loop(http, playlist_url, playlist, tx));
        Ok(Self { rx, task })
    }
}

impl Stream for HlsRemuxer {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for HlsRemuxer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn fetch_text(http: &reqwest::Client, url: &str) -> Result<String, String> {
    let response = http.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("http {}", response.status().as_u16()));
    }
    response.text().await.map_err(|e| e.to_string())
}

/// Download segments in order, refresh the playlist for live streams, and
/// push fixed TS chunks into the channel until ENDLIST or the client leaves.
async fn segment_loop(
    http: reqwest::Client,
    playlist_url: String,
    mut playlist: MediaPlaylist,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
) {
    let mut fixer = ContinuityFixer::default();
    // Absolute sequence number of the next segment to deliver
    let mut next_sequence = playlist.media_sequence;

    loop {
        let first = playlist.media_sequence;
        let skip = next_sequence.saturating_sub(first) as usize;

        for (offset, segment_url) in playlist.segments.iter().enumerate().skip(skip) {
            let sequence = first + offset as u64;
            match http.get(segment_url).send().await {
                Ok(response) if response.status().is_success() => match response.bytes().await {
                    Ok(body) => {
                        let mut data = body.to_vec();
                        fixer.fix(&mut data);
                        if tx.send(Ok(Bytes::from(data))).await.is_err() {
                            // Client went away; not an upstream failure
                            debug!("hls client disconnected");
                            return;
                        }
                        next_sequence = sequence + 1;
                    }
                    Err(e) => {
                        warn!(url = %segment_url, error = %e, "segment read failed");
                    }
                },
                Ok(response) => {
                    warn!(url = %segment_url, status = response.status().as_u16(), "segment fetch failed");
                }
                Err(e) => {
                    warn!(url = %segment_url, error = %e, "segment fetch failed");
                }
            }
        }

        if playlist.ended {
            return;
        }

        // Live playlist: wait roughly half a target duration, then refresh
        tokio::time::sleep(Duration::from_secs(
            (playlist.target_duration_secs / 2).max(1),
        ))
        .await;

        match fetch_text(&http, &playlist_url).await {
            Ok(body) => {
                let refreshed = parse_playlist(&playlist_url, &body);
                if refreshed.encrypted || refreshed.fmp4 {
                    let _ = tx
                        .send(Err(io::Error::other("playlist switched to encrypted")))
                        .await;
                    return;
                }
                playlist = refreshed;
            }
            Err(e) => {
                warn!(error = %e, "playlist refresh failed");
            }
        }
    }
}
