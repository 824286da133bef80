//! Stream gateway
//!
//! Opens upstream streams on demand with per-channel failover across the
//! ranked provider URLs, selects remux vs transcode, applies the configured
//! buffering policy and enforces admission by tuner count. Cleanup (tuner
//! permit, session row, child processes) is tied to guard drops so every
//! exit path releases everything.

pub mod buffer;
pub mod remux;
pub mod transcode;

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::LiveChannel;
use crate::config::{BufferPolicy, TranscodeMode};
use crate::provider::probe::is_cloudflare_response;

/// Connect timeout per failover attempt.
pub const OPEN_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total budget for opening one channel across all its URLs.
pub const OPEN_TOTAL_BUDGET: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("all tuners in use")]
    AllTunersInUse,

    #[error("channel not found")]
    ChannelNotFound,

    #[error("all upstream urls failed: {0}")]
    Upstream(String),

    #[error("transcoder error: {0}")]
    Transcoder(#[from] io::Error),
}

/// Why one upstream attempt failed; drives the try-next decision and the log
/// line, never the client response.
#[derive(Debug, Clone)]
pub enum FailureReason {
    ConnectionTimeout,
    ConnectionError(String),
    HttpError(u16),
    CloudflareBlocked,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ConnectionTimeout => write!(f, "connection timeout"),
            FailureReason::ConnectionError(msg) => write!(f, "connection error: {msg}"),
            FailureReason::HttpError(code) => write!(f, "http {code}"),
            FailureReason::CloudflareBlocked => write!(f, "cloudflare block"),
        }
    }
}

impl FailureReason {
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            FailureReason::ConnectionTimeout
        } else {
            FailureReason::ConnectionError(error.to_string())
        }
    }
}

/// Process-wide view of streaming activity, shared with the SDT prober.
///
/// `idle_for` reports how long the gateway has been continuously idle; while
/// any stream is open it is zero.
#[derive(Debug)]
pub struct TunerActivity {
    active: AtomicUsize,
    last_active_ms: AtomicU64,
    epoch: Instant,
}

impl Default for TunerActivity {
    fn default() -> Self {
        Self {
            active: AtomicUsize::new(0),
            last_active_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }
}

impl TunerActivity {
    // 1-based so that 0 can mean "never active"
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    pub fn stream_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.last_active_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    pub fn stream_ended(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.last_active_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        if self.active_streams() > 0 {
            return Duration::ZERO;
        }
        match self.last_active_ms.load(Ordering::SeqCst) {
            // No stream has ever run: idle since forever
            0 => Duration::MAX,
            last => Duration::from_millis(self.now_ms().saturating_sub(last)),
        }
    }
}

/// Bookkeeping row for an open stream.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub channel_id: String,
    pub upstream_url: String,
    pub transcoding: bool,
    pub started_at: Instant,
}

/// RAII guard: releasing it frees the tuner slot and the session row.
struct SessionGuard {
    session_id: String,
    sessions: Arc<DashMap<String, StreamSession>>,
    activity: Arc<TunerActivity>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.session_id);
        self.activity.stream_ended();
        debug!(session = %self.session_id, "stream session closed");
    }
}

/// The byte stream handed to the HTTP layer. Dropping it tears down the
/// whole chain: buffers, transcoder process, upstream connection, permit.
pub struct StreamHandle {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
    _guard: SessionGuard,
}

impl Stream for StreamHandle {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

pub struct StreamGateway {
    http: reqwest::Client,
    tuner_slots: Arc<tokio::sync::Semaphore>,
    activity: Arc<TunerActivity>,
    sessions: Arc<DashMap<String, StreamSession>>,
    transcode: TranscodeMode,
    buffer: BufferPolicy,
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl StreamGateway {
    pub fn new(
        tuner_count: u32,
        transcode: TranscodeMode,
        buffer: BufferPolicy,
        ffmpeg_path: String,
        ffprobe_path: String,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(OPEN_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        Ok(Self {
            http,
            tuner_slots: Arc::new(tokio::sync::Semaphore::new(tuner_count as usize)),
            activity: Arc::new(TunerActivity::default()),
            sessions: Arc::new(DashMap::new()),
            transcode,
            buffer,
            ffmpeg_path,
            ffprobe_path,
        })
    }

    pub fn activity(&self) -> Arc<TunerActivity> {
        self.activity.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Open a live stream for a channel.
    ///
    /// URLs are tried strictly in order, primary first; the first upstream
    /// that answers 2xx without Cloudflare markers wins.
    pub async fn open_stream(&self, channel: &LiveChannel) -> Result<StreamHandle, GatewayError> {
        let permit = self
            .tuner_slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| GatewayError::AllTunersInUse)?;

        let started = Instant::now();
        let mut last_failure: Option<FailureReason> = None;
        let mut opened: Option<(String, reqwest::Response)> = None;

        for url in channel.stream_urls() {
            if started.elapsed() > OPEN_TOTAL_BUDGET {
                warn!(channel = %channel.channel_id, "open budget exhausted");
                break;
            }
            match self.try_open(url).await {
                Ok(response) => {
                    opened = Some((url.to_string(), response));
                    break;
                }
                Err(reason) => {
                    debug!(channel = %channel.channel_id, url, %reason, "upstream attempt failed");
                    last_failure = Some(reason);
                }
            }
        }

        let Some((url, response)) = opened else {
            let reason = last_failure
                .map(|r| r.to_string())
                .unwrap_or_else(|| "no stream urls".into());
            return Err(GatewayError::Upstream(reason));
        };

        // Mode selection: off = remux only, on = always transcode, auto =
        // probe and transcode only when codecs fall outside the passthrough set
        let is_hls = looks_like_hls(&url, &response);
        let transcoding = match self.transcode {
            TranscodeMode::On => true,
            TranscodeMode::Off => false,
            TranscodeMode::Auto => {
                match transcode::probe_codecs(&self.ffprobe_path, &url).await {
                    Ok(info) => transcode::needs_transcode(&info),
                    Err(e) => {
                        warn!(channel = %channel.channel_id, error = %e, "codec probe failed, passing through");
                        false
                    }
                }
            }
        };

        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            StreamSession {
                channel_id: channel.channel_id.clone(),
                upstream_url: url.clone(),
                transcoding,
                started_at: Instant::now(),
            },
        );
        self.activity.stream_started();
        let guard = SessionGuard {
            session_id: session_id.clone(),
            sessions: self.sessions.clone(),
            activity: self.activity.clone(),
            _permit: permit,
        };

        info!(
            channel = %channel.channel_id,
            session = %session_id,
            transcoding,
            hls = is_hls,
            "stream opened"
        );

        let raw: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>> = if transcoding {
            drop(response);
            Box::pin(transcode::ffmpeg_stream(&self.ffmpeg_path, &url, true)?)
        } else if is_hls {
            let playlist = response
                .text()
                .await
                .map_err(|e| GatewayError::Upstream(e.to_string()))?;
            match remux::HlsRemuxer::start(self.http.clone(), url.clone(), playlist).await {
                Ok(remuxer) => Box::pin(remuxer),
                // Encrypted or otherwise unconcatenatable playlists still get
                // remuxed, just through the external tool with -c copy
                Err(remux::RemuxError::NeedsExternalRemux) => {
                    Box::pin(transcode::ffmpeg_stream(&self.ffmpeg_path, &url, false)?)
                }
                Err(remux::RemuxError::Upstream(e)) => {
                    return Err(GatewayError::Upstream(e));
                }
            }
        } else {
            Box::pin(
                response
                    .bytes_stream()
                    .map(|r| r.map_err(|e| io::Error::other(e.to_string()))),
            )
        };

        let buffered: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>> =
            match self.buffer {
                BufferPolicy::Off => raw,
                BufferPolicy::Adaptive => Box::pin(buffer::BufferedRelay::adaptive(raw)),
                BufferPolicy::Fixed(bytes) => Box::pin(buffer::BufferedRelay::fixed(raw, bytes)),
            };

        Ok(StreamHandle { inner: buffered, _guard: guard })
    }

    /// One upstream attempt: GET, classify failures for the failover loop.
    async fn try_open(&self, url: &str) -> Result<reqwest::Response, FailureReason> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FailureReason::from_reqwest_error(&e))?;

        let status = response.status().as_u16();
        let server = response
            .headers()
            .get(reqwest::header::SERVER)
            .and_then(|v| v.to_str().ok());
        let cf_ray = response.headers().contains_key("cf-ray");
        if is_cloudflare_response(status, server, cf_ray, "") {
            return Err(FailureReason::CloudflareBlocked);
        }
        if !response.status().is_success() {
            return Err(FailureReason::HttpError(status));
        }
        Ok(response)
    }
}

fn looks_like_hls(url: &str, response: &reqwest::Response) -> bool {
    let path = url.split('?').next().unwrap_or(url);
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        return true;
    }
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("mpegurl"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // TunerActivity
    // =========================================================================

    #[test]
    fn test_activity_counts() {
        let activity = TunerActivity::default();
        assert_eq!(activity.active_streams(), 0);

        activity.stream_started();
        activity.stream_started();
        assert_eq!(activity.active_streams(), 2);
        assert_eq!(activity.idle_for(), Duration::ZERO);

        activity.stream_ended();
        activity.stream_ended();
        assert_eq!(activity.active_streams(), 0);
    }

    #[test]
    fn test_idle_duration_grows_after_last_stream() {
        let activity = TunerActivity::default();
        activity.stream_started();
        activity.stream_ended();

        std::thread::sleep(Duration::from_millis(30));
        assert!(activity.idle_for() >= Duration::from_millis(20));
    }

    // =========================================================================
    // Admission
    // =========================================================================

    #[tokio::test]
    async fn test_admission_limit() {
        let gateway = StreamGateway::new(
            2,
            TranscodeMode::Off,
            BufferPolicy::Off,
            "ffmpeg".into(),
            "ffprobe".into(),
        )
        .unwrap();

        let p1 = gateway.tuner_slots.clone().try_acquire_owned();
        let p2 = gateway.tuner_slots.clone().try_acquire_owned();
        let p3 = gateway.tuner_slots.clone().try_acquire_owned();
        assert!(p1.is_ok());
        assert!(p2.is_ok());
        assert!(p3.is_err());

        drop(p1);
        assert!(gateway.tuner_slots.clone().try_acquire_owned().is_ok());
    }

    #[tokio::test]
    async fn test_open_unreachable_channel_fails_without_leaking_permit() {
        let gateway = StreamGateway::new(
            1,
            TranscodeMode::Off,
            BufferPolicy::Off,
            "ffmpeg".into(),
            "ffprobe".into(),
        )
        .unwrap();

        let channel = LiveChannel {
            channel_id: "c1".into(),
            guide_number: "1".into(),
            guide_name: "C1".into(),
            tvg_id: String::new(),
            tvg_logo: String::new(),
            group_title: String::new(),
            epg_linked: false,
            quality_tier: crate::catalog::QualityTier::Sd,
            // RFC 5737 TEST-NET, nothing listens there
            primary_stream_url: "http://192.0.2.1:9/stream.ts".into(),
            backup_stream_urls: vec![],
            source_tag: String::new(),
            sdt: None,
        };

        let result = gateway.open_stream(&channel).await;
        assert!(matches!(result, Err(GatewayError::Upstream(_))));
        // The permit must have been returned
        assert_eq!(gateway.tuner_slots.available_permits(), 1);
        assert_eq!(gateway.active_sessions(), 0);
    }

    // =========================================================================
    // HLS detection
    // =========================================================================

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(FailureReason::HttpError(502).to_string(), "http 502");
        assert_eq!(FailureReason::CloudflareBlocked.to_string(), "cloudflare block");
    }
}
