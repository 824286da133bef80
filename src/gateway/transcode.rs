//! External transcoder / remuxer invocation
//!
//! Wraps ffprobe (codec gate for `auto` mode) and ffmpeg. The passthrough
//! gate accepts only what Plex clients demux natively: mainstream codecs,
//! LC AAC, progressive scan, ordinary frame rates. Everything else is
//! re-encoded to H.264/AAC transport stream.
//!
//! ffmpeg must be on PATH (or configured); the process is killed when the
//! output stream drops.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Video codecs Plex clients take without re-encoding.
const PASSTHROUGH_VIDEO: &[&str] = &["h264", "mpeg2video", "mpeg4"];

/// Audio codecs Plex clients take without re-encoding.
const PASSTHROUGH_AUDIO: &[&str] = &["aac", "ac3", "eac3", "mp3", "mp2"];

/// Frame rates above this always transcode.
const MAX_PASSTHROUGH_FPS: f64 = 30.5;

/// Read size from the transcoder pipe: 1000 TS packets.
const READ_CHUNK: usize = 188 * 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub profile: Option<String>,
    pub field_order: Option<String>,
    pub avg_frame_rate: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProbeInfo {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
}

fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => raw.parse().ok(),
    }
}

/// Decide whether a probed stream needs re-encoding.
pub fn needs_transcode(info: &ProbeInfo) -> bool {
    let mut saw_video = false;

    for stream in &info.streams {
        match stream.codec_type.as_deref() {
            Some("video") => {
                saw_video = true;
                let codec = stream.codec_name.as_deref().unwrap_or("");
                if !PASSTHROUGH_VIDEO.contains(&codec) {
                    return true;
                }
                if let Some(order) = stream.field_order.as_deref() {
                    if !order.is_empty() && order != "progressive" && order != "unknown" {
                        return true;
                    }
                }
                if let Some(fps) = stream.avg_frame_rate.as_deref().and_then(parse_frame_rate) {
                    if fps > MAX_PASSTHROUGH_FPS {
                        return true;
                    }
                }
            }
            Some("audio") => {
                let codec = stream.codec_name.as_deref().unwrap_or("");
                if !PASSTHROUGH_AUDIO.contains(&codec) {
                    return true;
                }
                if codec == "aac" {
                    let profile = stream.profile.as_deref().unwrap_or("LC");
                    if !profile.eq_ignore_ascii_case("LC") && !profile.eq_ignore_ascii_case("Main")
                    {
                        return true;
                    }
                }
            }
            _ => {}
        }
    }

    // A stream ffprobe could not see video in is suspect; re-encode it
    !saw_video
}

/// Probe the codecs of an upstream URL.
pub async fn probe_codecs(ffprobe: &str, url: &str) -> Result<ProbeInfo, io::Error> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-analyzeduration",
            "3000000",
            url,
        ])
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(io::Error::other(format!(
            "ffprobe exited with {}",
            output.status
        )));
    }
    serde_json::from_slice(&output.stdout)
        .map_err(|e| io::Error::other(format!("ffprobe output: {e}")))
}

/// A TS byte stream produced by an ffmpeg child process. The child is killed
/// when the stream drops.
pub struct FfmpegStream {
    stdout: tokio::process::ChildStdout,
    buf: Vec<u8>,
    _child: Child,
    _stderr_task: tokio::task::JoinHandle<()>,
}

/// Spawn ffmpeg reading `url` and emitting MPEG-TS on stdout.
///
/// `reencode` false stream-copies (`-c copy`); true re-encodes to
/// H.264 / AAC.
pub fn ffmpeg_stream(ffmpeg: &str, url: &str, reencode: bool) -> Result<FfmpegStream, io::Error> {
    let mut args: Vec<&str> = vec![
        "-hide_banner",
        "-loglevel",
        "warning",
        "-reconnect",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_delay_max",
        "2",
        "-i",
        url,
    ];
    if reencode {
        args.extend([
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-c:a",
            "aac",
            "-b:a",
            "160k",
        ]);
    } else {
        args.extend(["-c", "copy"]);
    }
    args.extend([
        "-f",
        "mpegts",
        "-fflags",
        "+genpts",
        "-mpegts_flags",
        "+initial_discontinuity",
        "-",
    ]);

    let mut child = Command::new(ffmpeg)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no ffmpeg stdout"))?;
    let stderr = child.stderr.take();

    let stderr_task = tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("Last message repeated") {
                continue;
            }
            warn!(target: "ffmpeg", "{line}");
        }
    });

    debug!(reencode, "ffmpeg spawned");
    Ok(FfmpegStream {
        stdout,
        buf: vec![0u8; READ_CHUNK],
        _child: child,
        _stderr_task: stderr_task,
    })
}

impl Stream for FfmpegStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut read_buf = tokio::io::ReadBuf::new(&mut this.buf);
        match Pin::new(&mut this.stdout).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Bytes::copy_from_slice(filled))))
                }
            }
        }
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        self._stderr_task.abort();
        // kill_on_drop covers the child itself
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(codec: &str, field_order: Option<&str>, fps: Option<&str>) -> FfprobeStream {
        FfprobeStream {
            codec_type: Some("video".into()),
            codec_name: Some(codec.into()),
            profile: None,
            field_order: field_order.map(String::from),
            avg_frame_rate: fps.map(String::from),
        }
    }

    fn audio(codec: &str, profile: Option<&str>) -> FfprobeStream {
        FfprobeStream {
            codec_type: Some("audio".into()),
            codec_name: Some(codec.into()),
            profile: profile.map(String::from),
            field_order: None,
            avg_frame_rate: None,
        }
    }

    #[test]
    fn test_passthrough_h264_aac() {
        let info = ProbeInfo {
            streams: vec![
                video("h264", Some("progressive"), Some("30000/1001")),
                audio("aac", Some("LC")),
            ],
        };
        assert!(!needs_transcode(&info));
    }

    #[test]
    fn test_hevc_transcodes() {
        let info = ProbeInfo {
            streams: vec![video("hevc", None, None), audio("aac", Some("LC"))],
        };
        assert!(needs_transcode(&info));
    }

    #[test]
    fn test_interlaced_transcodes() {
        let info = ProbeInfo {
            streams: vec![video("h264", Some("tt"), None), audio("aac", Some("LC"))],
        };
        assert!(needs_transcode(&info));
    }

    #[test]
    fn test_high_fps_transcodes() {
        let info = ProbeInfo {
            streams: vec![video("h264", None, Some("50/1")), audio("ac3", None)],
        };
        assert!(needs_transcode(&info));

        let ok = ProbeInfo {
            streams: vec![video("h264", None, Some("25/1")), audio("ac3", None)],
        };
        assert!(!needs_transcode(&ok));
    }

    #[test]
    fn test_he_aac_transcodes() {
        let info = ProbeInfo {
            streams: vec![video("h264", None, None), audio("aac", Some("HE-AAC"))],
        };
        assert!(needs_transcode(&info));
    }

    #[test]
    fn test_exotic_audio_transcodes() {
        let info = ProbeInfo {
            streams: vec![video("mpeg2video", None, None), audio("opus", None)],
        };
        assert!(needs_transcode(&info));
    }

    #[test]
    fn test_no_video_stream_transcodes() {
        let info = ProbeInfo { streams: vec![audio("aac", Some("LC"))] };
        assert!(needs_transcode(&info));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30000/1001").map(|f| f.round()), Some(30.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("24"), Some(24.0));
    }
}
