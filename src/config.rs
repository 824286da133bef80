//! Configuration
//!
//! Every knob is an environment variable under the `TUNEBRIDGE_` prefix, with
//! an optional JSON file (`TUNEBRIDGE_CONFIG`) merged underneath. The binary
//! itself takes no flags; the supervisor passes child-specific overrides
//! through the environment.

use std::path::PathBuf;

use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Extract(#[from] figment::Error),

    #[error("config error: {0}")]
    Invalid(String),
}

/// Gateway transcode policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeMode {
    #[default]
    Off,
    On,
    Auto,
}

/// Gateway buffering policy: disabled, adaptive, or a fixed byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    Off,
    Adaptive,
    Fixed(usize),
}

impl Default for BufferPolicy {
    fn default() -> Self {
        BufferPolicy::Adaptive
    }
}

impl<'de> Deserialize<'de> for BufferPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.trim() {
            "" | "auto" => Ok(BufferPolicy::Adaptive),
            "0" | "off" => Ok(BufferPolicy::Off),
            other => other
                .parse::<usize>()
                .map(BufferPolicy::Fixed)
                .map_err(|_| serde::de::Error::custom(format!("invalid buffer policy: {other}"))),
        }
    }
}

impl Serialize for BufferPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            BufferPolicy::Off => serializer.serialize_str("0"),
            BufferPolicy::Adaptive => serializer.serialize_str("auto"),
            BufferPolicy::Fixed(n) => serializer.serialize_str(&n.to_string()),
        }
    }
}

/// SDT prober tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdtProbeConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub quiet_window_secs: u64,
    pub start_delay_secs: u64,
    pub rescan_interval_secs: u64,
    pub concurrency: usize,
    pub inter_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SdtProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 7 * 24 * 3600,
            quiet_window_secs: 180,
            start_delay_secs: 30,
            rescan_interval_secs: 30 * 24 * 3600,
            concurrency: 2,
            inter_delay_ms: 500,
            timeout_secs: 12,
        }
    }
}

/// The full configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Upstream credentials and host pool
    pub provider_urls: Vec<String>,
    pub provider_user: String,
    pub provider_pass: String,
    pub subscription_file: Option<PathBuf>,
    pub m3u_url: Option<String>,
    // Optional second provider: merges live channels only
    pub provider_url_2: Option<String>,
    pub provider_user_2: String,
    pub provider_pass_2: String,
    pub m3u_url_2: Option<String>,

    // On-disk paths
    pub catalog_path: PathBuf,
    pub fetch_state_path: PathBuf,
    pub sdt_cache_path: PathBuf,
    pub mount_point: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    /// Cross-UID access to the mount; needs user_allow_other in fuse.conf.
    pub vodfs_allow_other: bool,

    // Tuner identity
    pub listen_port: u16,
    pub base_url: Option<String>,
    pub device_id: Option<String>,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    pub device_auth: String,
    pub scan_possible: bool,
    pub tuner_count: u32,

    // Lineup shaping
    pub lineup_max_channels: usize,
    pub guide_number_offset: u32,
    pub lineup_category: Option<String>,
    pub lineup_skip: usize,
    pub lineup_take: Option<usize>,
    pub lineup_drop_music: bool,
    pub lineup_shape: Option<String>,
    pub lineup_exclude_regex: Option<String>,

    // Stream gateway
    pub stream_transcode: TranscodeMode,
    pub stream_buffer_bytes: BufferPolicy,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,

    // EPG
    pub xmltv_url: Option<String>,
    pub xmltv_timeout_secs: u64,
    pub xmltv_cache_ttl_secs: u64,
    pub live_epg_only: bool,
    pub epg_prune_unlinked: bool,
    pub xmltv_prefer_langs: Vec<String>,
    pub xmltv_prefer_latin: bool,
    pub xmltv_non_latin_title_fallback: bool,
    pub dummy_guide: bool,

    // HDHR network protocol mode (UDP/TCP 65001)
    pub hdhr_network_mode: bool,
    pub hdhr_device_id: Option<String>,

    // SDT prober
    pub sdt_probe: SdtProbeConfig,

    // Enrichment data paths
    pub gracenote_db: Option<PathBuf>,
    pub iptvorg_db: Option<PathBuf>,
    pub sd_db: Option<PathBuf>,
    pub dvb_db: Option<PathBuf>,

    // Fetcher tuning
    pub fetch_category_concurrency: usize,
    pub fetch_cf_reject: bool,
    pub fetch_stream_sample_size: usize,
    pub fetch_force_refresh: bool,
    pub refresh_interval_secs: u64,
    /// Cron expression for scheduled refreshes, in addition to the interval.
    pub refresh_cron: Option<String>,

    // Plex (external collaborator endpoints)
    pub pms_url: Option<String>,
    pub pms_token: Option<String>,
    /// Consumed by the out-of-process session-drain helper; carried here so
    /// one environment configures the whole deployment.
    pub plex_session_reaper: Option<String>,

    // Supervisor manifest: when set the binary runs as a parent process
    pub supervisor_manifest: Option<PathBuf>,
    pub dvr_guide_wait_secs: u64,
    pub dvr_delete_unknown: bool,
    pub dvr_dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_urls: vec![],
            provider_user: String::new(),
            provider_pass: String::new(),
            subscription_file: None,
            m3u_url: None,
            provider_url_2: None,
            provider_user_2: String::new(),
            provider_pass_2: String::new(),
            m3u_url_2: None,

            catalog_path: PathBuf::from("data/catalog.json"),
            fetch_state_path: PathBuf::from("data/fetch_state.json"),
            sdt_cache_path: PathBuf::from("data/sdt_cache.json"),
            mount_point: None,
            cache_dir: None,
            vodfs_allow_other: false,

            listen_port: 5004,
            base_url: None,
            device_id: None,
            friendly_name: "tunebridge".into(),
            manufacturer: "Silicondust".into(),
            model_name: "HDHomeRun CONNECT".into(),
            model_number: "HDHR5-4K".into(),
            firmware_name: "hdhomerun5_atsc".into(),
            firmware_version: "20200101".into(),
            device_auth: "tunebridge".into(),
            scan_possible: false,
            tuner_count: 4,

            lineup_max_channels: 479,
            guide_number_offset: 0,
            lineup_category: None,
            lineup_skip: 0,
            lineup_take: None,
            lineup_drop_music: false,
            lineup_shape: None,
            lineup_exclude_regex: None,

            stream_transcode: TranscodeMode::Off,
            stream_buffer_bytes: BufferPolicy::Adaptive,
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),

            xmltv_url: None,
            xmltv_timeout_secs: 30,
            xmltv_cache_ttl_secs: 3600,
            live_epg_only: false,
            epg_prune_unlinked: false,
            xmltv_prefer_langs: vec![],
            xmltv_prefer_latin: false,
            xmltv_non_latin_title_fallback: false,
            dummy_guide: false,

            hdhr_network_mode: false,
            hdhr_device_id: None,

            sdt_probe: SdtProbeConfig::default(),

            gracenote_db: None,
            iptvorg_db: None,
            sd_db: None,
            dvb_db: None,

            fetch_category_concurrency: 8,
            fetch_cf_reject: false,
            fetch_stream_sample_size: 0,
            fetch_force_refresh: false,
            refresh_interval_secs: 0,
            refresh_cron: None,

            pms_url: None,
            pms_token: None,
            plex_session_reaper: None,

            supervisor_manifest: None,
            dvr_guide_wait_secs: 20,
            dvr_delete_unknown: false,
            dvr_dry_run: false,
        }
    }
}

impl Config {
    /// Load from the optional JSON file and the environment; env wins.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Config::default()));
        if let Ok(path) = std::env::var("TUNEBRIDGE_CONFIG") {
            figment = figment.merge(Json::file(path));
        }
        let mut config: Config = figment
            .merge(Env::prefixed("TUNEBRIDGE_").split("__"))
            .extract()?;
        config.apply_subscription_file()?;
        config.validate()?;
        Ok(config)
    }

    /// Credentials kept out of the environment: a JSON file with
    /// `provider_urls`, `provider_user` and `provider_pass` fills any of
    /// those fields still empty.
    fn apply_subscription_file(&mut self) -> Result<(), ConfigError> {
        let Some(path) = &self.subscription_file else {
            return Ok(());
        };

        #[derive(Deserialize)]
        struct Subscription {
            #[serde(default)]
            provider_urls: Vec<String>,
            #[serde(default)]
            provider_user: String,
            #[serde(default)]
            provider_pass: String,
        }

        let data = std::fs::read(path)
            .map_err(|e| ConfigError::Invalid(format!("subscription file: {e}")))?;
        let subscription: Subscription = serde_json::from_slice(&data)
            .map_err(|e| ConfigError::Invalid(format!("subscription file: {e}")))?;

        if self.provider_urls.is_empty() {
            self.provider_urls = subscription.provider_urls;
        }
        if self.provider_user.is_empty() {
            self.provider_user = subscription.provider_user;
        }
        if self.provider_pass.is_empty() {
            self.provider_pass = subscription.provider_pass;
        }
        Ok(())
    }

    /// Startup sanity checks; only contradictions are fatal here. A missing
    /// provider is tolerated when a cached catalog exists on disk, so that
    /// decision is left to the refresh pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.provider_urls.is_empty() && self.provider_user.is_empty() {
            return Err(ConfigError::Invalid(
                "provider_urls set but provider_user is empty".into(),
            ));
        }
        if self.lineup_take == Some(0) {
            return Err(ConfigError::Invalid("lineup_take must be > 0 when set".into()));
        }
        if let Some(re) = &self.lineup_exclude_regex {
            regex::Regex::new(re)
                .map_err(|e| ConfigError::Invalid(format!("lineup_exclude_regex: {e}")))?;
        }
        Ok(())
    }

    /// True when no upstream source of any kind is configured.
    pub fn has_upstream(&self) -> bool {
        !self.provider_urls.is_empty() || self.m3u_url.is_some()
    }
}
