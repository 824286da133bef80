//! HDHomeRun device identity
//!
//! Plex consumes the HDHomeRun discovery/lineup JSON shapes natively, so the
//! serialized field names must match the hardware byte for byte (PascalCase,
//! `DeviceID`, `BaseURL`, ...).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::catalog::LiveChannel;
use crate::config::Config;

/// HDHomeRun discovery response (`GET /discover.json`).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_number: String,
    pub model_name: String,
    pub firmware_name: String,
    pub firmware_version: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_auth: String,
    #[serde(rename = "BaseURL")]
    pub base_url: String,
    #[serde(rename = "LineupURL")]
    pub lineup_url: String,
    pub tuner_count: u32,
    pub scan_possible: u8,
}

/// One `lineup.json` entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    pub guide_number: String,
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// `GET /lineup_status.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatusResponse {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
}

/// Derive a stable 8-hex device id from the hostname and instance name, so
/// it survives restarts but differs between supervised children.
pub fn derive_device_id(friendly_name: &str) -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "tunebridge".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    friendly_name.hash(&mut hasher);
    format!("{:08X}", hasher.finish() as u32)
}

/// Local IP for URLs handed to Plex; falls back to loopback.
pub fn local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// The base URL this instance advertises.
pub fn advertised_base_url(config: &Config) -> String {
    match &config.base_url {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => format!("http://{}:{}", local_ip(), config.listen_port),
    }
}

pub fn device_id(config: &Config) -> String {
    config
        .device_id
        .clone()
        .unwrap_or_else(|| derive_device_id(&config.friendly_name))
}

pub fn discover_response(config: &Config) -> DiscoverResponse {
    let base_url = advertised_base_url(config);
    DiscoverResponse {
        friendly_name: config.friendly_name.clone(),
        manufacturer: config.manufacturer.clone(),
        model_number: config.model_number.clone(),
        model_name: config.model_name.clone(),
        firmware_name: config.firmware_name.clone(),
        firmware_version: config.firmware_version.clone(),
        device_id: device_id(config),
        device_auth: config.device_auth.clone(),
        lineup_url: format!("{base_url}/lineup.json"),
        base_url,
        tuner_count: config.tuner_count,
        scan_possible: config.scan_possible as u8,
    }
}

/// Build `lineup.json` entries for an already-shaped channel list.
pub fn lineup_entries(channels: &[LiveChannel], base_url: &str) -> Vec<LineupEntry> {
    channels
        .iter()
        .map(|ch| LineupEntry {
            guide_number: ch.guide_number.clone(),
            guide_name: ch.guide_name.clone(),
            url: format!("{}/stream/{}", base_url, ch.channel_id),
        })
        .collect()
}

pub fn lineup_status(config: &Config) -> LineupStatusResponse {
    LineupStatusResponse {
        scan_in_progress: 0,
        scan_possible: config.scan_possible as u8,
        source: "Cable".to_string(),
        source_list: vec!["Cable".to_string()],
    }
}
