//! Plex Media Server HTTP client
//!
//! Covers the DVR and library-section surfaces the reconciler and the VOD
//! registration need. Requests are token-authenticated and rate-limited
//! through a small semaphore; responses are requested as JSON.

use std::sync::Arc;
use std::time::Duration;

use reqwest::RequestBuilder;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PlexError {
    #[error("failed to request data from Plex: {0}")]
    Request(#[from] reqwest::Error),

    #[error("couldn't parse Plex response: {0}")]
    Response(String),

    #[error("Plex returned http {0}")]
    Http(u16),
}

pub type Result<T, E = PlexError> = std::result::Result<T, E>;

/// Concurrent requests against one PMS.
const REQUEST_LIMIT: usize = 5;

// =============================================================================
// Response shapes
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexDevice {
    pub key: Option<String>,
    /// Stable device identifier (the HDHR DeviceID)
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub make: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexDvr {
    pub key: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "Device")]
    pub device: Vec<PlexDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DvrContainer {
    #[serde(default)]
    dvr: Vec<PlexDvr>,
}

#[derive(Debug, Deserialize)]
struct DvrResponse {
    #[serde(rename = "MediaContainer")]
    media_container: DvrContainer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexChannel {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub channel_identifier: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChannelContainer {
    #[serde(default)]
    channel_mapping: Vec<PlexChannel>,
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    #[serde(rename = "MediaContainer")]
    media_container: ChannelContainer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexSection {
    pub key: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, rename = "Location")]
    pub locations: Vec<PlexLocation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlexLocation {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SectionContainer {
    #[serde(default)]
    directory: Vec<PlexSection>,
}

#[derive(Debug, Deserialize)]
struct SectionResponse {
    #[serde(rename = "MediaContainer")]
    media_container: SectionContainer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexSetting {
    pub id: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SettingContainer {
    #[serde(default)]
    setting: Vec<PlexSetting>,
}

#[derive(Debug, Deserialize)]
struct SettingResponse {
    #[serde(rename = "MediaContainer")]
    media_container: SettingContainer,
}

// =============================================================================
// Client
// =============================================================================

pub struct PlexClient {
    host: String,
    token: String,
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl PlexClient {
    pub fn new(host: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
            limit: Arc::new(Semaphore::new(REQUEST_LIMIT)),
        })
    }

    fn request(&self, method: reqwest::Method, resource: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.host, resource.trim_start_matches('/')))
            .query(&[("X-Plex-Token", &self.token)])
            .header("accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .expect("plex limit closed");
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PlexError::Http(status.as_u16()));
        }
        Ok(response)
    }

    pub async fn get_dvrs(&self) -> Result<Vec<PlexDvr>> {
        let response: DvrResponse = self
            .send(self.request(reqwest::Method::GET, "livetv/dvrs"))
            .await?
            .json()
            .await?;
        Ok(response.media_container.dvr)
    }

    /// Register a tuner device by URI; Plex probes it and returns the device
    /// row.
    pub async fn discover_device(&self, uri: &str) -> Result<PlexDevice> {
        let response: DvrResponse = self
            .send(
                self.request(reqwest::Method::POST, "media/grabbers/devices/discover")
                    .query(&[("uri", uri)]),
            )
            .await?
            .json()
            .await?;

        response
            .media_container
            .dvr
            .into_iter()
            .flat_map(|d| d.device)
            .next()
            .ok_or_else(|| PlexError::Response("discover returned no device".into()))
    }

    pub async fn create_dvr(&self, device_key: &str, guide_identifier: &str) -> Result<PlexDvr> {
        let response: DvrResponse = self
            .send(
                self.request(reqwest::Method::POST, "livetv/dvrs")
                    .query(&[
                        ("device", device_key),
                        ("lineup", guide_identifier),
                        ("language", "en"),
                    ]),
            )
            .await?
            .json()
            .await?;

        response
            .media_container
            .dvr
            .into_iter()
            .next()
            .ok_or_else(|| PlexError::Response("dvr create returned nothing".into()))
    }

    pub async fn delete_dvr(&self, dvr_key: &str) -> Result<()> {
        self.send(self.request(reqwest::Method::DELETE, &format!("livetv/dvrs/{dvr_key}")))
            .await?;
        Ok(())
    }

    pub async fn update_device_uri(&self, device_key: &str, uri: &str) -> Result<()> {
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("media/grabbers/devices/{device_key}"),
            )
            .query(&[("uri", uri)]),
        )
        .await?;
        Ok(())
    }

    pub async fn reload_guide(&self, dvr_key: &str) -> Result<()> {
        self.send(self.request(
            reqwest::Method::POST,
            &format!("livetv/dvrs/{dvr_key}/reloadGuide"),
        ))
        .await?;
        Ok(())
    }

    pub async fn get_channel_map(&self, dvr_key: &str) -> Result<Vec<PlexChannel>> {
        let response: ChannelResponse = self
            .send(self.request(
                reqwest::Method::GET,
                &format!("livetv/dvrs/{dvr_key}/channels"),
            ))
            .await?
            .json()
            .await?;
        Ok(response.media_container.channel_mapping)
    }

    /// Enable every channel in the map.
    pub async fn activate_channels(&self, dvr_key: &str, channels: &[PlexChannel]) -> Result<usize> {
        let mut activated = 0;
        for channel in channels {
            if channel.enabled == Some(true) {
                continue;
            }
            self.send(
                self.request(
                    reqwest::Method::PUT,
                    &format!("livetv/dvrs/{dvr_key}/channels/{}", channel.key),
                )
                .query(&[("enabled", "1")]),
            )
            .await?;
            activated += 1;
        }
        debug!(dvr = dvr_key, activated, "channels activated");
        Ok(activated)
    }

    // =========================================================================
    // Library sections
    // =========================================================================

    pub async fn get_sections(&self) -> Result<Vec<PlexSection>> {
        let response: SectionResponse = self
            .send(self.request(reqwest::Method::GET, "library/sections"))
            .await?
            .json()
            .await?;
        Ok(response.media_container.directory)
    }

    pub async fn create_section(
        &self,
        name: &str,
        kind: &str,
        agent: &str,
        scanner: &str,
        location: &str,
    ) -> Result<PlexSection> {
        let response: SectionResponse = self
            .send(
                self.request(reqwest::Method::POST, "library/sections")
                    .query(&[
                        ("name", name),
                        ("type", kind),
                        ("agent", agent),
                        ("scanner", scanner),
                        ("location", location),
                        ("language", "en-US"),
                    ]),
            )
            .await?
            .json()
            .await?;

        response
            .media_container
            .directory
            .into_iter()
            .next()
            .ok_or_else(|| PlexError::Response("section create returned nothing".into()))
    }

    pub async fn get_section_prefs(&self, key: &str) -> Result<Vec<PlexSetting>> {
        let response: SettingResponse = self
            .send(self.request(
                reqwest::Method::GET,
                &format!("library/sections/{key}/prefs"),
            ))
            .await?
            .json()
            .await?;
        Ok(response.media_container.setting)
    }

    pub async fn set_section_pref(&self, key: &str, pref: &str, value: &str) -> Result<()> {
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("library/sections/{key}/prefs"),
            )
            .query(&[(pref, value)]),
        )
        .await?;
        Ok(())
    }

    pub async fn refresh_section(&self, key: &str) -> Result<()> {
        self.send(self.request(
            reqwest::Method::GET,
            &format!("library/sections/{key}/refresh"),
        ))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dvr_response_parsing() {
        let json = r#"{
            "MediaContainer": {
                "Dvr": [{
                    "key": "11",
                    "uuid": "dvr-uuid",
                    "Device": [{
                        "key": "21",
                        "uuid": "AABBCCDD",
                        "uri": "http://10.0.0.5:5004",
                        "make": "Silicondust"
                    }]
                }]
            }
        }"#;

        let parsed: DvrResponse = serde_json::from_str(json).unwrap();
        let dvrs = parsed.media_container.dvr;
        assert_eq!(dvrs.len(), 1);
        assert_eq!(dvrs[0].key, "11");
        assert_eq!(dvrs[0].device[0].uuid, "AABBCCDD");
        assert_eq!(dvrs[0].device[0].make, "Silicondust");
    }

    #[test]
    fn test_empty_dvr_container() {
        let parsed: DvrResponse = serde_json::from_str(r#"{"MediaContainer": {}}"#).unwrap();
        assert!(parsed.media_container.dvr.is_empty());
    }

    #[test]
    fn test_section_response_parsing() {
        let json = r#"{
            "MediaContainer": {
                "Directory": [{
                    "key": "3",
                    "title": "IPTV Movies",
                    "type": "movie",
                    "Location": [{"path": "/mnt/vod/Movies"}]
                }]
            }
        }"#;

        let parsed: SectionResponse = serde_json::from_str(json).unwrap();
        let sections = parsed.media_container.directory;
        assert_eq!(sections[0].kind, "movie");
        assert_eq!(sections[0].locations[0].path, "/mnt/vod/Movies");
    }

    #[test]
    fn test_channel_map_parsing() {
        let json = r#"{
            "MediaContainer": {
                "ChannelMapping": [
                    {"key": "1", "channelIdentifier": "id-101", "enabled": false},
                    {"key": "2", "channelIdentifier": "id-102", "enabled": true}
                ]
            }
        }"#;

        let parsed: ChannelResponse = serde_json::from_str(json).unwrap();
        let channels = parsed.media_container.channel_mapping;
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].enabled, Some(false));
    }
}
