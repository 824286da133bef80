//! Xtream Codes `player_api` client
//!
//! Handles HTTP communication with Xtream Codes servers for live categories,
//! live/VOD/series listings and account checks. Xtream APIs are inconsistent
//! about numeric fields (strings vs ints vs null), so every numeric field
//! goes through a tolerant deserializer.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Deserializer};
use tracing::warn;

/// HTTP timeout for Xtream API requests.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum XtreamError {
    #[error("invalid server URL")]
    InvalidUrl,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    HttpError(u16),

    #[error("invalid API response")]
    InvalidResponse,

    #[error("authentication failed")]
    AuthenticationFailed,
}

/// Deserialize a number that may come as a string or int
fn number_from_string<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber<T> {
        String(String),
        Number(T),
    }

    match StringOrNumber::<T>::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse::<T>().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

/// Deserialize an optional number that may come as a string, int or null
fn optional_number_from_string<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber<T> {
        String(String),
        Number(T),
        Null,
    }

    match Option::<StringOrNumber<T>>::deserialize(deserializer)? {
        Some(StringOrNumber::String(s)) if s.is_empty() => Ok(None),
        Some(StringOrNumber::String(s)) => s.parse::<T>().map(Some).map_err(serde::de::Error::custom),
        Some(StringOrNumber::Number(n)) => Ok(Some(n)),
        Some(StringOrNumber::Null) | None => Ok(None),
    }
}

/// Category from `get_live_categories` / `get_vod_categories`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct XtreamCategory {
    pub category_id: String,
    pub category_name: String,
}

/// Live stream from `get_live_streams`
#[derive(Debug, Deserialize, Clone)]
pub struct XtreamLiveStream {
    #[serde(default, deserialize_with = "optional_number_from_string")]
    pub num: Option<i64>,
    pub name: String,
    #[serde(deserialize_with = "number_from_string")]
    pub stream_id: i64,
    #[serde(default)]
    pub stream_icon: Option<String>,
    #[serde(default)]
    pub epg_channel_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub direct_source: Option<String>,
}

/// VOD stream from `get_vod_streams`
#[derive(Debug, Deserialize, Clone)]
pub struct XtreamVodStream {
    pub name: String,
    #[serde(deserialize_with = "number_from_string")]
    pub stream_id: i64,
    #[serde(default)]
    pub stream_icon: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub container_extension: Option<String>,
    #[serde(default)]
    pub added: Option<String>,
}

/// Series listing entry from `get_series`
#[derive(Debug, Deserialize, Clone)]
pub struct XtreamSeriesListing {
    pub name: String,
    #[serde(deserialize_with = "number_from_string")]
    pub series_id: i64,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub plot: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
}

/// Episode from `get_series_info`
#[derive(Debug, Deserialize, Clone)]
pub struct XtreamEpisode {
    #[serde(deserialize_with = "number_from_string")]
    pub id: i64,
    pub title: String,
    #[serde(default, deserialize_with = "optional_number_from_string")]
    pub episode_num: Option<u32>,
    #[serde(default, deserialize_with = "optional_number_from_string")]
    pub season: Option<u32>,
    #[serde(default)]
    pub container_extension: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct XtreamSeriesInfo {
    #[serde(default)]
    pub episodes: Option<std::collections::HashMap<String, Vec<XtreamEpisode>>>,
}

/// A fetched body together with its cache validators.
#[derive(Debug, Clone)]
pub enum ConditionalBody {
    NotModified,
    Fresh {
        body: bytes::Bytes,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Client for one Xtream Codes provider host.
#[derive(Debug, Clone)]
pub struct XtreamClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl XtreamClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, XtreamError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(XtreamError::InvalidUrl);
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            base_url: trimmed.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL for a `player_api.php` action.
    ///
    /// The Xtream protocol puts credentials in query parameters; there is no
    /// other authentication mechanism, so they will appear in upstream logs.
    pub fn api_url(&self, action: &str, extra: &[(&str, &str)]) -> String {
        let mut url = format!(
            "{}/player_api.php?username={}&password={}&action={}",
            self.base_url,
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            action
        );
        for (k, v) in extra {
            url.push('&');
            url.push_str(k);
            url.push('=');
            url.push_str(&urlencoding::encode(v));
        }
        url
    }

    /// Live stream URL in the standard Xtream layout.
    pub fn live_stream_url(&self, stream_id: i64) -> String {
        format!(
            "{}/live/{}/{}/{}.ts",
            self.base_url,
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            stream_id
        )
    }

    pub fn movie_stream_url(&self, stream_id: i64, ext: &str) -> String {
        format!(
            "{}/movie/{}/{}/{}.{}",
            self.base_url,
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            stream_id,
            ext
        )
    }

    pub fn series_stream_url(&self, episode_id: i64, ext: &str) -> String {
        format!(
            "{}/series/{}/{}/{}.{}",
            self.base_url,
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            episode_id,
            ext
        )
    }

    /// Conditional GET of a `player_api.php` action.
    ///
    /// Sends `If-None-Match` / `If-Modified-Since` when validators are known;
    /// a 304 maps to `ConditionalBody::NotModified`.
    pub async fn get_conditional(
        &self,
        action: &str,
        extra: &[(&str, &str)],
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<ConditionalBody, XtreamError> {
        let url = self.api_url(action, extra);
        let mut req = self.http.get(&url);
        if let Some(etag) = etag {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(lm) = last_modified {
            req = req.header(reqwest::header::IF_MODIFIED_SINCE, lm);
        }

        let response = req.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(ConditionalBody::NotModified);
        }
        if !response.status().is_success() {
            return Err(XtreamError::HttpError(response.status().as_u16()));
        }

        let header_str = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let etag = header_str(reqwest::header::ETAG);
        let last_modified = header_str(reqwest::header::LAST_MODIFIED);
        let body = response.bytes().await?;

        Ok(ConditionalBody::Fresh { body, etag, last_modified })
    }

    pub async fn get_live_categories(&self) -> Result<Vec<XtreamCategory>, XtreamError> {
        self.get_json("get_live_categories", &[]).await
    }

    pub async fn get_live_streams(
        &self,
        category_id: &str,
    ) -> Result<Vec<XtreamLiveStream>, XtreamError> {
        self.get_json("get_live_streams", &[("category_id", category_id)])
            .await
    }

    /// All live streams in one call (no category filter).
    pub async fn get_live_streams_all(&self) -> Result<Vec<XtreamLiveStream>, XtreamError> {
        self.get_json("get_live_streams", &[]).await
    }

    pub async fn get_vod_streams(&self) -> Result<Vec<XtreamVodStream>, XtreamError> {
        self.get_json("get_vod_streams", &[]).await
    }

    pub async fn get_series(&self) -> Result<Vec<XtreamSeriesListing>, XtreamError> {
        self.get_json("get_series", &[]).await
    }

    pub async fn get_series_info(&self, series_id: i64) -> Result<XtreamSeriesInfo, XtreamError> {
        self.get_json("get_series_info", &[("series_id", &series_id.to_string())])
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
        extra: &[(&str, &str)],
    ) -> Result<T, XtreamError> {
        let url = self.api_url(action, extra);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(XtreamError::HttpError(response.status().as_u16()));
        }
        response.json::<T>().await.map_err(|e| {
            if e.is_decode() {
                warn!(action, "unparseable player_api response");
                XtreamError::InvalidResponse
            } else {
                XtreamError::Network(e)
            }
        })
    }
}

/// Parse the body of a stream-list response, tolerating both a bare array and
/// the occasional `{"streams": [...]}` wrapper some panels emit.
pub fn parse_live_streams(body: &[u8]) -> Result<Vec<XtreamLiveStream>, XtreamError> {
    if let Ok(list) = serde_json::from_slice::<Vec<XtreamLiveStream>>(body) {
        return Ok(list);
    }

    #[derive(Deserialize)]
    struct Wrapper {
        streams: Vec<XtreamLiveStream>,
    }
    serde_json::from_slice::<Wrapper>(body)
        .map(|w| w.streams)
        .map_err(|_| XtreamError::InvalidResponse)
}

pub fn parse_categories(body: &[u8]) -> Result<Vec<XtreamCategory>, XtreamError> {
    serde_json::from_slice(body).map_err(|_| XtreamError::InvalidResponse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_strips_trailing_slashes() {
        let client = XtreamClient::new("http://example.com:8080///", "user", "pass").unwrap();
        assert_eq!(client.base_url(), "http://example.com:8080");
    }

    #[test]
    fn test_client_rejects_empty_url() {
        assert!(matches!(
            XtreamClient::new("  ", "u", "p"),
            Err(XtreamError::InvalidUrl)
        ));
    }

    #[test]
    fn test_api_url_encodes_credentials() {
        let client = XtreamClient::new("http://example.com", "us er", "p@ss", ).unwrap();
        let url = client.api_url("get_live_streams", &[("category_id", "7")]);
        assert_eq!(
            url,
            "http://example.com/player_api.php?username=us%20er&password=p%40ss&action=get_live_streams&category_id=7"
        );
    }

    #[test]
    fn test_live_stream_url_layout() {
        let client = XtreamClient::new("http://example.com:8080", "user", "pass").unwrap();
        assert_eq!(
            client.live_stream_url(42),
            "http://example.com:8080/live/user/pass/42.ts"
        );
    }

    #[test]
    fn test_live_stream_deserialization_mixed_types() {
        // stream_id as string, num as int, missing optionals
        let json = r#"[
            {"num": 1, "name": "ESPN HD", "stream_id": "101", "epg_channel_id": "espn.us"},
            {"num": "2", "name": "CNN", "stream_id": 102}
        ]"#;
        let streams = parse_live_streams(json.as_bytes()).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].stream_id, 101);
        assert_eq!(streams[0].epg_channel_id.as_deref(), Some("espn.us"));
        assert_eq!(streams[1].num, Some(2));
        assert!(streams[1].epg_channel_id.is_none());
    }

    #[test]
    fn test_live_stream_wrapper_shape() {
        let json = r#"{"streams": [{"name": "A", "stream_id": 1}]}"#;
        let streams = parse_live_streams(json.as_bytes()).unwrap();
        assert_eq!(streams.len(), 1);
    }

    #[test]
    fn test_invalid_stream_body_is_error() {
        assert!(parse_live_streams(b"<html>cf</html>").is_err());
    }

    #[test]
    fn test_episode_optional_numbers() {
        let json = r#"{"id": "9", "title": "Pilot", "episode_num": "1", "season": 1}"#;
        let ep: XtreamEpisode = serde_json::from_str(json).unwrap();
        assert_eq!(ep.id, 9);
        assert_eq!(ep.episode_num, Some(1));
        assert_eq!(ep.season, Some(1));
    }
}
