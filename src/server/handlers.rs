//! HTTP request handlers for the tuner surface and the control plane

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, warn};

use crate::gateway::GatewayError;

use super::hdhr;
use super::m3u_out;
use super::state::AppState;
use super::xmltv::{self, GuideOptions};

/// Health check, used by monitoring and the supervisor.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse { status: "healthy".to_string() }),
    )
}

pub async fn fallback_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn content_etag(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

// =============================================================================
// HDHomeRun surface
// =============================================================================

pub async fn discover_json(State(state): State<AppState>) -> impl IntoResponse {
    Json(hdhr::discover_response(&state.config))
}

pub async fn lineup_json(State(state): State<AppState>) -> impl IntoResponse {
    let lineup = state.shaped_lineup();
    let base_url = hdhr::advertised_base_url(&state.config);
    Json(hdhr::lineup_entries(&lineup, &base_url))
}

pub async fn lineup_status_json(State(state): State<AppState>) -> impl IntoResponse {
    Json(hdhr::lineup_status(&state.config))
}

pub async fn live_m3u(State(state): State<AppState>) -> impl IntoResponse {
    let lineup = state.shaped_lineup();
    let base_url = hdhr::advertised_base_url(&state.config);
    let content = m3u_out::render_live_m3u(&lineup, &base_url);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("audio/x-mpegurl"),
    );
    (headers, content)
}

// =============================================================================
// Guide
// =============================================================================

pub async fn guide_xml(
    State(state): State<AppState>,
    request_headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ttl = Duration::from_secs(state.config.xmltv_cache_ttl_secs.max(1));

    let cached = match state.guide_cache.get(ttl) {
        Some(cached) => cached,
        None => {
            let content = build_guide(&state).await.map_err(|e| {
                error!(error = %e, "guide build failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "guide unavailable".to_string())
            })?;
            let etag = content_etag(&content);
            state.guide_cache.set(content.clone(), etag.clone());
            super::state::CachedGuide {
                content,
                etag,
                built_at: std::time::Instant::now(),
            }
        }
    };

    let etag_header = format!("\"{}\"", cached.etag);
    if let Some(client_etag) = request_headers.get(header::IF_NONE_MATCH) {
        if client_etag.to_str().ok() == Some(etag_header.as_str()) {
            let mut headers = HeaderMap::new();
            headers.insert(header::ETAG, HeaderValue::from_str(&etag_header).unwrap());
            return Ok((StatusCode::NOT_MODIFIED, headers, String::new()));
        }
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    headers.insert(header::ETAG, HeaderValue::from_str(&etag_header).unwrap());
    Ok((StatusCode::OK, headers, cached.content))
}

/// Build guide.xml: a remapped upstream feed when one is configured, a
/// placeholder generated from the lineup otherwise.
async fn build_guide(state: &AppState) -> Result<String, xmltv::XmltvError> {
    let lineup = state.shaped_lineup();
    let config = &state.config;

    let Some(url) = config.xmltv_url.as_deref() else {
        return xmltv::placeholder_guide(&lineup, Utc::now());
    };

    let opts = GuideOptions {
        prefer_langs: config.xmltv_prefer_langs.clone(),
        prefer_latin: config.xmltv_prefer_latin,
        non_latin_title_fallback: config.xmltv_non_latin_title_fallback,
        dummy_guide: config.dummy_guide,
        prune_unlinked: config.epg_prune_unlinked,
        live_epg_only: config.live_epg_only,
    };

    match xmltv::fetch_xmltv(url, Duration::from_secs(config.xmltv_timeout_secs)).await {
        Ok(data) => {
            let (channels, programmes) = xmltv::parse_xmltv(&data)?;
            xmltv::write_guide(&lineup, &channels, &programmes, &opts, Utc::now())
        }
        Err(e) => {
            // A dead upstream feed must not take the guide down
            warn!(error = %e, "xmltv fetch failed, serving placeholder guide");
            xmltv::placeholder_guide(&lineup, Utc::now())
        }
    }
}

// =============================================================================
// Stream gateway
// =============================================================================

pub async fn stream_proxy(
    Path(channel_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let snapshot = state.catalog.snapshot();
    let Some(channel) = snapshot.live_by_id(&channel_id) else {
        return Err((StatusCode::NOT_FOUND, "channel not found".to_string()));
    };

    let handle = state.gateway.open_stream(channel).await.map_err(|e| match e {
        GatewayError::AllTunersInUse => {
            warn!(channel = %channel_id, "tuner limit reached");
            (StatusCode::SERVICE_UNAVAILABLE, "all tuners in use".to_string())
        }
        GatewayError::ChannelNotFound => (StatusCode::NOT_FOUND, "channel not found".to_string()),
        GatewayError::Upstream(reason) => {
            error!(channel = %channel_id, reason = %reason, "stream open failed");
            (StatusCode::SERVICE_UNAVAILABLE, "stream unavailable".to_string())
        }
        GatewayError::Transcoder(e) => {
            error!(channel = %channel_id, error = %e, "transcoder start failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "transcoder unavailable".to_string())
        }
    })?;

    let mut response = Response::new(Body::from_stream(handle));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
    Ok(response)
}

// =============================================================================
// Control plane
// =============================================================================

pub async fn refresh_post(State(state): State<AppState>) -> impl IntoResponse {
    state.control.request_refresh();
    StatusCode::ACCEPTED
}

pub async fn refresh_get(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control.status())
}

pub async fn rescan_post(State(state): State<AppState>) -> impl IntoResponse {
    state.control.request_rescan();
    StatusCode::ACCEPTED
}

pub async fn rescan_get(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "sdt_probe_enabled": state.config.sdt_probe.enabled }))
}
