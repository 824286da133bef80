use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers::{
    discover_json, fallback_handler, guide_xml, health_check, lineup_json, lineup_status_json,
    live_m3u, refresh_get, refresh_post, rescan_get, rescan_post, stream_proxy,
};
use super::state::AppState;

/// The tuner + control-plane router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // HDHomeRun emulation surface
        .route("/discover.json", get(discover_json))
        .route("/lineup.json", get(lineup_json))
        .route("/lineup_status.json", get(lineup_status_json))
        .route("/guide.xml", get(guide_xml))
        .route("/live.m3u", get(live_m3u))
        .route("/stream/{channel_id}", get(stream_proxy))
        // Control plane
        .route("/refresh", post(refresh_post).get(refresh_get))
        .route("/rescan", post(rescan_post).get(rescan_get))
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::catalog::CatalogStore;
    use crate::config::{BufferPolicy, Config, TranscodeMode};
    use crate::gateway::StreamGateway;
    use crate::server::state::GuideCache;

    use super::*;

    fn test_state() -> AppState {
        let config = Config {
            base_url: Some("http://127.0.0.1:5004".into()),
            ..Default::default()
        };
        let gateway = StreamGateway::new(
            config.tuner_count,
            TranscodeMode::Off,
            BufferPolicy::Off,
            "ffmpeg".into(),
            "ffprobe".into(),
        )
        .unwrap();
        let (control, _refresh_rx, _rescan_rx) = crate::control::control_channel();

        AppState {
            config: Arc::new(config),
            catalog: Arc::new(CatalogStore::new()),
            gateway: Arc::new(gateway),
            control,
            guide_cache: Arc::new(GuideCache::default()),
        }
    }

    #[tokio::test]
    async fn test_routes_resolve() {
        let router = create_router(test_state());

        for (path, expected) in [
            ("/health", StatusCode::OK),
            ("/discover.json", StatusCode::OK),
            ("/lineup.json", StatusCode::OK),
            ("/lineup_status.json", StatusCode::OK),
            ("/live.m3u", StatusCode::OK),
            ("/nope", StatusCode::NOT_FOUND),
        ] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "unexpected status for {path}");
        }
    }

    #[tokio::test]
    async fn test_control_routes_accept_posts() {
        let router = create_router(test_state());
        for path in ["/refresh", "/rescan"] {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(path)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
    }
}
