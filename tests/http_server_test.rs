//! Integration tests for the tuner HTTP surface
//!
//! Binds the real router on a random port and drives it with an HTTP
//! client: HDHomeRun endpoints, lineup shaping, the M3U/guide exports and
//! the control plane.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tunebridge::catalog::{CatalogStore, LiveChannel, QualityTier};
use tunebridge::config::{BufferPolicy, Config, TranscodeMode};
use tunebridge::control;
use tunebridge::gateway::StreamGateway;
use tunebridge::server::routes::create_router;
use tunebridge::server::state::{AppState, GuideCache};

fn channel(id: &str, name: &str, group: &str, number: &str) -> LiveChannel {
    LiveChannel {
        channel_id: id.to_string(),
        guide_number: number.to_string(),
        guide_name: name.to_string(),
        tvg_id: String::new(),
        tvg_logo: String::new(),
        group_title: group.to_string(),
        epg_linked: false,
        quality_tier: QualityTier::Sd,
        // TEST-NET address: unreachable, streams fail fast
        primary_stream_url: format!("http://192.0.2.1:9/{id}.ts"),
        backup_stream_urls: vec![],
        source_tag: String::new(),
        sdt: None,
    }
}

fn test_state(config: Config, live: Vec<LiveChannel>) -> AppState {
    let catalog = Arc::new(CatalogStore::new());
    catalog.replace(vec![], vec![], live);

    let gateway = Arc::new(
        StreamGateway::new(
            config.tuner_count,
            TranscodeMode::Off,
            BufferPolicy::Off,
            "ffmpeg".into(),
            "ffprobe".into(),
        )
        .expect("gateway"),
    );
    let (control, _refresh_rx, _rescan_rx) = control::control_channel();

    AppState {
        config: Arc::new(config),
        catalog,
        gateway,
        control,
        guide_cache: Arc::new(GuideCache::default()),
    }
}

async fn start_test_server(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server error");
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, handle)
}

fn base_config() -> Config {
    Config {
        base_url: Some("http://127.0.0.1:5004".into()),
        tuner_count: 2,
        lineup_max_channels: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _server) = start_test_server(test_state(base_config(), vec![])).await;

    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (addr, _server) = start_test_server(test_state(base_config(), vec![])).await;
    let response = reqwest::get(format!("http://{addr}/nonexistent")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_discover_json_shape() {
    let (addr, _server) = start_test_server(test_state(base_config(), vec![])).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/discover.json"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["BaseURL"], "http://127.0.0.1:5004");
    assert_eq!(body["LineupURL"], "http://127.0.0.1:5004/lineup.json");
    assert_eq!(body["TunerCount"], 2);
    assert_eq!(body["ScanPossible"], 0);
    assert_eq!(body["Manufacturer"], "Silicondust");
    // 8-hex device id
    let device_id = body["DeviceID"].as_str().unwrap();
    assert_eq!(device_id.len(), 8);
    assert!(device_id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_lineup_json_applies_shaping_and_offset() {
    let config = Config {
        guide_number_offset: 1000,
        lineup_drop_music: true,
        ..base_config()
    };
    let live = vec![
        channel("a", "ESPN", "US | Sports", "5"),
        channel("b", "MTV Music", "Music", "6"),
        channel("c", "CNN", "US | News", "7"),
    ];
    let (addr, _server) = start_test_server(test_state(config, live)).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/lineup.json"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let entries = body.as_array().unwrap();
    // Music channel dropped, numbers offset
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["GuideNumber"], "1005");
    assert_eq!(entries[0]["GuideName"], "ESPN");
    assert!(entries[0]["URL"]
        .as_str()
        .unwrap()
        .ends_with("/stream/a"));
    assert_eq!(entries[1]["GuideNumber"], "1007");
}

#[tokio::test]
async fn test_lineup_status_json() {
    let (addr, _server) = start_test_server(test_state(base_config(), vec![])).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/lineup_status.json"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ScanInProgress"], 0);
    assert_eq!(body["ScanPossible"], 0);
    assert_eq!(body["Source"], "Cable");
    assert_eq!(body["SourceList"][0], "Cable");
}

#[tokio::test]
async fn test_live_m3u_export() {
    let live = vec![channel("a", "ESPN", "US | Sports", "5")];
    let (addr, _server) = start_test_server(test_state(base_config(), live)).await;

    let response = reqwest::get(format!("http://{addr}/live.m3u")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("mpegurl"));

    let body = response.text().await.unwrap();
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains("tvg-name=\"ESPN\""));
    assert!(body.contains("/stream/a"));
}

#[tokio::test]
async fn test_guide_xml_placeholder_and_etag() {
    let live = vec![channel("a", "ESPN", "US | Sports", "5")];
    let (addr, _server) = start_test_server(test_state(base_config(), live)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/guide.xml"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let etag = response
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body = response.text().await.unwrap();
    assert!(body.contains("<tv"));
    assert!(body.contains(r#"<channel id="5">"#));
    assert!(body.contains("<title>ESPN</title>"));

    // Conditional request returns 304
    let not_modified = client
        .get(format!("http://{addr}/guide.xml"))
        .header("if-none-match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(not_modified.status(), 304);
}

#[tokio::test]
async fn test_stream_unknown_channel_is_404() {
    let (addr, _server) = start_test_server(test_state(base_config(), vec![])).await;
    let response = reqwest::get(format!("http://{addr}/stream/nope")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_stream_admission_refused_when_no_tuners() {
    // tuner_count 0: the first open already exceeds the admission limit
    let config = Config { tuner_count: 0, ..base_config() };
    let live = vec![channel("a", "ESPN", "", "1")];
    let (addr, _server) = start_test_server(test_state(config, live)).await;

    let response = reqwest::get(format!("http://{addr}/stream/a")).await.unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "all tuners in use");
}

#[tokio::test]
async fn test_stream_unreachable_upstream_is_503() {
    let live = vec![channel("a", "ESPN", "", "1")];
    let (addr, _server) = start_test_server(test_state(base_config(), live)).await;

    let response = reqwest::get(format!("http://{addr}/stream/a")).await.unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "stream unavailable");
}

#[tokio::test]
async fn test_refresh_and_rescan_return_202() {
    let (addr, _server) = start_test_server(test_state(base_config(), vec![])).await;
    let client = reqwest::Client::new();

    let refresh = client
        .post(format!("http://{addr}/refresh"))
        .send()
        .await
        .unwrap();
    assert_eq!(refresh.status(), 202);

    let rescan = client
        .post(format!("http://{addr}/rescan"))
        .send()
        .await
        .unwrap();
    assert_eq!(rescan.status(), 202);

    // GET variants report status
    let status: serde_json::Value = client
        .get(format!("http://{addr}/refresh"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "idle");
}
