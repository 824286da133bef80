//! tunebridge: headless IPTV-to-Plex bridge
//!
//! One binary, two modes:
//! - serve (default): one HDHomeRun-compatible tuner instance with catalog
//!   refresh, stream gateway, SDT prober, optional network protocol mode and
//!   optional VOD filesystem
//! - supervise (`TUNEBRIDGE_SUPERVISOR_MANIFEST`): spawn N serve children
//!   from one manifest and reconcile Plex DVR rows against them

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunebridge::catalog::CatalogStore;
use tunebridge::config::Config;
use tunebridge::control;
use tunebridge::enrich::EnrichmentPipeline;
use tunebridge::gateway::StreamGateway;
use tunebridge::sdt::SdtProber;
use tunebridge::server::{self, state::GuideCache, AppState};
use tunebridge::supervisor::{self, dvr::DvrReconciler, plex::PlexClient, SupervisorManifest};
use tunebridge::vodfs;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Watch channel flipped to true on SIGTERM / ctrl-c.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "sigterm handler unavailable");
                    let _ = ctrl_c.await;
                    let _ = tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };

    let result = match config.supervisor_manifest.clone() {
        Some(manifest_path) => supervise(config, &manifest_path).await,
        None => serve(config).await,
    };

    if let Err(message) = result {
        error!("{message}");
        std::process::exit(1);
    }
}

/// Single-tuner mode.
async fn serve(config: Arc<Config>) -> Result<(), String> {
    info!(version = env!("CARGO_PKG_VERSION"), "tunebridge starting");
    let shutdown = shutdown_channel();

    // Catalog: a malformed file restarts this store empty, it does not take
    // the process down
    let catalog = Arc::new(CatalogStore::new());
    if let Err(e) = catalog.load(&config.catalog_path) {
        warn!(error = %e, "catalog unreadable, starting empty");
    }
    if catalog.snapshot().live.is_empty() && !config.has_upstream() {
        return Err("no cached catalog and no provider or m3u source configured".into());
    }

    let gateway = Arc::new(
        StreamGateway::new(
            config.tuner_count,
            config.stream_transcode,
            config.stream_buffer_bytes,
            config.ffmpeg_path.clone(),
            config.ffprobe_path.clone(),
        )
        .map_err(|e| e.to_string())?,
    );

    let (control_handle, refresh_rx, rescan_rx) = control::control_channel();
    let guide_cache = Arc::new(GuideCache::default());
    let state = AppState {
        config: config.clone(),
        catalog: catalog.clone(),
        gateway: gateway.clone(),
        control: control_handle.clone(),
        guide_cache: guide_cache.clone(),
    };

    let enrichment = Arc::new(EnrichmentPipeline::from_config(&config));
    let refresh_ctx = control::RefreshContext {
        config: config.clone(),
        catalog: catalog.clone(),
        enrichment,
        guide_cache,
    };
    tokio::spawn(control::refresh_loop(
        refresh_ctx,
        control_handle.clone(),
        refresh_rx,
        shutdown.clone(),
    ));
    tokio::spawn(control::schedule_refreshes(
        config.clone(),
        control_handle.clone(),
        shutdown.clone(),
    ));

    if config.sdt_probe.enabled {
        let prober = SdtProber::new(
            catalog.clone(),
            gateway.activity(),
            config.sdt_cache_path.clone(),
            config.sdt_probe.clone(),
        )
        .map_err(|e| e.to_string())?;
        tokio::spawn(prober.run(shutdown.clone(), rescan_rx));
    }

    if config.hdhr_network_mode {
        tokio::spawn(server::protocol::run_network_mode(
            state.clone(),
            shutdown.clone(),
        ));
    }

    if let Some(mount_point) = config.mount_point.clone() {
        let materializer: Arc<dyn vodfs::materialize::Materializer> = match &config.cache_dir {
            Some(dir) => Arc::new(
                vodfs::materialize::CacheMaterializer::new(dir.clone())
                    .map_err(|e| format!("cache dir: {e}"))?,
            ),
            None => Arc::new(vodfs::materialize::StubMaterializer),
        };
        let fs_catalog = catalog.clone();
        let allow_other = config.vodfs_allow_other;
        // fuser blocks its thread for the lifetime of the mount
        std::thread::spawn(move || {
            if let Err(e) = vodfs::mount(fs_catalog, materializer, &mount_point, allow_other) {
                error!(error = %e, "vodfs mount failed");
            }
        });

        register_vod_libraries(&config).await;
    }

    let mut shutdown_wait = shutdown.clone();
    tokio::select! {
        result = server::start_server(state) => result.map_err(|e| e.to_string()),
        _ = shutdown_wait.changed() => {
            info!("draining and exiting");
            Ok(())
        }
    }
}

/// Create/reuse the Plex library sections pointing at the VOD mount.
async fn register_vod_libraries(config: &Config) {
    let (Some(pms_url), Some(pms_token), Some(mount)) =
        (&config.pms_url, &config.pms_token, &config.mount_point)
    else {
        return;
    };

    let plex = match PlexClient::new(pms_url, pms_token) {
        Ok(plex) => plex,
        Err(e) => {
            warn!(error = %e, "plex client unavailable, skipping library registration");
            return;
        }
    };

    for (name, kind, subdir) in [
        ("IPTV Movies", supervisor::library::LibraryType::Movie, "Movies"),
        ("IPTV TV", supervisor::library::LibraryType::Show, "TV"),
    ] {
        let path = mount.join(subdir);
        match supervisor::library::ensure_library_section(
            &plex,
            name,
            kind,
            &path.to_string_lossy(),
            true,
            true,
        )
        .await
        {
            Ok(key) => info!(library = name, key = %key, "library section ready"),
            Err(e) => warn!(library = name, error = %e, "library registration failed"),
        }
    }
}

/// Supervisor mode: run children, then reconcile Plex DVRs against them.
async fn supervise(config: Arc<Config>, manifest_path: &std::path::Path) -> Result<(), String> {
    let manifest = SupervisorManifest::load(manifest_path).map_err(|e| e.to_string())?;
    info!(children = manifest.children.len(), "supervisor starting");

    let shutdown = shutdown_channel();

    if let (Some(pms_url), Some(pms_token)) = (&config.pms_url, &config.pms_token) {
        if !manifest.dvr_sync.is_empty() {
            let plex = PlexClient::new(pms_url, pms_token).map_err(|e| e.to_string())?;
            let reconciler = DvrReconciler::new(
                plex,
                std::time::Duration::from_secs(config.dvr_guide_wait_secs),
                config.dvr_delete_unknown,
                config.dvr_dry_run,
            );
            let desired = manifest.dvr_sync.clone();
            tokio::spawn(async move {
                // Give the children a moment to bind their ports
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                match reconciler.reconcile(&desired).await {
                    Ok(reports) => {
                        for report in reports {
                            info!(instance = %report.instance, outcome = ?report.outcome, "dvr sync");
                        }
                    }
                    Err(e) => error!(error = %e, "dvr reconcile failed"),
                }
            });
        }
    }

    supervisor::run(manifest, shutdown).await.map_err(|e| e.to_string())
}
