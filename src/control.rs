//! Control plane
//!
//! Refresh and rescan triggers, the scheduled refresh loop, SIGHUP handling
//! and graceful shutdown. A bounded channel of size one coalesces refresh
//! bursts; the single consumer loop guarantees two refreshes never run
//! concurrently. The pipeline order is fixed:
//! probe -> fetch -> enrich -> replace+save -> lineup/guide invalidation.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::enrich::EnrichmentPipeline;
use crate::provider::fetch::{FetchOutcome, ResilientFetcher, SecondarySource};
use crate::provider::probe::probe_and_rank;
use crate::provider::XtreamClient;
use crate::server::state::GuideCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshState {
    Idle,
    Running,
}

/// What the GET control endpoints report.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshStatus {
    pub state: RefreshState,
    pub last_outcome: Option<String>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub runs: u64,
}

impl Default for RefreshStatus {
    fn default() -> Self {
        Self {
            state: RefreshState::Idle,
            last_outcome: None,
            last_started_at: None,
            last_finished_at: None,
            runs: 0,
        }
    }
}

/// Handle given to HTTP handlers and signal tasks.
#[derive(Clone)]
pub struct ControlHandle {
    refresh_tx: mpsc::Sender<()>,
    rescan_tx: mpsc::Sender<()>,
    status: Arc<RwLock<RefreshStatus>>,
}

impl ControlHandle {
    /// Enqueue a refresh. Returns false when one is already queued; bursts
    /// coalesce into a single run.
    pub fn request_refresh(&self) -> bool {
        self.refresh_tx.try_send(()).is_ok()
    }

    /// Wake the SDT prober with cleared TTLs.
    pub fn request_rescan(&self) -> bool {
        self.rescan_tx.try_send(()).is_ok()
    }

    pub fn status(&self) -> RefreshStatus {
        self.status.read().expect("status lock poisoned").clone()
    }
}

/// Everything one refresh run needs.
pub struct RefreshContext {
    pub config: Arc<Config>,
    pub catalog: Arc<CatalogStore>,
    pub enrichment: Arc<EnrichmentPipeline>,
    pub guide_cache: Arc<GuideCache>,
}

/// Build the control plane: the handle for triggers plus the receiver ends
/// the loop consumes.
pub fn control_channel() -> (ControlHandle, mpsc::Receiver<()>, mpsc::Receiver<()>) {
    let (refresh_tx, refresh_rx) = mpsc::channel(1);
    let (rescan_tx, rescan_rx) = mpsc::channel(1);
    let handle = ControlHandle {
        refresh_tx,
        rescan_tx,
        status: Arc::new(RwLock::new(RefreshStatus::default())),
    };
    (handle, refresh_rx, rescan_rx)
}

/// One full refresh: ranked probe, resilient fetch, enrichment, atomic
/// replace+save, guide cache invalidation.
pub async fn run_refresh(
    ctx: &RefreshContext,
    cancel: &watch::Receiver<bool>,
) -> Result<String, String> {
    let config = &ctx.config;

    let ranked = if config.provider_urls.is_empty() {
        Default::default()
    } else {
        probe_and_rank(&config.provider_urls, &config.provider_user, &config.provider_pass).await
    };

    if ranked.is_empty() && config.m3u_url.is_none() {
        let cached = !ctx.catalog.snapshot().live.is_empty();
        let message = "no reachable provider and no m3u fallback".to_string();
        // Only fatal when there is nothing cached to keep serving
        return if cached {
            warn!("{message}; continuing to serve cached catalog");
            Ok("degraded: serving cached catalog".into())
        } else {
            Err(message)
        };
    }

    let client = ranked
        .indexing()
        .map(|r| XtreamClient::new(&r.base_url, &config.provider_user, &config.provider_pass))
        .transpose()
        .map_err(|e| e.to_string())?;
    let backup_bases = ranked.backups().iter().map(|r| r.base_url.clone()).collect();

    let secondary = match (&config.provider_url_2, &config.m3u_url_2) {
        (None, None) => None,
        (api, m3u) => Some(SecondarySource {
            client: api
                .as_ref()
                .map(|base| {
                    XtreamClient::new(base, &config.provider_user_2, &config.provider_pass_2)
                })
                .transpose()
                .map_err(|e| e.to_string())?,
            m3u_url: m3u.clone(),
        }),
    };

    let fetcher = ResilientFetcher::new(
        config.fetch_state_path.clone(),
        client,
        backup_bases,
        config.m3u_url.clone(),
        secondary,
        config.fetch_category_concurrency,
        config.fetch_cf_reject,
        config.fetch_stream_sample_size,
        config.fetch_force_refresh,
    )
    .map_err(|e| e.to_string())?;

    match fetcher.run(ctx.catalog.snapshot(), cancel).await {
        Ok(FetchOutcome::NotModified) => {
            // Catalog file untouched, lineup stays stable
            Ok("not modified".into())
        }
        Ok(FetchOutcome::Fetched(fetched)) => {
            let (live, _reports) = ctx.enrichment.run(fetched.live);
            let stats = fetched.stats;
            ctx.catalog.replace(fetched.movies, fetched.series, live);
            ctx.catalog
                .save(&ctx.config.catalog_path)
                .map_err(|e| e.to_string())?;
            ctx.guide_cache.invalidate();
            Ok(format!(
                "refreshed: {} new, {} changed, {} unchanged",
                stats.new_streams, stats.changed_streams, stats.unchanged_streams
            ))
        }
        Err(e) => Err(e.to_string()),
    }
}

/// The single-consumer refresh loop. Runs until shutdown.
pub async fn refresh_loop(
    ctx: RefreshContext,
    handle: ControlHandle,
    mut refresh_rx: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            request = refresh_rx.recv() => {
                if request.is_none() {
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        {
            let mut status = handle.status.write().expect("status lock poisoned");
            status.state = RefreshState::Running;
            status.last_started_at = Some(Utc::now());
        }

        let outcome = run_refresh(&ctx, &shutdown).await;

        let mut status = handle.status.write().expect("status lock poisoned");
        status.state = RefreshState::Idle;
        status.last_finished_at = Some(Utc::now());
        status.runs += 1;
        match outcome {
            Ok(message) => {
                info!(outcome = %message, "refresh finished");
                status.last_outcome = Some(message);
            }
            Err(message) => {
                error!(error = %message, "refresh failed");
                status.last_outcome = Some(format!("error: {message}"));
            }
        }
    }
}

/// Interval ticker, optional cron schedule and SIGHUP, all funneled into the
/// refresh channel. 0 interval means refresh at startup only.
pub async fn schedule_refreshes(
    config: Arc<Config>,
    handle: ControlHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    // Startup refresh
    handle.request_refresh();

    if let Some(cron) = config.refresh_cron.clone() {
        let cron_handle = handle.clone();
        match JobScheduler::new().await {
            Ok(scheduler) => {
                let job = Job::new(cron.as_str(), move |_uuid, _lock| {
                    info!("scheduled refresh (cron)");
                    cron_handle.request_refresh();
                });
                match job {
                    Ok(job) => {
                        if scheduler.add(job).await.is_ok() {
                            if let Err(e) = scheduler.start().await {
                                warn!(error = %e, "cron scheduler failed to start");
                            }
                        }
                    }
                    Err(e) => warn!(cron = %cron, error = %e, "invalid refresh cron"),
                }
            }
            Err(e) => warn!(error = %e, "cron scheduler unavailable"),
        }
    }

    #[cfg(unix)]
    {
        let sighup_handle = handle.clone();
        tokio::spawn(async move {
            let Ok(mut sighup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while sighup.recv().await.is_some() {
                info!("SIGHUP: refresh requested");
                sighup_handle.request_refresh();
            }
        });
    }

    if config.refresh_interval_secs == 0 {
        return;
    }
    let interval = std::time::Duration::from_secs(config.refresh_interval_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                handle.request_refresh();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
