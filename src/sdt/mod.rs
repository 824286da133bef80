//! Background SDT prober
//!
//! A single long-lived worker that reads the first 256 KB of idle, unlinked
//! channels, extracts the DVB service identity and writes it back through
//! the catalog store. It is deliberately polite: it pauses the moment a
//! viewer is streaming, resumes only after a quiet window, rate-limits probe
//! starts and sleeps a day between full passes.
//!
//! Worker states:
//! `Waiting(start_delay) -> Sweeping <-> Paused -> Sleeping(24h) -> Sweeping ...`

pub mod cache;
pub mod section;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::catalog::CatalogStore;
use crate::config::SdtProbeConfig;
use crate::gateway::TunerActivity;

use cache::SdtProbeCache;
use section::extract_identity;

/// Ranged read size per probe: enough TS packets to see PAT + SDT + EIT p/f.
const PROBE_READ_BYTES: usize = 256 * 1024;

/// Pause between full sweeps.
const SWEEP_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// Poll granularity while waiting for the tuners to go quiet.
const IDLE_POLL: Duration = Duration::from_secs(2);

pub struct SdtProber {
    catalog: Arc<CatalogStore>,
    activity: Arc<TunerActivity>,
    cache_path: PathBuf,
    config: SdtProbeConfig,
    http: reqwest::Client,
}

impl SdtProber {
    pub fn new(
        catalog: Arc<CatalogStore>,
        activity: Arc<TunerActivity>,
        cache_path: PathBuf,
        config: SdtProbeConfig,
    ) -> Result<Arc<Self>, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Arc::new(Self {
            catalog,
            activity,
            cache_path,
            config,
            http,
        }))
    }

    /// Run until shutdown. `rescan` messages clear all cache TTLs and start
    /// a fresh sweep immediately.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut rescan: mpsc::Receiver<()>,
    ) {
        if !self.config.enabled {
            return;
        }

        // Waiting -> Sweeping
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.config.start_delay_secs)) => {}
            _ = shutdown.changed() => return,
        }

        let mut cache = match SdtProbeCache::load(&self.cache_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "sdt cache unreadable, starting empty");
                SdtProbeCache::default()
            }
        };

        let rescan_interval = Duration::from_secs(self.config.rescan_interval_secs.max(1));
        let mut next_forced_rescan = tokio::time::Instant::now() + rescan_interval;

        loop {
            if !self.sweep(&mut cache, &mut shutdown).await {
                break;
            }
            if let Err(e) = cache.save(&self.cache_path) {
                warn!(error = %e, "sdt cache save failed");
            }

            // Sleeping; a rescan request or the scheduled rescan wakes us
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_PERIOD) => {}
                _ = tokio::time::sleep_until(next_forced_rescan) => {
                    info!("scheduled sdt rescan");
                    cache.clear_ttls();
                    next_forced_rescan = tokio::time::Instant::now() + rescan_interval;
                }
                Some(()) = rescan.recv() => {
                    info!("forced sdt rescan");
                    cache.clear_ttls();
                }
                _ = shutdown.changed() => break,
            }
        }

        let _ = cache.save(&self.cache_path);
    }

    /// One pass over every due channel. Returns false on shutdown.
    async fn sweep(&self, cache: &mut SdtProbeCache, shutdown: &mut watch::Receiver<bool>) -> bool {
        let snapshot = self.catalog.snapshot();
        let now = Utc::now();
        let due: Vec<(String, String)> = snapshot
            .live
            .iter()
            .filter(|c| !c.epg_linked)
            .filter(|c| cache.is_due(&c.channel_id, now))
            .map(|c| (c.channel_id.clone(), c.primary_stream_url.clone()))
            .collect();

        if due.is_empty() {
            debug!("sdt sweep: nothing due");
            return true;
        }
        info!(due = due.len(), "sdt sweep starting");

        let mut tasks: JoinSet<(String, Option<crate::catalog::SdtIdentity>)> = JoinSet::new();
        let mut probed = 0usize;
        let mut found = 0usize;

        for (channel_id, url) in due {
            // Sweeping -> Paused -> Sweeping
            if !self.wait_until_quiet(shutdown).await {
                tasks.abort_all();
                return false;
            }

            while tasks.len() >= self.config.concurrency.max(1) {
                if let Some(Ok((id, identity))) = tasks.join_next().await {
                    found += self.apply(cache, &id, identity) as usize;
                    probed += 1;
                }
            }

            let prober = self.http.clone();
            let timeout = Duration::from_secs(self.config.timeout_secs);
            tasks.spawn(async move {
                let identity = probe_stream(&prober, &url, timeout).await;
                (channel_id, identity)
            });

            tokio::time::sleep(Duration::from_millis(self.config.inter_delay_ms)).await;
            tokio::task::yield_now().await;
        }

        while let Some(result) = tasks.join_next().await {
            if let Ok((id, identity)) = result {
                found += self.apply(cache, &id, identity) as usize;
                probed += 1;
            }
        }

        info!(probed, found, "sdt sweep complete");
        true
    }

    /// Returns true once the gateway has been idle for the configured quiet
    /// window; false on shutdown.
    async fn wait_until_quiet(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let quiet = Duration::from_secs(self.config.quiet_window_secs);
        loop {
            if *shutdown.borrow() {
                return false;
            }
            if self.activity.active_streams() == 0 && self.activity.idle_for() >= quiet {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL) => {}
                _ = shutdown.changed() => return false,
            }
        }
    }

    /// Record one probe result; returns whether an identity was found.
    fn apply(
        &self,
        cache: &mut SdtProbeCache,
        channel_id: &str,
        identity: Option<crate::catalog::SdtIdentity>,
    ) -> bool {
        let found = match identity {
            Some(identity) => {
                let changed = self.catalog.update_live_sdt(channel_id, identity, true);
                debug!(channel = channel_id, changed, "sdt identity stored");
                cache.record_success(channel_id, self.config.ttl_secs);
                true
            }
            None => {
                cache.record_failure(channel_id, self.config.ttl_secs);
                false
            }
        };
        if let Err(e) = cache.save(&self.cache_path) {
            warn!(error = %e, "sdt cache save failed");
        }
        found
    }
}

/// One probe: ranged GET, bounded read, parse. Every failure is swallowed
/// into `None`; the cache records the attempt either way.
async fn probe_stream(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Option<crate::catalog::SdtIdentity> {
    let read = async {
        let response = http
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes=0-{}", PROBE_READ_BYTES - 1))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(url, status = response.status().as_u16(), "sdt probe http error");
            return None;
        }

        let mut data: Vec<u8> = Vec::with_capacity(64 * 1024);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.ok()?;
            data.extend_from_slice(&chunk);
            if data.len() >= PROBE_READ_BYTES {
                data.truncate(PROBE_READ_BYTES);
                break;
            }
        }
        Some(data)
    };

    let data = match tokio::time::timeout(timeout, read).await {
        Ok(Some(data)) if !data.is_empty() => data,
        Ok(_) => return None,
        Err(_) => {
            debug!(url, "sdt probe timed out");
            return None;
        }
    };

    extract_identity(&data, Utc::now())
}
