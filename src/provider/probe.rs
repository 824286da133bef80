//! Provider probing and ranking
//!
//! Probes each configured provider base over both the M3U `get.php` endpoint
//! and `player_api.php`, classifies the result (ok / cloudflare / failed) and
//! ranks the healthy ones by latency. Rank 1 becomes the indexing host; the
//! rest become per-channel backup stream bases.

use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, warn};

/// Bounded probe timeout; a provider slower than this is treated as failed.
const PROBE_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Ok,
    Cloudflare,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub base_url: String,
    pub status: ProbeStatus,
    pub http_status: Option<u16>,
    pub latency: Duration,
}

/// Healthy providers ordered ascending by probe latency.
///
/// Ties keep input order, so a stable provider list yields a stable ranking.
#[derive(Debug, Clone, Default)]
pub struct RankedProviders {
    ranked: Vec<ProbeResult>,
}

impl RankedProviders {
    pub fn from_results(results: Vec<ProbeResult>) -> Self {
        let mut ranked: Vec<ProbeResult> = results
            .into_iter()
            .filter(|r| r.status == ProbeStatus::Ok)
            .collect();
        // sort_by is stable; equal latencies keep probe order
        ranked.sort_by(|a, b| a.latency.cmp(&b.latency));
        Self { ranked }
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    /// The host used for catalog indexing (rank 1).
    pub fn indexing(&self) -> Option<&ProbeResult> {
        self.ranked.first()
    }

    /// Rank 2..N, used as per-channel backup stream bases.
    pub fn backups(&self) -> &[ProbeResult] {
        if self.ranked.len() > 1 {
            &self.ranked[1..]
        } else {
            &[]
        }
    }

    pub fn all(&self) -> &[ProbeResult] {
        &self.ranked
    }
}

/// Cloudflare block markers on a response: server banner, CF-RAY header, or
/// the Xtream panel's 884 block code in the body.
pub fn is_cloudflare_response(status: u16, server: Option<&str>, cf_ray: bool, body: &str) -> bool {
    if cf_ray {
        return true;
    }
    if let Some(server) = server {
        if server.eq_ignore_ascii_case("cloudflare") {
            return true;
        }
    }
    // Xtream panels behind a block respond 884 in an error payload
    if body.contains("\"884\"") || body.contains(":884") {
        return true;
    }
    // Cloudflare challenge pages come back as 403/503 HTML
    (status == 403 || status == 503) && body.contains("Cloudflare")
}

async fn classify_endpoint(client: &Client, url: &str) -> (ProbeStatus, Option<u16>) {
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let server = response
                .headers()
                .get(reqwest::header::SERVER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let cf_ray = response.headers().contains_key("cf-ray");
            // Only a prefix of the body is needed for marker detection
            let body = match response.text().await {
                Ok(text) => text.chars().take(4096).collect::<String>(),
                Err(_) => String::new(),
            };

            if is_cloudflare_response(status, server.as_deref(), cf_ray, &body) {
                (ProbeStatus::Cloudflare, Some(status))
            } else if (200..300).contains(&status) {
                (ProbeStatus::Ok, Some(status))
            } else {
                (ProbeStatus::Failed, Some(status))
            }
        }
        Err(_) => (ProbeStatus::Failed, None),
    }
}

/// Probe one base URL over both entry points.
///
/// The combined classification is pessimistic: a Cloudflare marker on either
/// endpoint marks the base Cloudflare; otherwise both must answer 2xx.
pub async fn probe_base(client: &Client, base_url: &str, username: &str, password: &str) -> ProbeResult {
    let base = base_url.trim_end_matches('/');
    let get_php = format!(
        "{}/get.php?username={}&password={}&type=m3u_plus&output=ts",
        base,
        urlencoding::encode(username),
        urlencoding::encode(password)
    );
    let player_api = format!(
        "{}/player_api.php?username={}&password={}",
        base,
        urlencoding::encode(username),
        urlencoding::encode(password)
    );

    let started = Instant::now();
    let (m3u_status, m3u_http) = classify_endpoint(client, &get_php).await;
    let (api_status, api_http) = classify_endpoint(client, &player_api).await;
    let latency = started.elapsed();

    let status = match (m3u_status, api_status) {
        (ProbeStatus::Cloudflare, _) | (_, ProbeStatus::Cloudflare) => ProbeStatus::Cloudflare,
        (ProbeStatus::Ok, ProbeStatus::Ok) => ProbeStatus::Ok,
        _ => ProbeStatus::Failed,
    };

    let http_status = api_http.or(m3u_http);
    match status {
        ProbeStatus::Ok => debug!(base = base, ?latency, "provider probe ok"),
        ProbeStatus::Cloudflare => warn!(base = base, "provider probe: cloudflare block"),
        ProbeStatus::Failed => warn!(base = base, http = ?http_status, "provider probe failed"),
    }

    ProbeResult {
        base_url: base.to_string(),
        status,
        http_status,
        latency,
    }
}

/// Probe every base concurrently and rank the healthy ones.
///
/// A fully failed set yields an empty ranking; whether that is fatal depends
/// on whether a cached catalog exists, which is the caller's call.
pub async fn probe_and_rank(bases: &[String], username: &str, password: &str) -> RankedProviders {
    let client = match Client::builder()
        .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "probe client construction failed");
            return RankedProviders::default();
        }
    };

    let probes = bases.iter().map(|b| probe_base(&client, b, username, password));
    let results = futures::future::join_all(probes).await;
    RankedProviders::from_results(results)
}
