//! Resilient catalog fetcher
//!
//! Conditional, crash-safe ingestion of provider data:
//! - ETag / If-Modified-Since plus a body SHA-256 check per endpoint; when
//!   nothing changed anywhere the run short-circuits to `NotModified` and the
//!   served catalog stays untouched.
//! - Live categories fetched in parallel with a bounded concurrency; the
//!   checkpoint file is rewritten atomically after every category, so a crash
//!   mid-run resumes with only the incomplete categories.
//! - Per-channel stream hashes diffed against the previous run.
//! - Optional random sampling of stream URLs with Cloudflare rejection; a
//!   blocked provider never overwrites the catalog.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Episode, LiveChannel, Movie, QualityTier, Season, Series};
use crate::provider::m3u::M3uParser;
use crate::provider::probe::is_cloudflare_response;
use crate::provider::state::{CategoryState, EndpointState, FetchState, StateError};
use crate::provider::xtream::{
    parse_categories, parse_live_streams, ConditionalBody, XtreamClient, XtreamError,
    XtreamLiveStream,
};

/// Per-URL timeout for the stream sampling pass.
const SAMPLE_TIMEOUT_SECS: u64 = 10;

/// Sampling results younger than this are not re-checked.
const SMOKETEST_TTL_SECS: i64 = 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no provider or m3u source configured")]
    NoSource,

    #[error("provider is cloudflare-blocked")]
    CloudflareBlocked,

    #[error("fetch cancelled")]
    Cancelled,

    #[error(transparent)]
    Xtream(#[from] XtreamError),

    #[error("m3u download error: {0}")]
    M3u(#[from] reqwest::Error),

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchStats {
    pub new_streams: usize,
    pub changed_streams: usize,
    pub unchanged_streams: usize,
    pub categories_fetched: usize,
}

#[derive(Debug)]
pub struct FetchedCatalog {
    pub movies: Vec<Movie>,
    pub series: Vec<Series>,
    pub live: Vec<LiveChannel>,
    pub stats: FetchStats,
}

#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchedCatalog),
    NotModified,
}

/// Stable per-channel content hash; a changed URL, name or EPG link shows up
/// as a changed hash in the run diff.
pub fn stream_hash(stream_id: &str, name: &str, epg_id: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stream_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(epg_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn body_sha256(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Canonical form of a stream URL used for cross-provider deduplication.
///
/// Credential query parameters are stripped so the same service fetched
/// through two accounts hashes identically.
pub fn normalize_stream_url(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.trim_end_matches('/').to_ascii_lowercase();
    };

    let keep: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            k != "username" && k != "password" && k != "token"
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if keep.is_empty() {
        parsed.set_query(None);
    } else {
        let joined = keep
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&joined));
    }

    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let port = match parsed.port() {
        Some(p) => format!(":{p}"),
        None => String::new(),
    };
    let path = parsed.path().trim_end_matches('/');
    match parsed.query() {
        Some(q) => format!("{host}{port}{path}?{q}"),
        None => format!("{host}{port}{path}"),
    }
}

/// Diff the current live set against the previous run's hashes.
pub fn diff_streams(
    previous: &HashMap<String, String>,
    live: &[LiveChannel],
) -> (FetchStats, HashMap<String, String>) {
    let mut stats = FetchStats::default();
    let mut next = HashMap::with_capacity(live.len());

    for ch in live {
        let hash = stream_hash(
            &ch.channel_id,
            &ch.guide_name,
            &ch.tvg_id,
            &ch.primary_stream_url,
        );
        match previous.get(&ch.channel_id) {
            None => stats.new_streams += 1,
            Some(prev) if prev != &hash => stats.changed_streams += 1,
            Some(_) => stats.unchanged_streams += 1,
        }
        next.insert(ch.channel_id.clone(), hash);
    }

    (stats, next)
}

/// Optional second provider: live channels only, merged with dedup.
pub struct SecondarySource {
    pub client: Option<XtreamClient>,
    pub m3u_url: Option<String>,
}

pub struct ResilientFetcher {
    state_path: PathBuf,
    client: Option<XtreamClient>,
    backup_bases: Vec<String>,
    m3u_url: Option<String>,
    secondary: Option<SecondarySource>,
    category_concurrency: usize,
    cf_reject: bool,
    stream_sample_size: usize,
    force_refresh: bool,
    http: reqwest::Client,
}

impl ResilientFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_path: PathBuf,
        client: Option<XtreamClient>,
        backup_bases: Vec<String>,
        m3u_url: Option<String>,
        secondary: Option<SecondarySource>,
        category_concurrency: usize,
        cf_reject: bool,
        stream_sample_size: usize,
        force_refresh: bool,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            state_path,
            client,
            backup_bases,
            m3u_url,
            secondary,
            category_concurrency: category_concurrency.max(1),
            cf_reject,
            stream_sample_size,
            force_refresh,
            http,
        })
    }

    /// Run one fetch. `previous` is the currently served catalog; on 304
    /// responses its data is carried forward instead of being refetched.
    pub async fn run(
        &self,
        previous: Arc<Catalog>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<FetchOutcome, FetchError> {
        let mut state = if self.force_refresh {
            info!("forced refresh: fetch state wiped");
            FetchState::default()
        } else {
            FetchState::load(&self.state_path)?
        };

        let resuming = state.has_incomplete_run();
        if !resuming {
            state.begin_run();
        } else {
            info!(
                complete = state.categories.iter().filter(|c| c.complete).count(),
                total = state.categories.len(),
                "resuming interrupted fetch"
            );
        }

        let mut all_unchanged = !resuming;

        let (live, movies, series) = if let Some(client) = &self.client {
            let (live, live_unchanged) = self
                .fetch_live_xtream(client, &mut state, &previous, cancel)
                .await?;
            let (movies, movies_unchanged) = self.fetch_movies(client, &mut state, &previous).await?;
            let (series, series_unchanged) = self.fetch_series(client, &mut state, &previous).await?;
            all_unchanged &= live_unchanged && movies_unchanged && series_unchanged;
            (live, movies, series)
        } else if let Some(m3u_url) = &self.m3u_url {
            let (live, unchanged) = self.fetch_live_m3u(m3u_url, &mut state, &previous).await?;
            all_unchanged &= unchanged;
            (live, previous.movies.clone(), previous.series.clone())
        } else {
            return Err(FetchError::NoSource);
        };

        if all_unchanged {
            info!("fetch: nothing changed upstream");
            // Drop per-run checkpoints so the state file stays small
            state.begin_run();
            state.save(&self.state_path)?;
            return Ok(FetchOutcome::NotModified);
        }

        let mut live = live;
        self.backfill_backups(&mut live);

        if let Some(secondary) = &self.secondary {
            match self.fetch_secondary(secondary).await {
                Ok(extra) => merge_secondary(&mut live, extra),
                Err(e) => warn!(error = %e, "second provider fetch failed, continuing without it"),
            }
        }

        self.sample_streams(&live).await?;

        let (mut stats, hashes) = diff_streams(&state.stream_hashes, &live);
        stats.categories_fetched = state.categories.len();
        info!(
            new = stats.new_streams,
            changed = stats.changed_streams,
            unchanged = stats.unchanged_streams,
            live = live.len(),
            movies = movies.len(),
            series = series.len(),
            "fetch complete"
        );

        state.finish_run(hashes);
        state.save(&self.state_path)?;

        Ok(FetchOutcome::Fetched(FetchedCatalog {
            movies,
            series,
            live,
            stats,
        }))
    }

    /// Fetch the live catalog from the indexing Xtream host, category by
    /// category, checkpointing after each one.
    async fn fetch_live_xtream(
        &self,
        client: &XtreamClient,
        state: &mut FetchState,
        previous: &Catalog,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(Vec<LiveChannel>, bool), FetchError> {
        let cat_endpoint = state.endpoint("live_categories");
        let response = client
            .get_conditional(
                "get_live_categories",
                &[],
                cat_endpoint.etag.as_deref(),
                cat_endpoint.last_modified.as_deref(),
            )
            .await?;

        let mut categories_unchanged = false;
        match response {
            ConditionalBody::NotModified => {
                categories_unchanged = true;
                debug!("live categories: 304");
            }
            ConditionalBody::Fresh { body, etag, last_modified } => {
                let hash = body_sha256(&body);
                if cat_endpoint.body_sha256.as_deref() == Some(hash.as_str()) {
                    categories_unchanged = true;
                    debug!("live categories: body hash unchanged");
                } else {
                    let categories = parse_categories(&body)?;
                    // Completion flags for still-existing categories survive a
                    // resume; new categories start incomplete.
                    let old: HashMap<String, bool> = state
                        .categories
                        .iter()
                        .map(|c| (c.category_id.clone(), c.complete))
                        .collect();
                    state.categories = categories
                        .into_iter()
                        .map(|c| CategoryState {
                            complete: old.get(&c.category_id).copied().unwrap_or(false),
                            category_id: c.category_id,
                            category_name: c.category_name,
                        })
                        .collect();
                }
                state.set_endpoint(
                    "live_categories",
                    EndpointState { etag, last_modified, body_sha256: Some(hash) },
                );
            }
        }

        let resumed_categories = state.categories.iter().filter(|c| c.complete).count();
        let pending: Vec<CategoryState> = state
            .categories
            .iter()
            .filter(|c| !c.complete)
            .cloned()
            .collect();

        let shared = Arc::new(Mutex::new(std::mem::take(state)));
        let mut any_category_changed = false;
        let mut cancelled = false;

        {
            let mut fetches = futures::stream::iter(pending.into_iter().map(|cat| {
                let shared = shared.clone();
                let state_path = self.state_path.clone();
                async move {
                    let result = self.fetch_category(client, &shared, &state_path, &cat).await;
                    (cat, result)
                }
            }))
            .buffer_unordered(self.category_concurrency);

            while let Some((cat, result)) = fetches.next().await {
                match result {
                    Ok(changed) => any_category_changed |= changed,
                    Err(e) => {
                        warn!(category = %cat.category_name, error = %e, "category fetch failed");
                        any_category_changed = true;
                    }
                }
                if *cancel.borrow() {
                    cancelled = true;
                    break;
                }
            }
        }

        *state = Arc::try_unwrap(shared)
            .map_err(|_| FetchError::Cancelled)?
            .into_inner();

        if cancelled {
            // Completed categories are already checkpointed on disk; the next
            // run resumes from there.
            return Err(FetchError::Cancelled);
        }

        if categories_unchanged && !any_category_changed && resumed_categories == 0 {
            // carry the served channels forward untouched
            return Ok((previous.live.clone(), true));
        }

        Ok((std::mem::take(&mut state.partial_live), false))
    }

    /// Fetch one category, convert its streams, checkpoint atomically.
    /// Returns whether the category body differed from the previous run.
    async fn fetch_category(
        &self,
        client: &XtreamClient,
        shared: &Mutex<FetchState>,
        state_path: &std::path::Path,
        cat: &CategoryState,
    ) -> Result<bool, FetchError> {
        let key = format!("cat:{}", cat.category_id);
        let url_streams = client
            .get_conditional("get_live_streams", &[("category_id", &cat.category_id)], None, None)
            .await?;

        let ConditionalBody::Fresh { body, etag, last_modified } = url_streams else {
            return Ok(false);
        };

        let hash = body_sha256(&body);
        let streams = parse_live_streams(&body)?;
        let channels: Vec<LiveChannel> = streams
            .into_iter()
            .map(|s| live_stream_to_channel(client, s, &cat.category_name))
            .collect();

        let mut guard = shared.lock().await;
        let changed = guard.endpoint(&key).body_sha256.as_deref() != Some(hash.as_str());
        guard.set_endpoint(&key, EndpointState { etag, last_modified, body_sha256: Some(hash) });
        guard.partial_live.extend(channels);
        guard.mark_category_complete(&cat.category_id);
        guard.save(state_path)?;
        debug!(category = %cat.category_name, changed, "category checkpointed");
        Ok(changed)
    }

    async fn fetch_movies(
        &self,
        client: &XtreamClient,
        state: &mut FetchState,
        previous: &Catalog,
    ) -> Result<(Vec<Movie>, bool), FetchError> {
        let endpoint = state.endpoint("vod");
        let response = client
            .get_conditional(
                "get_vod_streams",
                &[],
                endpoint.etag.as_deref(),
                endpoint.last_modified.as_deref(),
            )
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                // Plenty of panels have no VOD; keep whatever we served before
                warn!(error = %e, "vod fetch failed, keeping previous movies");
                return Ok((previous.movies.clone(), true));
            }
        };

        match response {
            ConditionalBody::NotModified => Ok((previous.movies.clone(), true)),
            ConditionalBody::Fresh { body, etag, last_modified } => {
                let hash = body_sha256(&body);
                if endpoint.body_sha256.as_deref() == Some(hash.as_str()) {
                    state.set_endpoint(
                        "vod",
                        EndpointState { etag, last_modified, body_sha256: Some(hash) },
                    );
                    return Ok((previous.movies.clone(), true));
                }

                // Parse before the hash is committed: a corrupt body must
                // neither empty the catalog nor look "unchanged" next run
                let streams: Vec<crate::provider::xtream::XtreamVodStream> =
                    match serde_json::from_slice(&body) {
                        Ok(streams) => streams,
                        Err(e) => {
                            warn!(error = %e, "unparseable vod response, keeping previous movies");
                            return Ok((previous.movies.clone(), true));
                        }
                    };
                state.set_endpoint(
                    "vod",
                    EndpointState { etag, last_modified, body_sha256: Some(hash) },
                );

                let movies = streams
                    .into_iter()
                    .map(|s| {
                        let ext = s.container_extension.clone().unwrap_or_else(|| "mp4".into());
                        Movie {
                            id: format!("vod-{}", s.stream_id),
                            category: s.category_id.unwrap_or_default(),
                            title: s.name,
                            stream_url: client.movie_stream_url(s.stream_id, &ext),
                            poster: s.stream_icon,
                            container_ext: Some(ext),
                            added: s.added,
                        }
                    })
                    .collect();
                Ok((movies, false))
            }
        }
    }

    async fn fetch_series(
        &self,
        client: &XtreamClient,
        state: &mut FetchState,
        previous: &Catalog,
    ) -> Result<(Vec<Series>, bool), FetchError> {
        let endpoint = state.endpoint("series");
        let response = match client
            .get_conditional(
                "get_series",
                &[],
                endpoint.etag.as_deref(),
                endpoint.last_modified.as_deref(),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "series fetch failed, keeping previous series");
                return Ok((previous.series.clone(), true));
            }
        };

        match response {
            ConditionalBody::NotModified => Ok((previous.series.clone(), true)),
            ConditionalBody::Fresh { body, etag, last_modified } => {
                let hash = body_sha256(&body);
                if endpoint.body_sha256.as_deref() == Some(hash.as_str()) {
                    state.set_endpoint(
                        "series",
                        EndpointState { etag, last_modified, body_sha256: Some(hash) },
                    );
                    return Ok((previous.series.clone(), true));
                }

                // Same rule as the vod path: only a body that parses may
                // advance the stored hash
                let listings: Vec<crate::provider::xtream::XtreamSeriesListing> =
                    match serde_json::from_slice(&body) {
                        Ok(listings) => listings,
                        Err(e) => {
                            warn!(error = %e, "unparseable series response, keeping previous series");
                            return Ok((previous.series.clone(), true));
                        }
                    };
                state.set_endpoint(
                    "series",
                    EndpointState { etag, last_modified, body_sha256: Some(hash) },
                );

                let mut out = Vec::with_capacity(listings.len());
                for listing in listings {
                    let info = match client.get_series_info(listing.series_id).await {
                        Ok(i) => i,
                        Err(e) => {
                            warn!(series = %listing.name, error = %e, "series info fetch failed");
                            continue;
                        }
                    };

                    let mut seasons: HashMap<u32, Vec<Episode>> = HashMap::new();
                    for (season_key, episodes) in info.episodes.unwrap_or_default() {
                        let season_num = season_key.parse::<u32>().unwrap_or(0);
                        for ep in episodes {
                            let ext = ep.container_extension.clone().unwrap_or_else(|| "mp4".into());
                            seasons.entry(ep.season.unwrap_or(season_num)).or_default().push(
                                Episode {
                                    id: format!("ep-{}", ep.id),
                                    season_num: ep.season.unwrap_or(season_num),
                                    episode_num: ep.episode_num.unwrap_or(0),
                                    title: ep.title,
                                    stream_url: client.series_stream_url(ep.id, &ext),
                                    container_ext: Some(ext),
                                },
                            );
                        }
                    }

                    let mut series = Series {
                        id: format!("ser-{}", listing.series_id),
                        category: listing.category_id.unwrap_or_default(),
                        title: listing.name,
                        cover: listing.cover,
                        plot: listing.plot,
                        seasons: seasons
                            .into_iter()
                            .map(|(season_num, episodes)| Season { season_num, episodes })
                            .collect(),
                    };
                    series.sort_entries();
                    out.push(series);
                }
                out.sort_by(|a, b| a.title.cmp(&b.title));
                Ok((out, false))
            }
        }
    }

    /// M3U fallback: stream the body line by line while hashing it.
    async fn fetch_live_m3u(
        &self,
        m3u_url: &str,
        state: &mut FetchState,
        previous: &Catalog,
    ) -> Result<(Vec<LiveChannel>, bool), FetchError> {
        let endpoint = state.endpoint("m3u");
        let mut req = self.http.get(m3u_url);
        if let Some(etag) = &endpoint.etag {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(lm) = &endpoint.last_modified {
            req = req.header(reqwest::header::IF_MODIFIED_SINCE, lm);
        }

        let response = req.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok((previous.live.clone(), true));
        }
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Xtream(XtreamError::HttpError(status.as_u16())));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let mut hasher = Sha256::new();
        let mut parser = M3uParser::new("provider1");
        let mut pending = String::new();

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                parser.push_line(line.trim_end_matches(['\n', '\r']));
            }
        }
        if !pending.is_empty() {
            parser.push_line(&pending);
        }

        let hash = hex::encode(hasher.finalize());
        let unchanged = endpoint.body_sha256.as_deref() == Some(hash.as_str());
        state.set_endpoint(
            "m3u",
            EndpointState { etag, last_modified, body_sha256: Some(hash) },
        );
        if unchanged {
            return Ok((previous.live.clone(), true));
        }
        Ok((parser.finish(), false))
    }

    async fn fetch_secondary(
        &self,
        secondary: &SecondarySource,
    ) -> Result<Vec<LiveChannel>, FetchError> {
        if let Some(client) = &secondary.client {
            let streams = client.get_live_streams_all().await?;
            return Ok(streams
                .into_iter()
                .map(|s| {
                    let mut ch = live_stream_to_channel(client, s, "");
                    ch.source_tag = "provider2".into();
                    ch
                })
                .collect());
        }
        if let Some(m3u_url) = &secondary.m3u_url {
            let body = self.http.get(m3u_url).send().await?.text().await?;
            return Ok(crate::provider::m3u::parse_m3u(&body, "provider2"));
        }
        Ok(vec![])
    }

    /// Substitute backup provider bases into each channel's stream URL.
    fn backfill_backups(&self, live: &mut [LiveChannel]) {
        let Some(client) = &self.client else { return };
        let indexing_base = client.base_url();

        for ch in live.iter_mut() {
            if ch.source_tag == "provider2" {
                continue;
            }
            if let Some(suffix) = ch.primary_stream_url.strip_prefix(indexing_base) {
                ch.backup_stream_urls = self
                    .backup_bases
                    .iter()
                    .map(|base| format!("{}{}", base.trim_end_matches('/'), suffix))
                    .collect();
            }
        }
    }

    fn smoketest_cache_path(&self) -> PathBuf {
        self.state_path.with_file_name("smoketest_cache.json")
    }

    /// HEAD a random sample of stream URLs to smoke-test the provider edge.
    /// Results persist so repeated refreshes do not hammer the same URLs.
    async fn sample_streams(&self, live: &[LiveChannel]) -> Result<(), FetchError> {
        if self.stream_sample_size == 0 || live.is_empty() {
            return Ok(());
        }

        let cache_path = self.smoketest_cache_path();
        let mut cache = SmoketestCache::load(&cache_path);
        let now = chrono::Utc::now();

        let mut urls: Vec<&str> = live
            .iter()
            .map(|c| c.primary_stream_url.as_str())
            .filter(|url| cache.is_due(url, now))
            .collect();
        urls.shuffle(&mut rand::thread_rng());
        urls.truncate(self.stream_sample_size);
        if urls.is_empty() {
            return Ok(());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SAMPLE_TIMEOUT_SECS))
            .build()?;

        let mut blocked = 0usize;
        for &url in &urls {
            match client.head(url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let server = response
                        .headers()
                        .get(reqwest::header::SERVER)
                        .and_then(|v| v.to_str().ok());
                    let cf_ray = response.headers().contains_key("cf-ray");
                    let cf = is_cloudflare_response(status, server, cf_ray, "");
                    if cf {
                        blocked += 1;
                    }
                    cache.record(url, now, !cf);
                }
                Err(e) => {
                    debug!(url, error = %e, "stream sample HEAD failed");
                    cache.record(url, now, false);
                }
            }
        }
        cache.save(&cache_path);

        if blocked > 0 {
            warn!(blocked, sampled = urls.len(), "cloudflare markers in stream sample");
            if self.cf_reject {
                return Err(FetchError::CloudflareBlocked);
            }
        }
        Ok(())
    }
}

/// Persisted results of the stream sampling smoke test.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct SmoketestCache {
    #[serde(default)]
    entries: HashMap<String, SmoketestEntry>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SmoketestEntry {
    checked_at: chrono::DateTime<chrono::Utc>,
    ok: bool,
}

impl SmoketestCache {
    fn load(path: &std::path::Path) -> Self {
        std::fs::read(path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default()
    }

    fn save(&self, path: &std::path::Path) {
        if let Ok(json) = serde_json::to_vec_pretty(self) {
            if let Err(e) = crate::catalog::store::write_atomic(path, &json) {
                warn!(error = %e, "smoketest cache save failed");
            }
        }
    }

    fn is_due(&self, url: &str, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.entries.get(url) {
            Some(entry) => (now - entry.checked_at).num_seconds() >= SMOKETEST_TTL_SECS,
            None => true,
        }
    }

    fn record(&mut self, url: &str, now: chrono::DateTime<chrono::Utc>, ok: bool) {
        self.entries
            .insert(url.to_string(), SmoketestEntry { checked_at: now, ok });
    }
}

fn live_stream_to_channel(
    client: &XtreamClient,
    s: XtreamLiveStream,
    group_title: &str,
) -> LiveChannel {
    let url = match &s.direct_source {
        Some(direct) if !direct.is_empty() => direct.clone(),
        _ => client.live_stream_url(s.stream_id),
    };
    let epg_id = s.epg_channel_id.unwrap_or_default();

    // epg_channel_id is a provider hint; linking is the enrichment
    // pipeline's call.
    LiveChannel {
        channel_id: format!("xc-{}", s.stream_id),
        guide_number: s.num.map(|n| n.to_string()).unwrap_or_default(),
        guide_name: s.name,
        epg_linked: false,
        tvg_id: epg_id,
        tvg_logo: s.stream_icon.unwrap_or_default(),
        group_title: group_title.to_string(),
        quality_tier: QualityTier::Sd,
        primary_stream_url: url,
        backup_stream_urls: vec![],
        source_tag: "provider1".into(),
        sdt: None,
    }
}

/// Merge second-provider channels: live only, deduplicated against the
/// primary set by tvg_id or normalized URL.
pub fn merge_secondary(live: &mut Vec<LiveChannel>, extra: Vec<LiveChannel>) {
    let known_tvg: HashSet<String> = live
        .iter()
        .filter(|c| !c.tvg_id.is_empty())
        .map(|c| c.tvg_id.clone())
        .collect();
    let known_urls: HashSet<String> = live
        .iter()
        .map(|c| normalize_stream_url(&c.primary_stream_url))
        .collect();

    let mut merged = 0usize;
    for mut ch in extra {
        if !ch.tvg_id.is_empty() && known_tvg.contains(&ch.tvg_id) {
            continue;
        }
        if known_urls.contains(&normalize_stream_url(&ch.primary_stream_url)) {
            continue;
        }
        ch.source_tag = "provider2".into();
        ch.channel_id = format!("p2-{}", ch.channel_id);
        live.push(ch);
        merged += 1;
    }
    if merged > 0 {
        info!(merged, "second provider channels merged");
    }
}
