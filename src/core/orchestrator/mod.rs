// src/core/orchestrator/mod.rs

//! The request state machine: every public request is routed through the
//! cache / stale / bypass / render / peer-pull decision tree, and render
//! completions replicate to the shard targets.

pub mod bypass;
pub mod renderer;
pub mod singleflight;

pub use renderer::{HttpRenderer, RenderJob, RenderedPage, Renderer};

use crate::config::{ExpiredStrategy, SelectionStrategy, ShardingConfig};
use crate::core::cache_service::{CacheService, ServeBody, WriteRequest};
use crate::core::cluster::{selector, PeerClient, Registry};
use crate::core::compress::Compression;
use crate::core::hosts::{Dimension, Host, HostTable, RuleDecision, UnmatchedPolicy};
use crate::core::metrics;
use crate::core::storage::CacheMetadata;
use crate::core::store::SharedStore;
use crate::core::tasks::recache::RecacheQueue;
use crate::core::types::{unix_now, ArtifactSource, CacheKey, Freshness, Priority, RuleAction};
use crate::core::urlnorm;
use crate::core::EdgeCacheError;
use bypass::BypassClient;
use bytes::Bytes;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use singleflight::{SingleFlight, LOCK_TTL_MARGIN};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

/// Poll interval while waiting on another flight's render.
const FLIGHT_WAIT_POLL: Duration = Duration::from_millis(250);

/// What produced the response, as reported in `X-Render-Source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
    Rendered,
    Cache,
    Bypass,
    BypassCache,
}

impl ServeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServeSource::Rendered => "rendered",
            ServeSource::Cache => "cache",
            ServeSource::Bypass => "bypass",
            ServeSource::BypassCache => "bypass_cache",
        }
    }
}

/// Cache verdict, as reported in `X-Render-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Stale,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Stale => "stale",
        }
    }
}

/// A public request entering the state machine. Header names are lowercase.
#[derive(Debug, Clone)]
pub struct PublicRequest {
    pub raw_url: String,
    pub user_agent: String,
    pub headers: HashMap<String, String>,
    pub client_ip: String,
}

/// The orchestrator's answer, ready for the HTTP layer.
#[derive(Debug)]
pub struct RenderResponse {
    pub status: u16,
    pub body: ServeBody,
    pub headers: HashMap<String, Vec<String>>,
    /// `None` for synthesized block/status responses.
    pub source: Option<ServeSource>,
    pub cache: CacheOutcome,
}

impl RenderResponse {
    fn synthesized(status: u16) -> Self {
        Self {
            status,
            body: ServeBody::Memory(Bytes::new()),
            headers: HashMap::new(),
            source: None,
            cache: CacheOutcome::Miss,
        }
    }
}

pub struct Orchestrator {
    node_id: String,
    hosts: Arc<HostTable>,
    cache: Arc<CacheService>,
    registry: Arc<Registry>,
    peers: Arc<PeerClient>,
    renderer: Arc<dyn Renderer>,
    bypass: BypassClient,
    recache: Arc<RecacheQueue>,
    sharding: ShardingConfig,
    selection: SelectionStrategy,
    single_flight: SingleFlight,
    /// Guards against duplicate stale-refresh enqueues per cache key.
    refresh_inflight: DashMap<String, Instant>,
    /// Per-host render concurrency bounds.
    render_semaphores: DashMap<u32, Arc<Semaphore>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        hosts: Arc<HostTable>,
        cache: Arc<CacheService>,
        store: Arc<dyn SharedStore>,
        registry: Arc<Registry>,
        peers: Arc<PeerClient>,
        renderer: Arc<dyn Renderer>,
        recache: Arc<RecacheQueue>,
        sharding: ShardingConfig,
        selection: SelectionStrategy,
    ) -> Result<Self, EdgeCacheError> {
        Ok(Self {
            node_id: node_id.into(),
            hosts,
            cache,
            registry,
            peers,
            renderer,
            bypass: BypassClient::new()?,
            recache,
            sharding,
            selection,
            single_flight: SingleFlight::new(store),
            refresh_inflight: DashMap::new(),
            render_semaphores: DashMap::new(),
        })
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn sharding(&self) -> &ShardingConfig {
        &self.sharding
    }

    /// Entry point for a public request that already resolved its host.
    pub async fn handle(
        &self,
        host: &Arc<Host>,
        req: &PublicRequest,
    ) -> Result<RenderResponse, EdgeCacheError> {
        // Dimension matching: first UA match wins, then the unmatched policy.
        let dimension = match host.match_dimension(&req.user_agent) {
            Some(d) => d.clone(),
            None => match host.unmatched {
                UnmatchedPolicy::Block => return Ok(RenderResponse::synthesized(403)),
                UnmatchedPolicy::Bypass => {
                    let decision = RuleDecision {
                        action: RuleAction::Bypass,
                        cache: host.cache.clone(),
                        bypass: host.bypass.clone(),
                    };
                    return self.bypass_flow(host, &req.raw_url, None, &decision, req).await;
                }
                UnmatchedPolicy::Dimension(id) => host
                    .dimension_by_id(id)
                    .ok_or_else(|| {
                        EdgeCacheError::Internal(format!("unmatched dimension {id} vanished"))
                    })?
                    .clone(),
            },
        };

        let (normalized, hash) = urlnorm::normalize_and_hash(&req.raw_url, &host.strip_params)?;
        let parsed = Url::parse(&normalized)?;
        let key = CacheKey::new(host.id, dimension.id, hash);
        let decision = host.decide(&parsed);

        // LOOKUP
        if let Some(meta) = self.lookup_tolerant(&key).await? {
            let now = unix_now();
            let stale_ttl = match decision.cache.expired_strategy {
                ExpiredStrategy::ServeStale => decision.cache.stale_ttl,
                ExpiredStrategy::Delete => Duration::ZERO,
            };
            match meta.freshness(now, stale_ttl) {
                Freshness::Fresh => {
                    if host.bothit.matches_ua(&req.user_agent) {
                        self.cache.touch_bot_hit(&key).await;
                    }
                    if let Some(resp) = self
                        .serve_existing(&key, &meta, CacheOutcome::Hit)
                        .await?
                    {
                        metrics::CACHE_HITS_TOTAL.inc();
                        self.cache.touch_last_access(&key).await;
                        return Ok(resp);
                    }
                    // Local copy unusable and no holder reachable: re-render.
                }
                Freshness::Stale => {
                    self.enqueue_refresh(&key, host, &dimension, &normalized, &decision)
                        .await;
                    if let Some(resp) = self
                        .serve_existing(&key, &meta, CacheOutcome::Stale)
                        .await?
                    {
                        metrics::CACHE_STALE_HITS_TOTAL.inc();
                        return Ok(resp);
                    }
                }
                Freshness::Expired => {
                    if decision.cache.expired_strategy == ExpiredStrategy::Delete {
                        if let Err(e) = self.cache.delete_entry(&key, &meta).await {
                            warn!("Failed to delete expired entry {}: {}", key, e);
                        }
                    }
                }
            }
        }

        // MISS
        metrics::CACHE_MISSES_TOTAL.inc();
        match decision.action {
            RuleAction::Render => {
                self.render_with_lock(&key, host, &dimension, &normalized, &decision)
                    .await
            }
            RuleAction::Bypass => {
                self.bypass_flow(host, &normalized, Some(&key), &decision, req)
                    .await
            }
            RuleAction::Block => Ok(RenderResponse::synthesized(403)),
            RuleAction::Status(code) => Ok(RenderResponse::synthesized(code)),
        }
    }

    /// Re-render entry point for the recache scheduler. Rules still apply;
    /// a URL the rules exclude from rendering is silently skipped.
    pub async fn render_for_recache(
        &self,
        host_id: u32,
        url: &str,
        dimension_id: u32,
    ) -> Result<(), EdgeCacheError> {
        let host = self
            .hosts
            .by_id(host_id)
            .ok_or_else(|| EdgeCacheError::UnknownHost(host_id.to_string()))?;
        let Some(dimension) = host.dimension_by_id(dimension_id).cloned() else {
            return Err(EdgeCacheError::InvalidRequest(format!(
                "host {host_id} has no dimension {dimension_id}"
            )));
        };
        let (normalized, hash) = urlnorm::normalize_and_hash(url, &host.strip_params)?;
        let parsed = Url::parse(&normalized)?;
        let decision = host.decide(&parsed);
        if decision.action != RuleAction::Render {
            debug!("Skipping recache of {}: rules exclude rendering", url);
            return Ok(());
        }
        let key = CacheKey::new(host_id, dimension.id, hash);
        let result = self
            .render_with_lock(&key, &host, &dimension, &normalized, &decision)
            .await
            .map(|_| ());
        self.refresh_inflight.remove(&key.to_string());
        result
    }

    /// Lookup that treats unparseable metadata as a miss. The record stays
    /// in the store for offline inspection.
    async fn lookup_tolerant(
        &self,
        key: &CacheKey,
    ) -> Result<Option<CacheMetadata>, EdgeCacheError> {
        match self.cache.lookup(key).await {
            Ok(meta) => Ok(meta),
            Err(EdgeCacheError::Parse { field, reason }) => {
                warn!(
                    "Unparseable metadata for {} (field '{}': {}); treating as miss",
                    key, field, reason
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn source_for(meta: &CacheMetadata) -> ServeSource {
        match meta.source {
            ArtifactSource::Render => ServeSource::Cache,
            ArtifactSource::Bypass => ServeSource::BypassCache,
        }
    }

    /// Serves an existing entry from local disk, or by pulling from a
    /// holder when this node is not in `eg_ids`. `None` means the entry is
    /// unusable everywhere and the caller should fall through to render.
    async fn serve_existing(
        &self,
        key: &CacheKey,
        meta: &CacheMetadata,
        outcome: CacheOutcome,
    ) -> Result<Option<RenderResponse>, EdgeCacheError> {
        if meta.held_by(&self.node_id) {
            match self.cache.prepare_for_serving(key, meta).await {
                Ok(body) => {
                    return Ok(Some(RenderResponse {
                        status: meta.status_code,
                        body,
                        headers: meta.headers.clone().unwrap_or_default(),
                        source: Some(Self::source_for(meta)),
                        cache: outcome,
                    }));
                }
                Err(EdgeCacheError::Decompression(_)) => {
                    // Self-heal already removed the entry.
                    metrics::CACHE_SELF_HEALS_TOTAL.inc();
                    return Ok(None);
                }
                Err(EdgeCacheError::NotFound) => {
                    debug!("Local artifact missing for {}; trying peers", key);
                }
                Err(e) => return Err(e),
            }
        }
        self.pull_and_serve(key, meta, outcome).await
    }

    /// PEER_PULL_FIRST: fetch the artifact from a holding node, optionally
    /// replicate it locally, and serve from memory. A pull whose local
    /// persist fails still serves the pulled bytes.
    async fn pull_and_serve(
        &self,
        key: &CacheKey,
        meta: &CacheMetadata,
        outcome: CacheOutcome,
    ) -> Result<Option<RenderResponse>, EdgeCacheError> {
        let mut holders: Vec<String> = meta
            .eg_ids
            .iter()
            .filter(|id| *id != &self.node_id)
            .cloned()
            .collect();
        if holders.is_empty() {
            return Ok(None);
        }
        if self.selection == SelectionStrategy::Random {
            holders.shuffle(&mut rand::thread_rng());
        }

        for holder in &holders {
            let Some(record) = self.registry.member(holder).await? else {
                debug!("Holder {} of {} is not in the registry", holder, key);
                continue;
            };
            match self.peers.pull(&record.address, key).await {
                Ok((pulled_meta, bytes)) => {
                    metrics::SHARD_PULLS_TOTAL.with_label_values(&["ok"]).inc();
                    return self
                        .finish_pull(key, &pulled_meta, bytes, outcome)
                        .await
                        .map(Some);
                }
                Err(e) => {
                    metrics::SHARD_PULLS_TOTAL
                        .with_label_values(&["error"])
                        .inc();
                    debug!("Pull of {} from {} failed: {}", key, holder, e);
                }
            }
        }
        Ok(None)
    }

    async fn finish_pull(
        &self,
        key: &CacheKey,
        meta: &CacheMetadata,
        bytes: Bytes,
        outcome: CacheOutcome,
    ) -> Result<RenderResponse, EdgeCacheError> {
        // Bytes arrive exactly as stored on the holder; decode per suffix.
        let compression = Compression::from_path(Path::new(&meta.file_path))?;
        let decoded = compression.decompress(&bytes)?;

        if self.sharding.replicate_on_pull
            && meta.eg_ids.len() < self.sharding.replication_factor.max(1)
        {
            if let Err(e) = self
                .cache
                .write_pulled(key, meta, bytes, self.sharding.replication_factor)
                .await
            {
                warn!("Failed to persist pulled artifact {}: {}", key, e);
            }
        }

        Ok(RenderResponse {
            status: meta.status_code,
            body: ServeBody::Memory(Bytes::from(decoded)),
            headers: meta.headers.clone().unwrap_or_default(),
            source: Some(Self::source_for(meta)),
            cache: outcome,
        })
    }

    /// RENDER with the cross-node single-flight lock. Losers wait bounded
    /// on the winner's result; a winner that fails releases the lock early
    /// so waiters retry once with a fresh budget.
    async fn render_with_lock(
        &self,
        key: &CacheKey,
        host: &Arc<Host>,
        dimension: &Dimension,
        normalized: &str,
        decision: &RuleDecision,
    ) -> Result<RenderResponse, EdgeCacheError> {
        let lock_ttl = decision.cache.render_timeout + LOCK_TTL_MARGIN;
        for _attempt in 0..2 {
            if let Some(guard) = self.single_flight.try_acquire(key, lock_ttl).await? {
                let result = self
                    .do_render(key, host, dimension, normalized, decision)
                    .await;
                guard.release().await;
                return result;
            }
            match self.wait_for_flight(key, decision).await? {
                Some(response) => return Ok(response),
                None => continue,
            }
        }
        Err(EdgeCacheError::Timeout(format!(
            "gave up waiting on concurrent render of {key}"
        )))
    }

    /// Polls for the winner's metadata. `Ok(None)` means the lock vanished
    /// without a fresh entry (the winner failed) and the caller may retry.
    async fn wait_for_flight(
        &self,
        key: &CacheKey,
        decision: &RuleDecision,
    ) -> Result<Option<RenderResponse>, EdgeCacheError> {
        let deadline = Instant::now() + decision.cache.render_timeout;
        loop {
            tokio::time::sleep(FLIGHT_WAIT_POLL).await;
            if let Some(meta) = self.lookup_tolerant(key).await? {
                if meta.is_fresh(unix_now()) {
                    if let Some(resp) = self.serve_existing(key, &meta, CacheOutcome::Hit).await? {
                        return Ok(Some(resp));
                    }
                }
            }
            if !self.single_flight.is_locked(key).await? {
                return Ok(None);
            }
            if Instant::now() >= deadline {
                return Err(EdgeCacheError::Timeout(format!(
                    "timed out waiting on concurrent render of {key}"
                )));
            }
        }
    }

    fn render_semaphore(&self, host: &Host) -> Arc<Semaphore> {
        self.render_semaphores
            .entry(host.id)
            .or_insert_with(|| Arc::new(Semaphore::new(host.max_concurrent_renders.max(1))))
            .clone()
    }

    /// Calls the renderer, persists the artifact, and fans out to the shard
    /// targets. Holding the single-flight lock is the caller's concern.
    async fn do_render(
        &self,
        key: &CacheKey,
        host: &Arc<Host>,
        dimension: &Dimension,
        normalized: &str,
        decision: &RuleDecision,
    ) -> Result<RenderResponse, EdgeCacheError> {
        let semaphore = self.render_semaphore(host);
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| EdgeCacheError::Cancelled)?;

        let job = RenderJob {
            url: normalized.to_string(),
            width: dimension.width,
            height: dimension.height,
            user_agent: dimension.render_ua.clone(),
            wait_for: host.events.wait_for.clone(),
            additional_wait_ms: host.events.additional_wait.map(|d| d.as_millis() as u64),
            blocked_resource_types: host.blocked_resource_types.clone(),
            timeout: decision.cache.render_timeout,
        };

        let timer = metrics::RENDER_DURATION_SECONDS.start_timer();
        let rendered = self.renderer.render(&job).await;
        timer.observe_duration();

        let page = match rendered {
            Ok(page) => {
                metrics::RENDERS_TOTAL.with_label_values(&["ok"]).inc();
                page
            }
            Err(e) => {
                metrics::RENDERS_TOTAL.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };

        let headers = filter_headers(&page.headers, &host.safe_response_headers);

        // Placement: a snapshot of the membership, never a live handle.
        let (eg_ids, addresses) = if self.sharding.enabled {
            let members = self.registry.members().await?;
            let member_ids: Vec<String> = members.iter().map(|m| m.eg_id.clone()).collect();
            let targets = selector::select_targets(
                self.sharding.distribution_strategy,
                key,
                &member_ids,
                &self.node_id,
                self.sharding.replication_factor,
            );
            let eg_ids = selector::compose_eg_ids(
                &self.node_id,
                &targets,
                self.sharding.replication_factor,
            );
            let addresses: HashMap<String, String> = members
                .into_iter()
                .map(|m| (m.eg_id, m.address))
                .collect();
            (eg_ids, addresses)
        } else {
            (vec![self.node_id.clone()], HashMap::new())
        };

        let meta = self
            .cache
            .write_rendered(
                key,
                WriteRequest {
                    url: normalized.to_string(),
                    status_code: page.status,
                    headers: if headers.is_empty() {
                        None
                    } else {
                        Some(headers.clone())
                    },
                    body: page.body.clone(),
                    ttl: decision.cache.ttl,
                    source: ArtifactSource::Render,
                    eg_ids: eg_ids.clone(),
                },
            )
            .await?;

        if self.sharding.enabled && self.sharding.push_on_render {
            self.spawn_push(key.clone(), meta, eg_ids, addresses);
        }

        Ok(RenderResponse {
            status: page.status,
            body: ServeBody::Memory(page.body),
            headers,
            source: Some(ServeSource::Rendered),
            cache: CacheOutcome::Miss,
        })
    }

    /// Push replication runs detached: failures are logged and never fail
    /// the originating render response.
    fn spawn_push(
        &self,
        key: CacheKey,
        meta: CacheMetadata,
        eg_ids: Vec<String>,
        addresses: HashMap<String, String>,
    ) {
        let cache = Arc::clone(&self.cache);
        let peers = Arc::clone(&self.peers);
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            let stored = match cache.read_local(&key).await {
                Ok((_, bytes)) => bytes,
                Err(e) => {
                    warn!("Push of {} skipped; local read failed: {}", key, e);
                    return;
                }
            };
            for target in eg_ids.iter().filter(|id| **id != node_id) {
                let Some(address) = addresses.get(target) else {
                    debug!("Push target {} for {} has no registry address", target, key);
                    continue;
                };
                match peers.push(address, &key, &meta, stored.clone()).await {
                    Ok(()) => {
                        metrics::SHARD_PUSHES_TOTAL.with_label_values(&["ok"]).inc();
                        debug!("Replicated {} to {}", key, target);
                    }
                    Err(EdgeCacheError::OverReplicated) => {
                        metrics::SHARD_PUSHES_TOTAL
                            .with_label_values(&["over_replicated"])
                            .inc();
                        info!("Push of {} to {} refused: already at replication factor", key, target);
                    }
                    Err(e) => {
                        metrics::SHARD_PUSHES_TOTAL
                            .with_label_values(&["error"])
                            .inc();
                        warn!("Push of {} to {} failed: {}", key, target, e);
                    }
                }
            }
        });
    }

    /// BYPASS: proxy to the origin, optionally capturing the response.
    async fn bypass_flow(
        &self,
        host: &Arc<Host>,
        url: &str,
        key: Option<&CacheKey>,
        decision: &RuleDecision,
        req: &PublicRequest,
    ) -> Result<RenderResponse, EdgeCacheError> {
        let request_headers: HashMap<String, String> = req
            .headers
            .iter()
            .filter(|(name, _)| host.safe_request_headers.iter().any(|h| h == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let page = self
            .bypass
            .fetch(url, &request_headers, decision.bypass.timeout)
            .await?;
        let headers = filter_headers(&page.headers, &host.safe_response_headers);

        let cacheable = decision.bypass.cache_enabled
            && decision.bypass.cache_status_codes.contains(&page.status)
            && page.body.len() >= decision.bypass.cache_min_body_size;
        if cacheable {
            if let Some(key) = key {
                let write = WriteRequest {
                    url: url.to_string(),
                    status_code: page.status,
                    headers: if headers.is_empty() {
                        None
                    } else {
                        Some(headers.clone())
                    },
                    body: page.body.clone(),
                    ttl: decision.bypass.cache_ttl,
                    source: ArtifactSource::Bypass,
                    eg_ids: vec![self.node_id.clone()],
                };
                if let Err(e) = self.cache.write_rendered(key, write).await {
                    warn!("Failed to cache bypass response for {}: {}", key, e);
                }
            }
        }

        Ok(RenderResponse {
            status: page.status,
            body: ServeBody::Memory(page.body),
            headers,
            source: Some(ServeSource::Bypass),
            cache: CacheOutcome::Miss,
        })
    }

    /// STALE_CANDIDATE: queue a background re-render unless one is already
    /// in flight for this key (in-process guard; the NX enqueue dedups
    /// across nodes).
    async fn enqueue_refresh(
        &self,
        key: &CacheKey,
        host: &Arc<Host>,
        dimension: &Dimension,
        normalized: &str,
        decision: &RuleDecision,
    ) {
        let guard_window = decision.cache.render_timeout + LOCK_TTL_MARGIN;
        let guard_key = key.to_string();
        let now = Instant::now();
        let mut should_enqueue = false;
        self.refresh_inflight
            .entry(guard_key)
            .and_modify(|at| {
                if at.elapsed() > guard_window {
                    *at = now;
                    should_enqueue = true;
                }
            })
            .or_insert_with(|| {
                should_enqueue = true;
                now
            });
        if !should_enqueue {
            return;
        }
        if let Err(e) = self
            .recache
            .enqueue(
                host.id,
                &[normalized.to_string()],
                &[dimension.id],
                Priority::High,
                unix_now() as f64,
            )
            .await
        {
            warn!("Failed to enqueue stale refresh of {}: {}", key, e);
            self.refresh_inflight.remove(&key.to_string());
        }
    }
}

/// Keeps only allow-listed headers (names already lowercase on both sides).
fn filter_headers(
    headers: &HashMap<String, Vec<String>>,
    allowed: &[String],
) -> HashMap<String, Vec<String>> {
    headers
        .iter()
        .filter(|(name, _)| allowed.iter().any(|a| a == *name))
        .map(|(name, values)| (name.clone(), values.clone()))
        .collect()
}
