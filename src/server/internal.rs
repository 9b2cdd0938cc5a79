// src/server/internal.rs

//! The internal listener: admin endpoints plus the server half of the peer
//! transport. Every route sits behind the shared-secret header and the
//! listener binds its own port; nothing here is reachable publicly.

use crate::config::ExpiredStrategy;
use crate::core::cluster::transport::{self, AUTH_HEADER, META_HEADER};
use crate::core::state::AppState;
use crate::core::types::{unix_now, CacheKey, Freshness, Priority};
use crate::core::EdgeCacheError;
use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

/// The unified JSON envelope of every internal response.
#[derive(Serialize)]
struct ApiEnvelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn api_ok<T: Serialize>(data: T) -> Response {
    Json(ApiEnvelope {
        success: true,
        message: None,
        data: Some(data),
    })
    .into_response()
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiEnvelope::<()> {
            success: false,
            message: Some(message.into()),
            data: None,
        }),
    )
        .into_response()
}

fn map_error(error: EdgeCacheError) -> Response {
    match error {
        EdgeCacheError::NotFound => api_error(StatusCode::NOT_FOUND, "not found"),
        EdgeCacheError::OverReplicated => {
            api_error(StatusCode::CONFLICT, "already at replication factor")
        }
        EdgeCacheError::InvalidRequest(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        EdgeCacheError::PathEscape(_) => api_error(StatusCode::BAD_REQUEST, "invalid file path"),
        EdgeCacheError::Unauthorized => api_error(StatusCode::UNAUTHORIZED, "unauthorized"),
        other => {
            error!("Internal API failure: {}", other);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Builds the internal router; exposed separately so tests can drive it on
/// an ephemeral port.
pub fn internal_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/internal/cache/status", get(status_handler))
        .route("/internal/cache/urls", get(urls_handler))
        .route("/internal/cache/summary", get(summary_handler))
        .route("/internal/cache/queue", get(queue_handler))
        .route("/internal/cache/queue/summary", get(queue_summary_handler))
        .route("/internal/cache/recache", post(recache_handler))
        .route("/internal/cache/invalidate", post(invalidate_handler))
        .route("/internal/shard/push", post(shard_push_handler))
        .route("/internal/shard/pull", get(shard_pull_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_auth,
        ))
        .with_state(state)
}

pub async fn run_internal_server(state: Arc<AppState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let listen = state.config.internal.listen.clone();
    let app = internal_router(state);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind internal listener on {}: {}", listen, e);
            return;
        }
    };
    info!("Internal listener on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Internal listener shutting down.");
        })
        .await
        .ok();
}

/// Shared-secret check. The configured key never appears in logs or bodies.
async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != state.config.internal.auth_key {
        return api_error(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    next.run(request).await
}

// --- Status ---

#[derive(Serialize)]
struct StatusReport {
    node_id: String,
    version: String,
    uptime_seconds: u64,
    cluster_size: usize,
    local_entries: usize,
    sharding_enabled: bool,
    replication_factor: usize,
    distribution_strategy: String,
    hosts: usize,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let members = match state.registry.members().await {
        Ok(members) => members,
        Err(e) => return map_error(e),
    };
    crate::core::metrics::CLUSTER_SIZE.set(members.len() as f64);
    let entries = match state.cache.metadata_store().all_entry_keys().await {
        Ok(keys) => keys.len(),
        Err(e) => return map_error(e),
    };
    let sharding = &state.config.cache_sharding;
    api_ok(StatusReport {
        node_id: state.node_id().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        cluster_size: members.len(),
        local_entries: entries,
        sharding_enabled: sharding.enabled,
        replication_factor: sharding.replication_factor,
        distribution_strategy: format!("{:?}", sharding.distribution_strategy).to_lowercase(),
        hosts: state.hosts.ids().len(),
    })
}

// --- URL listing ---

#[derive(Deserialize)]
struct UrlsQuery {
    host_id: u32,
    status: Option<String>,
    dimension: Option<u32>,
    source: Option<String>,
    #[serde(rename = "urlContains")]
    url_contains: Option<String>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    /// Cache age bounds in seconds since `created_at`.
    min_age: Option<u64>,
    max_age: Option<u64>,
    cursor: Option<usize>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct UrlEntry {
    key: String,
    url: String,
    dimension: u32,
    source: String,
    status: String,
    status_code: u16,
    size: u64,
    disk_size: u64,
    created_at: u64,
    expires_at: u64,
    last_access: u64,
    eg_ids: Vec<String>,
}

#[derive(Serialize)]
struct UrlsPage {
    entries: Vec<UrlEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<usize>,
}

fn freshness_label(freshness: Freshness) -> &'static str {
    match freshness {
        Freshness::Fresh => "active",
        Freshness::Stale => "stale",
        Freshness::Expired => "expired",
    }
}

async fn urls_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UrlsQuery>,
) -> Response {
    let Some(host) = state.hosts.by_id(query.host_id) else {
        return api_error(StatusCode::NOT_FOUND, "unknown host_id");
    };
    let stale_ttl = match host.cache.expired_strategy {
        ExpiredStrategy::ServeStale => host.cache.stale_ttl,
        ExpiredStrategy::Delete => Duration::ZERO,
    };
    let keys = match state
        .cache
        .metadata_store()
        .host_entry_keys(query.host_id)
        .await
    {
        Ok(keys) => keys,
        Err(e) => return map_error(e),
    };

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let now = unix_now();
    let mut entries = Vec::new();
    let mut position = query.cursor.unwrap_or(0);

    while position < keys.len() && entries.len() < limit {
        let key = &keys[position];
        position += 1;
        let meta = match state.cache.lookup(key).await {
            Ok(Some(meta)) => meta,
            _ => continue,
        };
        let freshness = freshness_label(meta.freshness(now, stale_ttl));
        if let Some(want) = &query.status {
            if want != freshness {
                continue;
            }
        }
        if let Some(dimension) = query.dimension {
            if meta.dimension != dimension {
                continue;
            }
        }
        if let Some(source) = &query.source {
            if *source != meta.source.to_string() {
                continue;
            }
        }
        if let Some(fragment) = &query.url_contains {
            if !meta.url.contains(fragment.as_str()) {
                continue;
            }
        }
        if query.min_size.is_some_and(|min| meta.size < min)
            || query.max_size.is_some_and(|max| meta.size > max)
        {
            continue;
        }
        let age = now.saturating_sub(meta.created_at);
        if query.min_age.is_some_and(|min| age < min) || query.max_age.is_some_and(|max| age > max)
        {
            continue;
        }
        entries.push(UrlEntry {
            key: key.to_string(),
            url: meta.url,
            dimension: meta.dimension,
            source: meta.source.to_string(),
            status: freshness.to_string(),
            status_code: meta.status_code,
            size: meta.size,
            disk_size: meta.disk_size,
            created_at: meta.created_at,
            expires_at: meta.expires_at,
            last_access: meta.last_access,
            eg_ids: meta.eg_ids,
        });
    }

    let next_cursor = (position < keys.len()).then_some(position);
    api_ok(UrlsPage {
        entries,
        next_cursor,
    })
}

// --- Summary ---

#[derive(Serialize, Default)]
struct CacheSummary {
    total: usize,
    by_status: HashMap<String, usize>,
    by_dimension: HashMap<u32, usize>,
    by_source: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct HostQuery {
    host_id: u32,
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HostQuery>,
) -> Response {
    let Some(host) = state.hosts.by_id(query.host_id) else {
        return api_error(StatusCode::NOT_FOUND, "unknown host_id");
    };
    let stale_ttl = match host.cache.expired_strategy {
        ExpiredStrategy::ServeStale => host.cache.stale_ttl,
        ExpiredStrategy::Delete => Duration::ZERO,
    };
    let keys = match state
        .cache
        .metadata_store()
        .host_entry_keys(query.host_id)
        .await
    {
        Ok(keys) => keys,
        Err(e) => return map_error(e),
    };

    let now = unix_now();
    let mut summary = CacheSummary::default();
    for key in keys {
        let meta = match state.cache.lookup(&key).await {
            Ok(Some(meta)) => meta,
            _ => continue,
        };
        summary.total += 1;
        *summary
            .by_status
            .entry(freshness_label(meta.freshness(now, stale_ttl)).to_string())
            .or_default() += 1;
        *summary.by_dimension.entry(meta.dimension).or_default() += 1;
        *summary.by_source.entry(meta.source.to_string()).or_default() += 1;
    }
    api_ok(summary)
}

// --- Queue views ---

#[derive(Deserialize)]
struct QueueQuery {
    host_id: u32,
    priority: Option<String>,
    cursor: Option<usize>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct QueueEntry {
    url: String,
    dimension_id: u32,
    priority: String,
    scheduled_at: u64,
}

#[derive(Serialize)]
struct QueuePage {
    entries: Vec<QueueEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<usize>,
}

fn parse_priority(raw: &str) -> Result<Priority, Response> {
    Priority::from_str(raw)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("unknown priority '{raw}'")))
}

async fn queue_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueQuery>,
) -> Response {
    if state.hosts.by_id(query.host_id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "unknown host_id");
    }
    let priorities = match &query.priority {
        Some(raw) => match parse_priority(raw) {
            Ok(priority) => vec![priority],
            Err(response) => return response,
        },
        None => Priority::ORDERED.to_vec(),
    };

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let cursor = query.cursor.unwrap_or(0);
    let mut entries = Vec::new();
    let mut skipped = 0usize;
    let mut more = false;

    'outer: for priority in priorities {
        let mut offset = 0usize;
        loop {
            let page = match state
                .recache
                .peek(query.host_id, priority, offset, limit.max(64))
                .await
            {
                Ok(page) => page,
                Err(e) => return map_error(e),
            };
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for (member, score) in page {
                if skipped < cursor {
                    skipped += 1;
                    continue;
                }
                if entries.len() >= limit {
                    more = true;
                    break 'outer;
                }
                entries.push(QueueEntry {
                    url: member.url,
                    dimension_id: member.dimension_id,
                    priority: priority.to_string(),
                    scheduled_at: score as u64,
                });
            }
        }
    }

    let next_cursor = more.then_some(cursor + entries.len());
    api_ok(QueuePage {
        entries,
        next_cursor,
    })
}

async fn queue_summary_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HostQuery>,
) -> Response {
    if state.hosts.by_id(query.host_id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "unknown host_id");
    }
    let mut lengths = HashMap::new();
    for priority in Priority::ORDERED {
        match state.recache.len(query.host_id, priority).await {
            Ok(len) => lengths.insert(priority.to_string(), len),
            Err(e) => return map_error(e),
        };
    }
    api_ok(lengths)
}

// --- Recache / invalidate ---

#[derive(Deserialize)]
struct RecacheBody {
    host_id: u32,
    urls: Vec<String>,
    dimension_ids: Vec<u32>,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Serialize)]
struct RecacheReply {
    entries_enqueued: u64,
}

async fn recache_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RecacheBody>,
) -> Response {
    let Some(host) = state.hosts.by_id(body.host_id) else {
        return api_error(StatusCode::NOT_FOUND, "unknown host_id");
    };
    if body.urls.is_empty() || body.dimension_ids.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "urls and dimension_ids are required");
    }
    for dimension_id in &body.dimension_ids {
        if host.dimension_by_id(*dimension_id).is_none() {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("host {} has no dimension {}", body.host_id, dimension_id),
            );
        }
    }
    let priority = match body.priority.as_deref() {
        Some(raw) => match parse_priority(raw) {
            Ok(priority) => priority,
            Err(response) => return response,
        },
        None => Priority::Normal,
    };

    // Autorecache entries bucket to the bot-hit interval so repeated API
    // calls within one bucket stay deduplicated.
    let now = unix_now();
    let score = if priority == Priority::Autorecache {
        let window = host.bothit.interval.as_secs().max(1);
        ((now / window) * window) as f64
    } else {
        now as f64
    };

    match state
        .recache
        .enqueue(body.host_id, &body.urls, &body.dimension_ids, priority, score)
        .await
    {
        Ok(added) => api_ok(RecacheReply {
            entries_enqueued: added,
        }),
        Err(e) => map_error(e),
    }
}

#[derive(Deserialize)]
struct InvalidateBody {
    host_id: u32,
    urls: Vec<String>,
    dimension_ids: Vec<u32>,
}

#[derive(Serialize)]
struct InvalidateReply {
    entries_removed: u64,
}

async fn invalidate_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InvalidateBody>,
) -> Response {
    let Some(host) = state.hosts.by_id(body.host_id) else {
        return api_error(StatusCode::NOT_FOUND, "unknown host_id");
    };
    let mut removed = 0u64;
    for url in &body.urls {
        let (_, hash) = match crate::core::urlnorm::normalize_and_hash(url, &host.strip_params) {
            Ok(parts) => parts,
            Err(e) => return map_error(e),
        };
        for dimension_id in &body.dimension_ids {
            let key = CacheKey::new(body.host_id, *dimension_id, hash.clone());
            match state.cache.lookup(&key).await {
                Ok(Some(meta)) => match state.cache.delete_entry(&key, &meta).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Invalidate failed for {}: {}", key, e),
                },
                Ok(None) => {}
                Err(e) => warn!("Invalidate lookup failed for {}: {}", key, e),
            }
        }
    }
    api_ok(InvalidateReply {
        entries_removed: removed,
    })
}

// --- Peer transport (server half) ---

#[derive(Deserialize)]
struct ShardQuery {
    key: String,
}

async fn shard_push_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ShardQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = match CacheKey::parse(&query.key) {
        Ok(key) => key,
        Err(e) => return map_error(e),
    };
    let meta_raw = headers
        .get(META_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let meta = match transport::decode_meta_header(meta_raw) {
        Ok(meta) => meta,
        Err(e) => return map_error(e),
    };
    let replication = state.config.cache_sharding.replication_factor;
    match state.cache.accept_push(&key, &meta, body, replication).await {
        Ok(()) => api_ok(serde_json::json!({ "stored": true })),
        Err(e) => map_error(e),
    }
}

async fn shard_pull_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ShardQuery>,
) -> Response {
    let key = match CacheKey::parse(&query.key) {
        Ok(key) => key,
        Err(e) => return map_error(e),
    };
    match state.cache.read_local(&key).await {
        Ok((meta, bytes)) => {
            let encoded = match transport::encode_meta_header(&meta) {
                Ok(encoded) => encoded,
                Err(e) => return map_error(e),
            };
            ([(META_HEADER, encoded)], bytes).into_response()
        }
        Err(e) => map_error(e),
    }
}
