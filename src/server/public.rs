// src/server/public.rs

//! The public listener: `GET /render?url=...` with the host's render key.
//!
//! No `/internal/...` route exists on this router; peer and admin traffic
//! only ever terminates on the internal listener.

use crate::core::cache_service::ServeBody;
use crate::core::events::RequestEvent;
use crate::core::hosts::Host;
use crate::core::metrics;
use crate::core::orchestrator::{PublicRequest, RenderResponse};
use crate::core::state::AppState;
use crate::core::EdgeCacheError;
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use url::Url;

/// Render key header required on every public request.
pub const RENDER_KEY_HEADER: &str = "X-Render-Key";
pub const SOURCE_HEADER: &str = "X-Render-Source";
pub const CACHE_HEADER: &str = "X-Render-Cache";

#[derive(Debug, Deserialize)]
struct RenderParams {
    url: String,
}

pub async fn run_public_server(state: Arc<AppState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let listen = state.config.server.listen.clone();
    let app = Router::new()
        .route("/render", get(render_handler))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind public listener on {}: {}", listen, e);
            return;
        }
    };
    info!("Public listener on http://{}", listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_rx.recv().await.ok();
        info!("Public listener shutting down.");
    })
    .await
    .ok();
}

async fn render_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RenderParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let timer = metrics::REQUEST_DURATION_SECONDS.start_timer();

    // Host resolution from the requested URL's domain.
    let domain = match Url::parse(&params.url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_end_matches('.').to_lowercase()))
    {
        Some(domain) => domain,
        None => {
            return plain_status(StatusCode::BAD_REQUEST, "invalid url parameter");
        }
    };
    let Some(host) = state.hosts.by_domain(&domain) else {
        return plain_status(StatusCode::NOT_FOUND, "unknown host");
    };

    // Render key check.
    let provided_key = headers
        .get(RENDER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided_key != host.render_key {
        return plain_status(StatusCode::UNAUTHORIZED, "invalid render key");
    }

    let request = build_public_request(&params.url, &headers, peer, &host);
    let outcome = tokio::time::timeout(
        state.config.server.timeout,
        state.orchestrator.handle(&host, &request),
    )
    .await
    .unwrap_or_else(|_| {
        Err(EdgeCacheError::Timeout(
            "public request deadline exceeded".to_string(),
        ))
    });

    timer.observe_duration();

    match outcome {
        Ok(response) => {
            let source_label = response
                .source
                .map(|s| s.as_str())
                .unwrap_or("blocked")
                .to_string();
            metrics::REQUESTS_TOTAL
                .with_label_values(&[&source_label])
                .inc();
            if let Some(events) = &state.events {
                events.record(&RequestEvent {
                    client_ip: request.client_ip.clone(),
                    host: domain,
                    url: params.url.clone(),
                    source: source_label,
                    cache: response.cache.as_str().to_string(),
                    status: response.status,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            render_to_http(response).await
        }
        Err(e) => error_to_http(&e),
    }
}

fn build_public_request(
    raw_url: &str,
    headers: &HeaderMap,
    peer: SocketAddr,
    host: &Host,
) -> PublicRequest {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            map.insert(name.as_str().to_lowercase(), text.to_string());
        }
    }
    let user_agent = map.get("user-agent").cloned().unwrap_or_default();

    // First configured header that parses as an IP wins; the socket peer is
    // the fallback.
    let client_ip = host
        .client_ip_headers
        .iter()
        .find_map(|name| {
            map.get(name).and_then(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .find(|part| part.parse::<std::net::IpAddr>().is_ok())
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| peer.ip().to_string());

    PublicRequest {
        raw_url: raw_url.to_string(),
        user_agent,
        headers: map,
        client_ip,
    }
}

/// Converts the orchestrator's answer into an HTTP response. Uncompressed
/// artifacts stream straight off disk.
async fn render_to_http(response: RenderResponse) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );

    for (name, values) in &response.headers {
        for value in values {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                builder = builder.header(name, value);
            }
        }
    }
    if let Some(source) = response.source {
        builder = builder.header(SOURCE_HEADER, source.as_str());
    }
    builder = builder.header(CACHE_HEADER, response.cache.as_str());

    let body = match response.body {
        ServeBody::Memory(bytes) => Body::from(bytes),
        ServeBody::File(path) => match tokio::fs::File::open(&path).await {
            Ok(file) => Body::from_stream(ReaderStream::new(file)),
            Err(e) => {
                warn!("Failed to open artifact {} for serving: {}", path.display(), e);
                return plain_status(StatusCode::INTERNAL_SERVER_ERROR, "artifact unavailable");
            }
        },
    };

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Maps orchestrator errors onto public statuses. Internal details stay out
/// of the body.
fn error_to_http(error: &EdgeCacheError) -> Response {
    let (status, message) = match error {
        EdgeCacheError::UnknownHost(_) => (StatusCode::NOT_FOUND, "unknown host"),
        EdgeCacheError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        EdgeCacheError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid request"),
        EdgeCacheError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "request timed out"),
        EdgeCacheError::Render(_) | EdgeCacheError::Transport(_) => {
            (StatusCode::BAD_GATEWAY, "upstream failure")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    };
    warn!("Public request failed: {}", error);
    plain_status(status, message)
}

fn plain_status(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}
