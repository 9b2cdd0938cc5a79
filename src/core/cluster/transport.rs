// src/core/cluster/transport.rs

//! Authenticated node-to-node HTTP client for artifact push and pull.
//!
//! Artifact bytes travel as the request/response body exactly as stored on
//! the sending node (already compressed when the origin compressed them);
//! the metadata field map rides in the percent-encoded `X-Cache-Meta`
//! header. The server half of this protocol lives in `server::internal`.

use crate::core::storage::CacheMetadata;
use crate::core::types::CacheKey;
use crate::core::EdgeCacheError;
use bytes::Bytes;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Shared-secret header for all internal traffic.
pub const AUTH_HEADER: &str = "X-Internal-Auth";
/// Header carrying the percent-encoded JSON metadata field map.
pub const META_HEADER: &str = "X-Cache-Meta";

/// Per-operation deadline for peer push/pull.
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PeerClient {
    http: reqwest::Client,
    auth_key: String,
}

/// Encodes metadata for the wire header.
pub fn encode_meta_header(meta: &CacheMetadata) -> Result<String, EdgeCacheError> {
    let fields: HashMap<String, String> = meta.to_fields()?.into_iter().collect();
    Ok(urlencoding::encode(&serde_json::to_string(&fields)?).into_owned())
}

/// Decodes the wire header back into metadata.
pub fn decode_meta_header(raw: &str) -> Result<CacheMetadata, EdgeCacheError> {
    let json = urlencoding::decode(raw)
        .map_err(|e| EdgeCacheError::Transport(format!("bad metadata header encoding: {e}")))?;
    let fields: HashMap<String, String> = serde_json::from_str(&json)?;
    CacheMetadata::from_fields(&fields)
}

fn status_to_error(status: StatusCode) -> EdgeCacheError {
    match status {
        StatusCode::UNAUTHORIZED => EdgeCacheError::Unauthorized,
        StatusCode::NOT_FOUND => EdgeCacheError::NotFound,
        StatusCode::CONFLICT => EdgeCacheError::OverReplicated,
        other => EdgeCacheError::Transport(format!("peer responded with status {other}")),
    }
}

impl PeerClient {
    pub fn new(auth_key: impl Into<String>) -> Result<Self, EdgeCacheError> {
        let http = reqwest::Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            auth_key: auth_key.into(),
        })
    }

    /// Pushes an artifact to a target node. The target writes the bytes
    /// as-is and adds itself to `eg_ids`; a target that would exceed the
    /// replication factor refuses with `over_replicated`.
    pub async fn push(
        &self,
        peer_address: &str,
        key: &CacheKey,
        meta: &CacheMetadata,
        bytes: Bytes,
    ) -> Result<(), EdgeCacheError> {
        let url = format!(
            "http://{peer_address}/internal/shard/push?key={}",
            urlencoding::encode(&key.to_string())
        );
        let response = self
            .http
            .post(&url)
            .header(AUTH_HEADER, &self.auth_key)
            .header(META_HEADER, encode_meta_header(meta)?)
            .body(bytes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_to_error(response.status()));
        }
        debug!("Pushed {} to {}", key, peer_address);
        Ok(())
    }

    /// Pulls an artifact from a holding node. Returns the holder's metadata
    /// and the bytes exactly as stored there.
    pub async fn pull(
        &self,
        peer_address: &str,
        key: &CacheKey,
    ) -> Result<(CacheMetadata, Bytes), EdgeCacheError> {
        let url = format!(
            "http://{peer_address}/internal/shard/pull?key={}",
            urlencoding::encode(&key.to_string())
        );
        let response = self
            .http
            .get(&url)
            .header(AUTH_HEADER, &self.auth_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_to_error(response.status()));
        }
        let meta_raw = response
            .headers()
            .get(META_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                EdgeCacheError::Transport("pull response missing metadata header".to_string())
            })?
            .to_string();
        let meta = decode_meta_header(&meta_raw)?;
        let bytes = response.bytes().await?;
        Ok((meta, bytes))
    }
}
