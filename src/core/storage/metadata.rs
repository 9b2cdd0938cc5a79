// src/core/storage/metadata.rs

//! The per-entry metadata record and its flat string-map serialization.
//!
//! Records are stored as one hash per entry in the shared store so that
//! individual fields (`eg_ids`, `last_access`, `last_bot_hit`) can be
//! CAS-updated without rewriting the whole record.

use crate::core::types::{ArtifactSource, Freshness};
use crate::core::EdgeCacheError;
use std::collections::HashMap;
use std::time::Duration;

/// Field names of the serialized record. Kept as constants so the store,
/// the CAS paths, and the parser cannot drift apart.
pub mod field {
    pub const KEY: &str = "key";
    pub const URL: &str = "url";
    pub const FILE_PATH: &str = "file_path";
    pub const HOST_ID: &str = "host_id";
    pub const DIMENSION: &str = "dimension";
    pub const REQUEST_ID: &str = "request_id";
    pub const CREATED_AT: &str = "created_at";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const LAST_ACCESS: &str = "last_access";
    pub const SIZE: &str = "size";
    pub const DISK_SIZE: &str = "disk_size";
    pub const SOURCE: &str = "source";
    pub const STATUS_CODE: &str = "status_code";
    pub const HEADERS: &str = "headers";
    pub const LAST_BOT_HIT: &str = "last_bot_hit";
    pub const EG_IDS: &str = "eg_ids";
}

/// Persisted metadata for one cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheMetadata {
    /// Textual cache key, redundant with the store key, for self-description.
    pub key: String,
    /// Canonical URL.
    pub url: String,
    /// Path relative to the storage base; carries the compression suffix.
    pub file_path: String,
    pub host_id: u32,
    pub dimension: u32,
    pub request_id: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_access: u64,
    /// Uncompressed artifact byte length.
    pub size: u64,
    /// On-disk byte length. Legacy records without it parse as 0.
    pub disk_size: u64,
    pub source: ArtifactSource,
    /// HTTP status captured at render time.
    pub status_code: u16,
    /// Optional response headers, name -> values.
    pub headers: Option<HashMap<String, Vec<String>>>,
    pub last_bot_hit: Option<u64>,
    /// Ordered unique node ids currently holding this artifact.
    pub eg_ids: Vec<String>,
}

fn parse_error(field: &str, reason: impl Into<String>) -> EdgeCacheError {
    EdgeCacheError::Parse {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn parse_u64(fields: &HashMap<String, String>, name: &str) -> Result<u64, EdgeCacheError> {
    match fields.get(name) {
        None => Ok(0),
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| parse_error(name, format!("expected integer, got '{raw}'"))),
    }
}

fn required_string(fields: &HashMap<String, String>, name: &str) -> Result<String, EdgeCacheError> {
    fields
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| parse_error(name, "missing"))
}

/// Joins node ids, deduplicated, preserving first-seen order.
pub fn join_eg_ids(ids: &[String]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for id in ids {
        let id = id.as_str();
        if !id.is_empty() && !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen.join(",")
}

/// Splits a stored `eg_ids` value into an ordered, deduplicated list.
pub fn split_eg_ids(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in raw.split(',') {
        let id = id.trim();
        if !id.is_empty() && !out.iter().any(|s| s == id) {
            out.push(id.to_string());
        }
    }
    out
}

impl CacheMetadata {
    /// Flattens the record into the stored field map. Integers render
    /// decimal, timestamps as Unix seconds, headers as JSON. Empty optional
    /// fields are omitted entirely.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>, EdgeCacheError> {
        let mut fields = vec![
            (field::KEY.to_string(), self.key.clone()),
            (field::URL.to_string(), self.url.clone()),
            (field::FILE_PATH.to_string(), self.file_path.clone()),
            (field::HOST_ID.to_string(), self.host_id.to_string()),
            (field::DIMENSION.to_string(), self.dimension.to_string()),
            (field::REQUEST_ID.to_string(), self.request_id.clone()),
            (field::CREATED_AT.to_string(), self.created_at.to_string()),
            (field::EXPIRES_AT.to_string(), self.expires_at.to_string()),
            (field::LAST_ACCESS.to_string(), self.last_access.to_string()),
            (field::SIZE.to_string(), self.size.to_string()),
            (field::DISK_SIZE.to_string(), self.disk_size.to_string()),
            (field::SOURCE.to_string(), self.source.to_string()),
            (field::STATUS_CODE.to_string(), self.status_code.to_string()),
        ];
        if let Some(headers) = &self.headers {
            if !headers.is_empty() {
                fields.push((field::HEADERS.to_string(), serde_json::to_string(headers)?));
            }
        }
        if let Some(ts) = self.last_bot_hit {
            fields.push((field::LAST_BOT_HIT.to_string(), ts.to_string()));
        }
        if !self.eg_ids.is_empty() {
            fields.push((field::EG_IDS.to_string(), join_eg_ids(&self.eg_ids)));
        }
        Ok(fields)
    }

    /// Rebuilds a record from a stored field map. Unrecognized fields are
    /// ignored; missing numeric fields default to 0; a malformed value
    /// surfaces as a `Parse` error naming the field.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, EdgeCacheError> {
        let url = required_string(fields, field::URL)?;
        let file_path = required_string(fields, field::FILE_PATH)?;

        let source = match fields.get(field::SOURCE) {
            None => ArtifactSource::Render,
            Some(raw) => raw
                .parse::<ArtifactSource>()
                .map_err(|_| parse_error(field::SOURCE, format!("unknown source '{raw}'")))?,
        };

        let status_code = parse_u64(fields, field::STATUS_CODE)?;
        let status_code = u16::try_from(status_code)
            .map_err(|_| parse_error(field::STATUS_CODE, "status code out of range"))?;

        let host_id = u32::try_from(parse_u64(fields, field::HOST_ID)?)
            .map_err(|_| parse_error(field::HOST_ID, "host id out of range"))?;
        let dimension = u32::try_from(parse_u64(fields, field::DIMENSION)?)
            .map_err(|_| parse_error(field::DIMENSION, "dimension id out of range"))?;

        let headers = match fields.get(field::HEADERS) {
            None => None,
            Some(raw) if raw.is_empty() => None,
            Some(raw) => Some(
                serde_json::from_str::<HashMap<String, Vec<String>>>(raw)
                    .map_err(|e| parse_error(field::HEADERS, e.to_string()))?,
            ),
        };

        let last_bot_hit = match fields.get(field::LAST_BOT_HIT) {
            None => None,
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| parse_error(field::LAST_BOT_HIT, "expected unix seconds"))?,
            ),
        };

        Ok(Self {
            key: fields.get(field::KEY).cloned().unwrap_or_default(),
            url,
            file_path,
            host_id,
            dimension,
            request_id: fields.get(field::REQUEST_ID).cloned().unwrap_or_default(),
            created_at: parse_u64(fields, field::CREATED_AT)?,
            expires_at: parse_u64(fields, field::EXPIRES_AT)?,
            last_access: parse_u64(fields, field::LAST_ACCESS)?,
            size: parse_u64(fields, field::SIZE)?,
            disk_size: parse_u64(fields, field::DISK_SIZE)?,
            source,
            status_code,
            headers,
            last_bot_hit,
            eg_ids: fields
                .get(field::EG_IDS)
                .map(|raw| split_eg_ids(raw))
                .unwrap_or_default(),
        })
    }

    /// Fresh iff `now < expires_at`.
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.expires_at
    }

    /// Stale iff the entry has expired but is still inside the stale window.
    pub fn is_stale(&self, now: u64, stale_ttl: Duration) -> bool {
        let stale_secs = stale_ttl.as_secs();
        stale_secs > 0 && now >= self.expires_at && now < self.expires_at + stale_secs
    }

    pub fn freshness(&self, now: u64, stale_ttl: Duration) -> Freshness {
        if self.is_fresh(now) {
            Freshness::Fresh
        } else if self.is_stale(now, stale_ttl) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// True when this node already holds the artifact locally.
    pub fn held_by(&self, node_id: &str) -> bool {
        self.eg_ids.iter().any(|id| id == node_id)
    }
}
