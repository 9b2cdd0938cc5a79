// src/core/types.rs

//! Shared identity and enumeration types used across the cache, cluster,
//! and scheduler layers.

use crate::core::EdgeCacheError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use strum_macros::{Display, EnumString};

/// Uniquely identifies one renderable artifact.
///
/// Rendered textually as `cache:<host_id>:<dimension_id>:<url_hash>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub host_id: u32,
    pub dimension_id: u32,
    pub url_hash: String,
}

impl CacheKey {
    pub fn new(host_id: u32, dimension_id: u32, url_hash: impl Into<String>) -> Self {
        Self {
            host_id,
            dimension_id,
            url_hash: url_hash.into(),
        }
    }

    /// The shared-store key holding this entry's metadata hash.
    pub fn meta_key(&self) -> String {
        format!("meta:{self}")
    }

    /// The shared-store key used for the single-flight render lock.
    pub fn lock_key(&self) -> String {
        format!("lock:{self}")
    }

    /// Parses the textual form `cache:<host_id>:<dimension_id>:<url_hash>`.
    pub fn parse(text: &str) -> Result<Self, EdgeCacheError> {
        let mut parts = text.splitn(4, ':');
        let tag = parts.next().unwrap_or_default();
        if tag != "cache" {
            return Err(EdgeCacheError::InvalidRequest(format!(
                "not a cache key: '{text}'"
            )));
        }
        let host_id = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|id| *id > 0)
            .ok_or_else(|| EdgeCacheError::InvalidRequest(format!("bad host id in '{text}'")))?;
        let dimension_id = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|id| *id > 0)
            .ok_or_else(|| {
                EdgeCacheError::InvalidRequest(format!("bad dimension id in '{text}'"))
            })?;
        let url_hash = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EdgeCacheError::InvalidRequest(format!("missing url hash in '{text}'")))?
            .to_string();
        Ok(Self {
            host_id,
            dimension_id,
            url_hash,
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache:{}:{}:{}",
            self.host_id, self.dimension_id, self.url_hash
        )
    }
}

/// How the cached artifact was produced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSource {
    #[default]
    Render,
    Bypass,
}

/// Freshness tiers of a cache entry, judged against `expires_at` and the
/// host's stale window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Priority tiers of the recache queues. Strict drain order: high before
/// normal before autorecache.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Autorecache,
}

impl Priority {
    /// All priorities in strict drain order.
    pub const ORDERED: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Autorecache];

    /// The shared-store sorted-set key for one host's queue at this priority.
    pub fn queue_key(&self, host_id: u32) -> String {
        format!("recache:{host_id}:{self}")
    }
}

/// A member of a recache sorted set: the renderable unit for one URL under
/// one dimension. The score (scheduled time) lives on the ZSET, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMember {
    pub url: String,
    pub dimension_id: u32,
}

/// In-process work descriptor produced by the scheduler from queue entries.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub host_id: u32,
    pub url: String,
    pub dimension_id: u32,
    pub priority: Priority,
    pub attempt: u32,
}

/// The action a matched URL rule prescribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Render,
    Bypass,
    Block,
    Status(u16),
}

/// Helper for the current wall-clock time as Unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
