// src/core/store/mod.rs

//! The shared key-value store behind all cross-node state: cache metadata,
//! the node registry, single-flight locks, and the recache queues.
//!
//! Components never talk to Redis directly; they go through [`SharedStore`],
//! which keeps the metadata and registry layers testable against the
//! in-memory implementation.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::core::EdgeCacheError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Operations the distributed layers need from the shared store.
///
/// The surface is deliberately narrow: plain strings, one hash per metadata
/// entry (so individual fields can be CAS-updated without rewriting the
/// record), and sorted sets for the durable recache backlog.
#[async_trait]
pub trait SharedStore: Send + Sync {
    // --- String keys ---

    async fn get(&self, key: &str) -> Result<Option<String>, EdgeCacheError>;

    /// Sets `key` with a TTL, replacing any existing value.
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EdgeCacheError>;

    /// Sets `key` with a TTL only if it does not exist. Returns whether the
    /// write happened. This is the single-flight lock primitive.
    async fn set_nx_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EdgeCacheError>;

    /// Deletes `key` only while it still holds `expected`. Used to release a
    /// lock without clobbering a successor's.
    async fn del_if_equal(&self, key: &str, expected: &str) -> Result<bool, EdgeCacheError>;

    /// Renews the TTL of `key`. Returns false when the key no longer exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EdgeCacheError>;

    /// Deletes `key`; absent keys are a successful no-op (returns false).
    async fn del(&self, key: &str) -> Result<bool, EdgeCacheError>;

    /// Lists keys matching a glob pattern. Backed by incremental SCAN on
    /// Redis; never by the blocking KEYS command.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, EdgeCacheError>;

    // --- Hashes ---

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, EdgeCacheError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EdgeCacheError>;

    /// Atomically replaces the full field set of a hash.
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), EdgeCacheError>;

    /// Compare-and-set of one hash field. The write happens only while the
    /// field still holds `expected` (`None` = field must be absent, which
    /// also covers a missing key). Returns whether the swap happened.
    async fn hset_field_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, EdgeCacheError>;

    /// Unconditionally writes one hash field of an existing hash. Returns
    /// false when the hash itself is absent.
    async fn hset_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, EdgeCacheError>;

    // --- Sorted sets ---

    /// Adds `member` with `score`; an existing member keeps its old score
    /// (NX semantics) so re-enqueueing never postpones an entry. Returns
    /// whether the member was newly added.
    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<bool, EdgeCacheError>;

    /// Pops the lowest-scored member whose score is `<= max_score`.
    /// Atomic on both implementations; ties break by member bytes.
    async fn zpop_min_until(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Option<(String, f64)>, EdgeCacheError>;

    async fn zcard(&self, key: &str) -> Result<u64, EdgeCacheError>;

    /// Reads members ordered by ascending score, with offset/count paging.
    async fn zrange(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, f64)>, EdgeCacheError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, EdgeCacheError>;
}
