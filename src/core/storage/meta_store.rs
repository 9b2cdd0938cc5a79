// src/core/storage/meta_store.rs

//! Shared-store persistence of cache metadata, plus the deterministic disk
//! layout and its traversal-safe resolution.

use crate::core::compress::Compression;
use crate::core::storage::metadata::{self, CacheMetadata};
use crate::core::store::SharedStore;
use crate::core::types::CacheKey;
use crate::core::EdgeCacheError;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Attempts before a CAS update of `eg_ids` gives up. Losing the membership
/// update is non-fatal; the entry just stays under-replicated.
const EG_IDS_CAS_ATTEMPTS: u32 = 3;
const EG_IDS_CAS_BACKOFF: Duration = Duration::from_millis(10);

pub struct MetadataStore {
    store: Arc<dyn SharedStore>,
    base_path: PathBuf,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn SharedStore>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Fetches the metadata for a key, or `None` when absent. Freshness
    /// judgement is the caller's.
    pub async fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheMetadata>, EdgeCacheError> {
        let fields = self.store.hgetall(&key.meta_key()).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        CacheMetadata::from_fields(&fields).map(Some)
    }

    /// Atomically replaces the full field set of an entry.
    pub async fn put_entry(
        &self,
        key: &CacheKey,
        meta: &CacheMetadata,
    ) -> Result<(), EdgeCacheError> {
        let fields = meta.to_fields()?;
        self.store.hset_all(&key.meta_key(), &fields).await
    }

    /// Deletes an entry; absence is success.
    pub async fn delete_entry(&self, key: &CacheKey) -> Result<(), EdgeCacheError> {
        self.store.del(&key.meta_key()).await?;
        Ok(())
    }

    /// Writes a single field of an existing entry, e.g. `last_access` or
    /// `last_bot_hit`. Silently a no-op when the entry has been deleted.
    pub async fn touch_field(
        &self,
        key: &CacheKey,
        field: &str,
        value: &str,
    ) -> Result<(), EdgeCacheError> {
        self.store.hset_field(&key.meta_key(), field, value).await?;
        Ok(())
    }

    /// Read-modify-write of the `eg_ids` field under a compare-and-swap
    /// guard. The mutator sees the current membership and returns the
    /// desired one; returning the same list short-circuits without a write.
    /// After the retry budget the conflict is surfaced to the caller, who
    /// normally logs and skips the membership update.
    pub async fn update_eg_ids<F>(&self, key: &CacheKey, mutate: F) -> Result<Vec<String>, EdgeCacheError>
    where
        F: Fn(Vec<String>) -> Vec<String>,
    {
        let meta_key = key.meta_key();
        for attempt in 0..EG_IDS_CAS_ATTEMPTS {
            let current_raw = self.store.hget(&meta_key, metadata::field::EG_IDS).await?;
            let current = current_raw
                .as_deref()
                .map(metadata::split_eg_ids)
                .unwrap_or_default();
            let desired = mutate(current.clone());
            if desired == current {
                return Ok(desired);
            }
            let desired_raw = metadata::join_eg_ids(&desired);
            let swapped = self
                .store
                .hset_field_if(
                    &meta_key,
                    metadata::field::EG_IDS,
                    current_raw.as_deref(),
                    &desired_raw,
                )
                .await?;
            if swapped {
                return Ok(desired);
            }
            debug!(
                "eg_ids CAS conflict on {} (attempt {}), retrying",
                key,
                attempt + 1
            );
            tokio::time::sleep(EG_IDS_CAS_BACKOFF).await;
        }
        Err(EdgeCacheError::Conflict(key.to_string()))
    }

    /// Lists all metadata keys for one host, as textual cache keys.
    pub async fn host_entry_keys(&self, host_id: u32) -> Result<Vec<CacheKey>, EdgeCacheError> {
        let pattern = format!("meta:cache:{host_id}:*");
        self.scan_cache_keys(&pattern).await
    }

    /// Lists every metadata key in the store, as textual cache keys.
    pub async fn all_entry_keys(&self) -> Result<Vec<CacheKey>, EdgeCacheError> {
        self.scan_cache_keys("meta:cache:*").await
    }

    async fn scan_cache_keys(&self, pattern: &str) -> Result<Vec<CacheKey>, EdgeCacheError> {
        let keys = self.store.scan_keys(pattern).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(text) = key.strip_prefix("meta:") {
                if let Ok(parsed) = CacheKey::parse(text) {
                    out.push(parsed);
                }
            }
        }
        out.sort_by(|a, b| {
            (a.host_id, a.dimension_id, &a.url_hash).cmp(&(b.host_id, b.dimension_id, &b.url_hash))
        });
        Ok(out)
    }

    /// Deterministic relative layout:
    /// `<host_id>/<yyyy>/<mm>/<dd>/<hh>/<mm>/<url_hash>_<dimension_id>.html[.<compression>]`,
    /// bucketed by the entry's expiry time.
    pub fn generate_file_path(
        &self,
        key: &CacheKey,
        expires_at: u64,
        compression: Compression,
    ) -> String {
        let when: DateTime<Utc> =
            DateTime::from_timestamp(expires_at as i64, 0).unwrap_or(DateTime::UNIX_EPOCH);
        format!(
            "{}/{:04}/{:02}/{:02}/{:02}/{:02}/{}_{}.html{}",
            key.host_id,
            when.year(),
            when.month(),
            when.day(),
            when.hour(),
            when.minute(),
            key.url_hash,
            key.dimension_id,
            compression.suffix()
        )
    }

    /// Joins a stored relative path with the base path, resolving `.` and
    /// `..` lexically. Resolutions that land outside the base directory are
    /// a hard `PathEscape` error; traversal segments that stay inside are
    /// permitted.
    pub fn absolute_file_path(&self, relative: &str) -> Result<PathBuf, EdgeCacheError> {
        let rel = Path::new(relative);
        let mut depth: usize = 0;
        let mut resolved = self.base_path.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(EdgeCacheError::PathEscape(relative.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(EdgeCacheError::PathEscape(relative.to_string()));
                }
            }
        }
        if depth == 0 {
            // Resolving to the base directory itself is never a valid
            // artifact location.
            return Err(EdgeCacheError::PathEscape(relative.to_string()));
        }
        Ok(resolved)
    }
}
