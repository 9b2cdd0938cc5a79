// src/core/cache_service.rs

//! Thin façade over compression, the file store, and the metadata store:
//! everything a caller needs to fetch an entry for serving, accept a peer
//! push or pull, and self-heal on corruption.

use crate::core::compress::{self, Compression};
use crate::core::storage::{fs_cache, CacheMetadata, MetadataStore};
use crate::core::types::{unix_now, ArtifactSource, CacheKey};
use crate::core::EdgeCacheError;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the serving layer hands to the HTTP response writer: a path for
/// uncompressed artifacts (streamed straight off disk) or decoded bytes for
/// compressed ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeBody {
    File(PathBuf),
    Memory(Bytes),
}

/// Everything needed to persist one freshly produced artifact.
pub struct WriteRequest {
    pub url: String,
    pub status_code: u16,
    pub headers: Option<HashMap<String, Vec<String>>>,
    pub body: Bytes,
    pub ttl: Duration,
    pub source: ArtifactSource,
    pub eg_ids: Vec<String>,
}

pub struct CacheService {
    meta: MetadataStore,
    compression: Compression,
    min_compress_size: usize,
    node_id: String,
}

impl CacheService {
    pub fn new(
        meta: MetadataStore,
        compression: Compression,
        min_compress_size: usize,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            meta,
            compression,
            min_compress_size,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.meta
    }

    /// Returns the entry whether fresh, stale, or expired; freshness
    /// judgement is the caller's.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheMetadata>, EdgeCacheError> {
        self.meta.get_entry(key).await
    }

    /// Prepares an entry for serving. Uncompressed artifacts come back as a
    /// file path for zero-copy streaming; compressed ones are read and
    /// decoded into memory. A corrupt artifact deletes the entry
    /// (self-heal) and surfaces the `Decompression` error so the caller
    /// re-renders.
    pub async fn prepare_for_serving(
        &self,
        key: &CacheKey,
        meta: &CacheMetadata,
    ) -> Result<ServeBody, EdgeCacheError> {
        let path = self.meta.absolute_file_path(&meta.file_path)?;
        let compression = Compression::from_path(&path)?;
        if compression == Compression::None {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(EdgeCacheError::NotFound);
            }
            return Ok(ServeBody::File(path));
        }
        let stored = fs_cache::read(&path).await?;
        match compression.decompress(&stored) {
            Ok(decoded) => Ok(ServeBody::Memory(Bytes::from(decoded))),
            Err(e @ EdgeCacheError::Decompression(_)) => {
                warn!("Corrupt artifact for {}; self-healing: {}", key, e);
                self.remove_entry_files(key, meta).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Persists a freshly rendered (or bypass-captured) artifact locally and
    /// writes its metadata. Returns the stored record.
    pub async fn write_rendered(
        &self,
        key: &CacheKey,
        req: WriteRequest,
    ) -> Result<CacheMetadata, EdgeCacheError> {
        let now = unix_now();
        let expires_at = now + req.ttl.as_secs();
        let (stored_bytes, applied) =
            compress::encode_for_storage(self.compression, &req.body, self.min_compress_size)?;
        let relative = self.meta.generate_file_path(key, expires_at, applied);
        let absolute = self.meta.absolute_file_path(&relative)?;
        fs_cache::write_atomic(&absolute, &stored_bytes).await?;

        let meta = CacheMetadata {
            key: key.to_string(),
            url: req.url,
            file_path: relative,
            host_id: key.host_id,
            dimension: key.dimension_id,
            request_id: Uuid::new_v4().to_string(),
            created_at: now,
            expires_at,
            last_access: now,
            size: req.body.len() as u64,
            disk_size: stored_bytes.len() as u64,
            source: req.source,
            status_code: req.status_code,
            headers: req.headers,
            last_bot_hit: None,
            eg_ids: req.eg_ids,
        };
        self.meta.put_entry(key, &meta).await?;
        debug!(
            "Cached {} ({} bytes, {} on disk)",
            key, meta.size, meta.disk_size
        );
        Ok(meta)
    }

    /// Accepts a peer push: writes the origin's bytes as-is under this
    /// node's base path and adds this node to `eg_ids`. Refuses with
    /// `over_replicated` when storing here would exceed the replication
    /// factor.
    pub async fn accept_push(
        &self,
        key: &CacheKey,
        pushed: &CacheMetadata,
        bytes: Bytes,
        replication: usize,
    ) -> Result<(), EdgeCacheError> {
        let current = self.meta.get_entry(key).await?;
        let meta = current.as_ref().unwrap_or(pushed);
        if !meta.held_by(&self.node_id) && meta.eg_ids.len() >= replication.max(1) {
            return Err(EdgeCacheError::OverReplicated);
        }

        let absolute = self.meta.absolute_file_path(&meta.file_path)?;
        fs_cache::write_atomic(&absolute, &bytes).await?;

        if current.is_none() {
            // The shared store has no record yet (e.g. the origin's write
            // is still in flight); seed it from the pushed copy.
            self.meta.put_entry(key, pushed).await?;
        }
        self.join_holders(key, replication).await;
        Ok(())
    }

    /// Persists bytes received from a peer pull and atomically adds this
    /// node to `eg_ids` while there is room under the replication factor.
    pub async fn write_pulled(
        &self,
        key: &CacheKey,
        meta: &CacheMetadata,
        bytes: Bytes,
        replication: usize,
    ) -> Result<(), EdgeCacheError> {
        let absolute = self.meta.absolute_file_path(&meta.file_path)?;
        fs_cache::write_atomic(&absolute, &bytes).await?;
        self.join_holders(key, replication).await;
        Ok(())
    }

    /// CAS-adds this node to the entry's membership, capped at the
    /// replication factor. A lost race leaves the membership unchanged.
    async fn join_holders(&self, key: &CacheKey, replication: usize) {
        let node_id = self.node_id.clone();
        let cap = replication.max(1);
        let result = self
            .meta
            .update_eg_ids(key, |mut ids| {
                if ids.iter().any(|id| *id == node_id) || ids.len() >= cap {
                    return ids;
                }
                ids.push(node_id.clone());
                ids
            })
            .await;
        if let Err(e) = result {
            warn!("Skipping eg_ids update for {}: {}", key, e);
        }
    }

    /// Reads the locally stored bytes for a pull response, exactly as they
    /// sit on disk.
    pub async fn read_local(
        &self,
        key: &CacheKey,
    ) -> Result<(CacheMetadata, Bytes), EdgeCacheError> {
        let meta = self
            .meta
            .get_entry(key)
            .await?
            .ok_or(EdgeCacheError::NotFound)?;
        let path = self.meta.absolute_file_path(&meta.file_path)?;
        let bytes = fs_cache::read(&path).await?;
        Ok((meta, Bytes::from(bytes)))
    }

    /// Marks the entry as read. Best-effort; the entry may be gone.
    pub async fn touch_last_access(&self, key: &CacheKey) {
        let now = unix_now().to_string();
        if let Err(e) = self
            .meta
            .touch_field(key, crate::core::storage::metadata::field::LAST_ACCESS, &now)
            .await
        {
            debug!("last_access update failed for {}: {}", key, e);
        }
    }

    /// Marks a bot hit on the entry. Best-effort.
    pub async fn touch_bot_hit(&self, key: &CacheKey) {
        let now = unix_now().to_string();
        if let Err(e) = self
            .meta
            .touch_field(
                key,
                crate::core::storage::metadata::field::LAST_BOT_HIT,
                &now,
            )
            .await
        {
            debug!("last_bot_hit update failed for {}: {}", key, e);
        }
    }

    /// Deletes an entry and its artifact. A path that escapes the base
    /// directory aborts the whole operation without deleting anything.
    pub async fn delete_entry(
        &self,
        key: &CacheKey,
        meta: &CacheMetadata,
    ) -> Result<(), EdgeCacheError> {
        let path = self.meta.absolute_file_path(&meta.file_path)?;
        fs_cache::delete(&path).await?;
        self.meta.delete_entry(key).await?;
        info!("Deleted cache entry {}", key);
        Ok(())
    }

    /// Self-heal helper: removes metadata first so concurrent lookups go to
    /// MISS immediately, then the artifact.
    async fn remove_entry_files(&self, key: &CacheKey, meta: &CacheMetadata) {
        if let Err(e) = self.meta.delete_entry(key).await {
            warn!("Self-heal failed to delete metadata for {}: {}", key, e);
        }
        if let Ok(path) = self.meta.absolute_file_path(&meta.file_path) {
            if let Err(e) = fs_cache::delete(&path).await {
                warn!("Self-heal failed to delete artifact for {}: {}", key, e);
            }
        }
    }

    /// Resolves a stored relative path. Exposed for the admin views.
    pub fn absolute_file_path(&self, relative: &str) -> Result<PathBuf, EdgeCacheError> {
        self.meta.absolute_file_path(relative)
    }

    pub fn base_path(&self) -> &Path {
        self.meta.base_path()
    }
}
