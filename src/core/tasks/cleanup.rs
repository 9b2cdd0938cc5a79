// src/core/tasks/cleanup.rs

//! Background sweep deleting entries whose stale window plus the configured
//! safety margin has fully elapsed, together with their artifacts. Errors
//! on individual entries are logged and the sweep continues.

use crate::config::{CleanupConfig, ExpiredStrategy};
use crate::core::cache_service::CacheService;
use crate::core::hosts::HostTable;
use crate::core::types::unix_now;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct CleanupTask {
    cache: Arc<CacheService>,
    hosts: Arc<HostTable>,
    cfg: CleanupConfig,
}

impl CleanupTask {
    pub fn new(cache: Arc<CacheService>, hosts: Arc<HostTable>, cfg: CleanupConfig) -> Self {
        Self { cache, hosts, cfg }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Cleanup sweep started (interval {:?}).", self.cfg.interval);
        let mut interval = tokio::time::interval(self.cfg.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so boot stays quiet.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Cleanup sweep shutting down.");
                    return;
                }
            }
        }
    }

    async fn sweep(&self) {
        let keys = match self.cache.metadata_store().all_entry_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cleanup sweep failed to list entries: {}", e);
                return;
            }
        };
        let now = unix_now();
        let mut removed = 0usize;
        for key in keys {
            let meta = match self.cache.lookup(&key).await {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Cleanup skipping {}: {}", key, e);
                    continue;
                }
            };
            let stale_window = self
                .hosts
                .by_id(meta.host_id)
                .map(|host| match host.cache.expired_strategy {
                    ExpiredStrategy::ServeStale => host.cache.stale_ttl,
                    ExpiredStrategy::Delete => Duration::ZERO,
                })
                .unwrap_or(Duration::ZERO);
            let deadline =
                meta.expires_at + stale_window.as_secs() + self.cfg.safety_margin.as_secs();
            if now <= deadline {
                continue;
            }
            match self.cache.delete_entry(&key, &meta).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Cleanup failed to delete {}: {}", key, e),
            }
        }
        if removed > 0 {
            info!("Cleanup sweep removed {} expired entries.", removed);
        }
    }
}
