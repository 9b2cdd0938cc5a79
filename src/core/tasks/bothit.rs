// src/core/tasks/bothit.rs

//! Bot-driven recache: entries that bots keep hitting are proactively
//! re-rendered so crawlers never see a stale page. Serving marks
//! `last_bot_hit`; this task periodically enqueues autorecache entries for
//! bot-hit URLs that are no longer fresh or are about to expire. Scores are
//! bucketed to the configured interval so one URL is enqueued at most once
//! per bucket.

use crate::core::cache_service::CacheService;
use crate::core::hosts::HostTable;
use crate::core::tasks::recache::RecacheQueue;
use crate::core::types::{unix_now, Priority};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How often the trigger scans for bot-hit entries.
const BOTHIT_POLL_INTERVAL: Duration = Duration::from_secs(600);

pub struct BotHitTask {
    cache: Arc<CacheService>,
    hosts: Arc<HostTable>,
    queue: Arc<RecacheQueue>,
}

impl BotHitTask {
    pub fn new(
        cache: Arc<CacheService>,
        hosts: Arc<HostTable>,
        queue: Arc<RecacheQueue>,
    ) -> Self {
        Self {
            cache,
            hosts,
            queue,
        }
    }

    /// Whether any host has the trigger enabled; the task is not spawned
    /// otherwise.
    pub fn is_needed(&self) -> bool {
        self.hosts.hosts().any(|h| h.bothit.enabled)
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Bot-hit recache trigger started.");
        let mut interval = tokio::time::interval(BOTHIT_POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.scan().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Bot-hit recache trigger shutting down.");
                    return;
                }
            }
        }
    }

    async fn scan(&self) {
        let now = unix_now();
        for host in self.hosts.hosts() {
            if !host.bothit.enabled {
                continue;
            }
            let window = host.bothit.interval.as_secs();
            let keys = match self.cache.metadata_store().host_entry_keys(host.id).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("Bot-hit scan failed for host {}: {}", host.id, e);
                    continue;
                }
            };
            let mut enqueued = 0u64;
            for key in keys {
                let meta = match self.cache.lookup(&key).await {
                    Ok(Some(meta)) => meta,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("Bot-hit scan skipping {}: {}", key, e);
                        continue;
                    }
                };
                let Some(last_bot_hit) = meta.last_bot_hit else {
                    continue;
                };
                if now.saturating_sub(last_bot_hit) > window {
                    continue; // Bots have moved on.
                }
                // Only entries past (or nearing) expiry are worth the render.
                if meta.expires_at > now + BOTHIT_POLL_INTERVAL.as_secs() {
                    continue;
                }
                let bucket = if window > 0 { (now / window) * window } else { now };
                match self
                    .queue
                    .enqueue(
                        host.id,
                        &[meta.url.clone()],
                        &[meta.dimension],
                        Priority::Autorecache,
                        bucket as f64,
                    )
                    .await
                {
                    Ok(added) => enqueued += added,
                    Err(e) => warn!("Bot-hit enqueue failed for {}: {}", key, e),
                }
            }
            if enqueued > 0 {
                debug!(
                    "Bot-hit trigger enqueued {} autorecache entries for host {}",
                    enqueued, host.id
                );
            }
        }
    }
}
