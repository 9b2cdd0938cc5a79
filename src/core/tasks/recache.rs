// src/core/tasks/recache.rs

//! The recache queues and their background consumer.
//!
//! Durable backlog lives in per-host, per-priority sorted sets in the shared
//! store; the scheduler moves due entries into a bounded in-memory buffer
//! that a worker pool drains against the local orchestrator. When the buffer
//! is full the scheduler simply stops popping, so the ZSETs absorb any
//! backlog without memory growth.

use crate::config::RecacheConfig;
use crate::core::hosts::HostTable;
use crate::core::metrics;
use crate::core::orchestrator::Orchestrator;
use crate::core::store::SharedStore;
use crate::core::types::{unix_now, Priority, QueueMember, WorkItem};
use crate::core::EdgeCacheError;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Producer/consumer handle over the durable recache queues.
pub struct RecacheQueue {
    store: Arc<dyn SharedStore>,
}

impl RecacheQueue {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Enqueues the cross-product of `urls` and `dimension_ids` at `score`.
    /// Members already queued keep their earlier schedule. Returns the
    /// number of newly added entries.
    pub async fn enqueue(
        &self,
        host_id: u32,
        urls: &[String],
        dimension_ids: &[u32],
        priority: Priority,
        score: f64,
    ) -> Result<u64, EdgeCacheError> {
        let queue_key = priority.queue_key(host_id);
        let mut added = 0;
        for url in urls {
            for dimension_id in dimension_ids {
                let member = serde_json::to_string(&QueueMember {
                    url: url.clone(),
                    dimension_id: *dimension_id,
                })?;
                if self.store.zadd_nx(&queue_key, &member, score).await? {
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Pops the earliest due entry, or `None` when nothing is due yet.
    pub async fn pop_due(
        &self,
        host_id: u32,
        priority: Priority,
        now: u64,
    ) -> Result<Option<QueueMember>, EdgeCacheError> {
        let queue_key = priority.queue_key(host_id);
        let Some((member, _score)) = self.store.zpop_min_until(&queue_key, now as f64).await?
        else {
            return Ok(None);
        };
        match serde_json::from_str::<QueueMember>(&member) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                // A corrupt member would wedge the queue head forever if
                // left in place; it has already been popped, so log and
                // move on.
                warn!(
                    "Dropping corrupt recache member on {}: {}",
                    queue_key, e
                );
                Ok(None)
            }
        }
    }

    pub async fn len(&self, host_id: u32, priority: Priority) -> Result<u64, EdgeCacheError> {
        self.store.zcard(&priority.queue_key(host_id)).await
    }

    /// Pages through queued entries without consuming them.
    pub async fn peek(
        &self,
        host_id: u32,
        priority: Priority,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(QueueMember, f64)>, EdgeCacheError> {
        let raw = self
            .store
            .zrange(&priority.queue_key(host_id), offset, count)
            .await?;
        let mut out = Vec::with_capacity(raw.len());
        for (member, score) in raw {
            if let Ok(parsed) = serde_json::from_str::<QueueMember>(&member) {
                out.push((parsed, score));
            }
        }
        Ok(out)
    }
}

/// Background consumer of the recache queues.
pub struct RecacheScheduler {
    queue: Arc<RecacheQueue>,
    orchestrator: Arc<Orchestrator>,
    hosts: Arc<HostTable>,
    cfg: RecacheConfig,
}

impl RecacheScheduler {
    pub fn new(
        queue: Arc<RecacheQueue>,
        orchestrator: Arc<Orchestrator>,
        hosts: Arc<HostTable>,
        cfg: RecacheConfig,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            hosts,
            cfg,
        }
    }

    /// Runs the dispatcher and worker pool until shutdown.
    pub async fn run(self, shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Recache scheduler started ({} workers, buffer {}).",
            self.cfg.workers, self.cfg.max_buffer
        );
        let (tx, rx) = mpsc::channel::<WorkItem>(self.cfg.max_buffer);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.cfg.workers);
        for _ in 0..self.cfg.workers {
            workers.push(tokio::spawn(run_worker(
                Arc::clone(&rx),
                tx.clone(),
                Arc::clone(&self.orchestrator),
                self.cfg.max_retries,
                shutdown_rx.resubscribe(),
            )));
        }

        self.run_dispatcher(tx, shutdown_rx).await;
        for worker in workers {
            let _ = worker.await;
        }
        info!("Recache scheduler shut down.");
    }

    async fn run_dispatcher(
        &self,
        tx: mpsc::Sender<WorkItem>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(self.cfg.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.dispatch_due(&tx).await;
                    let fill = self.cfg.max_buffer.saturating_sub(tx.capacity());
                    metrics::RECACHE_BUFFER_FILL.set(fill as f64);
                }
                _ = shutdown_rx.recv() => {
                    info!("Recache dispatcher shutting down.");
                    return;
                }
            }
        }
    }

    /// One poll cycle: for every host, drain due entries in strict priority
    /// order while the buffer has room.
    async fn dispatch_due(&self, tx: &mpsc::Sender<WorkItem>) {
        let now = unix_now();
        for host_id in self.hosts.ids() {
            for priority in Priority::ORDERED {
                loop {
                    if tx.capacity() == 0 {
                        // Buffer full: the ZSETs stay the durable backlog.
                        return;
                    }
                    let popped = match self.queue.pop_due(host_id, priority, now).await {
                        Ok(popped) => popped,
                        Err(e) => {
                            warn!("Recache pop failed for host {}: {}", host_id, e);
                            break;
                        }
                    };
                    let Some(member) = popped else {
                        break;
                    };
                    let item = WorkItem {
                        host_id,
                        url: member.url,
                        dimension_id: member.dimension_id,
                        priority,
                        attempt: 0,
                    };
                    if let Err(send_err) = tx.try_send(item) {
                        // Raced to full between the capacity check and the
                        // send; put the entry back rather than lose it.
                        let item = send_err.into_inner();
                        let member = QueueMember {
                            url: item.url,
                            dimension_id: item.dimension_id,
                        };
                        if let Ok(raw) = serde_json::to_string(&member) {
                            let queue_key = priority.queue_key(host_id);
                            if let Err(e) =
                                self.queue.store.zadd_nx(&queue_key, &raw, now as f64).await
                            {
                                warn!("Failed to restore popped recache entry: {}", e);
                            }
                        }
                        return;
                    }
                    metrics::RECACHE_DISPATCHED_TOTAL.inc();
                }
            }
        }
    }
}

async fn run_worker(
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    tx: mpsc::Sender<WorkItem>,
    orchestrator: Arc<Orchestrator>,
    max_retries: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let item = {
            let mut guard = rx.lock().await;
            tokio::select! {
                item = guard.recv() => item,
                _ = shutdown_rx.recv() => return,
            }
        };
        let Some(mut item) = item else { return };

        match orchestrator
            .render_for_recache(item.host_id, &item.url, item.dimension_id)
            .await
        {
            Ok(()) => {
                debug!(
                    "Recached {} dim {} for host {} ({})",
                    item.url, item.dimension_id, item.host_id, item.priority
                );
            }
            Err(e) => {
                item.attempt += 1;
                if item.attempt < max_retries {
                    debug!(
                        "Recache attempt {} failed for {}: {}; requeueing",
                        item.attempt, item.url, e
                    );
                    // Requeue into the buffer; a full buffer sheds the item
                    // (it will come back on the next bot hit or schedule).
                    if tx.try_send(item).is_err() {
                        metrics::RECACHE_DROPPED_TOTAL.inc();
                    }
                } else {
                    warn!(
                        "Dropping recache of {} after {} attempts: {}",
                        item.url, item.attempt, e
                    );
                    metrics::RECACHE_DROPPED_TOTAL.inc();
                }
            }
        }
    }
}
