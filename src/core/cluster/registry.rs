// src/core/cluster/registry.rs

//! The membership directory. Each node owns exactly one record under
//! `registry:eg:<id>`, written with a TTL and renewed by heartbeat; peers
//! list live records to discover each other. Membership is eventually
//! consistent on the order of the heartbeat interval, so consumers must
//! tolerate a record outliving its node.

use crate::core::store::SharedStore;
use crate::core::types::unix_now;
use crate::core::EdgeCacheError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

fn registry_key(node_id: &str) -> String {
    format!("registry:eg:{node_id}")
}

/// One node's registry record. Owned exclusively by its node; readers treat
/// it as a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub eg_id: String,
    /// Internal-listener address peers dial for push/pull.
    pub address: String,
    pub sharding_enabled: bool,
    pub started_at: u64,
    pub last_heartbeat: u64,
}

pub struct Registry {
    store: Arc<dyn SharedStore>,
    node_id: String,
    address: String,
    sharding_enabled: bool,
    started_at: u64,
    record_ttl: Duration,
    heartbeat_interval: Duration,
}

impl Registry {
    pub fn new(
        store: Arc<dyn SharedStore>,
        node_id: impl Into<String>,
        address: impl Into<String>,
        sharding_enabled: bool,
        heartbeat_interval: Duration,
        record_ttl: Duration,
    ) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            address: address.into(),
            sharding_enabled,
            started_at: unix_now(),
            record_ttl,
            heartbeat_interval,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn record(&self) -> NodeRecord {
        NodeRecord {
            eg_id: self.node_id.clone(),
            address: self.address.clone(),
            sharding_enabled: self.sharding_enabled,
            started_at: self.started_at,
            last_heartbeat: unix_now(),
        }
    }

    async fn write_record(&self) -> Result<(), EdgeCacheError> {
        let json = serde_json::to_string(&self.record())?;
        self.store
            .set_ttl(&registry_key(&self.node_id), &json, self.record_ttl)
            .await
    }

    /// Boot-time guard: a node with sharding disabled must not join a
    /// cluster that is actively sharding. Once the conflicting peers'
    /// records expire, the node may start.
    pub async fn startup_guard(&self) -> Result<(), EdgeCacheError> {
        if self.sharding_enabled {
            return Ok(());
        }
        let conflicting: Vec<String> = self
            .members()
            .await?
            .into_iter()
            .filter(|peer| peer.eg_id != self.node_id && peer.sharding_enabled)
            .map(|peer| peer.eg_id)
            .collect();
        if conflicting.is_empty() {
            return Ok(());
        }
        Err(EdgeCacheError::FatalConfig(format!(
            "cache_sharding is disabled on this node, but sharding-enabled peers are live: {}",
            conflicting.join(", ")
        )))
    }

    /// Writes the initial record. Blocks until the store confirms, so a
    /// node is never serving without being discoverable.
    pub async fn register(&self) -> Result<(), EdgeCacheError> {
        self.write_record().await?;
        info!(
            "Registered node '{}' at {} (record TTL {:?})",
            self.node_id, self.address, self.record_ttl
        );
        Ok(())
    }

    /// Best-effort removal on graceful shutdown.
    pub async fn deregister(&self) {
        if let Err(e) = self.store.del(&registry_key(&self.node_id)).await {
            warn!("Failed to deregister node '{}': {}", self.node_id, e);
        }
    }

    /// Lists all live registry records, including this node's own.
    pub async fn members(&self) -> Result<Vec<NodeRecord>, EdgeCacheError> {
        let keys = self.store.scan_keys("registry:eg:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue; // Expired between SCAN and GET.
            };
            match serde_json::from_str::<NodeRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping corrupt registry record at '{}': {}", key, e),
            }
        }
        records.sort_by(|a, b| a.eg_id.cmp(&b.eg_id));
        Ok(records)
    }

    /// Live peers other than this node.
    pub async fn peers(&self) -> Result<Vec<NodeRecord>, EdgeCacheError> {
        Ok(self
            .members()
            .await?
            .into_iter()
            .filter(|r| r.eg_id != self.node_id)
            .collect())
    }

    /// Looks up a single live member by id.
    pub async fn member(&self, node_id: &str) -> Result<Option<NodeRecord>, EdgeCacheError> {
        let Some(raw) = self.store.get(&registry_key(node_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<NodeRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Corrupt registry record for '{}': {}", node_id, e);
                Ok(None)
            }
        }
    }

    /// The heartbeat loop. Renews the record every interval until shutdown,
    /// then deregisters.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Registry heartbeat started (interval {:?}).",
            self.heartbeat_interval
        );
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.write_record().await {
                        warn!("Registry heartbeat failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Registry heartbeat shutting down.");
                    self.deregister().await;
                    return;
                }
            }
        }
    }
}
