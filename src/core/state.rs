// src/core/state.rs

//! The process-wide state shared by the listeners and background tasks:
//! the configuration snapshot loaded at boot plus the component handles.
//! Live-reload is out of scope; a restart reloads.

use crate::config::Config;
use crate::core::cache_service::CacheService;
use crate::core::cluster::Registry;
use crate::core::events::EventLogger;
use crate::core::hosts::HostTable;
use crate::core::orchestrator::Orchestrator;
use crate::core::store::SharedStore;
use crate::core::tasks::recache::RecacheQueue;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub config: Arc<Config>,
    pub hosts: Arc<HostTable>,
    pub store: Arc<dyn SharedStore>,
    pub cache: Arc<CacheService>,
    pub registry: Arc<Registry>,
    pub orchestrator: Arc<Orchestrator>,
    pub recache: Arc<RecacheQueue>,
    pub events: Option<EventLogger>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }
}
