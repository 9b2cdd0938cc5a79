// src/server/mod.rs

//! Server startup: wires the shared store, cluster registry, orchestrator,
//! background tasks, and the three listeners together, then runs until
//! shutdown.

pub mod internal;
pub mod metrics_server;
pub mod public;

use crate::config::Config;
use crate::core::cache_service::CacheService;
use crate::core::cluster::{PeerClient, Registry};
use crate::core::events::EventLogger;
use crate::core::hosts::HostTable;
use crate::core::orchestrator::{HttpRenderer, Orchestrator};
use crate::core::state::AppState;
use crate::core::storage::MetadataStore;
use crate::core::store::{RedisStore, SharedStore};
use crate::core::tasks::bothit::BotHitTask;
use crate::core::tasks::cleanup::CleanupTask;
use crate::core::tasks::recache::{RecacheQueue, RecacheScheduler};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{error, info};

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let hosts = Arc::new(HostTable::build(&config).context("Failed to compile host table")?);

    // Shared store first: nothing works without it, so a dead Redis fails
    // boot immediately.
    let store: Arc<dyn SharedStore> = Arc::new(
        RedisStore::connect(
            &config.redis.addr,
            config.redis.password.as_deref(),
            config.redis.db,
        )
        .await
        .with_context(|| format!("Failed to connect to shared store at {}", config.redis.addr))?,
    );

    let registry = Arc::new(Registry::new(
        Arc::clone(&store),
        config.node.id.clone(),
        config.advertise_addr(),
        config.cache_sharding.enabled,
        config.registry.heartbeat_interval,
        config.registry.record_ttl,
    ));
    registry
        .startup_guard()
        .await
        .context("Cluster membership check refused startup")?;
    // Only sharding participants publish themselves: peers never pull from
    // (or push to) a node that does not hold cluster entries.
    if config.cache_sharding.enabled {
        registry.register().await.context("Registration failed")?;
    }

    let meta_store = MetadataStore::new(Arc::clone(&store), config.storage.base_path.clone());
    let cache = Arc::new(CacheService::new(
        meta_store,
        config.storage.compression,
        config.storage.min_compress_size,
        config.node.id.clone(),
    ));

    let peers = Arc::new(PeerClient::new(config.internal.auth_key.clone())?);
    let renderer = Arc::new(HttpRenderer::new(config.render.service_url.clone())?);
    let recache = Arc::new(RecacheQueue::new(Arc::clone(&store)));

    let orchestrator = Arc::new(Orchestrator::new(
        config.node.id.clone(),
        Arc::clone(&hosts),
        Arc::clone(&cache),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&peers),
        renderer,
        Arc::clone(&recache),
        config.cache_sharding.clone(),
        config.registry.selection_strategy,
    )?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let events = EventLogger::spawn(&config.event_logging.file, shutdown_tx.subscribe())
        .context("Failed to start event logger")?;

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        hosts: Arc::clone(&hosts),
        store,
        cache: Arc::clone(&cache),
        registry: Arc::clone(&registry),
        orchestrator: Arc::clone(&orchestrator),
        recache: Arc::clone(&recache),
        events,
        started_at: Instant::now(),
    });

    // Background tasks.
    if config.cache_sharding.enabled {
        tokio::spawn(Arc::clone(&registry).run_heartbeat(shutdown_tx.subscribe()));
    }

    let scheduler = RecacheScheduler::new(
        Arc::clone(&recache),
        Arc::clone(&orchestrator),
        Arc::clone(&hosts),
        config.recache.clone(),
    );
    tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let cleanup = CleanupTask::new(
        Arc::clone(&cache),
        Arc::clone(&hosts),
        config.storage.cleanup.clone(),
    );
    tokio::spawn(cleanup.run(shutdown_tx.subscribe()));

    let bothit = BotHitTask::new(Arc::clone(&cache), Arc::clone(&hosts), Arc::clone(&recache));
    if bothit.is_needed() {
        tokio::spawn(bothit.run(shutdown_tx.subscribe()));
    }

    if config.metrics.enabled {
        tokio::spawn(metrics_server::run_metrics_server(
            Arc::clone(&state),
            shutdown_tx.subscribe(),
        ));
    }

    // Listeners. The internal listener is a distinct port and the only
    // place `/internal/...` routes exist; the public router has none.
    let public = tokio::spawn(public::run_public_server(
        Arc::clone(&state),
        shutdown_tx.subscribe(),
    ));
    let internal = tokio::spawn(internal::run_internal_server(
        Arc::clone(&state),
        shutdown_tx.subscribe(),
    ));

    // Run until interrupted.
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    let _ = shutdown_tx.send(());

    let _ = public.await;
    let _ = internal.await;
    info!("Server shut down cleanly.");
    Ok(())
}
