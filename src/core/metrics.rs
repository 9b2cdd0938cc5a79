// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram, TextEncoder,
};

lazy_static! {
    // --- Request counters ---
    /// Public render requests, labeled by the serving source.
    pub static ref REQUESTS_TOTAL: CounterVec =
        register_counter_vec!("edgecache_requests_total", "Public requests served, labeled by source.", &["source"]).unwrap();
    /// Cache lookups that found a fresh entry.
    pub static ref CACHE_HITS_TOTAL: Counter =
        register_counter!("edgecache_cache_hits_total", "Total number of fresh cache hits.").unwrap();
    /// Cache lookups that found nothing serveable.
    pub static ref CACHE_MISSES_TOTAL: Counter =
        register_counter!("edgecache_cache_misses_total", "Total number of cache misses.").unwrap();
    /// Expired entries served inside the stale window.
    pub static ref CACHE_STALE_HITS_TOTAL: Counter =
        register_counter!("edgecache_cache_stale_hits_total", "Total number of stale cache hits.").unwrap();
    /// Entries deleted after a corrupt artifact was detected.
    pub static ref CACHE_SELF_HEALS_TOTAL: Counter =
        register_counter!("edgecache_cache_self_heals_total", "Entries deleted after artifact corruption.").unwrap();

    // --- Render & peer counters ---
    /// Renderer RPCs issued, labeled by outcome.
    pub static ref RENDERS_TOTAL: CounterVec =
        register_counter_vec!("edgecache_renders_total", "Renderer calls, labeled by outcome.", &["outcome"]).unwrap();
    /// Artifact pushes to peers, labeled by outcome.
    pub static ref SHARD_PUSHES_TOTAL: CounterVec =
        register_counter_vec!("edgecache_shard_pushes_total", "Peer pushes, labeled by outcome.", &["outcome"]).unwrap();
    /// Artifact pulls from peers, labeled by outcome.
    pub static ref SHARD_PULLS_TOTAL: CounterVec =
        register_counter_vec!("edgecache_shard_pulls_total", "Peer pulls, labeled by outcome.", &["outcome"]).unwrap();

    // --- Scheduler ---
    /// Recache work items dispatched to workers.
    pub static ref RECACHE_DISPATCHED_TOTAL: Counter =
        register_counter!("edgecache_recache_dispatched_total", "Recache work items dispatched.").unwrap();
    /// Recache work items dropped after exhausting retries.
    pub static ref RECACHE_DROPPED_TOTAL: Counter =
        register_counter!("edgecache_recache_dropped_total", "Recache work items dropped after max retries.").unwrap();
    /// Current fill of the in-memory recache buffer.
    pub static ref RECACHE_BUFFER_FILL: Gauge =
        register_gauge!("edgecache_recache_buffer_fill", "Work items currently buffered in memory.").unwrap();

    // --- Cluster ---
    /// Live peers visible in the registry (including self).
    pub static ref CLUSTER_SIZE: Gauge =
        register_gauge!("edgecache_cluster_size", "Live nodes visible in the registry.").unwrap();

    // --- Histograms ---
    /// End-to-end renderer latency in seconds.
    pub static ref RENDER_DURATION_SECONDS: Histogram =
        register_histogram!("edgecache_render_duration_seconds", "Renderer RPC latency in seconds.",
            vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]).unwrap();
    /// Public request latency in seconds.
    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        register_histogram!("edgecache_request_duration_seconds", "Public request latency in seconds.",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let metric_families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
