// tests/common/mod.rs

//! Shared fixtures for the integration tests: a programmatic configuration,
//! a mock renderer, and a fully wired node over the in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use edgecache::config::{
    BotHitRecacheConfig, BypassConfig, ClientIpConfig, Config, DimensionConfig, EventLoggingConfig,
    ExpiredConfig, ExpiredStrategy, HeadersConfig, HostConfig, InternalConfig, LogConfig,
    MetricsConfig, NodeConfig, RecacheConfig, RedisConfig, RegistryConfig, RenderCacheConfig,
    RenderConfig, ServerConfig, ShardingConfig, StorageConfig, TrackingParamsConfig, UrlRuleConfig,
};
use edgecache::core::cache_service::CacheService;
use edgecache::core::cluster::{PeerClient, Registry};
use edgecache::core::hosts::HostTable;
use edgecache::core::orchestrator::{Orchestrator, RenderJob, RenderedPage, Renderer};
use edgecache::core::state::AppState;
use edgecache::core::storage::MetadataStore;
use edgecache::core::store::{MemoryStore, SharedStore};
use edgecache::core::tasks::recache::RecacheQueue;
use edgecache::EdgeCacheError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TEST_AUTH_KEY: &str = "test-internal-auth-key";
pub const TEST_RENDER_KEY: &str = "render-key-1";

/// A renderer double that counts calls and can be told to fail or stall.
pub struct MockRenderer {
    pub calls: AtomicUsize,
    pub body: String,
    pub status: u16,
    pub delay: Duration,
    pub fail: bool,
}

impl MockRenderer {
    pub fn new(body: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            body: body.to_string(),
            status: 200,
            delay: Duration::ZERO,
            fail: false,
        })
    }

    pub fn slow(body: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            body: body.to_string(),
            status: 200,
            delay,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            body: String::new(),
            status: 200,
            delay: Duration::ZERO,
            fail: true,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render(&self, _job: &RenderJob) -> Result<RenderedPage, EdgeCacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(EdgeCacheError::Render("mock renderer failure".to_string()));
        }
        Ok(RenderedPage {
            status: self.status,
            body: Bytes::from(self.body.clone()),
            headers: HashMap::from([(
                "content-type".to_string(),
                vec!["text/html".to_string()],
            )]),
        })
    }
}

/// A programmatic configuration for one test node serving one host.
pub fn test_config(base_path: &Path, node_id: &str, domain: &str) -> Config {
    Config {
        server: ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            timeout: Duration::from_secs(30),
            tls: Default::default(),
        },
        internal: InternalConfig {
            listen: "127.0.0.1:0".to_string(),
            auth_key: TEST_AUTH_KEY.to_string(),
        },
        redis: RedisConfig::default(),
        storage: StorageConfig {
            base_path: base_path.to_path_buf(),
            compression: edgecache::core::compress::Compression::Snappy,
            min_compress_size: 64,
            cleanup: Default::default(),
        },
        render: RenderConfig {
            service_url: "http://127.0.0.1:9222".to_string(),
            timeout: Duration::from_secs(10),
            dimensions: vec![
                DimensionConfig {
                    id: 1,
                    name: "desktop".to_string(),
                    width: 1920,
                    height: 1080,
                    render_ua: "HeadlessDesktop/1.0".to_string(),
                    match_ua: vec!["*".to_string()],
                },
                DimensionConfig {
                    id: 2,
                    name: "mobile".to_string(),
                    width: 390,
                    height: 844,
                    render_ua: "HeadlessMobile/1.0".to_string(),
                    match_ua: vec!["*iphone*".to_string(), "*android*".to_string()],
                },
            ],
            events: Default::default(),
            cache: RenderCacheConfig {
                ttl: Duration::from_secs(3600),
                expired: ExpiredConfig {
                    strategy: ExpiredStrategy::ServeStale,
                    stale_ttl: Duration::from_secs(2 * 3600),
                },
            },
            blocked_resource_types: vec![],
            unmatched_dimension: "desktop".to_string(),
            max_concurrent: 4,
        },
        bypass: BypassConfig::default(),
        registry: RegistryConfig {
            selection_strategy: Default::default(),
            heartbeat_interval: Duration::from_secs(1),
            record_ttl: Duration::from_secs(3),
        },
        cache_sharding: ShardingConfig {
            enabled: false,
            replication_factor: 2,
            push_on_render: true,
            replicate_on_pull: false,
            distribution_strategy: Default::default(),
        },
        bothit_recache: BotHitRecacheConfig::default(),
        tracking_params: TrackingParamsConfig::default(),
        headers: HeadersConfig::default(),
        client_ip: ClientIpConfig::default(),
        log: LogConfig::default(),
        metrics: MetricsConfig::default(),
        event_logging: EventLoggingConfig::default(),
        node: NodeConfig {
            id: node_id.to_string(),
            advertise_addr: None,
        },
        recache: RecacheConfig {
            max_buffer: 16,
            workers: 2,
            max_retries: 3,
            poll_interval: Duration::from_millis(50),
        },
        hosts: vec![HostConfig {
            id: 1,
            domain: Some(domain.to_string()),
            domains: vec![],
            render_key: TEST_RENDER_KEY.to_string(),
            enabled: true,
            render: None,
            bypass: None,
            url_rules: vec![],
            headers: None,
            client_ip: None,
            tracking_params: None,
            bothit_recache: None,
        }],
    }
}

/// Adds URL rules to the single test host.
pub fn with_rules(mut config: Config, rules: Vec<UrlRuleConfig>) -> Config {
    config.hosts[0].url_rules = rules;
    config
}

/// A fully wired node over a shared in-memory store.
pub struct TestNode {
    pub state: Arc<AppState>,
    pub renderer: Arc<MockRenderer>,
}

pub async fn build_node(
    store: Arc<dyn SharedStore>,
    config: Config,
    renderer: Arc<MockRenderer>,
) -> TestNode {
    let config = Arc::new(config);
    let hosts = Arc::new(HostTable::build(&config).expect("host table"));
    let registry = Arc::new(Registry::new(
        Arc::clone(&store),
        config.node.id.clone(),
        config.advertise_addr(),
        config.cache_sharding.enabled,
        config.registry.heartbeat_interval,
        config.registry.record_ttl,
    ));
    let meta_store = MetadataStore::new(Arc::clone(&store), config.storage.base_path.clone());
    let cache = Arc::new(CacheService::new(
        meta_store,
        config.storage.compression,
        config.storage.min_compress_size,
        config.node.id.clone(),
    ));
    let peers = Arc::new(PeerClient::new(config.internal.auth_key.clone()).expect("peer client"));
    let recache = Arc::new(RecacheQueue::new(Arc::clone(&store)));
    let orchestrator = Arc::new(
        Orchestrator::new(
            config.node.id.clone(),
            Arc::clone(&hosts),
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&peers),
            renderer.clone() as Arc<dyn Renderer>,
            Arc::clone(&recache),
            config.cache_sharding.clone(),
            config.registry.selection_strategy,
        )
        .expect("orchestrator"),
    );
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        hosts,
        store,
        cache,
        registry,
        orchestrator,
        recache,
        events: None,
        started_at: Instant::now(),
    });
    TestNode { state, renderer }
}

/// Convenience constructor: fresh memory store, temp dir config.
pub async fn single_node(base_path: &Path, domain: &str) -> TestNode {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let renderer = MockRenderer::new("<html>rendered</html>");
    build_node(store, test_config(base_path, "n1", domain), renderer).await
}

/// A basic public request for the test host.
pub fn public_request(url: &str) -> edgecache::core::orchestrator::PublicRequest {
    edgecache::core::orchestrator::PublicRequest {
        raw_url: url.to_string(),
        user_agent: "Mozilla/5.0 (X11; Linux x86_64)".to_string(),
        headers: HashMap::new(),
        client_ip: "203.0.113.9".to_string(),
    }
}
