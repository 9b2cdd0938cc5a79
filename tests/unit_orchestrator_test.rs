// tests/unit_orchestrator_test.rs

mod common;

use axum::routing::get;
use axum::Router;
use common::*;
use edgecache::config::{BypassCacheOverride, BypassOverride, UrlRuleAction, UrlRuleConfig};
use edgecache::core::cache_service::ServeBody;
use edgecache::core::orchestrator::{CacheOutcome, ServeSource};
use edgecache::core::store::{MemoryStore, SharedStore};
use edgecache::core::types::{unix_now, CacheKey};
use edgecache::core::urlnorm;
use edgecache::EdgeCacheError;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn rule(matches: &[&str], action: UrlRuleAction, status: Option<u16>) -> UrlRuleConfig {
    UrlRuleConfig {
        matches: matches.iter().map(|s| s.to_string()).collect(),
        action,
        status,
        render: None,
        bypass: None,
    }
}

async fn body_bytes(body: ServeBody) -> Vec<u8> {
    match body {
        ServeBody::Memory(bytes) => bytes.to_vec(),
        ServeBody::File(path) => tokio::fs::read(&path).await.unwrap(),
    }
}

#[tokio::test]
async fn test_miss_renders_then_hits_cache() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();

    let first = node
        .state
        .orchestrator
        .handle(&host, &public_request("https://ex.com/page"))
        .await
        .unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.source, Some(ServeSource::Rendered));
    assert_eq!(first.cache, CacheOutcome::Miss);
    assert_eq!(node.renderer.call_count(), 1);
    assert_eq!(
        body_bytes(first.body).await,
        b"<html>rendered</html>".to_vec()
    );

    let second = node
        .state
        .orchestrator
        .handle(&host, &public_request("https://ex.com/page"))
        .await
        .unwrap();
    assert_eq!(second.source, Some(ServeSource::Cache));
    assert_eq!(second.cache, CacheOutcome::Hit);
    // No second render for a fresh entry.
    assert_eq!(node.renderer.call_count(), 1);
}

#[tokio::test]
async fn test_metadata_is_written_with_self_as_holder() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();

    node.state
        .orchestrator
        .handle(&host, &public_request("https://ex.com/page?b=2&a=1"))
        .await
        .unwrap();

    let keys = node
        .state
        .cache
        .metadata_store()
        .all_entry_keys()
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
    let meta = node.state.cache.lookup(&keys[0]).await.unwrap().unwrap();
    assert_eq!(meta.eg_ids, vec!["n1"]);
    assert_eq!(meta.host_id, 1);
    // The stored URL is the canonical one.
    assert_eq!(meta.url, "https://ex.com/page?a=1&b=2");
}

#[tokio::test]
async fn test_stale_serve_enqueues_exactly_one_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();
    let request = public_request("https://ex.com/page");

    node.state.orchestrator.handle(&host, &request).await.unwrap();
    assert_eq!(node.renderer.call_count(), 1);

    // Age the entry past its expiry but inside the stale window.
    let key = node
        .state
        .cache
        .metadata_store()
        .all_entry_keys()
        .await
        .unwrap()
        .remove(0);
    let meta_store = node.state.cache.metadata_store();
    let mut meta = meta_store.get_entry(&key).await.unwrap().unwrap();
    meta.expires_at = unix_now() - 30;
    meta_store.put_entry(&key, &meta).await.unwrap();

    let stale = node.state.orchestrator.handle(&host, &request).await.unwrap();
    assert_eq!(stale.cache, CacheOutcome::Stale);
    assert_eq!(stale.source, Some(ServeSource::Cache));
    // Serving stale never renders inline.
    assert_eq!(node.renderer.call_count(), 1);
    assert_eq!(node.state.store.zcard("recache:1:high").await.unwrap(), 1);

    // An immediate second stale request does not enqueue a duplicate.
    let again = node.state.orchestrator.handle(&host, &request).await.unwrap();
    assert_eq!(again.cache, CacheOutcome::Stale);
    assert_eq!(node.state.store.zcard("recache:1:high").await.unwrap(), 1);
}

#[tokio::test]
async fn test_block_and_status_rules() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let config = with_rules(
        test_config(dir.path(), "n1", "ex.com"),
        vec![
            rule(&["/admin*"], UrlRuleAction::Block, None),
            rule(&["/gone*"], UrlRuleAction::Status, Some(410)),
        ],
    );
    let renderer = MockRenderer::new("<html>x</html>");
    let node = build_node(store, config, renderer).await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();

    let blocked = node
        .state
        .orchestrator
        .handle(&host, &public_request("https://ex.com/admin/users"))
        .await
        .unwrap();
    assert_eq!(blocked.status, 403);
    assert_eq!(blocked.source, None);

    let gone = node
        .state
        .orchestrator
        .handle(&host, &public_request("https://ex.com/gone/forever"))
        .await
        .unwrap();
    assert_eq!(gone.status, 410);
    assert_eq!(node.renderer.call_count(), 0);
}

async fn spawn_origin() -> SocketAddr {
    let app = Router::new().fallback(get(|| async {
        (
            [("content-type", "application/json")],
            "{\"origin\":\"payload that is comfortably above the minimum body size\"}",
        )
    }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

#[tokio::test]
async fn test_bypass_proxies_and_caches_by_policy() {
    let origin = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let mut bypass_rule = rule(&["/api*"], UrlRuleAction::Bypass, None);
    bypass_rule.bypass = Some(BypassOverride {
        timeout: None,
        cache: Some(BypassCacheOverride {
            enabled: Some(true),
            status_codes: None,
            ttl: None,
            min_body_size: Some(1),
        }),
    });
    let config = with_rules(
        test_config(dir.path(), "n1", "127.0.0.1"),
        vec![bypass_rule],
    );
    let renderer = MockRenderer::new("<html>unused</html>");
    let node = build_node(store, config, renderer).await;
    let host = node.state.hosts.by_domain("127.0.0.1").unwrap();

    let url = format!("http://127.0.0.1:{}/api/data", origin.port());
    let first = node
        .state
        .orchestrator
        .handle(&host, &public_request(&url))
        .await
        .unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.source, Some(ServeSource::Bypass));
    assert_eq!(first.cache, CacheOutcome::Miss);
    assert_eq!(node.renderer.call_count(), 0);

    // The captured response now serves from cache.
    let second = node
        .state
        .orchestrator
        .handle(&host, &public_request(&url))
        .await
        .unwrap();
    assert_eq!(second.source, Some(ServeSource::BypassCache));
    assert_eq!(second.cache, CacheOutcome::Hit);
    let body = body_bytes(second.body).await;
    assert!(String::from_utf8(body).unwrap().contains("origin"));
}

#[tokio::test]
async fn test_single_flight_renders_once_under_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let renderer = MockRenderer::slow("<html>slow</html>", Duration::from_millis(300));
    let node = build_node(
        store,
        test_config(dir.path(), "n1", "ex.com"),
        renderer,
    )
    .await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();

    let requests = (0..6).map(|_| {
        let host = host.clone();
        let state = Arc::clone(&node.state);
        async move {
            state
                .orchestrator
                .handle(&host, &public_request("https://ex.com/hot"))
                .await
        }
    });
    let results = join_all(requests).await;

    for result in results {
        let response = result.unwrap();
        assert_eq!(response.status, 200);
    }
    // At most one renderer RPC despite six concurrent identical requests.
    assert_eq!(node.renderer.call_count(), 1);
}

#[tokio::test]
async fn test_render_failure_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let renderer = MockRenderer::failing();
    let node = build_node(
        Arc::clone(&store),
        test_config(dir.path(), "n1", "ex.com"),
        renderer,
    )
    .await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();

    let err = node
        .state
        .orchestrator
        .handle(&host, &public_request("https://ex.com/broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, EdgeCacheError::Render(_)));

    // The single-flight lock is not left held for its TTL.
    let key = CacheKey::new(1, 1, urlnorm::url_hash("https://ex.com/broken"));
    assert!(store.get(&key.lock_key()).await.unwrap().is_none());

    // A later request retries with a fresh budget.
    let _ = node
        .state
        .orchestrator
        .handle(&host, &public_request("https://ex.com/broken"))
        .await
        .unwrap_err();
    assert_eq!(node.renderer.call_count(), 2);
}

#[tokio::test]
async fn test_corrupt_artifact_triggers_rerender() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    // Body above the compression threshold so the artifact is snappy-coded
    // and corruption is detected at decode time.
    let big_body = format!("<html>{}</html>", "content ".repeat(40));
    let renderer = MockRenderer::new(&big_body);
    let node = build_node(store, test_config(dir.path(), "n1", "ex.com"), renderer).await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();
    let request = public_request("https://ex.com/page");

    node.state.orchestrator.handle(&host, &request).await.unwrap();
    let key = node
        .state
        .cache
        .metadata_store()
        .all_entry_keys()
        .await
        .unwrap()
        .remove(0);
    let meta = node.state.cache.lookup(&key).await.unwrap().unwrap();
    let path = node.state.cache.absolute_file_path(&meta.file_path).unwrap();
    tokio::fs::write(&path, vec![0u8; 16]).await.unwrap();

    // The request still succeeds: self-heal deletes the entry, then the
    // miss path re-renders.
    let response = node.state.orchestrator.handle(&host, &request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.source, Some(ServeSource::Rendered));
    assert_eq!(node.renderer.call_count(), 2);
}

#[tokio::test]
async fn test_unreachable_holder_falls_back_to_render() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();
    let request = public_request("https://ex.com/page");

    // Render once, then pretend only a vanished peer holds the artifact.
    node.state.orchestrator.handle(&host, &request).await.unwrap();
    let key = node
        .state
        .cache
        .metadata_store()
        .all_entry_keys()
        .await
        .unwrap()
        .remove(0);
    let meta_store = node.state.cache.metadata_store();
    let mut meta = meta_store.get_entry(&key).await.unwrap().unwrap();
    meta.eg_ids = vec!["ghost".to_string()];
    meta_store.put_entry(&key, &meta).await.unwrap();

    let response = node.state.orchestrator.handle(&host, &request).await.unwrap();
    assert_eq!(response.status, 200);
    // The ghost holder is unreachable, so the node re-rendered.
    assert_eq!(response.source, Some(ServeSource::Rendered));
    assert_eq!(node.renderer.call_count(), 2);
}

#[tokio::test]
async fn test_unmatched_dimension_blocks_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let mut config = test_config(dir.path(), "n1", "ex.com");
    // Only mobile UAs match any dimension; everything else is blocked.
    config.render.dimensions.remove(0);
    config.render.unmatched_dimension = "block".to_string();
    let renderer = MockRenderer::new("<html>x</html>");
    let node = build_node(store, config, renderer).await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();

    let desktop = node
        .state
        .orchestrator
        .handle(&host, &public_request("https://ex.com/page"))
        .await
        .unwrap();
    assert_eq!(desktop.status, 403);

    let mut mobile = public_request("https://ex.com/page");
    mobile.user_agent = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)".to_string();
    let matched = node.state.orchestrator.handle(&host, &mobile).await.unwrap();
    assert_eq!(matched.status, 200);
    assert_eq!(node.renderer.call_count(), 1);
}
