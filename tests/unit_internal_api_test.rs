// tests/unit_internal_api_test.rs

mod common;

use bytes::Bytes;
use common::*;
use edgecache::core::cache_service::{CacheService, WriteRequest};
use edgecache::core::cluster::{NodeRecord, PeerClient};
use edgecache::core::compress::Compression;
use edgecache::core::orchestrator::{CacheOutcome, ServeSource};
use edgecache::core::storage::MetadataStore;
use edgecache::core::store::{MemoryStore, SharedStore};
use edgecache::core::types::{ArtifactSource, CacheKey};
use edgecache::core::urlnorm;
use edgecache::server::internal::internal_router;
use edgecache::EdgeCacheError;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn serve_internal(node: &TestNode) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = internal_router(Arc::clone(&node.state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

async fn get_json(addr: SocketAddr, path_and_query: &str, auth: Option<&str>) -> (u16, Value) {
    let client = reqwest::Client::new();
    let mut request = client.get(format!("http://{addr}{path_and_query}"));
    if let Some(key) = auth {
        request = request.header("X-Internal-Auth", key);
    }
    let response = request.send().await.unwrap();
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap();
    (status, body)
}

async fn post_json(addr: SocketAddr, path: &str, body: Value) -> (u16, Value) {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}{path}"))
        .header("X-Internal-Auth", TEST_AUTH_KEY)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap();
    (status, body)
}

#[tokio::test]
async fn test_internal_routes_require_the_shared_secret() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;
    let addr = serve_internal(&node).await;

    let (status, body) = get_json(addr, "/internal/cache/status", None).await;
    assert_eq!(status, 401);
    assert_eq!(body["success"], Value::Bool(false));

    let (status, _) = get_json(addr, "/internal/cache/status", Some("wrong-key")).await;
    assert_eq!(status, 401);

    let (status, body) = get_json(addr, "/internal/cache/status", Some(TEST_AUTH_KEY)).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], Value::Bool(true));
    assert_eq!(body["data"]["node_id"], Value::String("n1".to_string()));
}

#[tokio::test]
async fn test_recache_api_expands_the_cross_product() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;
    let addr = serve_internal(&node).await;

    let (status, body) = post_json(
        addr,
        "/internal/cache/recache",
        serde_json::json!({
            "host_id": 1,
            "urls": ["https://ex.com/u1", "https://ex.com/u2"],
            "dimension_ids": [1, 2],
            "priority": "high"
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["entries_enqueued"], Value::from(4));
    assert_eq!(node.state.store.zcard("recache:1:high").await.unwrap(), 4);

    let (status, body) = get_json(
        addr,
        "/internal/cache/queue/summary?host_id=1",
        Some(TEST_AUTH_KEY),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["high"], Value::from(4));
    assert_eq!(body["data"]["normal"], Value::from(0));

    let (status, body) = get_json(
        addr,
        "/internal/cache/queue?host_id=1&priority=high&limit=2",
        Some(TEST_AUTH_KEY),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["entries"].as_array().unwrap().len(), 2);
    assert!(body["data"]["next_cursor"].is_number());
}

#[tokio::test]
async fn test_recache_api_validates_input() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;
    let addr = serve_internal(&node).await;

    let (status, _) = post_json(
        addr,
        "/internal/cache/recache",
        serde_json::json!({"host_id": 99, "urls": ["https://ex.com/u1"], "dimension_ids": [1]}),
    )
    .await;
    assert_eq!(status, 404);

    let (status, _) = post_json(
        addr,
        "/internal/cache/recache",
        serde_json::json!({"host_id": 1, "urls": [], "dimension_ids": [1]}),
    )
    .await;
    assert_eq!(status, 400);

    let (status, _) = post_json(
        addr,
        "/internal/cache/recache",
        serde_json::json!({"host_id": 1, "urls": ["https://ex.com/u1"], "dimension_ids": [9]}),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_urls_summary_and_invalidate() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;
    let addr = serve_internal(&node).await;
    let host = node.state.hosts.by_domain("ex.com").unwrap();

    for path in ["/a", "/b", "/c"] {
        node.state
            .orchestrator
            .handle(&host, &public_request(&format!("https://ex.com{path}")))
            .await
            .unwrap();
    }

    let (status, body) = get_json(
        addr,
        "/internal/cache/urls?host_id=1&status=active",
        Some(TEST_AUTH_KEY),
    )
    .await;
    assert_eq!(status, 200);
    let entries = body["data"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["source"], Value::String("render".to_string()));

    let (_, body) = get_json(
        addr,
        "/internal/cache/urls?host_id=1&urlContains=%2Fb",
        Some(TEST_AUTH_KEY),
    )
    .await;
    assert_eq!(body["data"]["entries"].as_array().unwrap().len(), 1);

    let (_, body) = get_json(
        addr,
        "/internal/cache/summary?host_id=1",
        Some(TEST_AUTH_KEY),
    )
    .await;
    assert_eq!(body["data"]["total"], Value::from(3));
    assert_eq!(body["data"]["by_status"]["active"], Value::from(3));

    let (status, body) = post_json(
        addr,
        "/internal/cache/invalidate",
        serde_json::json!({
            "host_id": 1,
            "urls": ["https://ex.com/b"],
            "dimension_ids": [1]
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["entries_removed"], Value::from(1));

    let (_, body) = get_json(
        addr,
        "/internal/cache/summary?host_id=1",
        Some(TEST_AUTH_KEY),
    )
    .await;
    assert_eq!(body["data"]["total"], Value::from(2));
}

fn origin_service(store: Arc<dyn SharedStore>, dir: &tempfile::TempDir, node_id: &str) -> CacheService {
    let meta = MetadataStore::new(store, dir.path());
    CacheService::new(meta, Compression::None, 64, node_id)
}

#[tokio::test]
async fn test_shard_push_and_pull_round_trip() {
    let target_dir = tempfile::tempdir().unwrap();
    let node = single_node(target_dir.path(), "ex.com").await;
    let addr = serve_internal(&node).await;

    // A second node sharing the store renders the entry.
    let origin_dir = tempfile::tempdir().unwrap();
    let origin = origin_service(Arc::clone(&node.state.store), &origin_dir, "origin");
    let key = CacheKey::new(1, 1, "aaaa000000000000");
    origin
        .write_rendered(
            &key,
            WriteRequest {
                url: "https://ex.com/shared".to_string(),
                status_code: 200,
                headers: None,
                body: Bytes::from("<html>replicated</html>"),
                ttl: Duration::from_secs(3600),
                source: ArtifactSource::Render,
                eg_ids: vec!["origin".to_string()],
            },
        )
        .await
        .unwrap();
    let (meta, bytes) = origin.read_local(&key).await.unwrap();

    let peers = PeerClient::new(TEST_AUTH_KEY).unwrap();
    peers
        .push(&addr.to_string(), &key, &meta, bytes)
        .await
        .unwrap();

    // The target holds the bytes and joined the membership.
    let stored = node.state.cache.lookup(&key).await.unwrap().unwrap();
    assert_eq!(stored.eg_ids, vec!["origin", "n1"]);
    let (pulled_meta, pulled_bytes) = peers.pull(&addr.to_string(), &key).await.unwrap();
    assert_eq!(pulled_bytes, Bytes::from("<html>replicated</html>"));
    assert_eq!(pulled_meta.url, "https://ex.com/shared");
}

#[tokio::test]
async fn test_shard_push_rejects_over_replication_and_bad_auth() {
    let target_dir = tempfile::tempdir().unwrap();
    let node = single_node(target_dir.path(), "ex.com").await;
    let addr = serve_internal(&node).await;

    let origin_dir = tempfile::tempdir().unwrap();
    let origin = origin_service(Arc::clone(&node.state.store), &origin_dir, "origin");
    let key = CacheKey::new(1, 1, "bbbb000000000000");
    origin
        .write_rendered(
            &key,
            WriteRequest {
                url: "https://ex.com/full".to_string(),
                status_code: 200,
                headers: None,
                body: Bytes::from("<html>full</html>"),
                ttl: Duration::from_secs(3600),
                source: ArtifactSource::Render,
                eg_ids: vec!["origin".to_string(), "other".to_string()],
            },
        )
        .await
        .unwrap();
    let (meta, bytes) = origin.read_local(&key).await.unwrap();

    // Replication factor is 2 and two nodes already hold the entry.
    let peers = PeerClient::new(TEST_AUTH_KEY).unwrap();
    let err = peers
        .push(&addr.to_string(), &key, &meta, bytes.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EdgeCacheError::OverReplicated));

    let wrong_key = PeerClient::new("wrong").unwrap();
    let err = wrong_key
        .push(&addr.to_string(), &key, &meta, bytes)
        .await
        .unwrap_err();
    assert!(matches!(err, EdgeCacheError::Unauthorized));

    // Pulling a key nobody stored is a 404.
    let missing = CacheKey::new(1, 1, "cccc000000000000");
    let err = peers.pull(&addr.to_string(), &missing).await.unwrap_err();
    assert!(matches!(err, EdgeCacheError::NotFound));
}

#[tokio::test]
async fn test_non_holder_serves_by_pulling_from_a_peer() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

    // Node n2 renders and serves the internal shard routes.
    let dir2 = tempfile::tempdir().unwrap();
    let n2 = build_node(
        Arc::clone(&store),
        test_config(dir2.path(), "n2", "ex.com"),
        MockRenderer::new("<html>from n2</html>"),
    )
    .await;
    let addr2 = serve_internal(&n2).await;
    let host2 = n2.state.hosts.by_domain("ex.com").unwrap();
    n2.state
        .orchestrator
        .handle(&host2, &public_request("https://ex.com/page"))
        .await
        .unwrap();

    // n2 announces itself in the registry under its real address.
    let record = NodeRecord {
        eg_id: "n2".to_string(),
        address: addr2.to_string(),
        sharding_enabled: true,
        started_at: 0,
        last_heartbeat: 0,
    };
    store
        .set_ttl(
            "registry:eg:n2",
            &serde_json::to_string(&record).unwrap(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    // Node n1 shares the store but holds nothing locally.
    let dir1 = tempfile::tempdir().unwrap();
    let n1 = build_node(
        store,
        test_config(dir1.path(), "n1", "ex.com"),
        MockRenderer::new("<html>from n1</html>"),
    )
    .await;
    let host1 = n1.state.hosts.by_domain("ex.com").unwrap();

    let response = n1
        .state
        .orchestrator
        .handle(&host1, &public_request("https://ex.com/page"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.source, Some(ServeSource::Cache));
    assert_eq!(response.cache, CacheOutcome::Hit);
    // Served by pull, not by a local render.
    assert_eq!(n1.renderer.call_count(), 0);

    // With replicate_on_pull disabled, the membership is unchanged.
    let key = CacheKey::new(1, 1, urlnorm::url_hash("https://ex.com/page"));
    let meta = n1.state.cache.lookup(&key).await.unwrap().unwrap();
    assert_eq!(meta.eg_ids, vec!["n2"]);
}
