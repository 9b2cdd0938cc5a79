// tests/unit_registry_test.rs

use edgecache::core::cluster::{NodeRecord, Registry};
use edgecache::core::store::{MemoryStore, SharedStore};
use edgecache::EdgeCacheError;
use std::sync::Arc;
use std::time::Duration;

fn registry_on(store: &Arc<dyn SharedStore>, node_id: &str, sharding: bool) -> Registry {
    Registry::new(
        Arc::clone(store),
        node_id,
        format!("127.0.0.1:81{}", node_id.len()),
        sharding,
        Duration::from_secs(1),
        Duration::from_secs(3),
    )
}

/// Plants a peer record directly, the way another node would have written it.
async fn plant_peer(store: &Arc<dyn SharedStore>, eg_id: &str, sharding: bool, ttl: Duration) {
    let record = NodeRecord {
        eg_id: eg_id.to_string(),
        address: "10.0.0.9:8081".to_string(),
        sharding_enabled: sharding,
        started_at: 1_700_000_000,
        last_heartbeat: 1_700_000_000,
    };
    store
        .set_ttl(
            &format!("registry:eg:{eg_id}"),
            &serde_json::to_string(&record).unwrap(),
            ttl,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_register_and_list_members() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_on(&store, "eg1", true);
    registry.register().await.unwrap();
    plant_peer(&store, "eg2", true, Duration::from_secs(10)).await;

    let members = registry.members().await.unwrap();
    let ids: Vec<&str> = members.iter().map(|m| m.eg_id.as_str()).collect();
    assert_eq!(ids, vec!["eg1", "eg2"]);

    let peers = registry.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].eg_id, "eg2");
}

#[tokio::test]
async fn test_member_lookup() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_on(&store, "eg1", true);
    plant_peer(&store, "eg2", true, Duration::from_secs(10)).await;

    let record = registry.member("eg2").await.unwrap().unwrap();
    assert_eq!(record.address, "10.0.0.9:8081");
    assert!(registry.member("eg9").await.unwrap().is_none());
}

#[tokio::test]
async fn test_records_expire_without_heartbeat() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_on(&store, "eg1", true);
    plant_peer(&store, "eg2", true, Duration::from_millis(30)).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(registry.members().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deregister_removes_the_record() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_on(&store, "eg1", true);
    registry.register().await.unwrap();
    registry.deregister().await;
    assert!(registry.members().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_corrupt_records_are_skipped() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    store
        .set_ttl("registry:eg:broken", "{not json", Duration::from_secs(10))
        .await
        .unwrap();
    let registry = registry_on(&store, "eg1", true);
    registry.register().await.unwrap();

    let members = registry.members().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].eg_id, "eg1");
}

#[tokio::test]
async fn test_startup_guard_refuses_unsharded_node_in_sharded_cluster() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    plant_peer(&store, "eg1", true, Duration::from_secs(10)).await;
    plant_peer(&store, "eg2", true, Duration::from_secs(10)).await;

    let registry = registry_on(&store, "eg3", false);
    match registry.startup_guard().await.unwrap_err() {
        EdgeCacheError::FatalConfig(message) => {
            // The diagnostic lists the conflicting peers.
            assert!(message.contains("eg1"));
            assert!(message.contains("eg2"));
        }
        other => panic!("expected fatal config error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_startup_guard_allows_boot_after_peers_expire() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    plant_peer(&store, "eg1", true, Duration::from_millis(30)).await;

    let registry = registry_on(&store, "eg3", false);
    assert!(registry.startup_guard().await.is_err());

    tokio::time::sleep(Duration::from_millis(60)).await;
    registry.startup_guard().await.unwrap();
}

#[tokio::test]
async fn test_startup_guard_ignores_unsharded_peers() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    plant_peer(&store, "eg1", false, Duration::from_secs(10)).await;

    let registry = registry_on(&store, "eg3", false);
    registry.startup_guard().await.unwrap();

    // A sharding-enabled node never blocks on the guard.
    let sharded = registry_on(&store, "eg4", true);
    sharded.startup_guard().await.unwrap();
}
