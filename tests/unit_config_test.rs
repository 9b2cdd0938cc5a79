// tests/unit_config_test.rs

mod common;

use common::test_config;
use edgecache::config::{Config, ExpiredStrategy, HeadersConfig, TrackingParamsConfig};
use std::fs;
use std::time::Duration;

const ROOT_YAML: &str = r#"
server:
  listen: "0.0.0.0:8080"
  timeout: 45s
internal:
  listen: "0.0.0.0:8081"
  auth_key: "0123456789abcdef"
redis:
  addr: "127.0.0.1:6379"
  db: 2
storage:
  base_path: "/var/cache/edgecache"
  compression: snappy
  cleanup:
    interval: 1h
    safety_margin: 2d
render:
  service_url: "http://127.0.0.1:9222"
  timeout: 30s
  dimensions:
    - id: 1
      name: desktop
      render_ua: "HeadlessDesktop/1.0"
      match_ua: ["*"]
  cache:
    ttl: 1w
    expired:
      strategy: serve_stale
      stale_ttl: 2h
cache_sharding:
  enabled: true
  replication_factor: 3
  distribution_strategy: hash_modulo
node:
  id: eg1
hosts:
  include: "hosts/*.yaml"
"#;

const HOST_YAML: &str = r#"
hosts:
  - id: 1
    domain: ex.com
    domains: ["www.ex.com"]
    render_key: "host-render-key"
    url_rules:
      - match: ["/api/*"]
        action: bypass
      - match: ["/private/*"]
        action: status
        status: 404
"#;

fn write_config(root: &str, host: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("hosts")).unwrap();
    let root_path = dir.path().join("config.yaml");
    fs::write(&root_path, root).unwrap();
    fs::write(dir.path().join("hosts/site.yaml"), host).unwrap();
    (dir, root_path.to_string_lossy().into_owned())
}

#[test]
fn test_loads_root_and_host_files() {
    let (_dir, path) = write_config(ROOT_YAML, HOST_YAML);
    let config = Config::from_file(&path).unwrap();

    assert_eq!(config.server.timeout, Duration::from_secs(45));
    assert_eq!(config.redis.db, 2);
    assert_eq!(config.node.id, "eg1");
    assert!(config.cache_sharding.enabled);
    assert_eq!(config.cache_sharding.replication_factor, 3);

    // Durations accept d and w units.
    assert_eq!(
        config.storage.cleanup.safety_margin,
        Duration::from_secs(2 * 24 * 3600)
    );
    assert_eq!(
        config.render.cache.ttl,
        Duration::from_secs(7 * 24 * 3600)
    );
    assert_eq!(
        config.render.cache.expired.strategy,
        ExpiredStrategy::ServeStale
    );

    assert_eq!(config.hosts.len(), 1);
    let host = &config.hosts[0];
    assert_eq!(host.id, 1);
    assert_eq!(host.all_domains(), vec!["ex.com", "www.ex.com"]);
    assert_eq!(host.url_rules.len(), 2);
    assert_eq!(host.url_rules[1].status, Some(404));
}

#[test]
fn test_defaults_apply_when_sections_are_omitted() {
    let minimal_root = r#"
internal:
  auth_key: "0123456789abcdef"
storage:
  base_path: "/var/cache/edgecache"
render:
  dimensions:
    - id: 1
      name: desktop
      render_ua: "HeadlessDesktop/1.0"
      match_ua: ["*"]
node:
  id: eg1
hosts:
  include: "hosts/*.yaml"
"#;
    let (_dir, path) = write_config(minimal_root, HOST_YAML);
    let config = Config::from_file(&path).unwrap();

    assert_eq!(config.server.listen, "0.0.0.0:8080");
    assert_eq!(config.internal.listen, "0.0.0.0:8081");
    assert!(!config.cache_sharding.enabled);
    assert_eq!(config.cache_sharding.replication_factor, 2);
    assert!(config.cache_sharding.push_on_render);
    assert_eq!(config.recache.max_buffer, 1000);
    assert_eq!(config.recache.max_retries, 3);
    assert_eq!(config.registry.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(config.registry.record_ttl, Duration::from_secs(15));
}

#[test]
fn test_missing_host_files_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let root_path = dir.path().join("config.yaml");
    fs::write(&root_path, ROOT_YAML).unwrap();
    // No hosts directory at all.
    let err = Config::from_file(&root_path.to_string_lossy()).unwrap_err();
    assert!(err.to_string().contains("no hosts configured"));
}

fn valid_config() -> Config {
    let dir = tempfile::tempdir().unwrap();
    test_config(dir.path(), "eg1", "ex.com")
}

#[test]
fn test_public_and_internal_ports_must_differ() {
    let mut config = valid_config();
    config.internal.listen = config.server.listen.clone();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("distinct"));
}

#[test]
fn test_tracking_params_variants_are_mutually_exclusive() {
    let mut config = valid_config();
    config.tracking_params.params = Some(vec!["gclid".to_string()]);
    config.tracking_params.params_add = Some(vec!["custom".to_string()]);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("mutually exclusive"));
}

#[test]
fn test_header_allow_list_variants_are_mutually_exclusive() {
    let mut config = valid_config();
    config.headers.safe_request = Some(vec!["accept".to_string()]);
    config.headers.safe_request_add = Some(vec!["x-extra".to_string()]);
    assert!(config.validate().is_err());
}

#[test]
fn test_bothit_interval_bounds() {
    let mut config = valid_config();
    config.bothit_recache.enabled = true;
    config.bothit_recache.interval = Duration::from_secs(10 * 60);
    assert!(config.validate().is_err());

    config.bothit_recache.interval = Duration::from_secs(6 * 3600);
    assert!(config.validate().is_ok());

    config.bothit_recache.interval = Duration::from_secs(48 * 3600);
    assert!(config.validate().is_err());
}

#[test]
fn test_domains_are_bare_lowercase_hostnames() {
    for bad in ["EX.com", "https://ex.com", "ex.com/path", "ex.com:8080", "*.ex.com"] {
        let mut config = valid_config();
        config.hosts[0].domain = Some(bad.to_string());
        assert!(config.validate().is_err(), "domain '{bad}' should be rejected");
    }
}

#[test]
fn test_duplicate_host_ids_and_domains_are_rejected() {
    let mut config = valid_config();
    let mut second = config.hosts[0].clone();
    second.domain = Some("other.com".to_string());
    config.hosts.push(second);
    // Same id twice.
    assert!(config.validate().is_err());

    let mut config = valid_config();
    let mut second = config.hosts[0].clone();
    second.id = 2;
    // Same domain twice.
    config.hosts.push(second);
    assert!(config.validate().is_err());
}

#[test]
fn test_status_rules_require_a_code() {
    let mut config = valid_config();
    config.hosts[0].url_rules = vec![edgecache::config::UrlRuleConfig {
        matches: vec!["/x*".to_string()],
        action: edgecache::config::UrlRuleAction::Status,
        status: None,
        render: None,
        bypass: None,
    }];
    assert!(config.validate().is_err());
}

#[test]
fn test_heartbeat_must_be_shorter_than_record_ttl() {
    let mut config = valid_config();
    config.registry.heartbeat_interval = Duration::from_secs(30);
    config.registry.record_ttl = Duration::from_secs(10);
    assert!(config.validate().is_err());
}

#[test]
fn test_tracking_params_resolution() {
    let defaults = TrackingParamsConfig::default().resolve();
    assert!(defaults.contains(&"gclid".to_string()));

    let replaced = TrackingParamsConfig {
        params: Some(vec!["only_this".to_string()]),
        params_add: None,
    }
    .resolve();
    assert_eq!(replaced, vec!["only_this"]);

    let extended = TrackingParamsConfig {
        params: None,
        params_add: Some(vec!["extra".to_string()]),
    }
    .resolve();
    assert!(extended.contains(&"gclid".to_string()));
    assert!(extended.contains(&"extra".to_string()));
}

#[test]
fn test_header_allow_list_resolution() {
    let defaults = HeadersConfig::default();
    assert!(defaults.resolve_request().contains(&"accept".to_string()));
    assert!(defaults
        .resolve_response()
        .contains(&"content-type".to_string()));

    let extended = HeadersConfig {
        safe_request: None,
        safe_request_add: Some(vec!["x-custom".to_string()]),
        safe_response: Some(vec!["content-type".to_string()]),
        safe_response_add: None,
    };
    let request = extended.resolve_request();
    assert!(request.contains(&"accept".to_string()));
    assert!(request.contains(&"x-custom".to_string()));
    assert_eq!(extended.resolve_response(), vec!["content-type"]);
}
