// src/config.rs

//! Manages server configuration: loading the root YAML file, expanding the
//! per-host include glob, resolving defaults, and validation.

use crate::core::cluster::DistributionStrategy;
use crate::core::compress::Compression;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Public ingress settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_public_listen")]
    pub listen: String,
    /// Overall deadline for one public request.
    #[serde(default = "default_server_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_public_listen(),
            timeout: default_server_timeout(),
            tls: TlsConfig::default(),
        }
    }
}

fn default_public_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_server_timeout() -> Duration {
    Duration::from_secs(60)
}

/// TLS material for the public listener. Termination itself is delegated to
/// the fronting proxy; the section is parsed and validated so a config can
/// travel between deployments unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

/// Internal ingress: peer transport and the admin API.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InternalConfig {
    #[serde(default = "default_internal_listen")]
    pub listen: String,
    pub auth_key: String,
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            listen: default_internal_listen(),
            auth_key: String::new(),
        }
    }
}

fn default_internal_listen() -> String {
    "0.0.0.0:8081".to_string()
}

/// Shared-store endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_addr")]
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            password: None,
            db: 0,
        }
    }
}

fn default_redis_addr() -> String {
    "127.0.0.1:6379".to_string()
}

/// Artifact store settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    /// Absolute base directory for artifacts.
    pub base_path: PathBuf,
    #[serde(default)]
    pub compression: Compression,
    /// Payloads below this size are stored uncompressed.
    #[serde(default = "default_min_compress_size")]
    pub min_compress_size: usize,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

fn default_min_compress_size() -> usize {
    1024
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Extra grace beyond the stale window before a sweep deletes an entry.
    #[serde(default = "default_cleanup_safety_margin", with = "humantime_serde")]
    pub safety_margin: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: default_cleanup_interval(),
            safety_margin: default_cleanup_safety_margin(),
        }
    }
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(3600)
}
fn default_cleanup_safety_margin() -> Duration {
    Duration::from_secs(3600)
}

/// A named viewport/UA variant. Dimensions partition the cache for a host.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DimensionConfig {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_dimension_width")]
    pub width: u32,
    #[serde(default = "default_dimension_height")]
    pub height: u32,
    /// User agent the renderer browses with.
    pub render_ua: String,
    /// Glob patterns matched (case-insensitively) against the caller's UA.
    #[serde(default)]
    pub match_ua: Vec<String>,
}

fn default_dimension_width() -> u32 {
    1920
}
fn default_dimension_height() -> u32 {
    1080
}

/// What to do with an entry found past its `expires_at`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredStrategy {
    #[default]
    ServeStale,
    Delete,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExpiredConfig {
    #[serde(default)]
    pub strategy: ExpiredStrategy,
    #[serde(default = "default_stale_ttl", with = "humantime_serde")]
    pub stale_ttl: Duration,
}

impl Default for ExpiredConfig {
    fn default() -> Self {
        Self {
            strategy: ExpiredStrategy::default(),
            stale_ttl: default_stale_ttl(),
        }
    }
}

fn default_stale_ttl() -> Duration {
    Duration::from_secs(2 * 3600)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RenderCacheConfig {
    #[serde(default = "default_render_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default)]
    pub expired: ExpiredConfig,
}

impl Default for RenderCacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_render_ttl(),
            expired: ExpiredConfig::default(),
        }
    }
}

fn default_render_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

/// Page-settling knobs forwarded to the renderer.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RenderEventsConfig {
    /// DOM event or selector the renderer waits for before capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub additional_wait: Option<Duration>,
}

/// Render defaults, overridable per host and per URL rule.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RenderConfig {
    /// Endpoint of the headless render service.
    #[serde(default = "default_render_service_url")]
    pub service_url: String,
    #[serde(default = "default_render_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    #[serde(default)]
    pub events: RenderEventsConfig,
    #[serde(default)]
    pub cache: RenderCacheConfig,
    /// Resource types the renderer should refuse to load (images, fonts, ...).
    #[serde(default)]
    pub blocked_resource_types: Vec<String>,
    /// `block`, `bypass`, or the name of a dimension.
    #[serde(default = "default_unmatched_dimension")]
    pub unmatched_dimension: String,
    /// Per-host cap on concurrent renders.
    #[serde(default = "default_max_concurrent_renders")]
    pub max_concurrent: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            service_url: default_render_service_url(),
            timeout: default_render_timeout(),
            dimensions: Vec::new(),
            events: RenderEventsConfig::default(),
            cache: RenderCacheConfig::default(),
            blocked_resource_types: Vec::new(),
            unmatched_dimension: default_unmatched_dimension(),
            max_concurrent: default_max_concurrent_renders(),
        }
    }
}

fn default_render_service_url() -> String {
    "http://127.0.0.1:9222".to_string()
}
fn default_render_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_unmatched_dimension() -> String {
    "bypass".to_string()
}
fn default_max_concurrent_renders() -> usize {
    4
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BypassCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bypass_status_codes")]
    pub status_codes: Vec<u16>,
    #[serde(default = "default_bypass_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    /// Responses smaller than this are never cached.
    #[serde(default = "default_bypass_min_body_size")]
    pub min_body_size: usize,
}

impl Default for BypassCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            status_codes: default_bypass_status_codes(),
            ttl: default_bypass_cache_ttl(),
            min_body_size: default_bypass_min_body_size(),
        }
    }
}

fn default_bypass_status_codes() -> Vec<u16> {
    vec![200]
}
fn default_bypass_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}
fn default_bypass_min_body_size() -> usize {
    256
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BypassConfig {
    #[serde(default = "default_bypass_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub cache: BypassCacheConfig,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            timeout: default_bypass_timeout(),
            cache: BypassCacheConfig::default(),
        }
    }
}

fn default_bypass_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Which holder a pulling node tries first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Random,
    First,
}

/// Membership directory knobs. The record TTL must exceed the heartbeat
/// interval or peers flap in and out of the directory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegistryConfig {
    #[serde(default)]
    pub selection_strategy: SelectionStrategy,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_record_ttl", with = "humantime_serde")]
    pub record_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            selection_strategy: SelectionStrategy::default(),
            heartbeat_interval: default_heartbeat_interval(),
            record_ttl: default_record_ttl(),
        }
    }
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_record_ttl() -> Duration {
    Duration::from_secs(15)
}

/// Sharding behavior.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShardingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_true")]
    pub push_on_render: bool,
    #[serde(default)]
    pub replicate_on_pull: bool,
    #[serde(default)]
    pub distribution_strategy: DistributionStrategy,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            replication_factor: default_replication_factor(),
            push_on_render: true,
            replicate_on_pull: false,
            distribution_strategy: DistributionStrategy::default(),
        }
    }
}

fn default_replication_factor() -> usize {
    2
}
fn default_true() -> bool {
    true
}

/// Bot-driven re-render trigger.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BotHitRecacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bothit_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub match_ua: Vec<String>,
}

impl Default for BotHitRecacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_bothit_interval(),
            match_ua: Vec::new(),
        }
    }
}

fn default_bothit_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

/// Tracking-parameter strip list. `params` replaces the built-in defaults;
/// `params_add` extends them. The two are mutually exclusive.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TrackingParamsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_add: Option<Vec<String>>,
}

impl TrackingParamsConfig {
    /// Resolves against the built-in defaults.
    pub fn resolve(&self) -> Vec<String> {
        match (&self.params, &self.params_add) {
            (Some(params), _) => params.clone(),
            (None, Some(add)) => {
                let mut out = default_tracking_params();
                out.extend(add.iter().cloned());
                out
            }
            (None, None) => default_tracking_params(),
        }
    }
}

pub fn default_tracking_params() -> Vec<String> {
    [
        "utm_*", "gclid", "gclsrc", "dclid", "fbclid", "msclkid", "mc_cid", "mc_eid", "yclid",
        "_ga", "ref", "referrer",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Header passthrough allow-lists. Base and `_add` variants are mutually
/// exclusive within each direction.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HeadersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_request: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_request_add: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_response: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_response_add: Option<Vec<String>>,
}

impl HeadersConfig {
    pub fn resolve_request(&self) -> Vec<String> {
        resolve_list(
            &self.safe_request,
            &self.safe_request_add,
            default_safe_request_headers,
        )
    }

    pub fn resolve_response(&self) -> Vec<String> {
        resolve_list(
            &self.safe_response,
            &self.safe_response_add,
            default_safe_response_headers,
        )
    }
}

fn resolve_list(
    base: &Option<Vec<String>>,
    add: &Option<Vec<String>>,
    defaults: fn() -> Vec<String>,
) -> Vec<String> {
    match (base, add) {
        (Some(list), _) => list.clone(),
        (None, Some(extra)) => {
            let mut out = defaults();
            out.extend(extra.iter().cloned());
            out
        }
        (None, None) => defaults(),
    }
}

pub fn default_safe_request_headers() -> Vec<String> {
    ["accept", "accept-language", "cookie", "referer"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn default_safe_response_headers() -> Vec<String> {
    [
        "content-type",
        "content-language",
        "cache-control",
        "location",
        "link",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Ordered list of headers consulted for the origin client IP.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientIpConfig {
    #[serde(default = "default_client_ip_headers")]
    pub headers: Vec<String>,
}

impl Default for ClientIpConfig {
    fn default() -> Self {
        Self {
            headers: default_client_ip_headers(),
        }
    }
}

fn default_client_ip_headers() -> Vec<String> {
    ["x-forwarded-for", "x-real-ip"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogConsoleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: LogFormat::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LogFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub rotation: RotationConfig,
}

/// Size-based rotation shared by the log file and the event log.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RotationConfig {
    /// Maximum file size in bytes before rotation.
    #[serde(default = "default_rotation_max_size")]
    pub max_size: u64,
    #[serde(default = "default_rotation_max_age", with = "humantime_serde")]
    pub max_age: Duration,
    #[serde(default = "default_rotation_max_backups")]
    pub max_backups: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size: default_rotation_max_size(),
            max_age: default_rotation_max_age(),
            max_backups: default_rotation_max_backups(),
        }
    }
}

fn default_rotation_max_size() -> u64 {
    100 * 1024 * 1024
}
fn default_rotation_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}
fn default_rotation_max_backups() -> usize {
    3
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub console: LogConsoleConfig,
    #[serde(default)]
    pub file: LogFileConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: LogConsoleConfig::default(),
            file: LogFileConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Prometheus exporter settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
            path: default_metrics_path(),
            namespace: default_metrics_namespace(),
        }
    }
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}
fn default_metrics_namespace() -> String {
    "edgecache".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EventLoggingConfig {
    #[serde(default)]
    pub file: EventLogFileConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EventLogFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_event_template")]
    pub template: String,
    #[serde(default)]
    pub rotation: RotationConfig,
}

impl Default for EventLogFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: String::new(),
            template: default_event_template(),
            rotation: RotationConfig::default(),
        }
    }
}

fn default_event_template() -> String {
    "{time} {client_ip} {host} {url} {source} {cache} {status} {duration_ms}ms".to_string()
}

/// Where to find the per-host files.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HostsInclude {
    #[serde(default)]
    pub include: String,
}

/// This node's cluster identity.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NodeConfig {
    pub id: String,
    /// Address peers dial for push/pull; defaults to `internal.listen`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,
}

/// Recache scheduler knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecacheConfig {
    /// Bound of the in-memory work buffer; the ZSETs are the durable backlog.
    #[serde(default = "default_recache_max_buffer")]
    pub max_buffer: usize,
    #[serde(default = "default_recache_workers")]
    pub workers: usize,
    #[serde(default = "default_recache_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_recache_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for RecacheConfig {
    fn default() -> Self {
        Self {
            max_buffer: default_recache_max_buffer(),
            workers: default_recache_workers(),
            max_retries: default_recache_max_retries(),
            poll_interval: default_recache_poll_interval(),
        }
    }
}

fn default_recache_max_buffer() -> usize {
    1000
}
fn default_recache_workers() -> usize {
    4
}
fn default_recache_max_retries() -> u32 {
    3
}
fn default_recache_poll_interval() -> Duration {
    Duration::from_millis(500)
}

// --- Per-host configuration ---

/// Partial render settings a host or URL rule may override.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RenderOverride {
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Vec<DimensionConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<RenderEventsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<RenderCacheOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_resource_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unmatched_dimension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RenderCacheOverride {
    #[serde(default, with = "humantime_serde::option")]
    pub ttl: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired: Option<ExpiredOverride>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExpiredOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ExpiredStrategy>,
    #[serde(default, with = "humantime_serde::option")]
    pub stale_ttl: Option<Duration>,
}

/// Partial bypass settings a host or URL rule may override.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BypassOverride {
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<BypassCacheOverride>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BypassCacheOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_codes: Option<Vec<u16>>,
    #[serde(default, with = "humantime_serde::option")]
    pub ttl: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_body_size: Option<usize>,
}

/// The action a URL rule prescribes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UrlRuleAction {
    #[default]
    Render,
    Bypass,
    Block,
    Status,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UrlRuleConfig {
    /// Glob patterns (or `~`/`~*` regexes) matched against the URL path+query.
    #[serde(rename = "match")]
    pub matches: Vec<String>,
    #[serde(default)]
    pub action: UrlRuleAction,
    /// Synthesized status for `action: status`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<RenderOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<BypassOverride>,
}

/// A configured origin identity, as written in a host file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HostConfig {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    pub render_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<RenderOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<BypassOverride>,
    #[serde(default)]
    pub url_rules: Vec<UrlRuleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeadersConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<ClientIpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_params: Option<TrackingParamsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bothit_recache: Option<BotHitRecacheConfig>,
}

impl HostConfig {
    /// All domains of the host, `domain` plus `domains`.
    pub fn all_domains(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(domain) = &self.domain {
            out.push(domain.clone());
        }
        out.extend(self.domains.iter().cloned());
        out
    }
}

#[derive(Deserialize, Debug, Default)]
struct HostFile {
    #[serde(default)]
    hosts: Vec<HostConfig>,
}

// --- Root configuration ---

/// A raw representation of the root config file before host expansion and
/// validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    internal: InternalConfig,
    #[serde(default)]
    redis: RedisConfig,
    storage: StorageConfig,
    #[serde(default)]
    render: RenderConfig,
    #[serde(default)]
    bypass: BypassConfig,
    #[serde(default)]
    registry: RegistryConfig,
    #[serde(default)]
    cache_sharding: ShardingConfig,
    #[serde(default)]
    bothit_recache: BotHitRecacheConfig,
    #[serde(default)]
    tracking_params: TrackingParamsConfig,
    #[serde(default)]
    headers: HeadersConfig,
    #[serde(default)]
    client_ip: ClientIpConfig,
    #[serde(default)]
    log: LogConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    event_logging: EventLoggingConfig,
    #[serde(default)]
    hosts: HostsInclude,
    node: NodeConfig,
    #[serde(default)]
    recache: RecacheConfig,
}

/// The final, validated server configuration with all host files expanded.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub internal: InternalConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub render: RenderConfig,
    pub bypass: BypassConfig,
    pub registry: RegistryConfig,
    pub cache_sharding: ShardingConfig,
    pub bothit_recache: BotHitRecacheConfig,
    pub tracking_params: TrackingParamsConfig,
    pub headers: HeadersConfig,
    pub client_ip: ClientIpConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
    pub event_logging: EventLoggingConfig,
    pub node: NodeConfig,
    pub recache: RecacheConfig,
    pub hosts: Vec<HostConfig>,
}

impl Config {
    /// Reads and parses the root YAML file, expands the host include glob
    /// relative to the root file's directory, and validates the result.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML from '{path}'"))?;

        let base_dir = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
        let hosts = load_host_files(base_dir, &raw.hosts.include)?;

        let config = Config {
            server: raw.server,
            internal: raw.internal,
            redis: raw.redis,
            storage: raw.storage,
            render: raw.render,
            bypass: raw.bypass,
            registry: raw.registry,
            cache_sharding: raw.cache_sharding,
            bothit_recache: raw.bothit_recache,
            tracking_params: raw.tracking_params,
            headers: raw.headers,
            client_ip: raw.client_ip,
            log: raw.log,
            metrics: raw.metrics,
            event_logging: raw.event_logging,
            node: raw.node,
            recache: raw.recache,
            hosts,
        };

        config.validate()?;
        Ok(config)
    }

    /// The address peers dial, defaulting to the internal listener.
    pub fn advertise_addr(&self) -> String {
        self.node
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.internal.listen.clone())
    }

    /// Validates the resolved configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            return Err(anyhow!("node.id cannot be empty"));
        }
        if self.server.listen.trim().is_empty() {
            return Err(anyhow!("server.listen cannot be empty"));
        }
        if self.internal.listen.trim().is_empty() {
            return Err(anyhow!("internal.listen cannot be empty"));
        }
        if self.server.listen == self.internal.listen {
            return Err(anyhow!(
                "internal.listen must be a distinct port from server.listen"
            ));
        }
        if self.internal.auth_key.is_empty() {
            return Err(anyhow!("internal.auth_key cannot be empty"));
        }
        if self.internal.auth_key.len() < 16 {
            warn!("internal.auth_key is shorter than the recommended 16 characters");
        }
        if !self.storage.base_path.is_absolute() {
            return Err(anyhow!("storage.base_path must be an absolute path"));
        }
        if self.server.tls.enabled
            && (self.server.tls.cert_file.trim().is_empty()
                || self.server.tls.key_file.trim().is_empty())
        {
            return Err(anyhow!(
                "server.tls.cert_file and key_file are required when TLS is enabled"
            ));
        }
        if self.registry.heartbeat_interval >= self.registry.record_ttl {
            return Err(anyhow!(
                "registry.heartbeat_interval must be shorter than registry.record_ttl"
            ));
        }
        if self.metrics.enabled && self.metrics.listen == self.server.listen {
            return Err(anyhow!(
                "metrics.listen cannot be the same as server.listen"
            ));
        }
        if self.metrics.enabled && self.metrics.namespace != default_metrics_namespace() {
            // Metric names are registered once at process start under the
            // default namespace; a divergent value would silently not apply.
            warn!(
                "metrics.namespace '{}' is ignored; metric names use '{}'",
                self.metrics.namespace,
                default_metrics_namespace()
            );
        }
        if self.bothit_recache.enabled {
            let interval = self.bothit_recache.interval;
            if interval < Duration::from_secs(30 * 60) || interval > Duration::from_secs(24 * 3600)
            {
                return Err(anyhow!(
                    "bothit_recache.interval must be between 30m and 24h"
                ));
            }
        }
        if self.recache.max_buffer == 0 {
            return Err(anyhow!("recache.max_buffer cannot be 0"));
        }
        if self.recache.workers == 0 {
            return Err(anyhow!("recache.workers cannot be 0"));
        }

        validate_exclusive(
            "tracking_params.params",
            &self.tracking_params.params,
            "tracking_params.params_add",
            &self.tracking_params.params_add,
        )?;
        validate_headers_config("headers", &self.headers)?;

        self.validate_durations();
        self.validate_hosts()?;
        Ok(())
    }

    /// Flags durations that were probably written without a unit.
    fn validate_durations(&self) {
        let checks: [(&str, Duration); 7] = [
            ("server.timeout", self.server.timeout),
            ("render.timeout", self.render.timeout),
            ("bypass.timeout", self.bypass.timeout),
            ("render.cache.ttl", self.render.cache.ttl),
            ("storage.cleanup.interval", self.storage.cleanup.interval),
            (
                "registry.heartbeat_interval",
                self.registry.heartbeat_interval,
            ),
            ("recache.poll_interval", self.recache.poll_interval),
        ];
        for (name, value) in checks {
            if !value.is_zero() && value < Duration::from_millis(1) {
                warn!(
                    "{} is below 1ms ({:?}); the value is likely missing a unit",
                    name, value
                );
            }
        }
    }

    fn validate_hosts(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(anyhow!("no hosts configured (check hosts.include)"));
        }
        let mut seen_ids = HashSet::new();
        let mut seen_domains = HashSet::new();
        for host in &self.hosts {
            if host.id == 0 {
                return Err(anyhow!("host id must be a positive integer"));
            }
            if !seen_ids.insert(host.id) {
                return Err(anyhow!("duplicate host id {}", host.id));
            }
            if host.render_key.trim().is_empty() {
                return Err(anyhow!("host {} has an empty render_key", host.id));
            }
            let domains = host.all_domains();
            if domains.is_empty() {
                return Err(anyhow!("host {} has no domains", host.id));
            }
            for domain in &domains {
                validate_domain(host.id, domain)?;
                if !seen_domains.insert(domain.clone()) {
                    return Err(anyhow!("domain '{domain}' is claimed by multiple hosts"));
                }
            }
            if let Some(tracking) = &host.tracking_params {
                validate_exclusive(
                    &format!("host {} tracking_params.params", host.id),
                    &tracking.params,
                    "tracking_params.params_add",
                    &tracking.params_add,
                )?;
            }
            if let Some(headers) = &host.headers {
                validate_headers_config(&format!("host {} headers", host.id), headers)?;
            }
            for rule in &host.url_rules {
                if rule.matches.is_empty() {
                    return Err(anyhow!("host {} has a url_rule with no patterns", host.id));
                }
                if rule.action == UrlRuleAction::Status && rule.status.is_none() {
                    return Err(anyhow!(
                        "host {} has a status url_rule without a status code",
                        host.id
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_exclusive<T>(
    base_name: &str,
    base: &Option<T>,
    add_name: &str,
    add: &Option<T>,
) -> Result<()> {
    if base.is_some() && add.is_some() {
        return Err(anyhow!(
            "{base_name} and {add_name} are mutually exclusive; configure one of them"
        ));
    }
    Ok(())
}

fn validate_headers_config(scope: &str, headers: &HeadersConfig) -> Result<()> {
    validate_exclusive(
        &format!("{scope}.safe_request"),
        &headers.safe_request,
        "safe_request_add",
        &headers.safe_request_add,
    )?;
    validate_exclusive(
        &format!("{scope}.safe_response"),
        &headers.safe_response,
        "safe_response_add",
        &headers.safe_response_add,
    )
}

/// Domains are bare lowercase hostnames: no scheme, path, port, or wildcard.
fn validate_domain(host_id: u32, domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(anyhow!("host {host_id} has an empty domain"));
    }
    if domain.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(anyhow!("host {host_id} domain '{domain}' must be lowercase"));
    }
    if domain.contains("://") || domain.contains('/') {
        return Err(anyhow!(
            "host {host_id} domain '{domain}' must not contain a scheme or path"
        ));
    }
    if domain.contains(':') {
        return Err(anyhow!(
            "host {host_id} domain '{domain}' must not contain a port"
        ));
    }
    if domain.contains('*') {
        return Err(anyhow!(
            "host {host_id} domain '{domain}' must not contain a wildcard"
        ));
    }
    Ok(())
}

/// Expands `hosts.include` (a glob or a directory) relative to the root
/// config directory and parses every matching YAML file.
fn load_host_files(base_dir: &Path, include: &str) -> Result<Vec<HostConfig>> {
    if include.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut pattern = PathBuf::from(include);
    if pattern.is_relative() {
        pattern = base_dir.join(pattern);
    }
    if pattern.is_dir() {
        pattern = pattern.join("*.yaml");
    }
    let pattern_str = pattern.to_string_lossy().into_owned();

    let mut hosts = Vec::new();
    let mut matched_any = false;
    for entry in glob::glob(&pattern_str)
        .with_context(|| format!("Invalid hosts.include pattern '{pattern_str}'"))?
    {
        let path = entry.context("Failed to read a hosts.include match")?;
        matched_any = true;
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read host file '{}'", path.display()))?;
        let file: HostFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML from '{}'", path.display()))?;
        hosts.extend(file.hosts);
    }
    if !matched_any {
        warn!("hosts.include pattern '{}' matched no files", pattern_str);
    }
    hosts.sort_by_key(|h| h.id);
    Ok(hosts)
}
