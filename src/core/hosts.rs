// src/core/hosts.rs

//! The runtime host table: per-host configuration compiled into matchers
//! and fully resolved settings. Built once at boot from the configuration
//! snapshot; a restart reloads.

use crate::config::{
    BotHitRecacheConfig, Config, DimensionConfig, ExpiredStrategy, RenderEventsConfig,
    UrlRuleAction, UrlRuleConfig,
};
use crate::core::types::RuleAction;
use crate::core::urlnorm::StripList;
use crate::core::EdgeCacheError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wildmatch::WildMatch;

/// A compiled viewport/UA variant.
#[derive(Debug, Clone)]
pub struct Dimension {
    pub id: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub render_ua: String,
    matchers: Vec<WildMatch>,
}

impl Dimension {
    fn compile(cfg: &DimensionConfig) -> Self {
        Self {
            id: cfg.id,
            name: cfg.name.clone(),
            width: cfg.width,
            height: cfg.height,
            render_ua: cfg.render_ua.clone(),
            matchers: cfg
                .match_ua
                .iter()
                .map(|p| WildMatch::new(&p.to_lowercase()))
                .collect(),
        }
    }

    /// Case-insensitive first-match against the caller's UA.
    pub fn matches_ua(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_lowercase();
        self.matchers.iter().any(|m| m.matches(&ua))
    }
}

/// Where a request goes when no dimension matches its UA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedPolicy {
    Block,
    Bypass,
    Dimension(u32),
}

#[derive(Debug, Clone)]
enum PathMatcher {
    Wildcard(WildMatch),
    Regex(Regex),
}

impl PathMatcher {
    fn compile(pattern: &str) -> Result<Self, EdgeCacheError> {
        if let Some(re) = pattern.strip_prefix("~*") {
            let re = Regex::new(&format!("(?i){re}")).map_err(|e| {
                EdgeCacheError::FatalConfig(format!("bad url_rule regex '{pattern}': {e}"))
            })?;
            Ok(PathMatcher::Regex(re))
        } else if let Some(re) = pattern.strip_prefix('~') {
            let re = Regex::new(re).map_err(|e| {
                EdgeCacheError::FatalConfig(format!("bad url_rule regex '{pattern}': {e}"))
            })?;
            Ok(PathMatcher::Regex(re))
        } else {
            Ok(PathMatcher::Wildcard(WildMatch::new(pattern)))
        }
    }

    fn matches(&self, path_and_query: &str) -> bool {
        match self {
            PathMatcher::Wildcard(w) => w.matches(path_and_query),
            PathMatcher::Regex(r) => r.is_match(path_and_query),
        }
    }
}

/// Effective bypass settings after all override layers.
#[derive(Debug, Clone)]
pub struct BypassSettings {
    pub timeout: Duration,
    pub cache_enabled: bool,
    pub cache_status_codes: Vec<u16>,
    pub cache_ttl: Duration,
    pub cache_min_body_size: usize,
}

/// Effective render/cache settings after all override layers.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub expired_strategy: ExpiredStrategy,
    pub stale_ttl: Duration,
    pub render_timeout: Duration,
}

/// One compiled URL rule with its merged settings.
#[derive(Debug, Clone)]
struct CompiledRule {
    matchers: Vec<PathMatcher>,
    action: RuleAction,
    cache: CacheSettings,
    bypass: BypassSettings,
}

/// A fully resolved host.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: u32,
    pub domains: Vec<String>,
    pub render_key: String,
    pub enabled: bool,
    pub dimensions: Vec<Dimension>,
    pub unmatched: UnmatchedPolicy,
    pub cache: CacheSettings,
    pub bypass: BypassSettings,
    pub strip_params: StripList,
    pub safe_request_headers: Vec<String>,
    pub safe_response_headers: Vec<String>,
    pub client_ip_headers: Vec<String>,
    pub events: RenderEventsConfig,
    pub blocked_resource_types: Vec<String>,
    pub max_concurrent_renders: usize,
    pub bothit: BotHitSettings,
    rules: Vec<CompiledRule>,
}

/// Compiled bot-hit recache settings.
#[derive(Debug, Clone)]
pub struct BotHitSettings {
    pub enabled: bool,
    pub interval: Duration,
    matchers: Vec<WildMatch>,
}

impl BotHitSettings {
    fn compile(cfg: &BotHitRecacheConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            interval: cfg.interval,
            matchers: cfg
                .match_ua
                .iter()
                .map(|p| WildMatch::new(&p.to_lowercase()))
                .collect(),
        }
    }

    pub fn matches_ua(&self, user_agent: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let ua = user_agent.to_lowercase();
        self.matchers.iter().any(|m| m.matches(&ua))
    }
}

/// The effective decision for one request URL after rule matching.
#[derive(Debug, Clone)]
pub struct RuleDecision {
    pub action: RuleAction,
    pub cache: CacheSettings,
    pub bypass: BypassSettings,
}

impl Host {
    /// First dimension whose UA patterns match, in configuration order.
    pub fn match_dimension(&self, user_agent: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.matches_ua(user_agent))
    }

    pub fn dimension_by_id(&self, id: u32) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.id == id)
    }

    /// Matches the URL's path+query against the host's rules, first match
    /// wins. Without a match the default is a plain render with host
    /// settings.
    pub fn decide(&self, url: &Url) -> RuleDecision {
        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        for rule in &self.rules {
            if rule.matchers.iter().any(|m| m.matches(&path_and_query)) {
                return RuleDecision {
                    action: rule.action,
                    cache: rule.cache.clone(),
                    bypass: rule.bypass.clone(),
                };
            }
        }
        RuleDecision {
            action: RuleAction::Render,
            cache: self.cache.clone(),
            bypass: self.bypass.clone(),
        }
    }
}

/// Lookup table over all enabled hosts.
pub struct HostTable {
    by_id: HashMap<u32, Arc<Host>>,
    by_domain: HashMap<String, Arc<Host>>,
}

impl HostTable {
    pub fn build(config: &Config) -> Result<Self, EdgeCacheError> {
        let mut by_id = HashMap::new();
        let mut by_domain = HashMap::new();

        for host_cfg in &config.hosts {
            if !host_cfg.enabled {
                continue;
            }
            let host = Arc::new(compile_host(config, host_cfg)?);
            for domain in &host.domains {
                by_domain.insert(domain.clone(), Arc::clone(&host));
            }
            by_id.insert(host.id, host);
        }

        Ok(Self { by_id, by_domain })
    }

    pub fn by_domain(&self, domain: &str) -> Option<Arc<Host>> {
        self.by_domain.get(domain).cloned()
    }

    pub fn by_id(&self, id: u32) -> Option<Arc<Host>> {
        self.by_id.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Arc<Host>> {
        self.by_id.values()
    }
}

fn compile_host(config: &Config, cfg: &crate::config::HostConfig) -> Result<Host, EdgeCacheError> {
    let render_override = cfg.render.as_ref();

    let dimension_cfgs = render_override
        .and_then(|r| r.dimensions.clone())
        .unwrap_or_else(|| config.render.dimensions.clone());
    let dimensions: Vec<Dimension> = dimension_cfgs.iter().map(Dimension::compile).collect();
    if dimensions.is_empty() {
        return Err(EdgeCacheError::FatalConfig(format!(
            "host {} has no dimensions configured",
            cfg.id
        )));
    }

    let unmatched_raw = render_override
        .and_then(|r| r.unmatched_dimension.clone())
        .unwrap_or_else(|| config.render.unmatched_dimension.clone());
    let unmatched = match unmatched_raw.as_str() {
        "block" => UnmatchedPolicy::Block,
        "bypass" => UnmatchedPolicy::Bypass,
        name => {
            let dim = dimensions.iter().find(|d| d.name == name).ok_or_else(|| {
                EdgeCacheError::FatalConfig(format!(
                    "host {}: unmatched_dimension '{}' is not block, bypass, or a dimension name",
                    cfg.id, name
                ))
            })?;
            UnmatchedPolicy::Dimension(dim.id)
        }
    };

    let host_cache = resolve_cache_settings(config, render_override, None);
    let host_bypass = resolve_bypass_settings(config, cfg.bypass.as_ref(), None);

    let mut rules = Vec::with_capacity(cfg.url_rules.len());
    for rule_cfg in &cfg.url_rules {
        rules.push(compile_rule(config, cfg, rule_cfg, &host_cache, &host_bypass)?);
    }

    let strip_raw = cfg
        .tracking_params
        .as_ref()
        .unwrap_or(&config.tracking_params)
        .resolve();
    let strip_params = StripList::compile(&strip_raw)?;

    let headers = cfg.headers.as_ref().unwrap_or(&config.headers);
    let safe_request_headers = lowercase_all(headers.resolve_request());
    let safe_response_headers = lowercase_all(headers.resolve_response());

    let client_ip_headers = lowercase_all(
        cfg.client_ip
            .as_ref()
            .unwrap_or(&config.client_ip)
            .headers
            .clone(),
    );

    let bothit = BotHitSettings::compile(
        cfg.bothit_recache.as_ref().unwrap_or(&config.bothit_recache),
    );

    Ok(Host {
        id: cfg.id,
        domains: cfg.all_domains(),
        render_key: cfg.render_key.clone(),
        enabled: cfg.enabled,
        dimensions,
        unmatched,
        cache: host_cache,
        bypass: host_bypass,
        strip_params,
        safe_request_headers,
        safe_response_headers,
        client_ip_headers,
        events: render_override
            .and_then(|r| r.events.clone())
            .unwrap_or_else(|| config.render.events.clone()),
        blocked_resource_types: render_override
            .and_then(|r| r.blocked_resource_types.clone())
            .unwrap_or_else(|| config.render.blocked_resource_types.clone()),
        max_concurrent_renders: render_override
            .and_then(|r| r.max_concurrent)
            .unwrap_or(config.render.max_concurrent),
        bothit,
        rules,
    })
}

fn compile_rule(
    config: &Config,
    host_cfg: &crate::config::HostConfig,
    rule_cfg: &UrlRuleConfig,
    host_cache: &CacheSettings,
    host_bypass: &BypassSettings,
) -> Result<CompiledRule, EdgeCacheError> {
    let mut matchers = Vec::with_capacity(rule_cfg.matches.len());
    for pattern in &rule_cfg.matches {
        matchers.push(PathMatcher::compile(pattern)?);
    }

    let action = match rule_cfg.action {
        UrlRuleAction::Render => RuleAction::Render,
        UrlRuleAction::Bypass => RuleAction::Bypass,
        UrlRuleAction::Block => RuleAction::Block,
        UrlRuleAction::Status => {
            let code = rule_cfg.status.ok_or_else(|| {
                EdgeCacheError::FatalConfig(format!(
                    "host {}: status url_rule without a status code",
                    host_cfg.id
                ))
            })?;
            RuleAction::Status(code)
        }
    };

    // Rule overrides stack on top of the host-resolved settings.
    let cache = match &rule_cfg.render {
        Some(over) => resolve_cache_settings(config, host_cfg.render.as_ref(), Some(over)),
        None => host_cache.clone(),
    };
    let bypass = match &rule_cfg.bypass {
        Some(over) => resolve_bypass_over(host_bypass, over),
        None => host_bypass.clone(),
    };

    Ok(CompiledRule {
        matchers,
        action,
        cache,
        bypass,
    })
}

fn resolve_cache_settings(
    config: &Config,
    host_over: Option<&crate::config::RenderOverride>,
    rule_over: Option<&crate::config::RenderOverride>,
) -> CacheSettings {
    let mut settings = CacheSettings {
        ttl: config.render.cache.ttl,
        expired_strategy: config.render.cache.expired.strategy,
        stale_ttl: config.render.cache.expired.stale_ttl,
        render_timeout: config.render.timeout,
    };
    for over in [host_over, rule_over].into_iter().flatten() {
        if let Some(timeout) = over.timeout {
            settings.render_timeout = timeout;
        }
        if let Some(cache) = &over.cache {
            if let Some(ttl) = cache.ttl {
                settings.ttl = ttl;
            }
            if let Some(expired) = &cache.expired {
                if let Some(strategy) = expired.strategy {
                    settings.expired_strategy = strategy;
                }
                if let Some(stale_ttl) = expired.stale_ttl {
                    settings.stale_ttl = stale_ttl;
                }
            }
        }
    }
    settings
}

fn resolve_bypass_settings(
    config: &Config,
    host_over: Option<&crate::config::BypassOverride>,
    rule_over: Option<&crate::config::BypassOverride>,
) -> BypassSettings {
    let mut settings = BypassSettings {
        timeout: config.bypass.timeout,
        cache_enabled: config.bypass.cache.enabled,
        cache_status_codes: config.bypass.cache.status_codes.clone(),
        cache_ttl: config.bypass.cache.ttl,
        cache_min_body_size: config.bypass.cache.min_body_size,
    };
    for over in [host_over, rule_over].into_iter().flatten() {
        apply_bypass_over(&mut settings, over);
    }
    settings
}

fn resolve_bypass_over(
    host: &BypassSettings,
    over: &crate::config::BypassOverride,
) -> BypassSettings {
    let mut settings = host.clone();
    apply_bypass_over(&mut settings, over);
    settings
}

fn apply_bypass_over(settings: &mut BypassSettings, over: &crate::config::BypassOverride) {
    if let Some(timeout) = over.timeout {
        settings.timeout = timeout;
    }
    if let Some(cache) = &over.cache {
        if let Some(enabled) = cache.enabled {
            settings.cache_enabled = enabled;
        }
        if let Some(codes) = &cache.status_codes {
            settings.cache_status_codes = codes.clone();
        }
        if let Some(ttl) = cache.ttl {
            settings.cache_ttl = ttl;
        }
        if let Some(min) = cache.min_body_size {
            settings.cache_min_body_size = min;
        }
    }
}

fn lowercase_all(list: Vec<String>) -> Vec<String> {
    list.into_iter().map(|s| s.to_lowercase()).collect()
}
