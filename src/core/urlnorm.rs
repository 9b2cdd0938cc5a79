// src/core/urlnorm.rs

//! URL canonicalization and digest computation.
//!
//! Every cache key's final segment comes from here: the same logical URL must
//! hash identically regardless of query-parameter order, configured tracking
//! parameters, or the node doing the hashing.

use crate::core::EdgeCacheError;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;
use wildmatch::WildMatch;

/// Number of hex characters of the SHA-256 digest kept as the URL hash.
const URL_HASH_LEN: usize = 16;

/// A single compiled tracking-parameter pattern.
#[derive(Debug, Clone)]
enum StripPattern {
    Exact(String),
    Wildcard(WildMatch),
    Regex(Regex),
}

impl StripPattern {
    fn matches(&self, name: &str) -> bool {
        match self {
            StripPattern::Exact(s) => s == name,
            StripPattern::Wildcard(w) => w.matches(name),
            StripPattern::Regex(r) => r.is_match(name),
        }
    }
}

/// A compiled host-scoped list of tracking parameters to remove during
/// normalization. Plain strings match exactly, `*` introduces a glob, and
/// a leading `~` (or `~*` for case-insensitive) introduces a regex.
#[derive(Debug, Clone, Default)]
pub struct StripList {
    patterns: Vec<StripPattern>,
}

impl StripList {
    pub fn compile(raw: &[String]) -> Result<Self, EdgeCacheError> {
        let mut patterns = Vec::with_capacity(raw.len());
        for pattern_src in raw {
            let pattern = if let Some(re) = pattern_src.strip_prefix("~*") {
                let re = Regex::new(&format!("(?i){re}")).map_err(|e| {
                    EdgeCacheError::FatalConfig(format!("bad tracking param regex '{pattern_src}': {e}"))
                })?;
                StripPattern::Regex(re)
            } else if let Some(re) = pattern_src.strip_prefix('~') {
                let re = Regex::new(re).map_err(|e| {
                    EdgeCacheError::FatalConfig(format!("bad tracking param regex '{pattern_src}': {e}"))
                })?;
                StripPattern::Regex(re)
            } else if pattern_src.contains('*') || pattern_src.contains('?') {
                StripPattern::Wildcard(WildMatch::new(pattern_src))
            } else {
                StripPattern::Exact(pattern_src.clone())
            };
            patterns.push(pattern);
        }
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true when a query parameter with this name must be removed.
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Canonicalizes an absolute URL.
///
/// Lowercases scheme and host, drops default ports, strips a single trailing
/// dot from the host, removes tracking parameters, re-serializes the
/// remaining query parameters in a stable order, and drops the fragment.
/// Path case is preserved.
pub fn normalize_url(raw: &str, strip: &StripList) -> Result<String, EdgeCacheError> {
    let mut url = Url::parse(raw.trim())?;
    if !url.has_host() {
        return Err(EdgeCacheError::InvalidRequest(format!(
            "URL has no host: '{raw}'"
        )));
    }

    // `Url::parse` already lowercases scheme and host and elides default
    // ports for known schemes. The trailing-dot form of a hostname is kept
    // by the parser, so strip it here.
    let undotted = url
        .host_str()
        .and_then(|host| host.strip_suffix('.'))
        .filter(|host| !host.is_empty())
        .map(str::to_string);
    if let Some(host) = undotted {
        url.set_host(Some(&host))?;
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !strip.matches(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(&pairs);
    }

    Ok(url.to_string())
}

/// Computes the short collision-resistant digest of a normalized URL.
pub fn url_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)[..URL_HASH_LEN].to_string()
}

/// Convenience composing [`normalize_url`] and [`url_hash`].
pub fn normalize_and_hash(
    raw: &str,
    strip: &StripList,
) -> Result<(String, String), EdgeCacheError> {
    let normalized = normalize_url(raw, strip)?;
    let hash = url_hash(&normalized);
    Ok((normalized, hash))
}
