// src/core/cluster/selector.rs

//! Shard target selection: which nodes should hold a given cache entry.
//!
//! The selector is a pure function over a snapshot of the membership, never
//! a live handle on the registry. For the same `(key, sorted members, R)`
//! the `hash_modulo` strategy always produces the same target set,
//! regardless of the order the membership list arrived in.

use crate::core::types::CacheKey;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Configurable placement strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    #[default]
    HashModulo,
    Random,
    PrimaryOnly,
}

/// Stable placement hash over the textual cache key.
fn placement_hash(key: &CacheKey) -> u32 {
    let text = key.to_string();
    murmur3::murmur3_32(&mut Cursor::new(text.as_bytes()), 0).unwrap_or_default()
}

/// Selects the target set for one entry.
///
/// `members` is a snapshot of live node ids; `replication` is clamped to
/// `[0, |members|]`. The returned set is the nodes that should hold the
/// artifact; composing the ordered `eg_ids` (rendering node first) is done
/// by [`compose_eg_ids`].
pub fn select_targets(
    strategy: DistributionStrategy,
    key: &CacheKey,
    members: &[String],
    self_id: &str,
    replication: usize,
) -> Vec<String> {
    let mut ordered: Vec<String> = members.to_vec();
    ordered.sort();
    ordered.dedup();

    let r = replication.min(ordered.len());
    if r == 0 {
        return Vec::new();
    }

    match strategy {
        DistributionStrategy::PrimaryOnly => vec![self_id.to_string()],
        DistributionStrategy::Random => {
            let mut rng = rand::thread_rng();
            ordered
                .choose_multiple(&mut rng, r)
                .cloned()
                .collect()
        }
        DistributionStrategy::HashModulo => {
            let start = placement_hash(key) as usize % ordered.len();
            (0..r)
                .map(|i| ordered[(start + i) % ordered.len()].clone())
                .collect()
        }
    }
}

/// Builds the initial `eg_ids` for a freshly rendered entry: the rendering
/// node first, then the selected targets minus the rendering node,
/// truncated to the replication factor. With `R = 0` only the originator is
/// tracked.
pub fn compose_eg_ids(self_id: &str, targets: &[String], replication: usize) -> Vec<String> {
    let cap = replication.max(1);
    let mut ids = Vec::with_capacity(cap);
    ids.push(self_id.to_string());
    for target in targets {
        if ids.len() >= cap {
            break;
        }
        if !ids.iter().any(|id| id == target) {
            ids.push(target.clone());
        }
    }
    ids
}
