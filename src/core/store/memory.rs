// src/core/store/memory.rs

//! In-process implementation of [`SharedStore`], mirroring the Redis
//! semantics (including TTL expiry and zset tie-breaking by member bytes).
//! This is what the test suite runs against; a single-node deployment can
//! also use it when no shared store is configured.

use crate::core::EdgeCacheError;
use crate::core::store::SharedStore;
use async_trait::async_trait;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use wildmatch::WildMatch;

#[derive(Debug, Clone)]
enum Value {
    Plain(String),
    Hash(HashMap<String, String>),
    Zset(BTreeSet<(OrderedFloat<f64>, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries for `key` and returns a locked view.
    fn prune(map: &mut HashMap<String, Entry>, key: &str) {
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        match map.get(key) {
            Some(Entry {
                value: Value::Plain(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(EdgeCacheError::Store(format!(
                "wrong value kind at '{key}'"
            ))),
            None => Ok(None),
        }
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EdgeCacheError> {
        let mut map = self.data.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Plain(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Plain(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del_if_equal(&self, key: &str, expected: &str) -> Result<bool, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        let matches = matches!(
            map.get(key),
            Some(Entry { value: Value::Plain(s), .. }) if s == expected
        );
        if matches {
            map.remove(key);
        }
        Ok(matches)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        Ok(map.remove(key).is_some())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, EdgeCacheError> {
        let matcher = WildMatch::new(pattern);
        let now = Instant::now();
        let map = self.data.lock();
        Ok(map
            .iter()
            .filter(|(k, e)| !e.is_expired(now) && matcher.matches(k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        match map.get(key) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(EdgeCacheError::Store(format!(
                "wrong value kind at '{key}'"
            ))),
            None => Ok(HashMap::new()),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EdgeCacheError> {
        Ok(self.hgetall(key).await?.get(field).cloned())
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), EdgeCacheError> {
        let mut map = self.data.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(fields.iter().cloned().collect()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn hset_field_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(hash) = &mut entry.value else {
            return Err(EdgeCacheError::Store(format!(
                "wrong value kind at '{key}'"
            )));
        };
        if hash.get(field).map(|s| s.as_str()) != expected {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hset_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        match map.get_mut(key) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(true)
            }
            Some(_) => Err(EdgeCacheError::Store(format!(
                "wrong value kind at '{key}'"
            ))),
            None => Ok(false),
        }
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<bool, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Zset(BTreeSet::new()),
            expires_at: None,
        });
        let Value::Zset(set) = &mut entry.value else {
            return Err(EdgeCacheError::Store(format!(
                "wrong value kind at '{key}'"
            )));
        };
        if set.iter().any(|(_, m)| m == member) {
            return Ok(false);
        }
        set.insert((OrderedFloat(score), member.to_string()));
        Ok(true)
    }

    async fn zpop_min_until(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Option<(String, f64)>, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        let Some(Entry {
            value: Value::Zset(set),
            ..
        }) = map.get_mut(key)
        else {
            return Ok(None);
        };
        let first = set
            .iter()
            .next()
            .filter(|(score, _)| score.0 <= max_score)
            .cloned();
        match first {
            Some(item) => {
                set.remove(&item);
                Ok(Some((item.1, item.0.into_inner())))
            }
            None => Ok(None),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        match map.get(key) {
            Some(Entry {
                value: Value::Zset(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(EdgeCacheError::Store(format!(
                "wrong value kind at '{key}'"
            ))),
            None => Ok(0),
        }
    }

    async fn zrange(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, f64)>, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        match map.get(key) {
            Some(Entry {
                value: Value::Zset(set),
                ..
            }) => Ok(set
                .iter()
                .skip(offset)
                .take(count)
                .map(|(score, member)| (member.clone(), score.0))
                .collect()),
            Some(_) => Err(EdgeCacheError::Store(format!(
                "wrong value kind at '{key}'"
            ))),
            None => Ok(Vec::new()),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, EdgeCacheError> {
        let mut map = self.data.lock();
        Self::prune(&mut map, key);
        let Some(Entry {
            value: Value::Zset(set),
            ..
        }) = map.get_mut(key)
        else {
            return Ok(false);
        };
        let found = set.iter().find(|(_, m)| m == member).cloned();
        match found {
            Some(item) => {
                set.remove(&item);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
