// src/core/store/redis_store.rs

//! Redis-backed implementation of [`SharedStore`].
//!
//! Single-round-trip operations use plain commands through a
//! `ConnectionManager`; the conditional operations (field CAS, guarded
//! delete, bounded ZPOPMIN) run as small Lua scripts so they stay atomic
//! under concurrent nodes.

use crate::core::EdgeCacheError;
use crate::core::store::SharedStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;

/// Deletes a key only while it holds the expected value.
const DEL_IF_EQUAL: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Compare-and-set of one hash field. An empty ARGV[1] with ARGV[3] == '0'
/// means the field must be absent.
const HSET_FIELD_IF: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[3] == '0' then
  if current then return 0 end
else
  if current ~= ARGV[2] then return 0 end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
return 1
"#;

/// Writes one field only when the hash already exists.
const HSET_FIELD_IF_PRESENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

/// Pops the earliest member whose score is within the bound.
const ZPOP_MIN_UNTIL: &str = r#"
local popped = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, 1)
if #popped == 0 then return nil end
redis.call('ZREM', KEYS[1], popped[1])
return popped
"#;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to the configured Redis endpoint. The initial connection
    /// blocks until the store confirms, so a dead store fails boot early.
    pub async fn connect(
        addr: &str,
        password: Option<&str>,
        db: i64,
    ) -> Result<Self, EdgeCacheError> {
        let auth = password
            .filter(|p| !p.is_empty())
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        let url = format!("redis://{auth}{addr}/{db}");
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EdgeCacheError> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EdgeCacheError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_nx_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EdgeCacheError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn del_if_equal(&self, key: &str, expected: &str) -> Result<bool, EdgeCacheError> {
        let removed: i64 = Script::new(DEL_IF_EQUAL)
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EdgeCacheError> {
        let renewed: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await?;
        Ok(renewed == 1)
    }

    async fn del(&self, key: &str) -> Result<bool, EdgeCacheError> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, EdgeCacheError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(250)
                .query_async(&mut self.conn())
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, EdgeCacheError> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(fields)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EdgeCacheError> {
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), EdgeCacheError> {
        // DEL + HSET in one MULTI block: a reader never observes a half
        // record while the field set is being replaced.
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(key).ignore();
        let mut hset = pipe.cmd("HSET");
        hset.arg(key);
        for (name, value) in fields {
            hset.arg(name).arg(value);
        }
        hset.ignore();
        pipe.query_async::<_, ()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn hset_field_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, EdgeCacheError> {
        let swapped: i64 = Script::new(HSET_FIELD_IF)
            .key(key)
            .arg(field)
            .arg(expected.unwrap_or_default())
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(value)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(swapped == 1)
    }

    async fn hset_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, EdgeCacheError> {
        let written: i64 = Script::new(HSET_FIELD_IF_PRESENT)
            .key(key)
            .arg(field)
            .arg(value)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(written == 1)
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<bool, EdgeCacheError> {
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(added == 1)
    }

    async fn zpop_min_until(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Option<(String, f64)>, EdgeCacheError> {
        let popped: Option<Vec<String>> = Script::new(ZPOP_MIN_UNTIL)
            .key(key)
            .arg(max_score)
            .invoke_async(&mut self.conn())
            .await?;
        match popped {
            Some(reply) if reply.len() == 2 => {
                let score = reply[1].parse::<f64>().map_err(|_| {
                    EdgeCacheError::Store(format!("non-numeric zset score '{}'", reply[1]))
                })?;
                Ok(Some((reply[0].clone(), score)))
            }
            _ => Ok(None),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64, EdgeCacheError> {
        let count: u64 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(count)
    }

    async fn zrange(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, f64)>, EdgeCacheError> {
        let flat: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(offset)
            .arg(count)
            .query_async(&mut self.conn())
            .await?;
        let mut out = Vec::with_capacity(flat.len() / 2);
        for pair in flat.chunks_exact(2) {
            let score = pair[1].parse::<f64>().map_err(|_| {
                EdgeCacheError::Store(format!("non-numeric zset score '{}'", pair[1]))
            })?;
            out.push((pair[0].clone(), score));
        }
        Ok(out)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, EdgeCacheError> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed == 1)
    }
}
