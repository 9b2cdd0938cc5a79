// src/core/orchestrator/singleflight.rs

//! Cross-node single-flight render locks.
//!
//! The lock lives in the shared store with a TTL, not in-process, so two
//! nodes that simultaneously decide to render the same key serialize on it;
//! losers discover the winner's metadata on re-lookup. The TTL exceeds the
//! render timeout, so a crashed winner cannot wedge the key for long.

use crate::core::store::SharedStore;
use crate::core::types::CacheKey;
use crate::core::EdgeCacheError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Margin added to the render timeout for the lock TTL.
pub const LOCK_TTL_MARGIN: Duration = Duration::from_secs(5);

pub struct SingleFlight {
    store: Arc<dyn SharedStore>,
}

impl SingleFlight {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Attempts to become the renderer for `key`. `None` means another
    /// flight is in progress and the caller should wait on its result.
    pub async fn try_acquire(
        &self,
        key: &CacheKey,
        ttl: Duration,
    ) -> Result<Option<FlightGuard>, EdgeCacheError> {
        let token = Uuid::new_v4().to_string();
        let lock_key = key.lock_key();
        let acquired = self.store.set_nx_ttl(&lock_key, &token, ttl).await?;
        if !acquired {
            return Ok(None);
        }
        debug!("Acquired render lock {}", lock_key);
        Ok(Some(FlightGuard {
            store: Arc::clone(&self.store),
            lock_key,
            token,
            released: false,
        }))
    }

    /// Whether a flight currently holds the key.
    pub async fn is_locked(&self, key: &CacheKey) -> Result<bool, EdgeCacheError> {
        Ok(self.store.get(&key.lock_key()).await?.is_some())
    }
}

/// Holds the render lock. Every exit path must call [`FlightGuard::release`];
/// dropping without releasing spawns a best-effort delete as a backstop so a
/// failed render never leaves the lock held for its full TTL.
pub struct FlightGuard {
    store: Arc<dyn SharedStore>,
    lock_key: String,
    token: String,
    released: bool,
}

impl FlightGuard {
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.del_if_equal(&self.lock_key, &self.token).await {
            warn!("Failed to release render lock {}: {}", self.lock_key, e);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        tokio::spawn(async move {
            if let Err(e) = store.del_if_equal(&lock_key, &token).await {
                warn!("Failed to release render lock {} on drop: {}", lock_key, e);
            }
        });
    }
}
