//! Distributed mutual exclusion keyed by string.
//!
//! ## Contract
//!
//! - `acquire` sets the key to a fresh opaque token only if absent, with a TTL.
//!   It never blocks; callers poll or give up.
//! - `release` deletes the key only if it still holds the caller's token, so a
//!   holder whose lock expired cannot release a newer holder's lock.
//! - `extend` renews the TTL under the same token check (heartbeat).
//! - Backend errors are surfaced; callers treat them exactly like "held".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dailycast_core::UserId;

pub mod guard;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use guard::{DistributedLock, LockGuard};
pub use in_memory::InMemoryLockStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;

/// Default TTL for content-generation stages.
pub const STAGE_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Opaque proof of ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lock key in the `lock:<namespace>:<userId>` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Per-user lock of one stage, e.g. `lock:summary:<userId>`.
    pub fn for_stage(stage: &str, user_id: UserId) -> Self {
        Self(format!("lock:{stage}:{user_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lock backend error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Shared key-value store providing TTL-bounded locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock if nobody holds it. `None` means it is held.
    async fn acquire(&self, key: &LockKey, ttl: Duration) -> Result<Option<LockToken>, LockError>;

    /// Release the lock if `token` is still the current holder.
    async fn release(&self, key: &LockKey, token: &LockToken) -> Result<bool, LockError>;

    /// Push the expiry out to `ttl` from now if `token` is still the current holder.
    async fn extend(&self, key: &LockKey, token: &LockToken, ttl: Duration)
        -> Result<bool, LockError>;
}

#[async_trait]
impl<T: LockStore + ?Sized> LockStore for Arc<T> {
    async fn acquire(&self, key: &LockKey, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        (**self).acquire(key, ttl).await
    }

    async fn release(&self, key: &LockKey, token: &LockToken) -> Result<bool, LockError> {
        (**self).release(key, token).await
    }

    async fn extend(
        &self,
        key: &LockKey,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        (**self).extend(key, token, ttl).await
    }
}
