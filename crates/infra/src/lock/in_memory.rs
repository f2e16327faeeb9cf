//! Process-local lock store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dailycast_core::{Clock, SystemClock};

use super::{LockError, LockKey, LockStore, LockToken};

#[derive(Debug, Clone)]
struct LockEntry {
    token: LockToken,
    expires_at: DateTime<Utc>,
}

/// In-memory lock store with TTL evaluated against a [`Clock`].
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, LockEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current holder of `key`, ignoring expired entries.
    pub fn holder(&self, key: &LockKey) -> Option<LockToken> {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap();
        entries
            .get(key.as_str())
            .filter(|e| e.expires_at > now)
            .map(|e| e.token.clone())
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650))
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLockStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(&self, key: &LockKey, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get(key.as_str()) {
            if entry.expires_at > now {
                return Ok(None);
            }
        }

        let token = LockToken::generate();
        entries.insert(
            key.as_str().to_string(),
            LockEntry {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, key: &LockKey, token: &LockToken) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key.as_str()) {
            Some(entry) if &entry.token == token && entry.expires_at > now => {
                entries.remove(key.as_str());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(
        &self,
        key: &LockKey,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key.as_str()) {
            Some(entry) if &entry.token == token && entry.expires_at > now => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
