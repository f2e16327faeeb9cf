//! Scoped lock ownership with optional TTL renewal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{LockError, LockKey, LockStore, LockToken};

/// Entry point for taking locks from a shared [`LockStore`].
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    heartbeat: bool,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            heartbeat: true,
        }
    }

    /// Disable TTL renewal; the lock then lives at most one TTL.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = false;
        self
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Try to take `key`. `Ok(None)` means another holder owns it.
    pub async fn try_lock(&self, key: LockKey, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let Some(token) = self.store.acquire(&key, ttl).await? else {
            return Ok(None);
        };
        debug!(lock_key = %key, "lock acquired");
        Ok(Some(LockGuard::new(self.store.clone(), key, token, ttl, self.heartbeat)))
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

/// A held lock.
///
/// Call [`LockGuard::release`] when the critical section ends. Dropping an
/// unreleased guard stops the heartbeat and releases in the background, so an
/// early return or panic never leaves the key held past its TTL.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    key: LockKey,
    token: LockToken,
    heartbeat: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
    released: bool,
}

impl LockGuard {
    fn new(
        store: Arc<dyn LockStore>,
        key: LockKey,
        token: LockToken,
        ttl: Duration,
        heartbeat: bool,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = if heartbeat && !ttl.is_zero() {
            tokio::runtime::Handle::try_current().ok().map(|rt| {
                rt.spawn(renew_loop(
                    store.clone(),
                    key.clone(),
                    token.clone(),
                    ttl,
                    lost.clone(),
                ))
            })
        } else {
            None
        };

        Self {
            store,
            key,
            token,
            heartbeat,
            lost,
            released: false,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// The heartbeat found the lock owned by someone else (or gone).
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Release the lock. Returns `false` if it had already expired or moved on.
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.stop_heartbeat();
        self.released = true;
        let released = self.store.release(&self.key, &self.token).await?;
        if released {
            debug!(lock_key = %self.key, "lock released");
        } else {
            warn!(lock_key = %self.key, "lock was no longer held at release");
        }
        Ok(released)
    }

    fn stop_heartbeat(&mut self) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.released {
            return;
        }
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let key = self.key.clone();
            let token = self.token.clone();
            rt.spawn(async move {
                if let Err(e) = store.release(&key, &token).await {
                    warn!(lock_key = %key, error = %e, "background lock release failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

async fn renew_loop(
    store: Arc<dyn LockStore>,
    key: LockKey,
    token: LockToken,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) {
    let every = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(every).await;
        match store.extend(&key, &token, ttl).await {
            Ok(true) => debug!(lock_key = %key, "lock renewed"),
            Ok(false) => {
                warn!(lock_key = %key, "lock lost before renewal");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            // Keep trying; the TTL still bounds the damage.
            Err(e) => warn!(lock_key = %key, error = %e, "lock renewal failed"),
        }
    }
}
