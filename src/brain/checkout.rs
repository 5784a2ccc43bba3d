//! Per-datum locking with single-use lease tokens.
//!
//! Each key has a reference-counted entry holding an async mutex. A
//! read-write checkout keeps the mutex guard inside a lease identified by a
//! random token; the lease ends on update, on checkin, or when the watchdog
//! fires after the lock timeout, whichever happens first.

use rand::Rng as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Shortest lock timeout accepted.
pub const MIN_LOCK_TIMEOUT: Duration = Duration::from_millis(200);

/// Default time a read-write checkout may hold a datum.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

struct DatumLock {
    refcount: usize,
    mutex: Arc<Mutex<()>>,
}

/// A held read-write lease. Dropping it releases the datum mutex.
pub struct Lease {
    token: String,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn token(&self) -> &str {
        &self.token
    }
}

pub struct DatumLocks {
    locks: Mutex<HashMap<String, DatumLock>>,
    leases: Mutex<HashMap<String, Lease>>,
    lock_timeout: Duration,
}

impl DatumLocks {
    pub fn new(lock_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            locks: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            lock_timeout: lock_timeout.max(MIN_LOCK_TIMEOUT),
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Take a reference on `key` and wait for its mutex.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            let entry = locks.entry(key.to_string()).or_insert_with(|| DatumLock {
                refcount: 0,
                mutex: Arc::new(Mutex::new(())),
            });
            entry.refcount += 1;
            entry.mutex.clone()
        };
        mutex.lock_owned().await
    }

    /// Drop a reference on `key`, deleting the entry at zero.
    pub async fn release(&self, key: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get_mut(key) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                locks.remove(key);
            }
        }
    }

    /// Convert a held guard into a lease and arm its watchdog. Returns the
    /// lease token.
    pub async fn lease(self: &Arc<Self>, key: &str, guard: OwnedMutexGuard<()>) -> String {
        let token = new_token();
        self.leases.lock().await.insert(
            key.to_string(),
            Lease {
                token: token.clone(),
                _guard: guard,
            },
        );

        let locks = Arc::clone(self);
        let watched_key = key.to_string();
        let watched_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(locks.lock_timeout).await;
            if let Some(lease) = locks.take_lease(&watched_key, &watched_token).await {
                tracing::warn!(key = %watched_key, "datum lock expired before checkin");
                drop(lease);
                locks.release(&watched_key).await;
            }
        });
        token
    }

    /// Remove the lease for `key` if `token` still owns it.
    pub async fn take_lease(&self, key: &str, token: &str) -> Option<Lease> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(lease) if lease.token == token => leases.remove(key),
            _ => None,
        }
    }

    /// Number of keys with outstanding references.
    pub async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// 8 random bytes, hex encoded.
fn new_token() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_blocks_other_holders_until_taken() {
        let locks = DatumLocks::new(Duration::from_secs(5));
        let guard = locks.acquire("k").await;
        let token = locks.lease("k", guard).await;
        assert_eq!(token.len(), 16);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("k").await;
                locks.release("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(locks.take_lease("k", "0000000000000000").await.is_none());
        let lease = locks.take_lease("k", &token).await.expect("valid token");
        drop(lease);
        locks.release("k").await;
        waiter.await.expect("waiter completes");
        assert_eq!(locks.tracked_keys().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_expires_lease_after_timeout() {
        let locks = DatumLocks::new(Duration::from_millis(250));
        let guard = locks.acquire("k").await;
        let token = locks.lease("k", guard).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(locks.tracked_keys().await, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(locks.take_lease("k", &token).await.is_none());
        assert_eq!(locks.tracked_keys().await, 0);
    }

    #[test]
    fn timeout_has_a_floor() {
        let locks = DatumLocks::new(Duration::from_millis(10));
        assert_eq!(locks.lock_timeout(), MIN_LOCK_TIMEOUT);
    }
}
