//! Long-term memory: a pluggable key/value backend behind per-datum
//! checkout locks, with optional encryption at rest.

pub mod checkout;
pub mod crypt;
pub mod file;
pub mod memory;
pub mod shortterm;

pub use checkout::{DEFAULT_LOCK_TIMEOUT, DatumLocks};
pub use crypt::Crypt;
pub use file::FileBrain;
pub use memory::MemBrain;
pub use shortterm::{MemoryKey, ShortTermMemories};

use crate::config::Paths;
use crate::error::BrainError;
use crate::retval::RetVal;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w:]+$").expect("hardcoded regex"));

/// Storage contract for brain backends. Values are opaque bytes; encryption
/// and locking happen above this layer.
#[async_trait::async_trait]
pub trait SimpleBrain: Send + Sync + 'static {
    async fn store(&self, key: &str, blob: &[u8]) -> Result<(), BrainError>;

    /// `Ok(None)` when the key does not exist.
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, BrainError>;

    async fn list(&self) -> Result<Vec<String>, BrainError>;

    async fn delete(&self, key: &str) -> Result<(), BrainError>;
}

/// Open the backend named by `GOPHER_BRAIN` or the robot's `Brain` setting.
///
/// `mem` keeps everything in process; `file` stores one file per key under
/// `BrainDirectory` (default `<home>/brain`).
pub fn open_backend(
    name: &str,
    config: Option<&serde_json::Value>,
    paths: &Paths,
) -> Result<Arc<dyn SimpleBrain>, BrainError> {
    match name {
        "" | "mem" | "memory" => Ok(Arc::new(MemBrain::new())),
        "file" => {
            let dir = config
                .and_then(|config| config.get("BrainDirectory"))
                .and_then(|value| value.as_str())
                .map(|dir| {
                    let dir = std::path::PathBuf::from(dir);
                    if dir.is_absolute() {
                        dir
                    } else {
                        paths.home_dir.join(dir)
                    }
                })
                .unwrap_or_else(|| paths.home_dir.join("brain"));
            Ok(Arc::new(FileBrain::open(dir)?))
        }
        other => Err(BrainError::UnknownBackend(other.to_string())),
    }
}

/// Whether `key` is a legal brain key.
pub fn valid_key(key: &str) -> bool {
    KEY_PATTERN.is_match(key)
}

/// Result of a [`Brain::checkout`].
#[derive(Debug, Clone, Default)]
pub struct Checkout {
    /// Lease token for read-write checkouts; empty for read-only ones.
    pub token: String,
    pub datum: Option<Vec<u8>>,
    pub ret: RetVal,
}

impl Checkout {
    pub fn exists(&self) -> bool {
        self.datum.is_some()
    }

    fn failed(ret: RetVal) -> Self {
        Self {
            ret,
            ..Default::default()
        }
    }
}

/// The robot's brain: backend, optional cipher, datum locks and
/// short-term memories.
pub struct Brain {
    backend: Arc<dyn SimpleBrain>,
    crypt: Option<Arc<Crypt>>,
    locks: Arc<DatumLocks>,
    short_term: ShortTermMemories,
}

impl Brain {
    pub fn new(backend: Arc<dyn SimpleBrain>, crypt: Option<Crypt>, lock_timeout: Duration) -> Self {
        Self {
            backend,
            crypt: crypt.map(Arc::new),
            locks: DatumLocks::new(lock_timeout),
            short_term: ShortTermMemories::default(),
        }
    }

    /// An unencrypted in-memory brain.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemBrain::new()), None, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn encrypted(&self) -> bool {
        self.crypt.is_some()
    }

    pub fn short_term(&self) -> &ShortTermMemories {
        &self.short_term
    }

    pub fn locks(&self) -> &Arc<DatumLocks> {
        &self.locks
    }

    /// Check out `key`. Read-write checkouts hold the datum until
    /// [`update`](Self::update), [`checkin`](Self::checkin) or lock expiry.
    pub async fn checkout(&self, key: &str, rw: bool) -> Checkout {
        if !valid_key(key) {
            tracing::warn!(key, "rejected invalid datum key");
            return Checkout::failed(RetVal::InvalidDatumKey);
        }
        let guard = self.locks.acquire(key).await;
        let datum = match self.read(key).await {
            Ok(datum) => datum,
            Err(error) => {
                tracing::error!(key, %error, "brain retrieve failed");
                drop(guard);
                self.locks.release(key).await;
                return Checkout::failed(RetVal::BrainFailed);
            }
        };
        let token = if rw {
            self.locks.lease(key, guard).await
        } else {
            drop(guard);
            self.locks.release(key).await;
            String::new()
        };
        Checkout {
            token,
            datum,
            ret: RetVal::Ok,
        }
    }

    /// Store `blob` under `key` and release the lease held by `token`.
    pub async fn update(&self, key: &str, token: &str, blob: &[u8]) -> RetVal {
        if token.is_empty() {
            return RetVal::Ok;
        }
        let Some(lease) = self.locks.take_lease(key, token).await else {
            tracing::warn!(key, "update with an expired or unknown lock token");
            return RetVal::DatumLockExpired;
        };
        let ret = match self.write(key, blob).await {
            Ok(()) => RetVal::Ok,
            Err(error) => {
                tracing::error!(key, %error, "brain store failed");
                RetVal::BrainFailed
            }
        };
        drop(lease);
        self.locks.release(key).await;
        ret
    }

    /// Release a read-write checkout without storing anything.
    pub async fn checkin(&self, key: &str, token: &str) {
        if token.is_empty() {
            return;
        }
        if let Some(lease) = self.locks.take_lease(key, token).await {
            drop(lease);
            self.locks.release(key).await;
        }
    }

    /// Read a datum without locking.
    pub async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, BrainError> {
        if !valid_key(key) {
            return Err(BrainError::InvalidKey(key.to_string()));
        }
        self.read(key).await
    }

    /// Write a datum outside of any checkout, holding its lock for the
    /// duration of the write.
    pub async fn store(&self, key: &str, blob: &[u8]) -> Result<(), BrainError> {
        if !valid_key(key) {
            return Err(BrainError::InvalidKey(key.to_string()));
        }
        let guard = self.locks.acquire(key).await;
        let result = self.write(key, blob).await;
        drop(guard);
        self.locks.release(key).await;
        result
    }

    pub async fn delete(&self, key: &str) -> Result<(), BrainError> {
        if !valid_key(key) {
            return Err(BrainError::InvalidKey(key.to_string()));
        }
        self.backend.delete(key).await
    }

    pub async fn list(&self) -> Result<Vec<String>, BrainError> {
        let mut keys = self.backend.list().await?;
        keys.sort();
        Ok(keys)
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, BrainError> {
        let Some(raw) = self.backend.retrieve(key).await? else {
            return Ok(None);
        };
        match &self.crypt {
            Some(crypt) => crypt.decrypt(&raw).map(Some),
            None => Ok(Some(raw)),
        }
    }

    async fn write(&self, key: &str, blob: &[u8]) -> Result<(), BrainError> {
        match &self.crypt {
            Some(crypt) => self.backend.store(key, &crypt.encrypt(blob)?).await,
            None => self.backend.store(key, blob).await,
        }
    }
}

impl std::fmt::Debug for Brain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brain")
            .field("encrypted", &self.encrypted())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(valid_key("links:bookmarks"));
        assert!(valid_key("bot_subscriptions"));
        assert!(!valid_key("has space"));
        assert!(!valid_key(""));
        assert!(!valid_key("dotted.key"));
    }

    #[tokio::test]
    async fn rw_checkout_of_missing_key_then_update_creates_it() {
        let brain = Brain::in_memory();
        let checkout = brain.checkout("fresh", true).await;
        assert_eq!(checkout.ret, RetVal::Ok);
        assert!(!checkout.exists());
        assert_eq!(checkout.token.len(), 16);

        assert_eq!(brain.update("fresh", &checkout.token, b"value").await, RetVal::Ok);
        let again = brain.checkout("fresh", false).await;
        assert_eq!(again.datum.as_deref(), Some(&b"value"[..]));
        assert!(again.token.is_empty());
        assert_eq!(brain.locks().tracked_keys().await, 0);
    }

    #[tokio::test]
    async fn tokens_are_single_use() {
        let brain = Brain::in_memory();
        let checkout = brain.checkout("k", true).await;
        assert_eq!(brain.update("k", &checkout.token, b"1").await, RetVal::Ok);
        assert_eq!(
            brain.update("k", &checkout.token, b"2").await,
            RetVal::DatumLockExpired
        );
        assert_eq!(brain.fetch("k").await.expect("fetch"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn empty_token_update_is_a_no_op() {
        let brain = Brain::in_memory();
        assert_eq!(brain.update("k", "", b"ignored").await, RetVal::Ok);
        assert_eq!(brain.fetch("k").await.expect("fetch"), None);
    }

    #[tokio::test]
    async fn expired_lease_rejects_update() {
        let brain = Brain::new(Arc::new(MemBrain::new()), None, Duration::from_millis(200));
        let checkout = brain.checkout("slow", true).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            brain.update("slow", &checkout.token, b"late").await,
            RetVal::DatumLockExpired
        );
        // The watchdog released the datum, so a new checkout proceeds.
        let next = brain.checkout("slow", true).await;
        assert_eq!(next.ret, RetVal::Ok);
        brain.checkin("slow", &next.token).await;
    }

    #[tokio::test]
    async fn concurrent_increments_are_serialized() {
        let brain = Arc::new(Brain::new(
            Arc::new(MemBrain::new()),
            None,
            Duration::from_secs(5),
        ));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let brain = brain.clone();
            handles.push(tokio::spawn(async move {
                let checkout = brain.checkout("counter", true).await;
                let current: u64 = checkout
                    .datum
                    .map(|raw| String::from_utf8_lossy(&raw).parse().unwrap_or(0))
                    .unwrap_or(0);
                tokio::task::yield_now().await;
                let next = (current + 1).to_string();
                brain.update("counter", &checkout.token, next.as_bytes()).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join"), RetVal::Ok);
        }
        let total = brain.fetch("counter").await.expect("fetch").expect("exists");
        assert_eq!(total, b"16");
    }

    #[tokio::test]
    async fn invalid_keys_are_refused() {
        let brain = Brain::in_memory();
        let checkout = brain.checkout("bad key", true).await;
        assert_eq!(checkout.ret, RetVal::InvalidDatumKey);
        assert!(brain.store("bad/key", b"x").await.is_err());
    }

    #[tokio::test]
    async fn encrypted_brain_stores_ciphertext() {
        let backend = Arc::new(MemBrain::new());
        let crypt = Crypt::new(&[7u8; crypt::KEY_LEN]);
        let brain = Brain::new(backend.clone(), Some(crypt), DEFAULT_LOCK_TIMEOUT);
        brain.store("secret", b"plaintext").await.expect("store");
        let raw = backend.retrieve("secret").await.expect("retrieve").expect("exists");
        assert_ne!(raw, b"plaintext");
        assert_eq!(
            brain.fetch("secret").await.expect("fetch"),
            Some(b"plaintext".to_vec())
        );
    }
}
