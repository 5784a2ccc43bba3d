//! Long-term datums and short-term memories.

use super::Robot;
use crate::brain::MemoryKey;
use crate::brain::shortterm::CONTEXT_PREFIX;
use crate::retval::RetVal;

use serde_json::Value;

/// A datum checked out of the brain, decoded from JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatumCheckout {
    /// Pass back to [`Robot::update_datum`] or [`Robot::check_in_datum`];
    /// empty for read-only checkouts.
    pub lock_token: String,
    pub exists: bool,
    pub datum: Option<Value>,
    pub ret: RetVal,
}

impl DatumCheckout {
    fn failed(ret: RetVal) -> Self {
        Self {
            ret,
            ..Default::default()
        }
    }
}

impl Robot {
    /// The memory namespace: a privileged task running in a pipeline with
    /// an inherited namespace shares it, everything else uses its own.
    fn memory_namespace(&self) -> String {
        let state = self.worker.state();
        match &state.inherited_namespace {
            Some(namespace) if self.task.common.privileged => namespace.clone(),
            _ => self.task.common.namespace.clone(),
        }
    }

    fn datum_key(&self, key: &str) -> Result<String, RetVal> {
        if key.is_empty() || key.contains(':') {
            tracing::warn!(task = self.task.name(), key, "datum keys may not contain ':'");
            return Err(RetVal::InvalidDatumKey);
        }
        Ok(format!("{}:{key}", self.memory_namespace()))
    }

    /// Check out a datum. A read-write checkout must be followed by
    /// `update_datum` or `check_in_datum` before the lock expires.
    pub async fn check_out_datum(&self, key: &str, rw: bool) -> DatumCheckout {
        let key = match self.datum_key(key) {
            Ok(key) => key,
            Err(ret) => return DatumCheckout::failed(ret),
        };
        let checkout = self.bot.brain.checkout(&key, rw).await;
        if checkout.ret != RetVal::Ok {
            return DatumCheckout::failed(checkout.ret);
        }
        let datum = match checkout.datum.as_deref().map(serde_json::from_slice::<Value>) {
            None => None,
            Some(Ok(value)) => Some(value),
            Some(Err(error)) => {
                tracing::error!(task = self.task.name(), %key, %error, "datum is not valid JSON");
                self.bot.brain.checkin(&key, &checkout.token).await;
                return DatumCheckout::failed(RetVal::DataFormatError);
            }
        };
        DatumCheckout {
            lock_token: checkout.token,
            exists: datum.is_some(),
            datum,
            ret: RetVal::Ok,
        }
    }

    pub async fn update_datum(&self, key: &str, lock_token: &str, datum: &Value) -> RetVal {
        let key = match self.datum_key(key) {
            Ok(key) => key,
            Err(ret) => return ret,
        };
        let blob = match serde_json::to_vec(datum) {
            Ok(blob) => blob,
            Err(error) => {
                tracing::error!(task = self.task.name(), %key, %error, "encoding datum");
                self.bot.brain.checkin(&key, lock_token).await;
                return RetVal::DataFormatError;
            }
        };
        self.bot.brain.update(&key, lock_token, &blob).await
    }

    pub async fn check_in_datum(&self, key: &str, lock_token: &str) {
        if let Ok(key) = self.datum_key(key) {
            self.bot.brain.checkin(&key, lock_token).await;
        }
    }

    fn memory_key(&self, key: &str, shared: bool, thread: bool) -> MemoryKey {
        let envelope = self.worker.envelope();
        let user = if shared { "" } else { envelope.user.as_str() };
        let thread = (thread && !envelope.thread.is_empty()).then_some(envelope.thread.as_str());
        MemoryKey::new(key, user, &envelope.channel, thread)
    }

    /// Remember a value for the user in this channel for a few minutes.
    /// An empty value forgets. `shared` memories are visible to every user.
    pub fn remember(&self, key: &str, value: &str, shared: bool) {
        self.bot
            .brain
            .short_term()
            .remember(self.memory_key(key, shared, false), value);
    }

    /// Like [`remember`](Self::remember), scoped to the message's thread.
    pub fn remember_thread(&self, key: &str, value: &str, shared: bool) {
        self.bot
            .brain
            .short_term()
            .remember(self.memory_key(key, shared, true), value);
    }

    /// Record conversational context, e.g. the `item` being discussed.
    pub fn remember_context(&self, context: &str, value: &str) {
        self.remember(&format!("{CONTEXT_PREFIX}{context}"), value, false);
    }

    pub fn remember_context_thread(&self, context: &str, value: &str) {
        self.remember_thread(&format!("{CONTEXT_PREFIX}{context}"), value, false);
    }

    /// Recall a short-term memory, preferring one from the current thread.
    pub fn recall(&self, key: &str, shared: bool) -> String {
        let memories = self.bot.brain.short_term();
        memories
            .recall(&self.memory_key(key, shared, true))
            .or_else(|| memories.recall(&self.memory_key(key, shared, false)))
            .unwrap_or_default()
    }
}
