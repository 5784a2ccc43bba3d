//! Thread subscriptions: a plugin may claim a thread and then receive every
//! non-command message posted to it, with the command `subscribed`.
//!
//! The registry is persisted to the brain under [`SUBSCRIPTIONS_KEY`] and
//! entries expire after [`SUBSCRIPTION_LIFETIME`] without traffic.

use crate::brain::Brain;
use crate::retval::RetVal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

pub const SUBSCRIPTIONS_KEY: &str = "bot:_subscriptions";

pub const SUBSCRIPTION_LIFETIME: chrono::Duration = chrono::Duration::days(14);

const KEY_SEPARATOR: &str = "{|}";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Empty for entries restored from the pre-protocol format.
    pub protocol: String,
    pub channel: String,
    pub thread: String,
}

impl SubscriptionKey {
    pub fn new(protocol: &str, channel: &str, thread: &str) -> Self {
        Self {
            protocol: crate::message::normalize_protocol(protocol),
            channel: channel.to_string(),
            thread: thread.to_string(),
        }
    }

    fn legacy(&self) -> Self {
        Self {
            protocol: String::new(),
            channel: self.channel.clone(),
            thread: self.thread.clone(),
        }
    }

    fn encode(&self) -> String {
        [self.protocol.as_str(), &self.channel, &self.thread].join(KEY_SEPARATOR)
    }

    /// Parse `proto{|}channel{|}thread`, or the legacy `channel{|}thread`.
    fn decode(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.splitn(3, KEY_SEPARATOR).collect();
        match parts.as_slice() {
            [channel, thread] => Some(Self {
                protocol: String::new(),
                channel: channel.to_string(),
                thread: thread.to_string(),
            }),
            [protocol, channel, thread] => Some(Self::new(protocol, channel, thread)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subscriber {
    pub plugin: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<SubscriptionKey, Subscriber>,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    inner: Mutex<Registry>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `plugin` to the thread. Returns false, leaving the registry
    /// untouched, when another plugin already holds it.
    pub fn subscribe(&self, key: &SubscriptionKey, plugin: &str) -> bool {
        let Ok(mut registry) = self.inner.lock() else {
            return false;
        };
        if let Some(existing) = registry.entries.get(key) {
            if existing.plugin != plugin {
                tracing::error!(
                    plugin,
                    holder = %existing.plugin,
                    channel = %key.channel,
                    thread = %key.thread,
                    "thread already subscribed by another plugin"
                );
                return false;
            }
            return true;
        }
        let legacy = key.legacy();
        if !key.protocol.is_empty()
            && let Some(existing) = registry.entries.get(&legacy)
        {
            if existing.plugin != plugin {
                tracing::error!(
                    plugin,
                    holder = %existing.plugin,
                    "thread held by a legacy subscription"
                );
                return false;
            }
            registry.entries.remove(&legacy);
            tracing::debug!(plugin, protocol = %key.protocol, "migrated legacy subscription");
        }
        registry.entries.insert(
            key.clone(),
            Subscriber {
                plugin: plugin.to_string(),
                timestamp: Utc::now(),
            },
        );
        registry.dirty = true;
        tracing::debug!(plugin, channel = %key.channel, thread = %key.thread, "plugin subscribed to thread");
        true
    }

    /// Drop `plugin`'s subscription. Returns false only when another plugin
    /// holds the thread.
    pub fn unsubscribe(&self, key: &SubscriptionKey, plugin: &str) -> bool {
        let Ok(mut registry) = self.inner.lock() else {
            return false;
        };
        let mut candidates = vec![key.clone()];
        if !key.protocol.is_empty() {
            candidates.push(key.legacy());
        }
        for candidate in candidates {
            let Some(existing) = registry.entries.get(&candidate) else {
                continue;
            };
            if existing.plugin != plugin {
                tracing::error!(plugin, holder = %existing.plugin, "cannot unsubscribe another plugin's thread");
                return false;
            }
            registry.entries.remove(&candidate);
            registry.dirty = true;
            return true;
        }
        tracing::warn!(plugin, channel = %key.channel, thread = %key.thread, "unsubscribe without a subscription");
        true
    }

    /// Find the subscriber for a thread, refreshing its timestamp.
    pub fn lookup(&self, key: &SubscriptionKey) -> Option<String> {
        let mut registry = self.inner.lock().ok()?;
        let legacy = key.legacy();
        let found = if registry.entries.contains_key(key) {
            key.clone()
        } else if !key.protocol.is_empty() && registry.entries.contains_key(&legacy) {
            legacy
        } else {
            return None;
        };
        let subscriber = registry.entries.get_mut(&found)?;
        subscriber.timestamp = Utc::now();
        Some(subscriber.plugin.clone())
    }

    /// Remove entries idle longer than the lifetime. Returns whether the
    /// registry needs saving.
    pub fn expire(&self, now: DateTime<Utc>) -> bool {
        let Ok(mut registry) = self.inner.lock() else {
            return false;
        };
        let before = registry.entries.len();
        registry
            .entries
            .retain(|_, subscriber| now - subscriber.timestamp <= SUBSCRIPTION_LIFETIME);
        let expired = before - registry.entries.len();
        if expired > 0 {
            tracing::debug!(expired, "expired thread subscriptions");
            registry.dirty = true;
        }
        registry.dirty
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|registry| registry.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let encoded: HashMap<String, Subscriber> = self
            .inner
            .lock()
            .map(|registry| {
                registry
                    .entries
                    .iter()
                    .map(|(key, subscriber)| (key.encode(), subscriber.clone()))
                    .collect()
            })
            .unwrap_or_default();
        serde_json::to_vec(&encoded)
    }

    /// Load a stored registry; every restored entry gets a fresh timestamp.
    fn load_json(&self, raw: &[u8]) -> serde_json::Result<usize> {
        let stored: HashMap<String, Subscriber> = serde_json::from_slice(raw)?;
        let now = Utc::now();
        let entries: HashMap<SubscriptionKey, Subscriber> = stored
            .into_iter()
            .filter_map(|(raw_key, mut subscriber)| {
                let Some(key) = SubscriptionKey::decode(&raw_key) else {
                    tracing::warn!(key = %raw_key, "skipping malformed subscription key");
                    return None;
                };
                subscriber.timestamp = now;
                Some((key, subscriber))
            })
            .collect();
        let count = entries.len();
        if let Ok(mut registry) = self.inner.lock() {
            registry.entries = entries;
            registry.dirty = false;
        }
        Ok(count)
    }

    /// Restore the registry from the brain at startup.
    pub async fn restore(&self, brain: &Brain) {
        let checkout = brain.checkout(SUBSCRIPTIONS_KEY, false).await;
        if checkout.ret != RetVal::Ok {
            tracing::error!(ret = %checkout.ret, "failed to read stored subscriptions");
            return;
        }
        let Some(raw) = checkout.datum else {
            tracing::info!("no stored subscriptions");
            return;
        };
        match self.load_json(&raw) {
            Ok(count) => tracing::info!(count, "restored thread subscriptions"),
            Err(error) => tracing::error!(%error, "stored subscriptions are malformed"),
        }
    }

    /// Save the registry when it has changed since the last save.
    pub async fn save_if_dirty(&self, brain: &Brain) {
        let dirty = self.inner.lock().map(|registry| registry.dirty).unwrap_or(false);
        if !dirty {
            return;
        }
        let checkout = brain.checkout(SUBSCRIPTIONS_KEY, true).await;
        if checkout.ret != RetVal::Ok {
            tracing::error!(ret = %checkout.ret, "failed to check out subscriptions datum");
            return;
        }
        let blob = match self.to_json() {
            Ok(blob) => blob,
            Err(error) => {
                tracing::error!(%error, "failed to encode subscriptions");
                brain.checkin(SUBSCRIPTIONS_KEY, &checkout.token).await;
                return;
            }
        };
        if let Ok(mut registry) = self.inner.lock() {
            registry.dirty = false;
        }
        let ret = brain.update(SUBSCRIPTIONS_KEY, &checkout.token, &blob).await;
        if ret != RetVal::Ok {
            tracing::error!(%ret, "failed to save subscriptions");
        }
    }
}
