//! Short-term memories: small strings scoped to a user in a channel (and
//! optionally a thread) that fade after a few minutes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a short-term memory survives without being refreshed.
pub const SHORT_TERM_LIFETIME: Duration = Duration::from_secs(7 * 60);

/// Prefix for context memories ("it", "that") remembered by the dispatcher.
pub const CONTEXT_PREFIX: &str = "context:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryKey {
    pub key: String,
    pub user: String,
    pub channel: String,
    /// Empty unless the memory is scoped to a thread.
    pub thread: String,
}

impl MemoryKey {
    pub fn new(key: &str, user: &str, channel: &str, thread: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            user: user.to_string(),
            channel: channel.to_string(),
            thread: thread.unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug)]
struct ShortTermMemory {
    value: String,
    remembered: Instant,
}

#[derive(Debug)]
pub struct ShortTermMemories {
    memories: Mutex<HashMap<MemoryKey, ShortTermMemory>>,
    lifetime: Duration,
}

impl Default for ShortTermMemories {
    fn default() -> Self {
        Self::with_lifetime(SHORT_TERM_LIFETIME)
    }
}

impl ShortTermMemories {
    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            memories: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    /// Remember `value`; an empty value forgets the key.
    pub fn remember(&self, key: MemoryKey, value: &str) {
        let Ok(mut memories) = self.memories.lock() else {
            return;
        };
        if value.is_empty() {
            memories.remove(&key);
            return;
        }
        memories.insert(
            key,
            ShortTermMemory {
                value: value.to_string(),
                remembered: Instant::now(),
            },
        );
    }

    /// Recall a live memory; expired entries are dropped on access.
    pub fn recall(&self, key: &MemoryKey) -> Option<String> {
        let mut memories = self.memories.lock().ok()?;
        match memories.get(key) {
            Some(memory) if memory.remembered.elapsed() <= self.lifetime => {
                Some(memory.value.clone())
            }
            Some(_) => {
                memories.remove(key);
                None
            }
            None => None,
        }
    }

    /// Drop everything older than the lifetime. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let Ok(mut memories) = self.memories.lock() else {
            return 0;
        };
        let before = memories.len();
        let lifetime = self.lifetime;
        memories.retain(|_, memory| memory.remembered.elapsed() <= lifetime);
        before - memories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memories_are_scoped_to_user_and_channel() {
        let memories = ShortTermMemories::default();
        let key = MemoryKey::new("Ferris Bueller", "david", "general", None);
        memories.remember(key.clone(), "a Righteous Dude");

        assert_eq!(memories.recall(&key).as_deref(), Some("a Righteous Dude"));
        assert!(memories
            .recall(&MemoryKey::new("Ferris Bueller", "carol", "general", None))
            .is_none());
        assert!(memories
            .recall(&MemoryKey::new("Ferris Bueller", "david", "random", None))
            .is_none());
    }

    #[test]
    fn empty_value_forgets() {
        let memories = ShortTermMemories::default();
        let key = MemoryKey::new("k", "u", "c", Some("t1"));
        memories.remember(key.clone(), "v");
        memories.remember(key.clone(), "");
        assert!(memories.recall(&key).is_none());
    }

    #[test]
    fn expired_memories_are_swept() {
        let memories = ShortTermMemories::with_lifetime(Duration::ZERO);
        memories.remember(MemoryKey::new("k", "u", "c", None), "v");
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(memories.sweep(), 1);
    }
}
