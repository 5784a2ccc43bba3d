//! In-process brain backend, used for tests and throwaway robots.

use super::SimpleBrain;
use crate::error::BrainError;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemBrain {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemBrain {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SimpleBrain for MemBrain {
    async fn store(&self, key: &str, blob: &[u8]) -> Result<(), BrainError> {
        self.data.write().await.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, BrainError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, BrainError> {
        Ok(self.data.read().await.keys().cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), BrainError> {
        self.data.write().await.remove(key);
        Ok(())
    }
}
