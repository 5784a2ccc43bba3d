//! Directory-backed brain: one file per key.
//!
//! Keys may contain `:`, which is stored as `%3A` so the directory stays
//! portable.

use super::SimpleBrain;
use crate::base64_file::write_private;
use crate::error::BrainError;
use std::path::PathBuf;

const COLON_ESCAPE: &str = "%3A";

#[derive(Debug)]
pub struct FileBrain {
    dir: PathBuf,
}

impl FileBrain {
    pub fn open(dir: PathBuf) -> Result<Self, BrainError> {
        std::fs::create_dir_all(&dir)
            .map_err(|error| BrainError::Storage(format!("{}: {error}", dir.display())))?;
        tracing::info!(dir = %dir.display(), "file brain opened");
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key.replace(':', COLON_ESCAPE))
    }
}

fn storage(error: std::io::Error, key: &str) -> BrainError {
    BrainError::Storage(format!("{key}: {error}"))
}

#[async_trait::async_trait]
impl SimpleBrain for FileBrain {
    async fn store(&self, key: &str, blob: &[u8]) -> Result<(), BrainError> {
        let path = self.path_for(key);
        let blob = blob.to_vec();
        tokio::task::spawn_blocking(move || write_private(&path, &blob))
            .await
            .map_err(|error| BrainError::Storage(error.to_string()))?
            .map_err(|error| BrainError::Storage(format!("{key}: {error:#}")))
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, BrainError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(storage(error, key)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, BrainError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|error| storage(error, "<list>"))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| storage(error, "<list>"))?
        {
            if let Some(name) = entry.file_name().to_str() {
                keys.push(name.replace(COLON_ESCAPE, ":"));
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), BrainError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(storage(error, key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn namespaced_keys_survive_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let brain = FileBrain::open(dir.path().join("brain")).expect("open");
        brain.store("links:bookmarks", b"{}").await.expect("store");
        assert!(dir.path().join("brain/links%3Abookmarks").exists());
        assert_eq!(brain.list().await.expect("list"), vec!["links:bookmarks"]);
        assert_eq!(
            brain.retrieve("links:bookmarks").await.expect("retrieve"),
            Some(b"{}".to_vec())
        );
        brain.delete("links:bookmarks").await.expect("delete");
        assert_eq!(brain.retrieve("links:bookmarks").await.expect("retrieve"), None);
        brain.delete("links:bookmarks").await.expect("deleting twice is fine");
    }
}
