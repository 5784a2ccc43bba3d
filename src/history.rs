//! Pipeline run histories.
//!
//! Each job run (and plugin runs that ask for it) gets a [`HistoryLogger`]
//! keyed by a tag and a run index. Providers keep the most recent `keep`
//! runs per tag. The `mem` provider holds logs in bounded line buffers; the
//! `file` provider writes `<Directory>/<tag>/run-<index>.log`.

use crate::brain::Brain;
use crate::config::Paths;
use crate::linebuffer::LineBuffer;
use crate::retval::RetVal;

use anyhow::Context as _;
use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Brain key holding the next run index for every history tag.
pub const HISTORY_INDEX_KEY: &str = "bot:_histories";

const MEM_LOG_SIZE: usize = 65536;
const MEM_LOG_LINE: usize = 4096;

/// Receives output for one pipeline run.
pub trait HistoryLogger: Send + Sync {
    fn log(&self, line: &str);

    /// Start a named section, separating the output of one task from the next.
    fn section(&self, task: &str, desc: &str);

    fn close(&self);
}

/// Stores and retrieves run histories.
pub trait HistoryProvider: Send + Sync {
    fn new_history(&self, tag: &str, index: usize, keep: usize) -> anyhow::Result<Arc<dyn HistoryLogger>>;

    /// Full text of a stored run.
    fn get_log(&self, tag: &str, index: usize) -> anyhow::Result<String>;

    /// Permanent link to a run, when the provider publishes one.
    fn history_url(&self, _tag: &str, _index: usize) -> Option<String> {
        None
    }
}

/// Reference users quote to find a run: `<tag>:<index>`.
pub fn log_ref(tag: &str, index: usize) -> String {
    format!("{tag}:{index}")
}

/// Open the provider named by the robot's `HistoryProvider` setting.
pub fn open_provider(
    name: &str,
    config: Option<&serde_json::Value>,
    paths: &Paths,
) -> anyhow::Result<Arc<dyn HistoryProvider>> {
    match name {
        "" | "mem" | "memory" => Ok(Arc::new(MemHistory::new())),
        "file" => {
            let directory = config
                .and_then(|config| config.get("Directory"))
                .and_then(|value| value.as_str())
                .context("HistoryConfig missing value for Directory required by 'file' history provider")?;
            let url_prefix = config
                .and_then(|config| config.get("URLPrefix"))
                .and_then(|value| value.as_str())
                .unwrap_or_default();
            let directory = PathBuf::from(directory);
            let directory = if directory.is_absolute() {
                directory
            } else {
                paths.home_dir.join(directory)
            };
            Ok(Arc::new(FileHistory::open(directory, url_prefix)?))
        }
        other => anyhow::bail!("unknown history provider '{other}'"),
    }
}

/// Allocate the next run index for `tag`, persisted in the brain.
pub async fn next_index(brain: &Brain, tag: &str) -> usize {
    let checkout = brain.checkout(HISTORY_INDEX_KEY, true).await;
    if checkout.ret != RetVal::Ok {
        tracing::error!(tag, ret = %checkout.ret, "failed to check out history index");
        return 0;
    }
    let mut indexes: BTreeMap<String, usize> = checkout
        .datum
        .as_deref()
        .and_then(|raw| serde_json::from_slice(raw).ok())
        .unwrap_or_default();
    let index = indexes.get(tag).copied().unwrap_or(0);
    indexes.insert(tag.to_string(), index + 1);
    match serde_json::to_vec(&indexes) {
        Ok(raw) => {
            let ret = brain.update(HISTORY_INDEX_KEY, &checkout.token, &raw).await;
            if ret != RetVal::Ok {
                tracing::error!(tag, %ret, "failed to store history index");
            }
        }
        Err(error) => {
            tracing::error!(tag, %error, "failed to encode history index");
            brain.checkin(HISTORY_INDEX_KEY, &checkout.token).await;
        }
    }
    index
}

fn sanitize_tag(tag: &str) -> String {
    tag.replace(['\\', '/'], ":")
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y/%m/%d %H:%M:%S").to_string()
}

/// In-memory provider.
#[derive(Default)]
pub struct MemHistory {
    logs: Mutex<HashMap<String, BTreeMap<usize, Arc<MemLog>>>>,
}

impl MemHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryProvider for MemHistory {
    fn new_history(&self, tag: &str, index: usize, keep: usize) -> anyhow::Result<Arc<dyn HistoryLogger>> {
        let log = Arc::new(MemLog {
            buffer: Mutex::new(LineBuffer::new(MEM_LOG_SIZE, MEM_LOG_LINE, " ...")),
        });
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| anyhow::anyhow!("history map poisoned"))?;
        let runs = logs.entry(tag.to_string()).or_default();
        runs.insert(index, log.clone());
        let keep = keep.max(1);
        while runs.len() > keep {
            runs.pop_first();
        }
        Ok(log)
    }

    fn get_log(&self, tag: &str, index: usize) -> anyhow::Result<String> {
        let logs = self
            .logs
            .lock()
            .map_err(|_| anyhow::anyhow!("history map poisoned"))?;
        let log = logs
            .get(tag)
            .and_then(|runs| runs.get(&index))
            .with_context(|| format!("no history for {}", log_ref(tag, index)))?;
        Ok(log
            .buffer
            .lock()
            .map(|buffer| buffer.snapshot())
            .unwrap_or_default())
    }
}

struct MemLog {
    buffer: Mutex<LineBuffer>,
}

impl HistoryLogger for MemLog {
    fn log(&self, line: &str) {
        if let Ok(mut buffer) = self.buffer.lock() {
            let _ = buffer.write_line(&format!("{} {line}", timestamp()));
        }
    }

    fn section(&self, task: &str, desc: &str) {
        if let Ok(mut buffer) = self.buffer.lock() {
            let _ = buffer.write_line(&format!("*** {task} - {desc}"));
        }
    }

    fn close(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.close();
        }
    }
}

/// File-backed provider.
pub struct FileHistory {
    directory: PathBuf,
    url_prefix: String,
}

impl FileHistory {
    pub fn open(directory: PathBuf, url_prefix: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("creating history directory {}", directory.display()))?;
        tracing::info!(directory = %directory.display(), "initialized file history provider");
        Ok(Self {
            directory,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        })
    }

    fn run_path(&self, tag: &str, index: usize) -> PathBuf {
        self.directory
            .join(sanitize_tag(tag))
            .join(format!("run-{index}.log"))
    }
}

impl HistoryProvider for FileHistory {
    fn new_history(&self, tag: &str, index: usize, keep: usize) -> anyhow::Result<Arc<dyn HistoryLogger>> {
        let dir = self.directory.join(sanitize_tag(tag));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating history directory {}", dir.display()))?;
        let path = self.run_path(tag, index);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("creating history file {}", path.display()))?;

        if let Some(oldest) = index.checked_sub(keep) {
            for old in (0..=oldest).rev() {
                let stale = self.run_path(tag, old);
                if !stale.exists() {
                    break;
                }
                if let Err(error) = std::fs::remove_file(&stale) {
                    tracing::error!(path = %stale.display(), %error, "failed to remove old history");
                    break;
                }
            }
        }

        Ok(Arc::new(FileLog {
            file: Mutex::new(Some(file)),
        }))
    }

    fn get_log(&self, tag: &str, index: usize) -> anyhow::Result<String> {
        let path = self.run_path(tag, index);
        std::fs::read_to_string(&path).with_context(|| format!("reading history {}", path.display()))
    }

    fn history_url(&self, tag: &str, index: usize) -> Option<String> {
        if self.url_prefix.is_empty() {
            return None;
        }
        Some(format!("{}/{}/run-{index}.log", self.url_prefix, sanitize_tag(tag)))
    }
}

struct FileLog {
    file: Mutex<Option<std::fs::File>>,
}

impl FileLog {
    fn write(&self, text: &str) {
        if let Ok(mut file) = self.file.lock()
            && let Some(file) = file.as_mut()
            && let Err(error) = writeln!(file, "{text}")
        {
            tracing::warn!(%error, "failed to write history line");
        }
    }
}

impl HistoryLogger for FileLog {
    fn log(&self, line: &str) {
        self.write(&format!("{} {line}", timestamp()));
    }

    fn section(&self, task: &str, desc: &str) {
        self.write(&format!("*** {task} - {desc}"));
    }

    fn close(&self) {
        if let Ok(mut file) = self.file.lock() {
            file.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_history_keeps_recent_runs() {
        let history = MemHistory::new();
        for index in 0..4 {
            let log = history.new_history("backup", index, 2).expect("new history");
            log.section("backup", "nightly");
            log.log(&format!("OUT run {index}"));
            log.close();
        }
        assert!(history.get_log("backup", 1).is_err());
        let text = history.get_log("backup", 3).expect("latest run");
        assert!(text.starts_with("*** backup - nightly\n"));
        assert!(text.contains("OUT run 3"));
    }

    #[test]
    fn file_history_writes_and_prunes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let history = FileHistory::open(dir.path().to_path_buf(), "https://logs.example.com/").expect("open");
        for index in 0..3 {
            let log = history.new_history("ops/deploy", index, 1).expect("new history");
            log.log("ERR something");
            log.close();
        }
        assert!(dir.path().join("ops:deploy/run-2.log").exists());
        assert!(!dir.path().join("ops:deploy/run-0.log").exists());
        assert!(history.get_log("ops/deploy", 2).expect("read").contains("ERR something"));
        assert_eq!(
            history.history_url("ops/deploy", 2).as_deref(),
            Some("https://logs.example.com/ops:deploy/run-2.log")
        );
    }

    #[tokio::test]
    async fn run_indexes_increment_per_tag() {
        let brain = Brain::in_memory();
        assert_eq!(next_index(&brain, "backup").await, 0);
        assert_eq!(next_index(&brain, "backup").await, 1);
        assert_eq!(next_index(&brain, "deploy").await, 0);
        assert_eq!(log_ref("backup", 1), "backup:1");
    }
}
