//! Workers: one per running pipeline, registered while active.

use super::{Envelope, PipelineType, Stage, TaskSpec};
use crate::catalog::Task;
use crate::env::Environment;
use crate::history::HistoryLogger;
use crate::linebuffer::LineBuffer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Output kept per pipeline for failure reports when there is no history.
const OUTPUT_SIZE: usize = 16384;
const OUTPUT_LINE: usize = 1024;

/// Mutable per-pipeline state, guarded by the worker's mutex.
#[derive(Default)]
pub struct PipelineState {
    pub envelope: Envelope,
    pub task: Option<Arc<Task>>,
    pub task_name: String,
    pub task_type: &'static str,
    pub command: String,
    pub args: Vec<String>,
    pub stage: Stage,
    pub next_tasks: Vec<TaskSpec>,
    pub final_tasks: Vec<TaskSpec>,
    pub fail_tasks: Vec<TaskSpec>,
    /// Values set with `SetParameter`, plus job start variables.
    pub environment: Environment,
    /// Environment composed for the task currently running.
    pub task_env: Environment,
    pub inherited_namespace: Option<String>,
    pub inherited_parameter_sets: Vec<String>,
    pub base_dir: PathBuf,
    pub working_dir: PathBuf,
    pub exclusive_tag: String,
    pub exclusive: bool,
    pub queue_task: bool,
    pub abort_pipeline: bool,
    pub elevated: bool,
    pub privileged: bool,
    pub history: Option<Arc<dyn HistoryLogger>>,
    pub history_tag: String,
    pub run_index: usize,
    pub pipe_name: String,
    pub pipe_desc: String,
    pub job_name: String,
    pub final_failed: Vec<String>,
    pub err_string: String,
}

pub struct Worker {
    pub id: u64,
    /// Random 8-hex-digit ID, unique among active workers.
    pub eid: String,
    pub parent: Option<String>,
    pub ptype: PipelineType,
    pub automatic: bool,
    /// How the message addressed the robot: `alias`, `name`, `direct` or empty.
    pub cmd_mode: String,
    /// Fires on robot shutdown; children of this pipeline are killed.
    pub cancel: CancellationToken,
    state: Mutex<PipelineState>,
    output: Mutex<LineBuffer>,
}

impl Worker {
    pub fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn envelope(&self) -> Envelope {
        self.state().envelope.clone()
    }

    /// Record a line of task output in the history log and the pipeline's
    /// own output buffer.
    pub fn log_output(&self, line: &str) {
        let history = self.state().history.clone();
        if let Some(history) = history {
            history.log(line);
        }
        if let Ok(mut output) = self.output.lock() {
            let _ = output.write_line(line);
        }
    }

    pub fn section(&self, task: &str, desc: &str) {
        let history = self.state().history.clone();
        if let Some(history) = history {
            history.section(task, desc);
        }
        if let Ok(mut output) = self.output.lock() {
            let _ = output.write_line(&format!("*** {task} - {desc}"));
        }
    }

    /// Recent output of this pipeline.
    pub fn output(&self) -> String {
        self.output
            .lock()
            .map(|output| output.snapshot())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("eid", &self.eid)
            .field("parent", &self.parent)
            .field("ptype", &self.ptype)
            .finish_non_exhaustive()
    }
}

/// Registry of active workers, keyed by external ID.
#[derive(Debug, Default)]
pub struct Workers {
    next_id: AtomicU64,
    active: Mutex<HashMap<String, Arc<Worker>>>,
}

/// Everything needed to register a new worker.
#[derive(Debug)]
pub struct WorkerInit {
    pub envelope: Envelope,
    pub ptype: PipelineType,
    pub automatic: bool,
    pub cmd_mode: String,
    pub parent: Option<String>,
    pub cancel: CancellationToken,
}

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, init: WorkerInit) -> Arc<Worker> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let eid = loop {
            let candidate = format!("{:08x}", rand::random::<u32>());
            if !active.contains_key(&candidate) {
                break candidate;
            }
        };
        let worker = Arc::new(Worker {
            id,
            eid: eid.clone(),
            parent: init.parent,
            ptype: init.ptype,
            automatic: init.automatic,
            cmd_mode: init.cmd_mode,
            cancel: init.cancel,
            state: Mutex::new(PipelineState {
                envelope: init.envelope,
                ..Default::default()
            }),
            output: Mutex::new(LineBuffer::new(OUTPUT_SIZE, OUTPUT_LINE, " ...")),
        });
        active.insert(eid, worker.clone());
        tracing::debug!(id, eid = %worker.eid, ptype = ?worker.ptype, "registered worker");
        worker
    }

    pub fn deregister(&self, eid: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(eid);
        }
    }

    pub fn get(&self, eid: &str) -> Option<Arc<Worker>> {
        self.active.lock().ok()?.get(eid).cloned()
    }

    pub fn len(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(parent: Option<String>) -> WorkerInit {
        WorkerInit {
            envelope: Envelope::default(),
            ptype: PipelineType::PluginCommand,
            automatic: false,
            cmd_mode: String::new(),
            parent,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn external_ids_are_unique_and_released() {
        let workers = Workers::new();
        let parent = workers.register(init(None));
        let child = workers.register(init(Some(parent.eid.clone())));
        assert_ne!(parent.eid, child.eid);
        assert_eq!(parent.eid.len(), 8);
        assert_eq!(workers.len(), 2);

        let resolved = child
            .parent
            .as_deref()
            .and_then(|eid| workers.get(eid))
            .expect("parent is active");
        assert_eq!(resolved.id, parent.id);

        workers.deregister(&parent.eid);
        workers.deregister(&child.eid);
        assert!(workers.is_empty());
        assert!(workers.get(&child.eid).is_none());
    }

    #[test]
    fn output_is_buffered_without_history() {
        let workers = Workers::new();
        let worker = workers.register(init(None));
        worker.section("ping", "starting");
        worker.log_output("OUT pong");
        assert!(worker.output().contains("OUT pong"));
    }
}
