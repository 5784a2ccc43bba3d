//! The task catalog: plugins, jobs and plain tasks, plus the namespaces and
//! parameter sets they draw their environment from.
//!
//! A [`TaskList`] is immutable once built. [`Catalog`] publishes a new list
//! atomically on reload; readers holding the old `Arc` finish undisturbed.

pub mod build;
pub mod matcher;

pub use build::{TaskSource, build_task_list};
pub use matcher::{Anchor, InputMatcher, JobTrigger};

use crate::config::{HelpConf, Parameter, ScheduledTaskConf};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Extensions whose tasks run through the pipeline child protocol.
pub const INTERPRETED_EXTENSIONS: &[&str] = &["go", "lua", "js"];

/// How a task's code is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecKind {
    /// A handler compiled into the robot, looked up by name.
    InProcess { handler: String },
    /// A script or executable run as a child process.
    External { path: PathBuf },
    /// A script run by an interpreter under the pipeline child protocol.
    Interpreted { path: PathBuf, extension: String },
}

impl ExecKind {
    /// Classify an external path by its extension.
    pub fn external(path: PathBuf) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase);
        match extension {
            Some(ext) if INTERPRETED_EXTENSIONS.contains(&ext.as_str()) => Self::Interpreted {
                path,
                extension: ext,
            },
            _ => Self::External { path },
        }
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self, Self::InProcess { .. })
    }
}

/// Attributes shared by every kind of task.
#[derive(Debug, Clone)]
pub struct TaskCommon {
    pub name: String,
    /// Content hash of the task's merged configuration.
    pub id: String,
    pub description: String,
    pub exec: ExecKind,
    pub namespace: String,
    pub parameters: Vec<Parameter>,
    pub parameter_sets: Vec<String>,
    /// Default channel for jobs and scheduled runs.
    pub channel: String,
    pub channels: Vec<String>,
    pub all_channels: bool,
    pub direct_only: bool,
    pub allow_direct: bool,
    pub users: Vec<String>,
    pub require_admin: bool,
    pub elevator: String,
    pub authorizer: String,
    pub auth_require: String,
    pub reply_matchers: Vec<InputMatcher>,
    /// `Some(reason)` when the task failed validation or was switched off.
    pub disabled: Option<String>,
    pub privileged: bool,
    pub homed: bool,
    /// Free-form `Config` section, decoded on demand by the task.
    pub config: Option<serde_json::Value>,
}

impl TaskCommon {
    /// A task with default visibility: every channel, no restrictions.
    pub fn new(name: &str, exec: ExecKind) -> Self {
        Self {
            name: name.to_string(),
            id: String::new(),
            description: String::new(),
            exec,
            namespace: name.to_string(),
            parameters: Vec::new(),
            parameter_sets: Vec::new(),
            channel: String::new(),
            channels: Vec::new(),
            all_channels: true,
            direct_only: false,
            allow_direct: true,
            users: Vec::new(),
            require_admin: false,
            elevator: String::new(),
            authorizer: String::new(),
            auth_require: String::new(),
            reply_matchers: Vec::new(),
            disabled: None,
            privileged: false,
            homed: false,
            config: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PluginSpec {
    pub command_matchers: Vec<InputMatcher>,
    pub message_matchers: Vec<InputMatcher>,
    pub help: Vec<HelpConf>,
    pub admin_commands: Vec<String>,
    pub elevated_commands: Vec<String>,
    pub elevate_immediate_commands: Vec<String>,
    pub authorized_commands: Vec<String>,
    pub authorize_all_commands: bool,
    pub allowed_hidden_commands: Vec<String>,
    pub catch_all: bool,
    pub ambient_match_command: bool,
}

impl PluginSpec {
    /// Find the command matcher that accepts `text` and return its command
    /// and captured arguments.
    pub fn match_command(&self, text: &str, threaded: bool) -> Option<(String, Vec<String>)> {
        self.command_matchers
            .iter()
            .filter(|matcher| !(threaded && matcher.channel_only))
            .find_map(|matcher| {
                matcher
                    .captures(text)
                    .map(|args| (matcher.command.clone(), args))
            })
    }

    /// Same as [`match_command`](Self::match_command) for ambient matchers.
    pub fn match_message(&self, text: &str, threaded: bool) -> Option<(String, Vec<String>)> {
        self.message_matchers
            .iter()
            .filter(|matcher| !(threaded && matcher.channel_only))
            .find_map(|matcher| {
                matcher
                    .captures(text)
                    .map(|args| (matcher.command.clone(), args))
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub triggers: Vec<JobTrigger>,
    pub arguments: Vec<InputMatcher>,
    pub keep_logs: usize,
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Plain,
    Plugin(PluginSpec),
    Job(JobSpec),
}

#[derive(Debug, Clone)]
pub struct Task {
    pub common: TaskCommon,
    pub kind: TaskKind,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.common.name
    }

    pub fn plugin(&self) -> Option<&PluginSpec> {
        match &self.kind {
            TaskKind::Plugin(plugin) => Some(plugin),
            _ => None,
        }
    }

    pub fn job(&self) -> Option<&JobSpec> {
        match &self.kind {
            TaskKind::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn is_plugin(&self) -> bool {
        matches!(self.kind, TaskKind::Plugin(_))
    }

    pub fn is_job(&self) -> bool {
        matches!(self.kind, TaskKind::Job(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Plain => "task",
            TaskKind::Plugin(_) => "plugin",
            TaskKind::Job(_) => "job",
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.common.disabled.is_some()
    }

    /// Look up a reply matcher by label or command; jobs also search their
    /// argument prompts.
    pub fn reply_matcher(&self, id: &str) -> Option<&InputMatcher> {
        let arguments = self.job().map(|job| job.arguments.as_slice()).unwrap_or(&[]);
        self.common
            .reply_matchers
            .iter()
            .chain(arguments)
            .find(|matcher| matcher.reply_key() == id)
    }
}

/// An immutable snapshot of every configured task.
#[derive(Debug, Default)]
pub struct TaskList {
    tasks: Vec<Arc<Task>>,
    by_name: HashMap<String, Arc<Task>>,
    by_id: HashMap<String, Arc<Task>>,
    namespaces: HashMap<String, Vec<Parameter>>,
    parameter_sets: HashMap<String, Vec<Parameter>>,
    scheduled: Vec<ScheduledTaskConf>,
}

impl TaskList {
    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        self.by_name.get(name).cloned()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Task>> {
        self.by_id.get(id).cloned()
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter().filter(|task| task.is_plugin())
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter().filter(|task| task.is_job())
    }

    pub fn namespace(&self, name: &str) -> Option<&[Parameter]> {
        self.namespaces.get(name).map(Vec::as_slice)
    }

    pub fn parameter_set(&self, name: &str) -> Option<&[Parameter]> {
        self.parameter_sets.get(name).map(Vec::as_slice)
    }

    pub fn scheduled(&self) -> &[ScheduledTaskConf] {
        &self.scheduled
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert a task, refusing duplicate names.
    pub(crate) fn insert(&mut self, task: Task) -> bool {
        if self.by_name.contains_key(task.name()) {
            return false;
        }
        let task = Arc::new(task);
        self.by_name.insert(task.common.name.clone(), task.clone());
        self.by_id.insert(task.common.id.clone(), task.clone());
        self.tasks.push(task);
        true
    }
}

/// Atomically swappable holder of the current [`TaskList`].
pub struct Catalog {
    current: ArcSwap<TaskList>,
}

impl Catalog {
    pub fn new(list: TaskList) -> Self {
        Self {
            current: ArcSwap::from_pointee(list),
        }
    }

    pub fn load(&self) -> Arc<TaskList> {
        self.current.load_full()
    }

    pub fn publish(&self, list: TaskList) {
        let count = list.len();
        self.current.store(Arc::new(list));
        tracing::info!(tasks = count, "task list published");
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("tasks", &self.current.load().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreted_extensions_are_detected() {
        assert_eq!(
            ExecKind::external(PathBuf::from("plugins/weather.lua")),
            ExecKind::Interpreted {
                path: PathBuf::from("plugins/weather.lua"),
                extension: "lua".into()
            }
        );
        assert_eq!(
            ExecKind::external(PathBuf::from("plugins/hello.sh")),
            ExecKind::External {
                path: PathBuf::from("plugins/hello.sh")
            }
        );
    }
}
