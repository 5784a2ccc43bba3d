//! Methods tasks use to extend and control their pipeline.

use super::Robot;
use crate::catalog::Task;
use crate::pipeline::{PipelineRequest, PipelineType, Stage, TaskSpec};
use crate::retval::RetVal;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Which queue a task is added to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Next,
    Final,
    Fail,
}

/// What kind of task a pipe command expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wanted {
    Any,
    Job,
    Plugin,
}

/// Resolve `name` to a runnable task spec. Failures are checked in a
/// fixed order so callers always see the most fundamental problem.
fn resolve(
    stage: Stage,
    task: Option<Arc<Task>>,
    name: &str,
    wanted: Wanted,
    command: &str,
    args: &[String],
) -> Result<TaskSpec, RetVal> {
    if stage != Stage::Primary {
        return Err(RetVal::InvalidStage);
    }
    let Some(task) = task else {
        tracing::warn!(task = name, "pipe command for a task that doesn't exist");
        return Err(RetVal::TaskNotFound);
    };
    if let Some(reason) = &task.common.disabled {
        tracing::warn!(task = name, %reason, "pipe command for a disabled task");
        return Err(RetVal::TaskDisabled);
    }
    match wanted {
        Wanted::Job if !task.is_job() => return Err(RetVal::InvalidTaskType),
        Wanted::Plugin if !task.is_plugin() => return Err(RetVal::InvalidTaskType),
        _ => {}
    }
    if wanted != Wanted::Plugin {
        return Ok(TaskSpec {
            task,
            command: String::new(),
            args: args.to_vec(),
        });
    }
    if command.is_empty() {
        return Err(RetVal::MissingArguments);
    }
    let Some(plugin) = task.plugin() else {
        return Err(RetVal::InvalidTaskType);
    };
    match plugin.match_command(command, false) {
        Some((command, args)) => Ok(TaskSpec { task, command, args }),
        None => {
            tracing::warn!(task = name, command, "command doesn't match any of the plugin's matchers");
            Err(RetVal::CommandNotMatched)
        }
    }
}

/// Join `path` onto `base` lexically; `None` when it climbs out of `base`.
fn within_base(base: &Path, path: &str) -> Option<PathBuf> {
    let requested = Path::new(path);
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        base.join(requested)
    };
    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved.starts_with(base).then_some(resolved)
}

impl Robot {
    fn pipe_task(&self, queue: Queue, name: &str, wanted: Wanted, command: &str, args: &[String]) -> RetVal {
        let task = self.bot.catalog.load().get(name);
        let stage = self.worker.state().stage;
        let spec = match resolve(stage, task, name, wanted, command, args) {
            Ok(spec) => spec,
            Err(ret) => return ret,
        };
        tracing::debug!(
            pipeline = self.task.name(),
            task = spec.task.name(),
            ?queue,
            "adding task to pipeline"
        );
        let mut state = self.worker.state();
        match queue {
            Queue::Next => state.next_tasks.push(spec),
            Queue::Final => state.final_tasks.insert(0, spec),
            Queue::Fail => state.fail_tasks.push(spec),
        }
        RetVal::Ok
    }

    /// Run a task after the current one.
    pub fn add_task(&self, name: &str, args: &[String]) -> RetVal {
        self.pipe_task(Queue::Next, name, Wanted::Any, "", args)
    }

    /// Run a task when the pipeline finishes, whatever the outcome. Final
    /// tasks run in reverse order of being added.
    pub fn final_task(&self, name: &str, args: &[String]) -> RetVal {
        self.pipe_task(Queue::Final, name, Wanted::Any, "", args)
    }

    pub fn fail_task(&self, name: &str, args: &[String]) -> RetVal {
        self.pipe_task(Queue::Fail, name, Wanted::Any, "", args)
    }

    /// Run a job as part of this pipeline, under its own history log.
    pub fn add_job(&self, name: &str, args: &[String]) -> RetVal {
        self.pipe_task(Queue::Next, name, Wanted::Job, "", args)
    }

    /// Run a plugin command, given as the text a user would type.
    pub fn add_command(&self, plugin: &str, command: &str) -> RetVal {
        self.pipe_task(Queue::Next, plugin, Wanted::Plugin, command, &[])
    }

    pub fn final_command(&self, plugin: &str, command: &str) -> RetVal {
        self.pipe_task(Queue::Final, plugin, Wanted::Plugin, command, &[])
    }

    pub fn fail_command(&self, plugin: &str, command: &str) -> RetVal {
        self.pipe_task(Queue::Fail, plugin, Wanted::Plugin, command, &[])
    }

    /// Start a job in a new pipeline that runs alongside this one.
    pub fn spawn_job(&self, name: &str, args: &[String]) -> RetVal {
        let task = self.bot.catalog.load().get(name);
        let stage = self.worker.state().stage;
        let spec = match resolve(stage, task, name, Wanted::Job, "", args) {
            Ok(spec) => spec,
            Err(ret) => return ret,
        };
        tracing::info!(parent = %self.worker.eid, job = name, "spawning job");
        self.bot.spawn_pipeline(PipelineRequest {
            task: spec.task,
            ptype: PipelineType::SpawnedTask,
            command: "run".into(),
            args: spec.args,
            envelope: self.worker.envelope(),
            automatic: true,
            cmd_mode: String::new(),
            parent: Some(self.worker.clone()),
        });
        RetVal::Ok
    }

    /// Claim an exclusive tag for this job. Returns true once the pipeline
    /// holds the tag. When the tag is busy the pipeline is queued behind the
    /// holder (`queue`) or aborted, and false is returned: a queued task is
    /// run again once the tag is released.
    pub fn exclusive(&self, tag: &str, queue: bool) -> bool {
        let mut state = self.worker.state();
        if state.exclusive {
            return true;
        }
        if state.job_name.is_empty() {
            tracing::error!(task = self.task.name(), "exclusive called outside a job pipeline");
            return false;
        }
        let tag = if tag.is_empty() {
            state.job_name.clone()
        } else {
            format!("{}:{tag}", state.job_name)
        };
        state.exclusive_tag = tag.clone();
        if self.bot.run_queues.try_acquire(&tag) {
            tracing::debug!(%tag, pipeline = %state.pipe_name, "exclusive tag acquired");
            state.exclusive = true;
            return true;
        }
        if queue {
            tracing::debug!(%tag, "exclusive tag held, queueing after this task");
            state.queue_task = true;
        } else {
            tracing::debug!(%tag, "exclusive tag held, aborting pipeline");
            state.abort_pipeline = true;
        }
        false
    }

    /// Change the working directory for the rest of the pipeline. The
    /// directory must exist inside the pipeline's base directory.
    pub fn set_working_directory(&self, path: &str) -> bool {
        let mut state = self.worker.state();
        let Some(dir) = within_base(&state.base_dir, path) else {
            tracing::warn!(task = self.task.name(), path, "working directory outside the base directory");
            return false;
        };
        if !dir.is_dir() {
            tracing::warn!(task = self.task.name(), path = %dir.display(), "working directory doesn't exist");
            return false;
        }
        state.working_dir = dir;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExecKind, InputMatcher, PluginSpec, TaskCommon, TaskKind};
    use regex::Regex;

    fn plugin() -> Arc<Task> {
        let mut common = TaskCommon::new("weather", ExecKind::InProcess { handler: "weather".into() });
        common.namespace = "weather".into();
        Arc::new(Task {
            common,
            kind: TaskKind::Plugin(PluginSpec {
                command_matchers: vec![InputMatcher {
                    label: String::new(),
                    command: "forecast".into(),
                    regex: Regex::new(r"(?i)^forecast (\w+)$").expect("regex"),
                    contexts: Vec::new(),
                    channel_only: false,
                }],
                ..Default::default()
            }),
        })
    }

    #[test]
    fn pipe_failures_are_checked_in_order() {
        let args = vec!["x".to_string()];
        assert_eq!(
            resolve(Stage::Final, None, "nope", Wanted::Any, "", &args).err(),
            Some(RetVal::InvalidStage)
        );
        assert_eq!(
            resolve(Stage::Primary, None, "nope", Wanted::Any, "", &args).err(),
            Some(RetVal::TaskNotFound)
        );

        let mut disabled = (*plugin()).clone();
        disabled.common.disabled = Some("bad regex".into());
        assert_eq!(
            resolve(Stage::Primary, Some(Arc::new(disabled)), "weather", Wanted::Job, "", &args).err(),
            Some(RetVal::TaskDisabled)
        );
        assert_eq!(
            resolve(Stage::Primary, Some(plugin()), "weather", Wanted::Job, "", &args).err(),
            Some(RetVal::InvalidTaskType)
        );
        assert_eq!(
            resolve(Stage::Primary, Some(plugin()), "weather", Wanted::Plugin, "", &args).err(),
            Some(RetVal::MissingArguments)
        );
        assert_eq!(
            resolve(Stage::Primary, Some(plugin()), "weather", Wanted::Plugin, "radar", &args).err(),
            Some(RetVal::CommandNotMatched)
        );
    }

    #[test]
    fn plugin_commands_resolve_through_matchers() {
        let spec = resolve(Stage::Primary, Some(plugin()), "weather", Wanted::Plugin, "forecast Paris", &[])
            .expect("command should match");
        assert_eq!(spec.command, "forecast");
        assert_eq!(spec.args, vec!["Paris".to_string()]);

        let plain = resolve(Stage::Primary, Some(plugin()), "weather", Wanted::Any, "", &["a".into()])
            .expect("any task can be added");
        assert!(plain.command.is_empty());
        assert_eq!(plain.args, vec!["a".to_string()]);
    }

    #[test]
    fn working_directories_stay_inside_base() {
        let base = Path::new("/srv/robot/workspace");
        assert_eq!(within_base(base, "build"), Some(base.join("build")));
        assert_eq!(within_base(base, "build/../src"), Some(base.join("src")));
        assert_eq!(within_base(base, ".."), None);
        assert_eq!(within_base(base, "/etc"), None);
        assert_eq!(within_base(base, "/srv/robot/workspace/tmp"), Some(base.join("tmp")));
    }
}
