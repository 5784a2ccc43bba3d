//! The pipeline runtime.
//!
//! A pipeline starts from one task (a matched plugin command, a triggered or
//! scheduled job, a spawned job) and runs three stages: primary, final and
//! fail. Tasks can extend every stage while it runs. Final tasks always run;
//! fail tasks only when the primary stage did not end normally.

pub mod calltask;
pub mod runner;
pub mod security;
pub mod worker;

pub use worker::{PipelineState, Worker, WorkerInit, Workers};

use crate::bot::Bot;
use crate::catalog::Task;
use crate::env::Environment;
use crate::history;
use crate::message::ConnectorMessage;
use crate::retval::TaskRetVal;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use std::sync::Arc;

/// What started a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineType {
    PluginCommand,
    PluginMessage,
    CatchAll,
    JobTrigger,
    JobCommand,
    Scheduled,
    InitJob,
    SpawnedTask,
}

impl PipelineType {
    /// Value exported to tasks as `GOPHER_PIPELINE_TYPE`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PluginCommand => "plugCommand",
            Self::PluginMessage => "plugMessage",
            Self::CatchAll => "catchAll",
            Self::JobTrigger => "jobTrigger",
            Self::JobCommand => "jobCommand",
            Self::Scheduled => "scheduled",
            Self::InitJob => "initJob",
            Self::SpawnedTask => "spawnedTask",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Primary,
    Final,
    Fail,
}

/// A task queued in a stage, with the command and arguments to run it with.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task: Arc<Task>,
    pub command: String,
    pub args: Vec<String>,
}

/// Who and where a pipeline is talking to.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub protocol: String,
    /// Canonical user name.
    pub user: String,
    pub user_id: String,
    /// Empty for direct messages.
    pub channel: String,
    pub channel_id: String,
    pub thread: String,
    pub message_id: String,
    pub direct: bool,
    pub hidden: bool,
    pub threaded: bool,
    pub text: String,
    /// The message that started the pipeline, when there was one.
    pub incoming: Option<ConnectorMessage>,
}

impl Envelope {
    /// Envelope for a message heard from `user`.
    pub fn from_message(message: &ConnectorMessage, user: &str) -> Self {
        Self {
            protocol: message.protocol.clone(),
            user: user.to_string(),
            user_id: message.user_id.clone(),
            channel: if message.direct_message {
                String::new()
            } else {
                message.channel_name.clone()
            },
            channel_id: message.channel_id.clone(),
            thread: message.thread_id.clone(),
            message_id: message.message_id.clone(),
            direct: message.direct_message,
            hidden: message.hidden_message,
            threaded: message.threaded_message,
            text: message.message_text.clone(),
            incoming: Some(message.clone()),
        }
    }

    /// Envelope for automatic pipelines posting to `channel`.
    pub fn for_channel(protocol: &str, channel: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            channel: channel.to_string(),
            direct: channel.is_empty(),
            ..Default::default()
        }
    }
}

/// A request to start a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub task: Arc<Task>,
    pub ptype: PipelineType,
    pub command: String,
    pub args: Vec<String>,
    pub envelope: Envelope,
    /// Scheduled and spawned pipelines skip authorization and elevation.
    pub automatic: bool,
    pub cmd_mode: String,
    pub parent: Option<Arc<Worker>>,
}

/// Run a pipeline to completion. Boxed because job tasks after the first
/// position start nested pipelines.
pub fn start_pipeline(bot: Arc<Bot>, request: PipelineRequest) -> BoxFuture<'static, TaskRetVal> {
    async move {
        let task = request.task.clone();
        if bot.is_stopping() && task.name() != "builtin-admin" {
            tracing::info!(task = task.name(), "robot stopping, refusing to start pipeline");
            return TaskRetVal::RobotStopping;
        }
        let worker = bot.workers.register(WorkerInit {
            envelope: request.envelope.clone(),
            ptype: request.ptype,
            automatic: request.automatic,
            cmd_mode: request.cmd_mode.clone(),
            parent: request.parent.as_ref().map(|parent| parent.eid.clone()),
            cancel: bot.worker_token(),
        });
        let ret = drive(&bot, &worker, request).await;
        bot.workers.deregister(&worker.eid);
        ret
    }
    .boxed()
}

async fn drive(bot: &Arc<Bot>, worker: &Arc<Worker>, request: PipelineRequest) -> TaskRetVal {
    let PipelineRequest {
        task,
        ptype,
        command,
        args,
        automatic,
        parent,
        ..
    } = request;
    let settings = bot.settings();
    let job = task.job();
    let is_job = job.is_some();
    let quiet = job.is_some_and(|job| job.quiet);

    let start_envelope = {
        let mut state = worker.state();
        let base = if task.common.homed {
            bot.paths.home_dir.clone()
        } else {
            settings.workspace.clone()
        };
        state.base_dir = base.clone();
        state.working_dir = base;
        state.privileged = task.common.privileged;
        state.inherited_parameter_sets = task.common.parameter_sets.clone();
        state.pipe_name = task.name().to_string();
        state.pipe_desc = task.common.description.clone();
        let start = state.envelope.clone();
        if is_job {
            for parameter in &task.common.parameters {
                state
                    .environment
                    .insert(parameter.name.clone(), parameter.value.clone());
            }
            state.inherited_namespace = Some(task.common.namespace.clone());
            state.job_name = task.name().to_string();
            let env = &mut state.environment;
            env.insert("GOPHER_JOB_NAME".into(), task.name().to_string());
            env.insert("GOPHER_START_CHANNEL".into(), start.channel.clone());
            env.insert("GOPHER_START_CHANNEL_ID".into(), start.channel_id.clone());
            env.insert("GOPHER_START_THREAD_ID".into(), start.thread.clone());
            env.insert("GOPHER_START_MESSAGE_ID".into(), start.message_id.clone());
            if start.threaded {
                env.insert("GOPHER_START_THREADED_MESSAGE".into(), "true".into());
            }
            let channel = if task.common.channel.is_empty() {
                settings.default_job_channel.clone()
            } else {
                task.common.channel.clone()
            };
            let envelope = &mut state.envelope;
            envelope.direct = channel.is_empty();
            envelope.channel = channel;
            envelope.channel_id.clear();
            envelope.thread.clear();
            envelope.message_id.clear();
            envelope.threaded = false;
        }
        start
    };

    let mut log_ref = String::new();
    let mut run_index = 0;
    if let Some(job) = job {
        run_index = history::next_index(&bot.brain, task.name()).await;
        match bot.history.new_history(task.name(), run_index, job.keep_logs) {
            Ok(logger) => {
                let reference = history::log_ref(task.name(), run_index);
                let link = bot.history.history_url(task.name(), run_index);
                log_ref = match &link {
                    Some(link) => format!(" (log {reference}; link {link})"),
                    None => format!(" (log {reference})"),
                };
                let mut state = worker.state();
                state.history = Some(logger);
                state.history_tag = task.name().to_string();
                state.run_index = run_index;
                state.environment.insert("GOPHER_LOG_REF".into(), reference);
                if let Some(link) = link {
                    state.environment.insert("GOPHER_LOG_LINK".into(), link);
                }
            }
            Err(error) => tracing::error!(job = task.name(), %error, "starting history failed"),
        }
    }

    if is_job && (!quiet || ptype == PipelineType::JobCommand) {
        let name = task.name();
        let channel = if start_envelope.channel.is_empty() {
            "(direct message)".to_string()
        } else {
            start_envelope.channel.clone()
        };
        let message = match ptype {
            PipelineType::JobTrigger => format!(
                "Starting job '{name}', run {run_index}{log_ref} - triggered by app '{}' in channel '{channel}'",
                start_envelope.user
            ),
            PipelineType::JobCommand => format!(
                "Starting job '{name}', run {run_index}{log_ref} - requested by user '{}' in channel '{channel}'",
                start_envelope.user
            ),
            PipelineType::SpawnedTask => {
                let spawner = parent
                    .as_ref()
                    .map(|parent| parent.state().pipe_name.clone())
                    .unwrap_or_default();
                let mut info = vec![name.to_string()];
                info.extend(args.iter().cloned());
                format!(
                    "Starting job '{name}', run {run_index}{log_ref} - spawned by pipeline '{spawner}': {}",
                    info.join(" ")
                )
            }
            PipelineType::Scheduled => format!("Starting scheduled job '{name}', run {run_index}{log_ref}"),
            PipelineType::InitJob => format!("Starting init job '{name}', run {run_index}{log_ref}"),
            _ => format!("Starting job '{name}', run {run_index}{log_ref}"),
        };
        bot.say(&worker.envelope(), &message).await;
    }

    let primary = vec![TaskSpec {
        task: task.clone(),
        command,
        args,
    }];
    let mut ret = runner::run_stage(bot.clone(), worker.clone(), Stage::Primary, primary, true).await;

    let (final_task, final_desc) = {
        let mut state = worker.state();
        let final_task = state.task_name.clone();
        let final_desc = state
            .task
            .as_ref()
            .map(|task| task.common.description.clone())
            .unwrap_or_default();
        let args = state.args.join(" ");
        let task_type = state.task_type.to_string();
        let command = state.command.clone();
        let env: &mut Environment = &mut state.environment;
        env.insert("GOPHER_FINAL_TASK".into(), final_task.clone());
        env.insert("GOPHER_FINAL_TYPE".into(), task_type.clone());
        if task_type == "plugin" {
            env.insert("GOPHER_FINAL_COMMAND".into(), command);
        }
        env.insert("GOPHER_FINAL_ARGS".into(), args);
        env.insert("GOPHER_FINAL_DESC".into(), final_desc.clone());
        (final_task, final_desc)
    };

    if ret != TaskRetVal::Normal {
        let summary = format!(
            "pipeline failed in task {final_task} with exit code {} ({ret})",
            ret.code()
        );
        {
            let tasks = bot.catalog.load();
            let mut state = worker.state();
            if is_job && !quiet && state.fail_tasks.is_empty() {
                match (tasks.get("send-message"), tasks.get("tail-log")) {
                    (Some(send), Some(tail)) => {
                        state.fail_tasks.push(TaskSpec {
                            task: send,
                            command: String::new(),
                            args: vec![format!("{summary}; log excerpt:")],
                        });
                        state.fail_tasks.push(TaskSpec {
                            task: tail,
                            command: String::new(),
                            args: Vec::new(),
                        });
                    }
                    _ => tracing::warn!("default fail tasks not available"),
                }
            }
            state
                .environment
                .insert("GOPHER_FAIL_CODE".into(), ret.code().to_string());
            state
                .environment
                .insert("GOPHER_FAIL_STRING".into(), ret.to_string());
        }
        worker.section("failed", &summary);
    } else {
        worker.section("done", "primary pipeline has completed");
    }

    let final_tasks = std::mem::take(&mut worker.state().final_tasks);
    if !final_tasks.is_empty() {
        runner::run_stage(bot.clone(), worker.clone(), Stage::Final, final_tasks, false).await;
    }
    if ret != TaskRetVal::Normal {
        let fail_tasks = std::mem::take(&mut worker.state().fail_tasks);
        if !fail_tasks.is_empty() {
            runner::run_stage(bot.clone(), worker.clone(), Stage::Fail, fail_tasks, false).await;
        }
    }

    if task.is_plugin() && ret != TaskRetVal::Normal {
        let (err_string, working_dir, pipe_name) = {
            let state = worker.state();
            (
                state.err_string.clone(),
                state.working_dir.clone(),
                state.pipe_name.clone(),
            )
        };
        if !automatic && !err_string.is_empty() {
            bot.reply(&worker.envelope(), &err_string).await;
        }
        let path = working_dir.join(format!("{pipe_name}-fail.log"));
        if let Err(error) = tokio::fs::write(&path, worker.output()).await {
            tracing::warn!(path = %path.display(), %error, "writing plugin fail log failed");
        }
    }

    if is_job && (!quiet || ptype == PipelineType::JobCommand) {
        let name = task.name();
        let message = match ret {
            TaskRetVal::Normal => {
                format!("Finished job '{name}', run {run_index}, final task '{final_task}', status: normal")
            }
            TaskRetVal::PipelineAborted => {
                let tag = worker.state().exclusive_tag.clone();
                format!("Job '{name}', run number {run_index} aborted, exclusive job '{tag}' already in progress")
            }
            other => format!(
                "Job '{name}', run number {run_index} failed in {final_task}: '{final_desc}'{log_ref}, exit code: {} ({other})",
                other.code()
            ),
        };
        bot.say(&worker.envelope(), &message).await;
    }

    let (exclusive, tag, history) = {
        let mut state = worker.state();
        let exclusive = std::mem::take(&mut state.exclusive);
        (exclusive, state.exclusive_tag.clone(), state.history.take())
    };
    if let Some(history) = history {
        history.close();
    }
    if exclusive {
        tracing::debug!(%tag, "releasing exclusive tag");
        bot.run_queues.release(&tag);
    }

    if ret == TaskRetVal::Success {
        ret = TaskRetVal::Normal;
    }
    ret
}
