//! Running a single task: in process, as a child process, or through an
//! interpreter speaking the pipeline child protocol.

use super::{Envelope, TaskSpec, Worker};
use crate::bot::Bot;
use crate::catalog::{ExecKind, Task};
use crate::env::{self, Environment, PipelineEnv};
use crate::events::Event;
use crate::retval::TaskRetVal;
use crate::robot::Robot;

use futures::FutureExt as _;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::task::JoinHandle;

/// How long output readers may run after an external task exits. A
/// backgrounded grandchild can hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Message shown to users when an external task fails.
pub fn external_error(task: &str) -> String {
    format!("There were errors calling external task '{task}', you might want to ask an administrator to check the logs")
}

/// Fixed `GOPHER_*` variables for one task run.
pub fn fixed_environment(bot: &Bot, worker: &Worker, envelope: &Envelope, task: &Task) -> Environment {
    let settings = bot.settings();
    let paths = &bot.paths;
    let home = paths.home_dir.display().to_string();
    let config = paths.config_dir.display().to_string();
    let install = paths.install_dir.display().to_string();
    let lib_path = format!("{install}/lib:{config}/lib");

    let mut fixed = Environment::new();
    fixed.insert("HOME".into(), home.clone());
    fixed.insert("GOPHER_HOME".into(), home.clone());
    fixed.insert("GOPHER_CONFIGDIR".into(), config);
    fixed.insert("GOPHER_INSTALLDIR".into(), install);
    fixed.insert("GOPHER_WORKSPACE".into(), settings.workspace.display().to_string());
    fixed.insert("GOPHER_CHANNEL".into(), envelope.channel.clone());
    fixed.insert("GOPHER_CHANNEL_ID".into(), envelope.channel_id.clone());
    fixed.insert("GOPHER_MESSAGE_ID".into(), envelope.message_id.clone());
    fixed.insert("GOPHER_THREAD_ID".into(), envelope.thread.clone());
    if envelope.threaded {
        fixed.insert("GOPHER_THREADED_MESSAGE".into(), "true".into());
    }
    if envelope.hidden {
        fixed.insert("GOPHER_HIDDEN_MESSAGE".into(), "true".into());
    }
    fixed.insert("GOPHER_CMDMODE".into(), worker.cmd_mode.clone());
    fixed.insert("GOPHER_USER".into(), envelope.user.clone());
    fixed.insert("GOPHER_USER_ID".into(), envelope.user_id.clone());
    fixed.insert("GOPHER_PROTOCOL".into(), envelope.protocol.to_lowercase());
    fixed.insert("GOPHER_TASK_NAME".into(), task.name().to_string());
    fixed.insert("GOPHER_PIPELINE_TYPE".into(), worker.ptype.as_str().into());
    fixed.insert("GOPHER_CALLER_ID".into(), worker.eid.clone());
    fixed.insert("GOPHER_HTTP_POST".into(), bot.http_post());
    fixed.insert("GOPHER_BRAIN".into(), settings.brain.clone());
    fixed.insert("GOPHER_ENVIRONMENT".into(), bot.environment.clone());
    fixed.insert("RUBYLIB".into(), lib_path.clone());
    fixed.insert("PYTHONPATH".into(), lib_path);
    fixed.insert("GEM_HOME".into(), format!("{home}/.local"));
    fixed
}

/// Run one task under `worker`, returning its result and, on failure, a
/// message for the user.
pub async fn call_task(bot: &Arc<Bot>, worker: &Arc<Worker>, spec: &TaskSpec) -> (TaskRetVal, String) {
    let task = &spec.task;
    if let Some(reason) = &task.common.disabled {
        tracing::error!(task = task.name(), %reason, "attempt to run disabled task");
        return (
            TaskRetVal::ConfigurationError,
            format!("Sorry, task '{}' is disabled: {reason}", task.name()),
        );
    }

    let tasks = bot.catalog.load();
    let (envelope, pipeline_env, namespace, parameter_sets, working_dir) = {
        let state = worker.state();
        (
            state.envelope.clone(),
            state.environment.clone(),
            state.inherited_namespace.clone(),
            state.inherited_parameter_sets.clone(),
            state.working_dir.clone(),
        )
    };
    let fixed = fixed_environment(bot, worker, &envelope, task);
    let environment = env::compose(
        task,
        &tasks,
        &PipelineEnv {
            inherited_namespace: namespace.as_deref(),
            inherited_parameter_sets: &parameter_sets,
            fixed: Some(&fixed),
            pipeline: Some(&pipeline_env),
        },
    );
    worker.state().task_env = environment.clone();

    match &task.common.exec {
        ExecKind::InProcess { handler } => run_in_process(bot, worker, spec, handler).await,
        ExecKind::External { path } => {
            let mut args = Vec::new();
            if task.is_plugin() {
                args.push(spec.command.clone());
            }
            args.extend(spec.args.iter().cloned());
            run_external(bot, worker, task, path, &args, &environment, &working_dir).await
        }
        ExecKind::Interpreted { path, extension } => {
            crate::rpc::parent::run_interpreted(
                bot,
                worker,
                spec,
                crate::rpc::parent::Script {
                    path,
                    extension,
                    environment: &environment,
                    working_dir: &working_dir,
                },
            )
            .await
        }
    }
}

async fn run_in_process(
    bot: &Arc<Bot>,
    worker: &Arc<Worker>,
    spec: &TaskSpec,
    handler: &str,
) -> (TaskRetVal, String) {
    let task = &spec.task;
    let Some(handler) = bot.handler(handler) else {
        tracing::error!(task = task.name(), handler, "no compiled-in handler registered");
        return (
            TaskRetVal::ConfigurationError,
            format!("Sorry, task '{}' has no handler", task.name()),
        );
    };
    if task.is_plugin() {
        bot.events.emit(Event::GoPluginRan);
    }
    let robot = Robot::new(bot.clone(), worker.clone(), task.clone());
    let result = AssertUnwindSafe(handler.run(&robot, &spec.command, &spec.args))
        .catch_unwind()
        .await;
    match result {
        Ok(ret) => (ret, String::new()),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!(task = task.name(), command = %spec.command, %detail, "task panicked");
            worker.log_output(&format!("ERR task '{}' panicked: {detail}", task.name()));
            (
                TaskRetVal::MechanismFail,
                format!("Sorry, task '{}' crashed; ask an administrator to check the log", task.name()),
            )
        }
    }
}

async fn run_external(
    bot: &Arc<Bot>,
    worker: &Arc<Worker>,
    task: &Task,
    path: &Path,
    args: &[String],
    environment: &Environment,
    working_dir: &Path,
) -> (TaskRetVal, String) {
    let name = task.name();
    let mut command = tokio::process::Command::new(path);
    command
        .args(args)
        .env_clear()
        .envs(environment)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    tracing::debug!(task = name, path = %path.display(), ?args, "starting external task");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            if error.kind() == std::io::ErrorKind::NotFound {
                bot.events.emit(Event::ExternalTaskBadPath);
            }
            tracing::error!(task = name, path = %path.display(), %error, "failed to start external task");
            worker.log_output(&format!("ERR failed to start '{}': {error}", path.display()));
            return (TaskRetVal::MechanismFail, external_error(name));
        }
    };
    bot.events.emit(Event::ExternalTaskRan);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_worker = worker.clone();
    let stdout_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out_worker.log_output(&format!("OUT {line}"));
            }
        }
    });
    let err_worker = worker.clone();
    let stderr_task = tokio::spawn(async move {
        let mut saw_output = false;
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                saw_output = true;
                err_worker.log_output(&format!("ERR {line}"));
            }
        }
        saw_output
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = worker.cancel.cancelled() => {
            tracing::warn!(task = name, "pipeline cancelled, killing external task");
            if let Some(pid) = child.id() {
                kill_process_group(pid);
            }
            let _ = child.wait().await;
            return (TaskRetVal::MechanismFail, external_error(name));
        }
    };
    drain_output(name, "stdout", stdout_task).await;
    let saw_stderr = drain_output(name, "stderr", stderr_task).await;

    let ret = match status {
        Ok(status) => match status.code() {
            Some(code) => TaskRetVal::from_code(code),
            None => {
                tracing::error!(task = name, %status, "external task terminated by signal");
                TaskRetVal::MechanismFail
            }
        },
        Err(error) => {
            tracing::error!(task = name, %error, "waiting for external task failed");
            TaskRetVal::MechanismFail
        }
    };
    if saw_stderr {
        bot.events.emit(Event::ExternalTaskStderrOutput);
    }
    if ret == TaskRetVal::Normal || ret == TaskRetVal::Success {
        return (ret, String::new());
    }
    bot.events.emit(Event::ExternalTaskErrExit);
    tracing::warn!(task = name, %ret, "external task exited with error");
    let message = if saw_stderr {
        format!(
            "There was error output while calling external task '{name}', you might want to ask an administrator to check the logs"
        )
    } else {
        external_error(name)
    };
    (ret, message)
}

/// Wait briefly for an output reader, then abandon it.
async fn drain_output<T: Default>(task: &str, stream: &'static str, reader: JoinHandle<T>) -> T {
    let abort = reader.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            tracing::warn!(task, stream, "output still open after task exited, abandoning reader");
            T::default()
        }
    }
}

/// SIGKILL a child's whole process group.
pub fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        // SAFETY: kill(2) with a negative pid signals the group; no memory is touched.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn readers_held_open_after_exit_are_abandoned() {
        let held_open = tokio::spawn(std::future::pending::<bool>());
        let started = tokio::time::Instant::now();
        assert!(!drain_output("backup", "stderr", held_open).await);
        assert!(started.elapsed() >= OUTPUT_DRAIN_TIMEOUT);

        let finished = tokio::spawn(async { true });
        assert!(drain_output("backup", "stderr", finished).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_grandchild_does_not_stall_output() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 5 & echo started"])
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh");
        let stdout = child.stdout.take().expect("stdout");
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line);
            }
            seen
        });
        child.wait().await.expect("wait");
        let started = std::time::Instant::now();
        // The reader is still blocked on the sleeper's copy of stdout.
        assert!(drain_output("backup", "stdout", reader).await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
