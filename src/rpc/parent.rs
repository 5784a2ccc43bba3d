//! The robot side of the protocol: spawn the child, run one request, and
//! serve the child's robot calls while it is in flight.

use super::interpreter::{ConfigParams, ConfigResult, RunParams, RunResult};
use super::robot_call;
use super::{
    CHILD_COMMAND, CHILD_WAIT_TIMEOUT, ErrorCode, HELLO_TIMEOUT, MessageType, PipelineRpcError, ReadError,
    RpcMessage, SHUTDOWN_TIMEOUT, STDERR_CAP, method_timeout, read_message, write_message,
};
use crate::bot::{Bot, Settings};
use crate::catalog::ExecKind;
use crate::catalog::build::resolve_task_path;
use crate::config::{Paths, RobotConf};
use crate::env::{self, Environment};
use crate::events::Event;
use crate::pipeline::calltask::{external_error, kill_process_group};
use crate::pipeline::{TaskSpec, Worker};
use crate::retval::TaskRetVal;
use crate::robot::Robot;

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncReadExt as _, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// An interpreted task about to run.
#[derive(Debug, Clone, Copy)]
pub struct Script<'a> {
    pub path: &'a Path,
    pub extension: &'a str,
    pub environment: &'a Environment,
    pub working_dir: &'a Path,
}

/// One conversation with a child over any byte stream.
pub struct Session<R, W> {
    reader: R,
    writer: W,
    method: String,
}

/// How an exchange ended: the request's result, and whether the child
/// acknowledged shutdown.
#[derive(Debug)]
pub struct Outcome {
    pub result: Result<Value, PipelineRpcError>,
    pub shutdown: Result<(), PipelineRpcError>,
}

impl Outcome {
    pub fn failed(&self) -> bool {
        self.result.is_err() || self.shutdown.is_err()
    }
}

impl<R, W> Session<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, method: &str) -> Self {
        Self {
            reader,
            writer,
            method: method.to_string(),
        }
    }

    fn error(&self, kind: ErrorCode, detail: &str) -> PipelineRpcError {
        PipelineRpcError::new(kind, &self.method, detail)
    }

    async fn send(&mut self, message: &RpcMessage, what: &str) -> Result<(), PipelineRpcError> {
        write_message(&mut self.writer, message)
            .await
            .map_err(|error| self.error(ErrorCode::ProtocolError, what).caused_by(error))
    }

    /// Hello, the request, then shutdown.
    pub async fn exchange(&mut self, params: Value, robot: Option<&Robot>, cancel: &CancellationToken) -> Outcome {
        let result = self.request(params, robot, cancel).await;
        let shutdown = match &result {
            Ok(_) => self.shutdown(cancel).await,
            Err(_) => Ok(()),
        };
        Outcome { result, shutdown }
    }

    async fn request(
        &mut self,
        params: Value,
        robot: Option<&Robot>,
        cancel: &CancellationToken,
    ) -> Result<Value, PipelineRpcError> {
        self.send(&RpcMessage::hello(), "sending rpc hello").await?;
        let deadline = Instant::now() + HELLO_TIMEOUT;
        if let Err(error) = self.wait_response("hello", robot, deadline, cancel).await {
            return Err(self.error(ErrorCode::ProtocolError, "rpc hello failed").caused_by(error));
        }

        let method = self.method.clone();
        self.send(&RpcMessage::request("req-1", &method, Some(params)), "sending rpc request")
            .await?;
        let deadline = Instant::now() + method_timeout(&method);
        self.wait_response("req-1", robot, deadline, cancel).await
    }

    async fn shutdown(&mut self, cancel: &CancellationToken) -> Result<(), PipelineRpcError> {
        self.send(&RpcMessage::request("shutdown", "shutdown", None), "sending rpc shutdown")
            .await?;
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        self.wait_response("shutdown", None, deadline, cancel)
            .await
            .map(|_| ())
            .map_err(|error| {
                self.error(ErrorCode::ProtocolError, "waiting for rpc shutdown")
                    .caused_by(error)
            })
    }

    /// Read until the message answering `target`, serving robot calls on
    /// the way.
    async fn wait_response(
        &mut self,
        target: &str,
        robot: Option<&Robot>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Value, PipelineRpcError> {
        let method = self.method.clone();
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(PipelineRpcError::new(ErrorCode::Canceled, &method, "rpc request canceled"));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PipelineRpcError::new(ErrorCode::Timeout, &method, "rpc response timed out"));
                }
                read = read_message(&mut self.reader) => read,
            };
            let message = message.map_err(|error| match error {
                ReadError::Eof => self.error(ErrorCode::ChildExit, "rpc child closed stream"),
                ReadError::Io(error) => self.error(ErrorCode::IoError, "reading rpc message").caused_by(error),
                ReadError::Decode(error) => self
                    .error(ErrorCode::ProtocolError, "decoding rpc message")
                    .caused_by(error),
            })?;

            match message.kind {
                MessageType::Response | MessageType::HelloAck if message.id == target => {
                    return Ok(message.result.unwrap_or(Value::Null));
                }
                MessageType::Error if message.id == target => {
                    return Err(match &message.error {
                        Some(body) => PipelineRpcError::remote(&self.method, body),
                        None => self.error(ErrorCode::ProtocolError, "rpc error with empty payload"),
                    });
                }
                MessageType::Request => self.serve_call(message, robot).await?,
                _ => {}
            }
        }
    }

    async fn serve_call(&mut self, message: RpcMessage, robot: Option<&Robot>) -> Result<(), PipelineRpcError> {
        let reply = if message.method() != "robot_call" {
            RpcMessage::error(
                &message.id,
                "method_not_found",
                format!("unsupported method '{}'", message.method()),
            )
        } else if let Some(robot) = robot {
            match Box::pin(robot_call::handle(robot, message.params.unwrap_or(Value::Null))).await {
                Ok(result) => RpcMessage::response(&message.id, result),
                Err(error) => {
                    tracing::warn!(method = %self.method, %error, "robot call from pipeline child failed");
                    RpcMessage::error(&message.id, "robot_call_failed", error.to_string())
                }
            }
        } else {
            RpcMessage::error(&message.id, "invalid_state", "robot is not available for this rpc request")
        };
        self.send(&reply, "writing rpc response").await
    }
}

/// Collect up to [`STDERR_CAP`] bytes, draining the rest.
async fn capture_stderr<R: tokio::io::AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let room = STDERR_CAP.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..read.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}

fn with_stderr(error: PipelineRpcError, kind: ErrorCode, detail: &str, stderr: &str) -> PipelineRpcError {
    if stderr.is_empty() {
        return error;
    }
    let method = error.method.clone();
    PipelineRpcError::new(kind, &method, format!("{detail} (child stderr: {stderr})")).caused_by(error)
}

/// Spawn `gopherbot pipeline-child-rpc` and run one request through it.
pub async fn request(
    method: &str,
    params: Value,
    robot: Option<&Robot>,
    cancel: &CancellationToken,
) -> Result<Value, PipelineRpcError> {
    let exe = std::env::current_exe().map_err(|error| {
        PipelineRpcError::new(ErrorCode::ChildStart, method, "locating robot executable").caused_by(error)
    })?;
    let mut command = Command::new(exe);
    command
        .arg(CHILD_COMMAND)
        .env_clear()
        .envs(env::sanitized_process_env())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|error| PipelineRpcError::new(ErrorCode::ChildStart, method, "starting rpc child").caused_by(error))?;
    let pid = child.id();
    let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        return Err(PipelineRpcError::new(ErrorCode::IoError, method, "creating rpc pipes"));
    };
    let stderr_task = tokio::spawn(capture_stderr(stderr));

    let mut session = Session::new(BufReader::new(stdout), stdin, method);
    let outcome = session.exchange(params, robot, cancel).await;
    drop(session);
    if outcome.failed()
        && let Some(pid) = pid
    {
        kill_process_group(pid);
    }

    let status = match tokio::time::timeout(CHILD_WAIT_TIMEOUT, child.wait()).await {
        Ok(status) => Some(status),
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            tokio::time::timeout(CHILD_WAIT_TIMEOUT, child.wait()).await.ok()
        }
    };
    let stderr = stderr_task.await.unwrap_or_default();

    let result = match (outcome.result, outcome.shutdown) {
        (Err(error), _) => return Err(with_stderr(error, ErrorCode::RequestFailed, "rpc request failed", &stderr)),
        (Ok(_), Err(error)) => {
            return Err(with_stderr(error, ErrorCode::ShutdownFailed, "rpc shutdown failed", &stderr));
        }
        (Ok(result), Ok(())) => result,
    };
    match status {
        None => Err(PipelineRpcError::new(
            ErrorCode::ChildTimeout,
            method,
            "rpc child did not exit in time",
        )),
        Some(Err(error)) => Err(PipelineRpcError::new(ErrorCode::ChildExit, method, "rpc child exit").caused_by(error)),
        Some(Ok(status)) if !status.success() => {
            let detail = if stderr.is_empty() {
                "rpc child exit".to_string()
            } else {
                format!("rpc child exit (stderr: {stderr})")
            };
            Err(PipelineRpcError::new(ErrorCode::ChildExit, method, detail).caused_by(status.to_string()))
        }
        Some(Ok(_)) => Ok(result),
    }
}

/// Request-method prefix for an interpreted extension.
fn method_prefix(extension: &str) -> Option<&'static str> {
    match extension {
        "lua" => Some("lua"),
        "js" => Some("js"),
        "go" => Some("go"),
        _ => None,
    }
}

fn run_method(extension: &str, is_plugin: bool, is_job: bool) -> Option<String> {
    let method = match method_prefix(extension)? {
        "go" if is_plugin => "go_plugin_run".to_string(),
        "go" if is_job => "go_job_run".to_string(),
        "go" => "go_task_run".to_string(),
        prefix => format!("{prefix}_run"),
    };
    Some(method)
}

/// Run an interpreted task through a pipeline child.
pub async fn run_interpreted(
    bot: &Arc<Bot>,
    worker: &Arc<Worker>,
    spec: &TaskSpec,
    script: Script<'_>,
) -> (TaskRetVal, String) {
    let task = &spec.task;
    let name = task.name();
    let settings = bot.settings();
    let method = run_method(script.extension, task.is_plugin(), task.is_job());
    let (Some(interpreter), Some(method)) = (settings.interpreter(script.extension), method) else {
        bot.events.emit(Event::ExternalTaskBadInterpreter);
        tracing::error!(task = name, extension = script.extension, "no interpreter configured for extension");
        worker.log_output(&format!("ERR no interpreter for '.{}' tasks", script.extension));
        return (TaskRetVal::ConfigurationError, external_error(name));
    };

    let mut args = Vec::with_capacity(spec.args.len() + 1);
    if task.is_plugin() {
        args.push(spec.command.clone());
    }
    args.extend(spec.args.iter().cloned());
    let params = RunParams {
        interpreter: interpreter.to_string(),
        task_path: script.path.display().to_string(),
        task_name: name.to_string(),
        env: script.environment.clone(),
        args,
        working_dir: script.working_dir.display().to_string(),
        privileged: task.common.privileged,
    };
    let params = match serde_json::to_value(&params) {
        Ok(params) => params,
        Err(error) => {
            tracing::error!(task = name, %error, "encoding run request");
            return (TaskRetVal::MechanismFail, external_error(name));
        }
    };

    tracing::debug!(task = name, %method, path = %script.path.display(), "running interpreted task");
    bot.events.emit(Event::ExternalTaskRan);
    let robot = Robot::new(bot.clone(), worker.clone(), task.clone());
    let response = match request(&method, params, Some(&robot), &worker.cancel).await {
        Ok(response) => response,
        Err(error) => {
            tracing::error!(task = name, %error, "interpreted task failed");
            worker.log_output(&format!("ERR {error}"));
            return (TaskRetVal::MechanismFail, external_error(name));
        }
    };
    let result: RunResult = match serde_json::from_value(response) {
        Ok(result) => result,
        Err(error) => {
            tracing::error!(task = name, %error, "decoding {method} response");
            return (TaskRetVal::MechanismFail, external_error(name));
        }
    };

    let mut ret = TaskRetVal::from_code(result.ret_val);
    if !result.error.is_empty() {
        if ret == TaskRetVal::Normal {
            ret = TaskRetVal::MechanismFail;
        }
        tracing::error!(task = name, error = %result.error, %ret, "interpreted task reported an error");
        worker.log_output(&format!("ERR {}", result.error));
        return (ret, external_error(name));
    }
    if ret != TaskRetVal::Normal && ret != TaskRetVal::Success {
        bot.events.emit(Event::ExternalTaskErrExit);
        tracing::warn!(task = name, %ret, "interpreted task exited with error");
        return (ret, external_error(name));
    }
    (ret, String::new())
}

/// Ask each interpreted external task for its stock configuration.
pub async fn default_configs(paths: &Paths, conf: &RobotConf, settings: &Settings) -> HashMap<String, String> {
    let mut defaults = HashMap::new();
    let cancel = CancellationToken::new();
    let declared = conf
        .external_plugins
        .iter()
        .chain(&conf.external_jobs)
        .chain(&conf.external_tasks);
    for task in declared {
        if task.disabled || task.path.is_empty() {
            continue;
        }
        let ExecKind::Interpreted { path, extension } = ExecKind::external(resolve_task_path(paths, &task.path)) else {
            continue;
        };
        let (Some(prefix), Some(interpreter)) = (method_prefix(&extension), settings.interpreter(&extension)) else {
            continue;
        };
        let method = format!("{prefix}_get_config");
        let params = ConfigParams {
            interpreter: interpreter.to_string(),
            task_path: path.display().to_string(),
            task_name: task.name.clone(),
        };
        let Ok(params) = serde_json::to_value(&params) else {
            continue;
        };
        match request(&method, params, None, &cancel).await {
            Ok(response) => match serde_json::from_value::<ConfigResult>(response) {
                Ok(result) if !result.error.is_empty() => {
                    tracing::warn!(task = %task.name, error = %result.error, "task reported a configuration error");
                }
                Ok(result) if !result.config.trim().is_empty() => {
                    defaults.insert(task.name.clone(), result.config);
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(task = %task.name, %error, "decoding {method} response"),
            },
            Err(error) => tracing::warn!(task = %task.name, %error, "getting default configuration failed"),
        }
    }
    defaults
}
