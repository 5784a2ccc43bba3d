//! Running a script under its interpreter inside the pipeline child.
//!
//! The script speaks a line protocol on its stdio: every stdout line that
//! is a JSON object with a `method` is a robot call, answered with one JSON
//! line on the script's stdin. Anything else on stdout is task output.

use super::robot_call::CallRequest;
use crate::env::Environment;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::Command;

/// Largest configuration document a script may print.
const CONFIG_CAP: u64 = 1024 * 1024;

/// Parameters of every `*_run` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub interpreter: String,
    pub task_path: String,
    pub task_name: String,
    #[serde(default)]
    pub env: Environment,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub ret_val: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Parameters of every `*_get_config` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigParams {
    pub interpreter: String,
    pub task_path: String,
    pub task_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// A robot call embedded in a script output line.
pub fn parse_call(line: &str) -> Option<CallRequest> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<CallRequest>(trimmed)
        .ok()
        .filter(|call| !call.method.is_empty())
}

fn command(interpreter: &str, task_path: &str) -> Command {
    let mut command = Command::new(interpreter);
    command.arg(task_path).kill_on_drop(true);
    command
}

/// Run the script to completion. `call` answers each robot call; other
/// output lines go to `output`. Returns the script's exit code.
pub async fn run<C, CF, O, OF>(params: &RunParams, mut call: C, mut output: O) -> Result<i32, String>
where
    C: FnMut(CallRequest) -> CF,
    CF: Future<Output = Result<Value, String>>,
    O: FnMut(String) -> OF,
    OF: Future<Output = ()>,
{
    let mut command = command(&params.interpreter, &params.task_path);
    command
        .args(&params.args)
        .env_clear()
        .envs(&params.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if !params.working_dir.is_empty() {
        command.current_dir(Path::new(&params.working_dir));
    }
    let mut child = command
        .spawn()
        .map_err(|error| format!("starting interpreter '{}': {error}", params.interpreter))?;
    let mut stdin = child.stdin.take().ok_or("script stdin unavailable")?;
    let stdout = child.stdout.take().ok_or("script stdout unavailable")?;

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|error| format!("reading script output: {error}"))?
    {
        let Some(request) = parse_call(&line) else {
            output(line).await;
            continue;
        };
        let answer = match call(request).await {
            Ok(result) => result,
            Err(error) => json!({ "error": error }),
        };
        let mut reply = serde_json::to_vec(&answer).map_err(|error| error.to_string())?;
        reply.push(b'\n');
        // A script that exits without reading its answer closes the pipe.
        if stdin.write_all(&reply).await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
    drop(stdin);

    let status = child
        .wait()
        .await
        .map_err(|error| format!("waiting for script: {error}"))?;
    status
        .code()
        .ok_or_else(|| format!("script '{}' terminated by {status}", params.task_name))
}

/// Ask the script for its default configuration: `<interp> <path> configure`.
pub async fn get_config(params: &ConfigParams) -> Result<String, String> {
    let mut command = command(&params.interpreter, &params.task_path);
    command
        .arg("configure")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    let mut child = command
        .spawn()
        .map_err(|error| format!("starting interpreter '{}': {error}", params.interpreter))?;
    let mut config = String::new();
    if let Some(stdout) = child.stdout.take() {
        stdout
            .take(CONFIG_CAP)
            .read_to_string(&mut config)
            .await
            .map_err(|error| format!("reading configuration: {error}"))?;
    }
    let status = child
        .wait()
        .await
        .map_err(|error| format!("waiting for script: {error}"))?;
    if !status.success() {
        return Err(format!("'{} configure' exited with {status}", params.task_path));
    }
    Ok(config)
}
