//! The `pipeline-child-rpc` side of the protocol.
//!
//! Exit codes: 0 after `shutdown` or EOF, 2 on a protocol violation.

use super::interpreter::{self, ConfigParams, ConfigResult, RunParams, RunResult};
use super::robot_call::{CallOptions, CallRequest};
use super::{MessageType, PROTOCOL_VERSION, ReadError, RpcMessage, read_message, write_message};
use crate::retval::TaskRetVal;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};

const PROTOCOL_VIOLATION: i32 = 2;

/// Serve one parent on the process's stdin and stdout.
pub async fn run_stdio() -> i32 {
    serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// The parent end of a running exchange: used to issue `robot_call`s
/// while a `*_run` request is in flight.
struct Parent<R, W> {
    reader: R,
    writer: W,
    seq: u64,
}

impl<R, W> Parent<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn send(&mut self, message: &RpcMessage) -> Result<(), i32> {
        write_message(&mut self.writer, message)
            .await
            .map_err(|_| PROTOCOL_VIOLATION)
    }

    async fn respond<T: Serialize>(&mut self, id: &str, result: &T) -> Result<(), i32> {
        let result = serde_json::to_value(result).map_err(|_| PROTOCOL_VIOLATION)?;
        self.send(&RpcMessage::response(id, result)).await
    }

    async fn robot_call(&mut self, request: CallRequest) -> Result<Value, String> {
        self.seq += 1;
        let id = format!("robot-{}", self.seq);
        let params = serde_json::to_value(&request).map_err(|error| error.to_string())?;
        write_message(&mut self.writer, &RpcMessage::request(&id, "robot_call", Some(params)))
            .await
            .map_err(|error| error.to_string())?;
        loop {
            let message = read_message(&mut self.reader)
                .await
                .map_err(|error| format!("reading robot_call response: {error}"))?;
            if message.id != id {
                continue;
            }
            match message.kind {
                MessageType::Response => return Ok(message.result.unwrap_or_else(|| json!({}))),
                MessageType::Error => {
                    return Err(match message.error {
                        Some(body) => format!("{}: {}", body.code, body.message),
                        None => "rpc robot call failed".into(),
                    });
                }
                _ => {}
            }
        }
    }
}

fn decode<T: DeserializeOwned>(message: &RpcMessage) -> Result<T, String> {
    serde_json::from_value(message.params.clone().unwrap_or(Value::Null))
        .map_err(|error| format!("invalid {} params: {error}", message.method()))
}

/// Handle hello, then requests until shutdown or EOF.
pub async fn serve<R, W>(reader: R, writer: W) -> i32
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut parent = Parent { reader, writer, seq: 0 };

    let hello = match read_message(&mut parent.reader).await {
        Ok(message) => message,
        Err(_) => return PROTOCOL_VIOLATION,
    };
    if hello.kind != MessageType::Hello || hello.version != PROTOCOL_VERSION {
        let _ = parent
            .send(&RpcMessage::error(
                &hello.id,
                "protocol_error",
                format!("expected hello v{PROTOCOL_VERSION}"),
            ))
            .await;
        return PROTOCOL_VIOLATION;
    }
    if parent.send(&RpcMessage::hello_ack(&hello.id)).await.is_err() {
        return PROTOCOL_VIOLATION;
    }

    loop {
        let message = match read_message(&mut parent.reader).await {
            Ok(message) => message,
            Err(ReadError::Eof) => return 0,
            Err(_) => return PROTOCOL_VIOLATION,
        };
        if message.version != PROTOCOL_VERSION {
            let _ = parent
                .send(&RpcMessage::error(
                    &message.id,
                    "protocol_error",
                    format!("unsupported version {}", message.version),
                ))
                .await;
            continue;
        }
        if message.kind != MessageType::Request {
            let _ = parent
                .send(&RpcMessage::error(&message.id, "protocol_error", "expected request message"))
                .await;
            continue;
        }
        let outcome = match message.method() {
            "shutdown" => {
                let _ = parent.respond(&message.id, &json!({ "ok": true })).await;
                return 0;
            }
            "lua_run" | "js_run" | "go_plugin_run" | "go_job_run" | "go_task_run" => {
                handle_run(&mut parent, &message).await
            }
            "lua_get_config" | "js_get_config" | "go_get_config" => handle_get_config(&mut parent, &message).await,
            other => {
                parent
                    .send(&RpcMessage::error(
                        &message.id,
                        "method_not_found",
                        format!("unsupported method '{other}'"),
                    ))
                    .await
            }
        };
        if let Err(code) = outcome {
            return code;
        }
    }
}

async fn handle_run<R, W>(parent: &mut Parent<R, W>, message: &RpcMessage) -> Result<(), i32>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let params: RunParams = match decode(message) {
        Ok(params) => params,
        Err(error) => {
            return parent
                .send(&RpcMessage::error(&message.id, "invalid_params", error))
                .await;
        }
    };
    if message.method() == "go_plugin_run" && params.args.is_empty() {
        let result = RunResult {
            ret_val: TaskRetVal::MechanismFail.code(),
            error: "go_plugin_run requires command argument".into(),
        };
        return parent.respond(&message.id, &result).await;
    }

    // Calls and output share the one parent link; both borrow it in turn.
    let outcome = {
        let link = tokio::sync::Mutex::new(&mut *parent);
        let link = &link;
        interpreter::run(
            &params,
            move |request| async move {
                let mut parent = link.lock().await;
                parent.robot_call(request).await
            },
            move |line| async move {
                let mut parent = link.lock().await;
                let log = CallRequest {
                    method: "Log".into(),
                    options: CallOptions::default(),
                    args: vec![json!("info"), json!(line)],
                };
                let _ = parent.robot_call(log).await;
            },
        )
        .await
    };

    let result = match outcome {
        Ok(code) => RunResult {
            ret_val: code,
            error: String::new(),
        },
        Err(error) => RunResult {
            ret_val: TaskRetVal::MechanismFail.code(),
            error,
        },
    };
    parent.respond(&message.id, &result).await
}

async fn handle_get_config<R, W>(parent: &mut Parent<R, W>, message: &RpcMessage) -> Result<(), i32>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let params: ConfigParams = match decode(message) {
        Ok(params) => params,
        Err(error) => {
            return parent
                .send(&RpcMessage::error(&message.id, "invalid_params", error))
                .await;
        }
    };
    let result = match interpreter::get_config(&params).await {
        Ok(config) => ConfigResult {
            config,
            error: String::new(),
        },
        Err(error) => ConfigResult {
            config: String::new(),
            error,
        },
    };
    parent.respond(&message.id, &result).await
}
