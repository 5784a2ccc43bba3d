//! The pipeline child protocol.
//!
//! Interpreted tasks (Lua, JavaScript, Go scripts) don't run in the robot
//! process. The parent re-executes itself as `gopherbot pipeline-child-rpc`
//! and talks to that child over newline-delimited JSON on stdin/stdout:
//!
//! ```text
//! parent -> {"version":1,"id":"hello","type":"hello"}
//! child  -> {"version":1,"id":"hello","type":"hello_ack"}
//! parent -> {"version":1,"id":"req-1","type":"request","method":"lua_run","params":{..}}
//! child  -> {"version":1,"id":"robot-1","type":"request","method":"robot_call","params":{..}}
//! parent -> {"version":1,"id":"robot-1","type":"response","result":{..}}
//! child  -> {"version":1,"id":"req-1","type":"response","result":{"ret_val":0}}
//! parent -> {"version":1,"id":"shutdown","type":"request","method":"shutdown"}
//! child  -> {"version":1,"id":"shutdown","type":"response","result":{"ok":true}}
//! ```

pub mod child;
pub mod interpreter;
pub mod parent;
pub mod robot_call;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};

pub const PROTOCOL_VERSION: u32 = 1;

/// Hidden CLI subcommand the parent spawns.
pub const CHILD_COMMAND: &str = "pipeline-child-rpc";

pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
pub const GET_CONFIG_TIMEOUT: Duration = Duration::from_secs(20);
pub const RUN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// How long to wait for the child to exit after shutdown.
pub const CHILD_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Child stderr kept for error details.
pub const STDERR_CAP: usize = 64 * 1024;

/// Deadline for a top-level request method.
pub fn method_timeout(method: &str) -> Duration {
    if method.ends_with("_run") {
        RUN_TIMEOUT
    } else {
        GET_CONFIG_TIMEOUT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Hello,
    HelloAck,
    Request,
    Response,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RpcMessage {
    fn new(id: &str, kind: MessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: id.to_string(),
            kind,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn hello() -> Self {
        Self::new("hello", MessageType::Hello)
    }

    pub fn hello_ack(id: &str) -> Self {
        Self::new(id, MessageType::HelloAck)
    }

    pub fn request(id: &str, method: &str, params: Option<Value>) -> Self {
        Self {
            method: Some(method.to_string()),
            params,
            ..Self::new(id, MessageType::Request)
        }
    }

    pub fn response(id: &str, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(id, MessageType::Response)
        }
    }

    pub fn error(id: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
            ..Self::new(id, MessageType::Error)
        }
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }
}

/// Failure codes carried by [`PipelineRpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Canceled,
    Timeout,
    ContextError,
    ChildExit,
    IoError,
    ProtocolError,
    EncodingError,
    RequestFailed,
    ShutdownFailed,
    ChildTimeout,
    ChildStart,
    /// An error reported by the child, carrying its own code.
    Remote,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::ContextError => "context_error",
            Self::ChildExit => "child_exit",
            Self::IoError => "io_error",
            Self::ProtocolError => "protocol_error",
            Self::EncodingError => "encoding_error",
            Self::RequestFailed => "request_failed",
            Self::ShutdownFailed => "shutdown_failed",
            Self::ChildTimeout => "child_timeout",
            Self::ChildStart => "child_start",
            Self::Remote => "remote",
        }
    }
}

/// A failed exchange with the pipeline child.
#[derive(Debug, thiserror::Error)]
pub struct PipelineRpcError {
    /// Wire code; for [`ErrorCode::Remote`] the child's code.
    pub code: String,
    pub kind: ErrorCode,
    pub method: String,
    pub detail: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PipelineRpcError {
    pub fn new(kind: ErrorCode, method: &str, detail: impl Into<String>) -> Self {
        Self {
            code: kind.as_str().to_string(),
            kind,
            method: method.to_string(),
            detail: detail.into(),
            cause: None,
        }
    }

    pub fn caused_by(mut self, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// An `error` message from the child.
    pub fn remote(method: &str, body: &ErrorBody) -> Self {
        Self {
            code: body.code.clone(),
            kind: ErrorCode::Remote,
            method: method.to_string(),
            detail: body.message.clone(),
            cause: None,
        }
    }
}

impl std::fmt::Display for PipelineRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipeline rpc")?;
        if !self.method.is_empty() {
            write!(f, " ({})", self.method)?;
        }
        if !self.code.is_empty() {
            write!(f, " [{}]", self.code)?;
        }
        match (&self.detail, &self.cause) {
            (detail, Some(cause)) if detail.is_empty() => write!(f, ": {cause}"),
            (detail, Some(cause)) => write!(f, ": {detail}: {cause}"),
            (detail, None) if !detail.is_empty() => write!(f, ": {detail}"),
            _ => Ok(()),
        }
    }
}

/// Why a message couldn't be read.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("stream closed")]
    Eof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Read the next non-blank line and decode it.
pub async fn read_message<R>(reader: &mut R) -> Result<RpcMessage, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ReadError::Eof);
        }
        if !line.trim().is_empty() {
            return Ok(serde_json::from_str(line.trim())?);
        }
    }
}

pub async fn write_message<W>(writer: &mut W, message: &RpcMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn error_display_includes_every_part() {
        let error = PipelineRpcError::new(ErrorCode::Timeout, "lua_run", "rpc response timed out")
            .caused_by("deadline exceeded");
        assert_eq!(
            error.to_string(),
            "pipeline rpc (lua_run) [timeout]: rpc response timed out: deadline exceeded"
        );

        let bare = PipelineRpcError::new(ErrorCode::ChildExit, "", "");
        assert_eq!(bare.to_string(), "pipeline rpc [child_exit]");

        let remote = PipelineRpcError::remote(
            "js_run",
            &ErrorBody {
                code: "method_not_found".into(),
                message: "unsupported method 'js_run'".into(),
            },
        );
        assert_eq!(
            remote.to_string(),
            "pipeline rpc (js_run) [method_not_found]: unsupported method 'js_run'"
        );
    }

    #[test]
    fn messages_omit_empty_fields() {
        let hello = serde_json::to_string(&RpcMessage::hello()).expect("encode");
        assert_eq!(hello, r#"{"version":1,"id":"hello","type":"hello"}"#);

        let error = serde_json::to_value(RpcMessage::error("req-1", "invalid_params", "bad")).expect("encode");
        assert_eq!(error["type"], "error");
        assert_eq!(error["error"]["code"], "invalid_params");
        assert!(error.get("result").is_none());
    }

    #[test]
    fn run_methods_get_the_long_deadline() {
        assert_eq!(method_timeout("go_job_run"), RUN_TIMEOUT);
        assert_eq!(method_timeout("lua_get_config"), GET_CONFIG_TIMEOUT);
    }

    #[tokio::test]
    async fn framing_skips_blank_lines_and_reports_eof() {
        let input = b"\n{\"version\":1,\"id\":\"x\",\"type\":\"hello_ack\"}\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let message = read_message(&mut reader).await.expect("message");
        assert_eq!(message.kind, MessageType::HelloAck);
        assert_eq!(message.id, "x");
        assert!(matches!(read_message(&mut reader).await, Err(ReadError::Eof)));
    }
}
