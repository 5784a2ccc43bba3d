//! Numeric outcome codes shared with external tasks.
//!
//! The integer values are part of the external-task contract (exit codes and
//! RPC payloads) and must never be renumbered.

use serde::{Deserialize, Serialize};

/// Result of running a task; external tasks report it as their exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum TaskRetVal {
    Normal,
    Fail,
    MechanismFail,
    ConfigurationError,
    PipelineAborted,
    RobotStopping,
    NotFound,
    Success,
}

impl TaskRetVal {
    pub fn code(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::Fail => 1,
            Self::MechanismFail => 2,
            Self::ConfigurationError => 3,
            Self::PipelineAborted => 4,
            Self::RobotStopping => 5,
            Self::NotFound => 6,
            Self::Success => 7,
        }
    }

    /// Map a process exit code; anything outside the known range is a
    /// mechanism failure.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Normal,
            1 => Self::Fail,
            2 => Self::MechanismFail,
            3 => Self::ConfigurationError,
            4 => Self::PipelineAborted,
            5 => Self::RobotStopping,
            6 => Self::NotFound,
            7 => Self::Success,
            _ => Self::MechanismFail,
        }
    }
}

impl From<TaskRetVal> for i32 {
    fn from(value: TaskRetVal) -> Self {
        value.code()
    }
}

impl From<i32> for TaskRetVal {
    fn from(value: i32) -> Self {
        Self::from_code(value)
    }
}

impl std::fmt::Display for TaskRetVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::Fail => "Fail",
            Self::MechanismFail => "MechanismFail",
            Self::ConfigurationError => "ConfigurationError",
            Self::PipelineAborted => "PipelineAborted",
            Self::RobotStopping => "RobotStopping",
            Self::NotFound => "NotFound",
            Self::Success => "Success",
        };
        write!(f, "{name}")
    }
}

macro_rules! retvals {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// Result of a robot method call.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "i32", from = "i32")]
        pub enum RetVal {
            $($name,)+
        }

        impl RetVal {
            pub fn code(self) -> i32 {
                match self {
                    $(Self::$name => $code,)+
                }
            }

            pub fn from_code(code: i32) -> Self {
                match code {
                    $($code => Self::$name,)+
                    _ => Self::Failed,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)+
                }
            }
        }

        impl Default for RetVal {
            fn default() -> Self {
                Self::Ok
            }
        }
    };
}

retvals! {
    Ok = 0,
    UserNotFound = 1,
    ChannelNotFound = 2,
    AttributeNotFound = 3,
    FailedMessageSend = 4,
    FailedChannelJoin = 5,
    DatumNotFound = 6,
    DatumLockExpired = 7,
    DataFormatError = 8,
    BrainFailed = 9,
    InvalidDatumKey = 10,
    InvalidConfigPointer = 11,
    ConfigUnmarshalError = 12,
    NoConfigFound = 13,
    RetryPrompt = 14,
    ReplyNotMatched = 15,
    UseDefaultValue = 16,
    TimeoutExpired = 17,
    Interrupted = 18,
    MatcherNotFound = 19,
    NoUserEmail = 20,
    NoBotEmail = 21,
    MailError = 22,
    TaskNotFound = 23,
    MissingArguments = 24,
    InvalidStage = 25,
    InvalidTaskType = 26,
    CommandNotMatched = 27,
    TaskDisabled = 28,
    PrivilegeViolation = 29,
    Failed = 63,
}

impl From<RetVal> for i32 {
    fn from(value: RetVal) -> Self {
        value.code()
    }
}

impl From<i32> for RetVal {
    fn from(value: i32) -> Self {
        Self::from_code(value)
    }
}

impl std::fmt::Display for RetVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outgoing message formatting hint for connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum MessageFormat {
    Raw,
    Fixed,
    #[default]
    Variable,
}

impl MessageFormat {
    /// Parse a configuration or RPC format name; unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "raw" => Some(Self::Raw),
            "fixed" => Some(Self::Fixed),
            "variable" => Some(Self::Variable),
            _ => None,
        }
    }
}

impl From<MessageFormat> for i32 {
    fn from(value: MessageFormat) -> Self {
        match value {
            MessageFormat::Raw => 0,
            MessageFormat::Fixed => 1,
            MessageFormat::Variable => 2,
        }
    }
}

impl From<i32> for MessageFormat {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Raw,
            1 => Self::Fixed,
            _ => Self::Variable,
        }
    }
}

impl std::fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => write!(f, "Raw"),
            Self::Fixed => write!(f, "Fixed"),
            Self::Variable => write!(f, "Variable"),
        }
    }
}

/// Severity used by the task-facing `Log` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Audit,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "audit" => Some(Self::Audit),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }

    /// Emit `message` through tracing at the matching level.
    pub fn emit(self, task: &str, message: &str) {
        match self {
            Self::Trace => tracing::trace!(task, "{message}"),
            Self::Debug => tracing::debug!(task, "{message}"),
            Self::Info => tracing::info!(task, "{message}"),
            Self::Audit => tracing::warn!(target: "gopherbot::audit", task, "{message}"),
            Self::Warn => tracing::warn!(task, "{message}"),
            Self::Error | Self::Fatal => tracing::error!(task, "{message}"),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Trace => "Trace",
            Self::Debug => "Debug",
            Self::Info => "Info",
            Self::Audit => "Audit",
            Self::Warn => "Warn",
            Self::Error => "Error",
            Self::Fatal => "Fatal",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_retval_codes_are_stable() {
        assert_eq!(TaskRetVal::Normal.code(), 0);
        assert_eq!(TaskRetVal::PipelineAborted.code(), 4);
        assert_eq!(TaskRetVal::Success.code(), 7);
        assert_eq!(TaskRetVal::from_code(42), TaskRetVal::MechanismFail);
        assert_eq!(TaskRetVal::from_code(-1), TaskRetVal::MechanismFail);
    }

    #[test]
    fn retval_serializes_as_integer() {
        let encoded = serde_json::to_string(&RetVal::DatumLockExpired).expect("serialize");
        assert_eq!(encoded, "7");
        let decoded: RetVal = serde_json::from_str("63").expect("deserialize");
        assert_eq!(decoded, RetVal::Failed);
        assert_eq!(RetVal::from_code(1000), RetVal::Failed);
        assert_eq!(RetVal::PrivilegeViolation.to_string(), "PrivilegeViolation");
    }

    #[test]
    fn message_format_parses_names() {
        assert_eq!(MessageFormat::parse("Fixed"), Some(MessageFormat::Fixed));
        assert_eq!(MessageFormat::parse(" raw "), Some(MessageFormat::Raw));
        assert_eq!(MessageFormat::parse("bold"), None);
    }
}
