//! Executing `robot_call` requests from the pipeline child against a
//! [`Robot`].

use crate::retval::{LogLevel, MessageFormat, RetVal};
use crate::robot::Robot;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Per-call messaging options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub direct: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub threaded: bool,
    /// A numeric code or a format name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub method: String,
    #[serde(default)]
    pub options: CallOptions,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("invalid robot_call params: {0}")]
    Params(#[from] serde_json::Error),
    #[error("argument {index}: expected {expected}")]
    Argument { index: usize, expected: &'static str },
    #[error("unsupported robot call '{0}'")]
    Unsupported(String),
}

fn format_option(value: &Value) -> Option<MessageFormat> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .and_then(|code| i32::try_from(code).ok())
            .map(MessageFormat::from),
        Value::String(name) => MessageFormat::parse(name),
        _ => None,
    }
}

/// Positional argument accessors mirroring what script libraries send.
struct Args<'a>(&'a [Value]);

impl Args<'_> {
    fn any(&self, index: usize) -> Result<&Value, CallError> {
        self.0.get(index).ok_or(CallError::Argument {
            index,
            expected: "a value",
        })
    }

    fn string(&self, index: usize) -> Result<String, CallError> {
        match self.any(index)? {
            Value::String(text) => Ok(text.clone()),
            Value::Null => Ok(String::new()),
            Value::Number(number) => Ok(number.to_string()),
            Value::Bool(flag) => Ok(flag.to_string()),
            _ => Err(CallError::Argument {
                index,
                expected: "a string",
            }),
        }
    }

    fn boolean(&self, index: usize) -> Result<bool, CallError> {
        match self.any(index)? {
            Value::Bool(flag) => Ok(*flag),
            Value::String(text) => match text.to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" | "" => Ok(false),
                _ => Err(CallError::Argument {
                    index,
                    expected: "a boolean",
                }),
            },
            Value::Number(number) => Ok(number.as_f64().is_some_and(|n| n != 0.0)),
            _ => Err(CallError::Argument {
                index,
                expected: "a boolean",
            }),
        }
    }

    /// An optional trailing boolean, false when absent.
    fn flag(&self, index: usize) -> Result<bool, CallError> {
        if index < self.0.len() { self.boolean(index) } else { Ok(false) }
    }

    fn int(&self, index: usize) -> Result<i64, CallError> {
        let value = self.any(index)?;
        let parsed = match value {
            Value::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|n| n as i64)),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or(CallError::Argument {
            index,
            expected: "an integer",
        })
    }

    fn float(&self, index: usize) -> Result<f64, CallError> {
        let value = self.any(index)?;
        let parsed = match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or(CallError::Argument {
            index,
            expected: "a number",
        })
    }

    fn strings(&self, index: usize) -> Result<Vec<String>, CallError> {
        match self.any(index)? {
            Value::Array(items) => Args(items).tail(0),
            _ => Err(CallError::Argument {
                index,
                expected: "a list of strings",
            }),
        }
    }

    /// Every argument from `start` on, as strings.
    fn tail(&self, start: usize) -> Result<Vec<String>, CallError> {
        (start..self.0.len()).map(|index| self.string(index)).collect()
    }
}

fn ret(value: RetVal) -> Value {
    json!({ "ret_val": value.code() })
}

fn attribute((attribute, ret_val): (String, RetVal)) -> Value {
    json!({ "attribute": attribute, "ret_val": ret_val.code() })
}

fn reply((reply, ret_val): (String, RetVal)) -> Value {
    json!({ "reply": reply, "ret_val": ret_val.code() })
}

/// Decode and run one `robot_call`.
pub async fn handle(base: &Robot, params: Value) -> Result<Value, CallError> {
    let request: CallRequest = serde_json::from_value(params)?;
    let format = request.options.format.as_ref().and_then(format_option);
    let mut robot = base.clone();
    if request.options.direct {
        robot = robot.direct();
    }
    if request.options.threaded {
        robot = robot.threaded();
    }
    if let Some(format) = format {
        robot = robot.with_format(format);
    }
    let args = Args(&request.args);
    let r = &robot;

    let result = match request.method.as_str() {
        "CheckAdmin" => json!({ "bool": r.check_admin() }),
        "Elevate" => json!({ "bool": r.elevate(args.flag(0)?).await }),
        "GetBotAttribute" => attribute(r.bot_attribute(&args.string(0)?)),
        "GetUserAttribute" => attribute(r.user_attribute(&args.string(0)?, &args.string(1)?).await),
        "GetSenderAttribute" => attribute(r.sender_attribute(&args.string(0)?).await),
        "GetTaskConfig" => match r.task_config::<Value>() {
            Ok(config) => json!({ "ret_val": RetVal::Ok.code(), "config": config }),
            Err(ret_val) => json!({ "ret_val": ret_val.code(), "config": Value::Null }),
        },
        "GetMessage" => {
            let envelope = r.message();
            json!({
                "message": {
                    "user": envelope.user,
                    "protocol_user": envelope.user_id,
                    "channel": envelope.channel,
                    "protocol_channel": envelope.channel_id,
                    "thread": envelope.thread,
                    "message_id": envelope.message_id,
                    "threaded": envelope.threaded,
                    "protocol": envelope.protocol,
                    "format": i32::from(MessageFormat::default()),
                }
            })
        }
        "GetParameter" => json!({ "string": r.parameter(&args.string(0)?) }),
        "SetParameter" => json!({ "bool": r.set_parameter(&args.string(0)?, &args.string(1)?) }),
        "Email" => ret(r.email(&args.string(0)?, &args.string(1)?).await),
        "EmailUser" => ret(r.email_user(&args.string(0)?, &args.string(1)?, &args.string(2)?).await),
        "EmailAddress" => ret(
            r.email_address(&args.string(0)?, &args.string(1)?, &args.string(2)?)
                .await,
        ),
        "Exclusive" => json!({ "bool": r.exclusive(&args.string(0)?, args.flag(1)?) }),
        "Log" => {
            let level = match args.any(0)? {
                Value::String(name) => LogLevel::parse(name),
                _ => log_level_code(args.int(0)?),
            };
            match level {
                Some(level) => {
                    r.log(level, &args.string(1)?);
                    json!({ "bool": true })
                }
                None => json!({ "bool": false }),
            }
        }
        "Say" => ret(r.say(&args.string(0)?).await),
        "SayThread" => ret(r.say_thread(&args.string(0)?).await),
        "Reply" => ret(r.reply(&args.string(0)?).await),
        "ReplyThread" => ret(r.reply_thread(&args.string(0)?).await),
        "SendChannelMessage" => ret(r.send_channel_message(&args.string(0)?, &args.string(1)?).await),
        "SendChannelThreadMessage" => ret(
            r.send_channel_thread_message(&args.string(0)?, &args.string(1)?, &args.string(2)?)
                .await,
        ),
        "SendUserMessage" => ret(r.send_user_message(&args.string(0)?, &args.string(1)?).await),
        "SendUserChannelMessage" => ret(
            r.send_user_channel_message(&args.string(0)?, &args.string(1)?, &args.string(2)?)
                .await,
        ),
        "SendUserChannelThreadMessage" => ret(
            r.send_user_channel_thread_message(
                &args.string(0)?,
                &args.string(1)?,
                &args.string(2)?,
                &args.string(3)?,
            )
            .await,
        ),
        "SendProtocolUserChannelMessage" => ret(
            r.send_protocol_user_channel_message(
                &args.string(0)?,
                &args.string(1)?,
                &args.string(2)?,
                &args.string(3)?,
            )
            .await,
        ),
        "PromptForReply" => reply(r.prompt_for_reply(&args.string(0)?, &args.string(1)?).await),
        "PromptThreadForReply" => reply(r.prompt_thread_for_reply(&args.string(0)?, &args.string(1)?).await),
        "PromptUserForReply" => reply(
            r.prompt_user_for_reply(&args.string(0)?, &args.string(1)?, &args.string(2)?)
                .await,
        ),
        "PromptUserChannelForReply" => reply(
            r.prompt_user_channel_for_reply(
                &args.string(0)?,
                &args.string(1)?,
                &args.string(2)?,
                &args.string(3)?,
            )
            .await,
        ),
        "PromptUserChannelThreadForReply" => reply(
            r.prompt_user_channel_thread_for_reply(
                &args.string(0)?,
                &args.string(1)?,
                &args.string(2)?,
                &args.string(3)?,
                &args.string(4)?,
            )
            .await,
        ),
        "RandomInt" => json!({ "int": r.random_int(args.int(0)?) }),
        "RandomString" => json!({ "string": r.random_string(&args.strings(0)?) }),
        "Pause" => {
            r.pause(args.float(0)?).await;
            json!({ "ok": true })
        }
        "CheckoutDatum" => {
            let checkout = r.check_out_datum(&args.string(0)?, args.flag(1)?).await;
            json!({
                "lock_token": checkout.lock_token,
                "exists": checkout.exists,
                "datum": checkout.datum,
                "ret_val": checkout.ret.code(),
            })
        }
        "CheckinDatum" => {
            r.check_in_datum(&args.string(0)?, &args.string(1)?).await;
            json!({ "ok": true })
        }
        "UpdateDatum" => ret(
            r.update_datum(&args.string(0)?, &args.string(1)?, args.any(2)?)
                .await,
        ),
        "Remember" => {
            r.remember(&args.string(0)?, &args.string(1)?, args.flag(2)?);
            json!({ "ok": true })
        }
        "RememberThread" => {
            r.remember_thread(&args.string(0)?, &args.string(1)?, args.flag(2)?);
            json!({ "ok": true })
        }
        "RememberContext" => {
            r.remember_context(&args.string(0)?, &args.string(1)?);
            json!({ "ok": true })
        }
        "RememberContextThread" => {
            r.remember_context_thread(&args.string(0)?, &args.string(1)?);
            json!({ "ok": true })
        }
        "Recall" => json!({ "string": r.recall(&args.string(0)?, args.flag(1)?) }),
        "SpawnJob" => ret(r.spawn_job(&args.string(0)?, &args.tail(1)?)),
        "AddTask" => ret(r.add_task(&args.string(0)?, &args.tail(1)?)),
        "FinalTask" => ret(r.final_task(&args.string(0)?, &args.tail(1)?)),
        "FailTask" => ret(r.fail_task(&args.string(0)?, &args.tail(1)?)),
        "AddJob" => ret(r.add_job(&args.string(0)?, &args.tail(1)?)),
        "AddCommand" => ret(r.add_command(&args.string(0)?, &args.string(1)?)),
        "FinalCommand" => ret(r.final_command(&args.string(0)?, &args.string(1)?)),
        "FailCommand" => ret(r.fail_command(&args.string(0)?, &args.string(1)?)),
        "Subscribe" => json!({ "bool": r.subscribe() }),
        "Unsubscribe" => json!({ "bool": r.unsubscribe() }),
        "JoinChannel" => ret(r.join_channel(&args.string(0)?).await),
        "RaisePriv" => json!({ "bool": r.raise_priv(&args.string(0)?) }),
        "DropPriv" => {
            r.drop_priv();
            json!({ "ok": true })
        }
        "SetWorkingDirectory" => json!({ "bool": r.set_working_directory(&args.string(0)?) }),
        other => return Err(CallError::Unsupported(other.to_string())),
    };
    Ok(result)
}

/// Numeric log levels as the script libraries number them.
fn log_level_code(code: i64) -> Option<LogLevel> {
    match code {
        0 => Some(LogLevel::Trace),
        1 => Some(LogLevel::Debug),
        2 => Some(LogLevel::Info),
        3 => Some(LogLevel::Audit),
        4 => Some(LogLevel::Warn),
        5 => Some(LogLevel::Error),
        6 => Some(LogLevel::Fatal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_coerce_loosely() {
        let values = vec![json!("deploy"), json!(3), json!("true"), json!(["a", "b"]), json!(1.5)];
        let args = Args(&values);
        assert_eq!(args.string(0).expect("string"), "deploy");
        assert_eq!(args.string(1).expect("number as string"), "3");
        assert_eq!(args.int(1).expect("int"), 3);
        assert!(args.boolean(2).expect("bool"));
        assert_eq!(args.strings(3).expect("list"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(args.float(4).expect("float"), 1.5);
        assert!(!args.flag(9).expect("absent flag"));
        assert!(matches!(args.string(9), Err(CallError::Argument { index: 9, .. })));
        assert_eq!(args.tail(4).expect("tail"), vec!["1.5".to_string()]);
        assert!(args.tail(3).is_err());
    }

    #[test]
    fn options_accept_codes_and_names() {
        assert_eq!(format_option(&json!(1)), Some(MessageFormat::Fixed));
        assert_eq!(format_option(&json!("raw")), Some(MessageFormat::Raw));
        assert_eq!(format_option(&json!("bogus")), None);

        let request: CallRequest = serde_json::from_value(json!({
            "method": "Say",
            "options": {"direct": true, "format": "fixed"},
            "args": ["hello"]
        }))
        .expect("request");
        assert!(request.options.direct);
        assert!(!request.options.threaded);
        assert_eq!(request.args, vec![json!("hello")]);
    }

    #[test]
    fn numeric_log_levels() {
        assert_eq!(log_level_code(0), Some(LogLevel::Trace));
        assert_eq!(log_level_code(5), Some(LogLevel::Error));
        assert_eq!(log_level_code(42), None);
    }
}
