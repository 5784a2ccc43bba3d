//! The `totp` elevator: RFC 6238 codes with a per-user elevation window.

use crate::brain::MemoryKey;
use crate::retval::{LogLevel, RetVal, TaskRetVal};
use crate::robot::{Robot, TaskHandler};

use async_trait::async_trait;
use hmac::{Hmac, Mac as _};
use serde::Deserialize;
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const CONFIG: &str = r#"
AllChannels: true
AllowDirect: true
Help:
- Keywords: [ "check", "launch", "codes", "code", "totp" ]
  Helptext: [ "(bot), check launch code <code> - verify a TOTP code without elevating" ]
CommandMatchers:
- Command: check
  Regex: '(?i:check (?:launch )?codes? (\d{6}))'
Config:
  TimeoutSeconds: 7200
  TimeoutType: idle
  Users: []
"#;

const STEP_SECONDS: u64 = 30;
const DIGITS: u32 = 6;
/// Steps either side of now that still validate.
const SKEW: i64 = 1;
const LAST_CODE: &str = "lastTOTP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutType {
    /// Every successful elevation restarts the window.
    #[default]
    Idle,
    /// The window runs from the elevation that opened it.
    Absolute,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TotpUser {
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TotpConfig {
    pub timeout_seconds: u64,
    pub timeout_type: TimeoutType,
    pub users: Vec<TotpUser>,
}

impl TotpConfig {
    fn secret(&self, user: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|entry| entry.user == user)
            .map(|entry| entry.secret.as_str())
    }
}

/// RFC 4648 base32, case-insensitive, ignoring padding and spaces.
fn decode_base32(text: &str) -> Option<Vec<u8>> {
    let mut bits: u64 = 0;
    let mut count = 0u32;
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    for ch in text.chars().filter(|ch| !ch.is_whitespace() && *ch != '=') {
        let value = match ch.to_ascii_uppercase() {
            upper @ 'A'..='Z' => upper as u8 - b'A',
            digit @ '2'..='7' => digit as u8 - b'2' + 26,
            _ => return None,
        };
        bits = (bits << 5) | u64::from(value);
        count += 5;
        if count >= 8 {
            count -= 8;
            out.push((bits >> count) as u8);
            bits &= (1 << count) - 1;
        }
    }
    Some(out)
}

/// HOTP value for `counter`.
fn hotp(secret: &[u8], counter: u64) -> Option<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).ok()?;
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();
    let offset = usize::from(hash[hash.len() - 1] & 0x0f);
    let binary = (u32::from(hash[offset] & 0x7f) << 24)
        | (u32::from(hash[offset + 1]) << 16)
        | (u32::from(hash[offset + 2]) << 8)
        | u32::from(hash[offset + 3]);
    Some(format!("{:0width$}", binary % 10u32.pow(DIGITS), width = DIGITS as usize))
}

/// Whether `code` is valid for `secret` at unix time `now`.
fn validate(code: &str, secret: &str, now: u64) -> bool {
    if code.len() != DIGITS as usize || !code.bytes().all(|byte| byte.is_ascii_digit()) {
        return false;
    }
    let Some(key) = decode_base32(secret) else {
        return false;
    };
    let step = (now / STEP_SECONDS) as i64;
    (-SKEW..=SKEW)
        .filter_map(|delta| u64::try_from(step + delta).ok())
        .filter_map(|counter| hotp(&key, counter))
        .any(|expected| expected == code)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Default)]
pub struct Totp {
    last_elevation: Mutex<HashMap<String, Instant>>,
}

impl Totp {
    /// Check `code` for the sender and record it so it can't be replayed.
    fn check_code(robot: &Robot, config: &TotpConfig, code: &str) -> Result<bool, TaskRetVal> {
        let user = robot.message().user;
        let Some(secret) = config.secret(&user) else {
            robot.log(LogLevel::Error, &format!("no TOTP secret configured for user {user}"));
            return Err(TaskRetVal::MechanismFail);
        };
        let memories = robot.bot().brain.short_term();
        let key = MemoryKey::new(LAST_CODE, &user, "", None);
        if memories.recall(&key).as_deref() == Some(code) {
            tracing::warn!(target: "gopherbot::audit", %user, "attempt to re-use a TOTP code");
            return Ok(false);
        }
        let valid = validate(code, secret, unix_now());
        if valid {
            memories.remember(key, code);
        }
        Ok(valid)
    }

    async fn get_code(robot: &Robot, config: &TotpConfig, immediate: bool) -> TaskRetVal {
        let full_name = robot.bot().settings().bot.full_name.clone();
        let prompt = if immediate {
            format!("This command requires immediate elevation, please provide a TOTP code for '{full_name}':")
        } else {
            format!("This command requires elevation, please provide a TOTP code for '{full_name}':")
        };
        let (mut reply, mut ret) = robot.prompt_for_reply("OTP", &prompt).await;
        if ret != RetVal::Ok {
            (reply, ret) = robot
                .direct()
                .prompt_for_reply("OTP", "Try again? I need a 6-digit launch code")
                .await;
        }
        if ret != RetVal::Ok {
            robot.log(
                LogLevel::Error,
                &format!("user \"{}\" failed to respond to TOTP token prompt", robot.message().user),
            );
            return TaskRetVal::Fail;
        }
        match Self::check_code(robot, config, &reply) {
            Ok(true) => TaskRetVal::Success,
            Ok(false) => {
                robot.say("Invalid code").await;
                TaskRetVal::Fail
            }
            Err(_) => {
                robot
                    .say("There were technical issues validating your code, ask an administrator to check the log")
                    .await;
                TaskRetVal::MechanismFail
            }
        }
    }

    async fn elevate(&self, robot: &Robot, config: &TotpConfig, immediate: bool) -> TaskRetVal {
        let user = robot.message().user;
        let window = Duration::from_secs(config.timeout_seconds);
        let within_window = self
            .last_elevation
            .lock()
            .ok()
            .and_then(|last| last.get(&user).copied())
            .is_some_and(|at| at.elapsed() <= window);

        let asked = immediate || !within_window;
        let ret = if asked {
            Self::get_code(robot, config, immediate).await
        } else {
            TaskRetVal::Success
        };
        let restart_window = match config.timeout_type {
            TimeoutType::Idle => true,
            TimeoutType::Absolute => asked,
        };
        if ret == TaskRetVal::Success
            && restart_window
            && let Ok(mut last) = self.last_elevation.lock()
        {
            last.insert(user, Instant::now());
        }
        ret
    }
}

#[async_trait]
impl TaskHandler for Totp {
    async fn run(&self, robot: &Robot, command: &str, args: &[String]) -> TaskRetVal {
        let config: TotpConfig = match robot.task_config() {
            Ok(config) => config,
            Err(ret) => {
                robot.log(LogLevel::Error, &format!("loading TOTP configuration: {ret}"));
                return TaskRetVal::ConfigurationError;
            }
        };
        match command {
            "init" => {
                tracing::debug!(users = config.users.len(), "TOTP elevator configured");
                TaskRetVal::Normal
            }
            "check" => {
                let code = args.first().map(String::as_str).unwrap_or_default();
                match Self::check_code(robot, &config, code) {
                    Ok(true) => robot.say("Looks good - you're ready to wreak havoc!").await,
                    Ok(false) => robot.say("Sorry, that's not a valid code").await,
                    Err(_) => robot.say("Dang! I had a system problem verifying your code").await,
                };
                TaskRetVal::Normal
            }
            "elevate" => {
                let immediate = matches!(
                    args.first().map(String::as_str),
                    Some("true" | "True" | "t" | "T" | "Yes" | "yes" | "Y")
                );
                self.elevate(robot, &config, immediate).await
            }
            _ => TaskRetVal::Normal,
        }
    }
}

/// The current code for `secret`; used by tests that need a valid code.
#[cfg(test)]
pub(crate) fn current_code(secret: &str) -> String {
    let key = decode_base32(secret).expect("base32 secret");
    hotp(&key, unix_now() / STEP_SECONDS).expect("hotp")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// "12345678901234567890" in base32.
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn base32_decodes_the_rfc_secret() {
        assert_eq!(decode_base32(RFC_SECRET).expect("decode"), b"12345678901234567890".to_vec());
        assert_eq!(decode_base32("gezd gnbv").expect("decode"), b"12345".to_vec());
        assert!(decode_base32("not base32!").is_none());
    }

    #[test]
    fn codes_match_the_rfc_vectors() {
        // RFC 6238 appendix B, SHA1, truncated to six digits.
        assert!(validate("287082", RFC_SECRET, 59));
        assert!(validate("081804", RFC_SECRET, 1_111_111_109));
        assert!(validate("050471", RFC_SECRET, 1_111_111_111));
        assert!(!validate("000000", RFC_SECRET, 59));
        assert!(!validate("28708", RFC_SECRET, 59));
    }

    #[test]
    fn neighbouring_steps_are_accepted() {
        assert!(validate("287082", RFC_SECRET, 59 + STEP_SECONDS));
        assert!(!validate("287082", RFC_SECRET, 59 + 3 * STEP_SECONDS));
    }

    #[test]
    fn config_decodes_from_task_yaml() {
        let config: TotpConfig = serde_json::from_value(serde_json::json!({
            "TimeoutSeconds": 60,
            "TimeoutType": "absolute",
            "Users": [{"User": "alice", "Secret": RFC_SECRET}],
        }))
        .expect("config");
        assert_eq!(config.timeout_type, TimeoutType::Absolute);
        assert_eq!(config.secret("alice"), Some(RFC_SECRET));
        assert_eq!(config.secret("bob"), None);
    }
}
