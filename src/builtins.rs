//! Compiled-in tasks: every robot ships these, configured by the stock YAML
//! below and overridable like any other task.

pub mod admin;
pub mod help;
pub mod memory;
pub mod tasks;
pub mod totp;

use crate::catalog::build::BuiltinTask;
use crate::config::ConfigKind;
use crate::retval::{MessageFormat, TaskRetVal};
use crate::robot::{Robot, TaskHandler};

use async_trait::async_trait;
use std::sync::Arc;

const PING_CONFIG: &str = r#"
AllChannels: true
AllowDirect: true
Help:
- Keywords: [ "ping" ]
  Helptext: [ "(bot), ping - see if the robot is alive" ]
- Keywords: [ "whoami", "user", "identity" ]
  Helptext: [ "(bot), whoami - report your user name and where you're talking to me from" ]
CommandMatchers:
- Command: ping
  Regex: '(?i:ping)'
- Command: hello
  Regex: '(?i:hi|hello|howdy)'
- Command: whoami
  Regex: '(?i:whoami|who am I\??)'
AllowedHiddenCommands: [ "ping", "whoami" ]
"#;

fn builtin(name: &str, kind: ConfigKind, description: &str, config: Option<&str>) -> BuiltinTask {
    BuiltinTask {
        name: name.to_string(),
        kind,
        description: description.to_string(),
        default_config: config.map(str::to_string),
    }
}

/// Every compiled-in task with its handler.
pub fn handlers() -> Vec<(BuiltinTask, Arc<dyn TaskHandler>)> {
    vec![
        (
            builtin("ping", ConfigKind::Plugin, "liveness and identity checks", Some(PING_CONFIG)),
            Arc::new(Ping),
        ),
        (
            builtin(
                "builtin-admin",
                ConfigKind::Plugin,
                "robot administration",
                Some(admin::CONFIG),
            ),
            Arc::new(admin::Admin),
        ),
        (
            builtin("help", ConfigKind::Plugin, "help for available commands", Some(help::CONFIG)),
            Arc::new(help::Help),
        ),
        (
            builtin("memory", ConfigKind::Plugin, "long and short-term memories", Some(memory::CONFIG)),
            Arc::new(memory::Memory),
        ),
        (
            builtin("totp", ConfigKind::Plugin, "TOTP elevator", Some(totp::CONFIG)),
            Arc::new(totp::Totp::default()),
        ),
        (
            builtin("send-message", ConfigKind::Task, "send the arguments as a message", None),
            Arc::new(tasks::SendMessage),
        ),
        (
            builtin("tail-log", ConfigKind::Task, "show the end of the pipeline log", None),
            Arc::new(tasks::TailLog),
        ),
        (
            builtin(
                "pause-notifies",
                ConfigKind::Job,
                "remind users about jobs they paused",
                None,
            ),
            Arc::new(tasks::PauseNotifies),
        ),
        (
            builtin("restart-robot", ConfigKind::Task, "restart the robot", None),
            Arc::new(tasks::RestartRobot),
        ),
    ]
}

struct Ping;

#[async_trait]
impl TaskHandler for Ping {
    async fn run(&self, robot: &Robot, command: &str, _args: &[String]) -> TaskRetVal {
        match command {
            "ping" => {
                robot.with_format(MessageFormat::Fixed).reply("PONG").await;
            }
            "hello" => {
                robot.reply("Howdy. Try 'help' if you want usage information.").await;
            }
            "whoami" => {
                let message = robot.message();
                let mut text = format!(
                    "You are '{}' user '{}/{}', speaking in channel '{}/{}'",
                    message.protocol, message.user, message.user_id, message.channel, message.channel_id
                );
                let (email, ret) = robot.sender_attribute("email").await;
                if ret == crate::retval::RetVal::Ok {
                    text.push_str(&format!(", email address: {email}"));
                }
                robot.say(&text).await;
            }
            _ => {}
        }
        TaskRetVal::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConf;

    #[test]
    fn stock_configs_decode() {
        for (builtin, _) in handlers() {
            let Some(config) = builtin.default_config else {
                continue;
            };
            let mut doc: serde_yaml::Value = serde_yaml::from_str(&config).expect("yaml");
            if let Some(map) = doc.as_mapping_mut() {
                map.remove("Config");
            }
            serde_yaml::from_value::<TaskConf>(doc)
                .unwrap_or_else(|error| panic!("{} config: {error}", builtin.name));
        }
    }

    #[test]
    fn builtin_names_are_unique() {
        let names: std::collections::HashSet<_> = handlers().into_iter().map(|(builtin, _)| builtin.name).collect();
        assert_eq!(names.len(), handlers().len());
    }
}
