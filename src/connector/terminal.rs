//! Interactive terminal connector for plugin development.
//!
//! Lines typed on stdin are heard as messages from the current user in the
//! current channel. `|c<channel>` switches channel (empty for a direct
//! message), `|u<user>` switches user, and `|t` toggles threading.

use super::{Connector, ConnectorContext, IncomingSender, OutgoingMessage, Target};
use crate::error::ConnectorError;
use crate::message::{BotInfo, ConnectorMessage};
use crate::retval::RetVal;

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct TerminalConfig {
    start_channel: String,
    start_user: String,
    channels: Vec<String>,
    bot_name: String,
    bot_full_name: String,
}

#[derive(Debug)]
struct Session {
    channel: String,
    user: String,
    thread: Option<String>,
    channels: Vec<String>,
}

#[derive(Debug)]
pub struct TerminalConnector {
    protocol: String,
    bot: BotInfo,
    session: Mutex<Session>,
    user_map: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
}

impl TerminalConnector {
    pub fn from_context(context: &ConnectorContext) -> Result<Self, ConnectorError> {
        let config: TerminalConfig = match &context.config {
            Some(value) => serde_json::from_value(value.clone()).map_err(|error| {
                ConnectorError::Lifecycle(format!("invalid terminal ProtocolConfig: {error}"))
            })?,
            None => TerminalConfig::default(),
        };
        let mut bot = context.bot.clone();
        if !config.bot_name.is_empty() {
            bot.user_name = config.bot_name;
        }
        if !config.bot_full_name.is_empty() {
            bot.full_name = config.bot_full_name;
        }
        let mut channels = config.channels;
        if !config.start_channel.is_empty() && !channels.contains(&config.start_channel) {
            channels.push(config.start_channel.clone());
        }
        Ok(Self {
            protocol: context.protocol.clone(),
            bot,
            session: Mutex::new(Session {
                channel: config.start_channel,
                user: if config.start_user.is_empty() {
                    "alice".to_string()
                } else {
                    config.start_user
                },
                thread: None,
                channels,
            }),
            user_map: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Handle one typed line; returns a message to deliver, if any.
    fn interpret(&self, input: &str) -> Option<ConnectorMessage> {
        let input = input.trim_end_matches(['\r', '\n']);
        if input.is_empty() {
            return None;
        }
        let Ok(mut session) = self.session.lock() else {
            return None;
        };
        if let Some(command) = input.strip_prefix('|') {
            let mut chars = command.chars();
            let argument = command.get(1..).unwrap_or_default().trim();
            match chars.next().map(|c| c.to_ascii_lowercase()) {
                Some('c') => {
                    if argument.is_empty() {
                        session.channel.clear();
                        println!("Changed current channel to: direct message");
                    } else if session.channels.iter().any(|channel| channel == argument) {
                        session.channel = argument.to_string();
                        println!("Changed current channel to: {argument}");
                    } else {
                        println!("Invalid channel.");
                    }
                    session.thread = None;
                }
                Some('u') => {
                    if argument.is_empty() {
                        println!("Invalid 0-length user");
                    } else {
                        session.user = argument.to_string();
                        println!("Changed current user to: {argument}");
                    }
                }
                Some('t') => {
                    session.thread = match session.thread {
                        Some(_) => None,
                        None => Some(self.next_id.fetch_add(1, Ordering::Relaxed).to_string()),
                    };
                    match &session.thread {
                        Some(thread) => println!("Now typing in thread {thread}"),
                        None => println!("Left thread"),
                    }
                }
                _ => println!("Invalid terminal connector command"),
            }
            return None;
        }

        let user_id = self
            .user_map
            .lock()
            .ok()
            .and_then(|map| map.get(&session.user).cloned())
            .unwrap_or_else(|| session.user.clone());
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        Some(ConnectorMessage {
            protocol: self.protocol.clone(),
            user_name: session.user.clone(),
            user_id,
            channel_name: session.channel.clone(),
            channel_id: session.channel.clone(),
            message_text: input.to_string(),
            thread_id: session.thread.clone().unwrap_or_else(|| message_id.clone()),
            message_id,
            direct_message: session.channel.is_empty(),
            hidden_message: false,
            threaded_message: session.thread.is_some(),
            bot_user: false,
        })
    }

    fn prompt(&self) {
        if let Ok(session) = self.session.lock() {
            let channel = if session.channel.is_empty() {
                "(direct)"
            } else {
                session.channel.as_str()
            };
            match &session.thread {
                Some(thread) => println!("{}/{channel}({thread}) ->", session.user),
                None => println!("{}/{channel} ->", session.user),
            }
        }
    }
}

impl Connector for TerminalConnector {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn bot_info(&self) -> Option<BotInfo> {
        Some(self.bot.clone())
    }

    fn set_user_map(&self, map: HashMap<String, String>) {
        if let Ok(mut current) = self.user_map.lock() {
            *current = map;
        }
    }

    async fn join_channel(&self, channel: &str) -> RetVal {
        if let Ok(mut session) = self.session.lock()
            && !channel.is_empty()
            && !session.channels.iter().any(|known| known == channel)
        {
            session.channels.push(channel.to_string());
        }
        RetVal::Ok
    }

    async fn send(&self, message: OutgoingMessage) -> RetVal {
        match message.target {
            Target::Channel { channel, thread } => {
                if thread.is_empty() {
                    println!("{channel}: {}", message.text);
                } else {
                    println!("{channel}({thread}): {}", message.text);
                }
            }
            Target::UserInChannel {
                user_name,
                channel,
                thread,
                ..
            } => {
                if thread.is_empty() {
                    println!("{channel}: @{user_name} {}", message.text);
                } else {
                    println!("{channel}({thread}): @{user_name} {}", message.text);
                }
            }
            Target::Direct { user } => println!("(dm:{user}): {}", message.text),
        }
        RetVal::Ok
    }

    async fn run(&self, incoming: IncomingSender, stop: CancellationToken) {
        println!(
            "Terminal connector running; Use '|C<channel>' to change channel, '|U<user>' to change user, or '|T' to toggle a thread"
        );
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.prompt();
            tokio::select! {
                _ = stop.cancelled() => {
                    tracing::debug!("terminal connector received stop");
                    break;
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            tracing::info!("terminal input closed");
                            stop.cancelled().await;
                            break;
                        }
                        Err(error) => {
                            tracing::error!(%error, "reading terminal input failed");
                            break;
                        }
                    };
                    if let Some(message) = self.interpret(&line)
                        && incoming.send(message).await.is_err()
                    {
                        tracing::warn!("dispatcher is gone, terminal connector exiting");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> TerminalConnector {
        TerminalConnector::from_context(&ConnectorContext {
            protocol: "terminal".into(),
            config: Some(serde_json::json!({
                "StartChannel": "general",
                "StartUser": "alice",
                "Channels": ["general", "random"],
                "BotName": "floyd"
            })),
            bot_identity: true,
            bot: BotInfo::default(),
        })
        .expect("terminal connector")
    }

    #[test]
    fn typed_lines_become_messages() {
        let connector = connector();
        let message = connector.interpret("floyd, ping").expect("message");
        assert_eq!(message.user_name, "alice");
        assert_eq!(message.channel_name, "general");
        assert!(!message.direct_message);
        assert_eq!(connector.bot_info().expect("bot").user_name, "floyd");
    }

    #[test]
    fn pipe_commands_switch_user_and_channel() {
        let connector = connector();
        assert!(connector.interpret("|ubob").is_none());
        assert!(connector.interpret("|crandom").is_none());
        assert!(connector.interpret("|cnowhere").is_none());
        let message = connector.interpret("hello").expect("message");
        assert_eq!(message.user_name, "bob");
        assert_eq!(message.channel_name, "random");

        assert!(connector.interpret("|c").is_none());
        let message = connector.interpret("hello").expect("message");
        assert!(message.direct_message);

        assert!(connector.interpret("|t").is_none());
        let message = connector.interpret("in thread").expect("message");
        assert!(message.threaded_message);
    }
}
