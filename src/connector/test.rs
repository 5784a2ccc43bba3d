//! In-memory connector for automated tests and AI-assisted development.
//!
//! Tests speak to the robot with [`TestConnector::send`] and read what it
//! said with [`TestConnector::get_reply`]. Every message in either direction
//! is also kept in a cursor-indexed log served through [`MessageSource`].

use super::{
    Connector, ConnectorContext, IncomingSender, InjectRequest, InjectResult, Injector,
    MessageBatch, MessageEvent, MessageQuery, MessageSource, OutgoingMessage, Target,
};
use crate::error::ConnectorError;
use crate::message::{BotInfo, ConnectorMessage};
use crate::retval::{MessageFormat, RetVal};

use anyhow::Context as _;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

const DEFAULT_BATCH: usize = 50;

/// A user the test connector knows about.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TestUser {
    pub name: String,
    #[serde(rename = "InternalID")]
    pub internal_id: String,
    pub email: String,
    pub full_name: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
}

impl TestUser {
    pub fn new(name: &str, internal_id: &str) -> Self {
        Self {
            name: name.to_string(),
            internal_id: internal_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct TestConfig {
    users: Vec<TestUser>,
    channels: Vec<String>,
    bot_name: String,
    #[serde(rename = "BotID")]
    bot_id: String,
}

/// Something the robot said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMessage {
    /// Addressed user, empty for plain channel messages.
    pub user: String,
    /// Empty for direct messages.
    pub channel: String,
    pub thread: String,
    pub text: String,
    pub format: MessageFormat,
}

/// Something a test user says.
#[derive(Debug, Clone, Default)]
pub struct TestInput {
    pub user: String,
    /// Empty for a direct message.
    pub channel: String,
    pub text: String,
    /// Reply inside this thread.
    pub thread: Option<String>,
    pub hidden: bool,
}

impl TestInput {
    pub fn new(user: &str, channel: &str, text: &str) -> Self {
        Self {
            user: user.to_string(),
            channel: channel.to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }
}

pub struct TestConnector {
    protocol: String,
    bot: BotInfo,
    users: Vec<TestUser>,
    channels: Mutex<Vec<String>>,
    incoming: watch::Sender<Option<IncomingSender>>,
    replies: Mutex<VecDeque<TestMessage>>,
    replied: Notify,
    log: Mutex<Vec<MessageEvent>>,
    logged: Notify,
    next_id: AtomicU64,
}

impl TestConnector {
    pub fn new(protocol: &str, bot: BotInfo, users: Vec<TestUser>, channels: Vec<String>) -> Arc<Self> {
        let (incoming, _) = watch::channel(None);
        Arc::new(Self {
            protocol: protocol.to_string(),
            bot,
            users,
            channels: Mutex::new(channels),
            incoming,
            replies: Mutex::new(VecDeque::new()),
            replied: Notify::new(),
            log: Mutex::new(Vec::new()),
            logged: Notify::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_context(context: &ConnectorContext) -> Result<Arc<Self>, ConnectorError> {
        let config: TestConfig = match &context.config {
            Some(value) => serde_json::from_value(value.clone()).map_err(|error| {
                ConnectorError::Lifecycle(format!("invalid test ProtocolConfig: {error}"))
            })?,
            None => TestConfig::default(),
        };
        let mut bot = context.bot.clone();
        if !config.bot_name.is_empty() {
            bot.user_name = config.bot_name;
        }
        if !config.bot_id.is_empty() {
            bot.user_id = config.bot_id;
        }
        Ok(Self::new(&context.protocol, bot, config.users, config.channels))
    }

    fn user_by_name(&self, name: &str) -> Option<&TestUser> {
        self.users.iter().find(|user| user.name == name)
    }

    /// Resolve a name or bracketed protocol ID.
    fn resolve_user(&self, user: &str) -> Option<&TestUser> {
        match user.strip_prefix('<').and_then(|id| id.strip_suffix('>')) {
            Some(id) => self.users.iter().find(|known| known.internal_id == id),
            None => self.user_by_name(user),
        }
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn record(&self, mut event: MessageEvent) -> u64 {
        let Ok(mut log) = self.log.lock() else {
            return 0;
        };
        event.cursor = log.len() as u64 + 1;
        event.timestamp = chrono::Utc::now().to_rfc3339();
        let cursor = event.cursor;
        log.push(event);
        drop(log);
        self.logged.notify_waiters();
        cursor
    }

    fn build_message(&self, input: &TestInput) -> anyhow::Result<ConnectorMessage> {
        let user = self
            .user_by_name(&input.user)
            .with_context(|| format!("invalid user: {}", input.user))?;
        if !input.channel.is_empty() {
            let known = self
                .channels
                .lock()
                .map(|channels| channels.iter().any(|channel| *channel == input.channel))
                .unwrap_or(false);
            anyhow::ensure!(known, "invalid channel: {}", input.channel);
        }
        let message_id = self.next_id();
        Ok(ConnectorMessage {
            protocol: self.protocol.clone(),
            user_name: user.name.clone(),
            user_id: user.internal_id.clone(),
            channel_name: input.channel.clone(),
            channel_id: input.channel.clone(),
            message_text: input.text.clone(),
            thread_id: input.thread.clone().unwrap_or_else(|| message_id.clone()),
            message_id,
            direct_message: input.channel.is_empty(),
            hidden_message: input.hidden,
            threaded_message: input.thread.is_some(),
            bot_user: false,
        })
    }

    async fn deliver(&self, message: ConnectorMessage) -> anyhow::Result<u64> {
        let mut receiver = self.incoming.subscribe();
        let sender = tokio::time::timeout(Duration::from_secs(2), receiver.wait_for(Option::is_some))
            .await
            .context("timed out waiting for the test connector to start")?
            .context("test connector is gone")?
            .clone()
            .context("test connector is not running")?;
        let cursor = self.record(MessageEvent {
            user_name: message.user_name.clone(),
            user_id: message.user_id.clone(),
            channel: message.channel_name.clone(),
            thread_id: message.thread_id.clone(),
            message_id: message.message_id.clone(),
            threaded: message.threaded_message,
            text: message.message_text.clone(),
            direct: message.direct_message,
            hidden: message.hidden_message,
            ..Default::default()
        });
        sender
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("robot is not listening"))?;
        Ok(cursor)
    }

    /// Send a message to the robot as a configured user.
    pub async fn send(&self, input: TestInput) -> anyhow::Result<()> {
        let message = self.build_message(&input)?;
        self.deliver(message).await.map(|_| ())
    }

    /// Convenience wrapper around [`send`](Self::send).
    pub async fn say(&self, user: &str, channel: &str, text: &str) -> anyhow::Result<()> {
        self.send(TestInput::new(user, channel, text)).await
    }

    /// Wait for the robot's next message.
    pub async fn get_reply(&self, timeout: Duration) -> anyhow::Result<TestMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.replied.notified();
            if let Some(reply) = self.replies.lock().ok().and_then(|mut replies| replies.pop_front()) {
                return Ok(reply);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                anyhow::bail!("timeout waiting for reply from robot");
            }
        }
    }

    /// Take every reply not yet read.
    pub fn drain_replies(&self) -> Vec<TestMessage> {
        self.replies
            .lock()
            .map(|mut replies| replies.drain(..).collect())
            .unwrap_or_default()
    }
}

impl Connector for TestConnector {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn bot_info(&self) -> Option<BotInfo> {
        Some(self.bot.clone())
    }

    async fn user_attribute(&self, user: &str, attr: &str) -> (String, RetVal) {
        let Some(user) = self.resolve_user(user) else {
            return (String::new(), RetVal::UserNotFound);
        };
        let value = match attr.to_lowercase().as_str() {
            "email" => &user.email,
            "internalid" => &user.internal_id,
            "realname" | "fullname" => &user.full_name,
            "firstname" => &user.first_name,
            "lastname" => &user.last_name,
            "phone" => &user.phone,
            _ => return (String::new(), RetVal::AttributeNotFound),
        };
        (value.clone(), RetVal::Ok)
    }

    async fn join_channel(&self, channel: &str) -> RetVal {
        if let Ok(mut channels) = self.channels.lock()
            && !channel.is_empty()
            && !channels.iter().any(|known| known == channel)
        {
            channels.push(channel.to_string());
        }
        RetVal::Ok
    }

    async fn send(&self, message: OutgoingMessage) -> RetVal {
        let (user, channel, thread) = match message.target {
            Target::Channel { channel, thread } => (String::new(), channel, thread),
            Target::UserInChannel {
                user_name,
                channel,
                thread,
                ..
            } => (user_name, channel, thread),
            Target::Direct { user } => {
                let name = self
                    .resolve_user(&user)
                    .map(|known| known.name.clone())
                    .unwrap_or(user);
                (name, String::new(), String::new())
            }
        };
        self.record(MessageEvent {
            user_name: self.bot.user_name.clone(),
            user_id: self.bot.user_id.clone(),
            is_bot: true,
            channel: channel.clone(),
            thread_id: thread.clone(),
            message_id: self.next_id(),
            threaded: !thread.is_empty(),
            text: message.text.clone(),
            direct: channel.is_empty(),
            ..Default::default()
        });
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(TestMessage {
                user,
                channel,
                thread,
                text: message.text,
                format: message.format,
            });
        }
        self.replied.notify_waiters();
        RetVal::Ok
    }

    async fn run(&self, incoming: IncomingSender, stop: CancellationToken) {
        self.incoming.send_replace(Some(incoming));
        stop.cancelled().await;
        self.incoming.send_replace(None);
        tracing::debug!(protocol = %self.protocol, "test connector stopped");
    }

    fn injector(&self) -> Option<&dyn Injector> {
        Some(self)
    }

    fn message_source(&self) -> Option<&dyn MessageSource> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Injector for TestConnector {
    async fn inject_message(&self, request: InjectRequest) -> anyhow::Result<InjectResult> {
        let user = if request.as_user.is_empty() {
            self.users
                .first()
                .map(|user| user.name.clone())
                .context("no test users configured")?
        } else {
            request.as_user.clone()
        };
        let channel = if request.direct {
            String::new()
        } else {
            request.channel.clone()
        };
        let message = self.build_message(&TestInput {
            user,
            channel,
            text: request.text.clone(),
            thread: (!request.thread.is_empty()).then(|| request.thread.clone()),
            hidden: request.hidden,
        })?;
        let result = InjectResult {
            protocol: self.protocol.clone(),
            user_name: message.user_name.clone(),
            user_id: message.user_id.clone(),
            channel: message.channel_name.clone(),
            message_id: message.message_id.clone(),
            thread_id: message.thread_id.clone(),
            hidden: message.hidden_message,
            direct: message.direct_message,
            cursor: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let cursor = self.deliver(message).await?;
        Ok(InjectResult { cursor, ..result })
    }
}

#[async_trait::async_trait]
impl MessageSource for TestConnector {
    async fn get_messages(&self, query: MessageQuery) -> anyhow::Result<MessageBatch> {
        let limit = if query.limit == 0 { DEFAULT_BATCH } else { query.limit };
        let deadline = tokio::time::Instant::now() + Duration::from_millis(query.timeout_ms);
        let visible = |event: &MessageEvent| {
            query.all
                || query.viewer.is_empty()
                || !event.direct
                || event.user_name == query.viewer
                || (event.is_bot && event.direct)
        };

        loop {
            let notified = self.logged.notified();
            let (mut matching, latest) = {
                let log = self
                    .log
                    .lock()
                    .map_err(|_| anyhow::anyhow!("message log poisoned"))?;
                let matching: Vec<MessageEvent> = log
                    .iter()
                    .filter(|event| event.cursor > query.after_cursor && visible(event))
                    .cloned()
                    .collect();
                (matching, log.len() as u64)
            };
            if !matching.is_empty() {
                let has_more = matching.len() > limit;
                matching.truncate(limit);
                let next_cursor = matching.last().map(|event| event.cursor).unwrap_or(query.after_cursor);
                return Ok(MessageBatch {
                    protocol: self.protocol.clone(),
                    viewer: query.viewer.clone(),
                    messages: matching,
                    next_cursor,
                    latest,
                    timed_out: false,
                    has_more,
                });
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(MessageBatch {
                    protocol: self.protocol.clone(),
                    viewer: query.viewer.clone(),
                    messages: Vec::new(),
                    next_cursor: query.after_cursor,
                    latest,
                    timed_out: true,
                    has_more: false,
                });
            }
        }
    }
}

impl std::fmt::Debug for TestConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestConnector")
            .field("protocol", &self.protocol)
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connector() -> Arc<TestConnector> {
        TestConnector::new(
            "test",
            BotInfo {
                user_name: "bender".into(),
                user_id: "u0000".into(),
                ..Default::default()
            },
            vec![TestUser::new("alice", "u0001"), TestUser::new("bob", "u0002")],
            vec!["general".into()],
        )
    }

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let connector = connector();
        let (tx, mut rx) = mpsc::channel(4);
        let stop = CancellationToken::new();
        let runner = {
            let connector = connector.clone();
            let stop = stop.clone();
            tokio::spawn(async move { Connector::run(connector.as_ref(), tx, stop).await })
        };

        connector.say("alice", "general", ";ping").await.expect("send");
        let heard = rx.recv().await.expect("heard");
        assert_eq!(heard.user_id, "u0001");
        assert!(!heard.direct_message);

        Connector::send(
            connector.as_ref(),
            OutgoingMessage {
                protocol: "test".into(),
                target: Target::UserInChannel {
                    user_id: "u0001".into(),
                    user_name: "alice".into(),
                    channel: "general".into(),
                    thread: String::new(),
                },
                text: "PONG".into(),
                format: MessageFormat::Variable,
                origin: Some(heard),
            },
        )
        .await;
        let reply = connector.get_reply(Duration::from_secs(1)).await.expect("reply");
        assert_eq!(reply.user, "alice");
        assert_eq!(reply.text, "PONG");

        stop.cancel();
        runner.await.expect("runner");
    }

    #[tokio::test]
    async fn unknown_users_and_channels_are_refused() {
        let connector = connector();
        assert!(connector.build_message(&TestInput::new("mallory", "general", "hi")).is_err());
        assert!(connector.build_message(&TestInput::new("alice", "secret", "hi")).is_err());
    }

    #[tokio::test]
    async fn message_source_pages_by_cursor() {
        let connector = connector();
        for text in ["one", "two", "three"] {
            Connector::send(
                connector.as_ref(),
                OutgoingMessage {
                    protocol: String::new(),
                    target: Target::Channel {
                        channel: "general".into(),
                        thread: String::new(),
                    },
                    text: text.into(),
                    format: MessageFormat::Fixed,
                    origin: None,
                },
            )
            .await;
        }
        let batch = connector
            .get_messages(MessageQuery {
                limit: 2,
                ..Default::default()
            })
            .await
            .expect("batch");
        assert_eq!(batch.messages.len(), 2);
        assert!(batch.has_more);
        let rest = connector
            .get_messages(MessageQuery {
                after_cursor: batch.next_cursor,
                timeout_ms: 10,
                ..Default::default()
            })
            .await
            .expect("rest");
        assert_eq!(rest.messages[0].text, "three");
        let empty = connector
            .get_messages(MessageQuery {
                after_cursor: rest.next_cursor,
                timeout_ms: 10,
                ..Default::default()
            })
            .await
            .expect("empty");
        assert!(empty.timed_out);
    }

    #[tokio::test]
    async fn attributes_resolve_by_bracketed_id() {
        let connector = connector();
        let (value, ret) = Connector::user_attribute(connector.as_ref(), "<u0002>", "internalID").await;
        assert_eq!(ret, RetVal::Ok);
        assert_eq!(value, "u0002");
    }
}
