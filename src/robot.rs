//! The handle tasks use to act on the robot's behalf.
//!
//! A [`Robot`] is created for every task invocation. In-process handlers
//! receive it directly; interpreted tasks reach the same methods through
//! the pipeline child protocol. Messaging options (`direct`, `threaded`,
//! `format`) are carried per handle, so `robot.direct().say(..)` affects
//! only that call.

pub mod memory;
pub mod pipecmd;

pub use memory::DatumCheckout;

use crate::bot::Bot;
use crate::catalog::{ExecKind, Task};
use crate::connector::{OutgoingMessage, Target};
use crate::message::bracket_id;
use crate::pipeline::{Envelope, Worker, security};
use crate::prompt::{self, INTERACTIVE_REPLY_TIMEOUT, REPLY_TIMEOUT, ReplyKey};
use crate::retval::{LogLevel, MessageFormat, RetVal, TaskRetVal};
use crate::subscriptions::SubscriptionKey;

use async_trait::async_trait;
use rand::Rng as _;
use rand::seq::IndexedRandom as _;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// A compiled-in task.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, robot: &Robot, command: &str, args: &[String]) -> TaskRetVal;
}

#[derive(Clone)]
pub struct Robot {
    bot: Arc<Bot>,
    worker: Arc<Worker>,
    task: Arc<Task>,
    format: MessageFormat,
    direct: bool,
    threaded: bool,
}

impl std::fmt::Debug for Robot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Robot")
            .field("task", &self.task.name())
            .field("worker", &self.worker.eid)
            .field("format", &self.format)
            .field("direct", &self.direct)
            .field("threaded", &self.threaded)
            .finish()
    }
}

impl Robot {
    pub fn new(bot: Arc<Bot>, worker: Arc<Worker>, task: Arc<Task>) -> Self {
        let threaded = worker.envelope().threaded;
        Self {
            bot,
            worker,
            task,
            format: MessageFormat::default(),
            direct: false,
            threaded,
        }
    }

    pub fn bot(&self) -> &Arc<Bot> {
        &self.bot
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// The message (or scheduled context) the pipeline is working for.
    pub fn message(&self) -> Envelope {
        self.worker.envelope()
    }

    /// A copy whose messages go to the user by DM.
    pub fn direct(&self) -> Self {
        Self {
            direct: true,
            ..self.clone()
        }
    }

    /// A copy whose channel messages go to the message's thread.
    pub fn threaded(&self) -> Self {
        Self {
            threaded: true,
            ..self.clone()
        }
    }

    pub fn with_format(&self, format: MessageFormat) -> Self {
        Self {
            format,
            ..self.clone()
        }
    }

    fn protocol(&self, envelope: &Envelope) -> String {
        if envelope.protocol.is_empty() {
            self.bot.connectors.primary()
        } else {
            envelope.protocol.clone()
        }
    }

    fn user_target(&self, envelope: &Envelope, user: &str) -> String {
        if user.starts_with('<') {
            return user.to_string();
        }
        if user == envelope.user && !envelope.user_id.is_empty() {
            return bracket_id(&envelope.user_id);
        }
        user.to_string()
    }

    async fn send_to(&self, protocol: String, target: Target, text: &str, origin: bool) -> RetVal {
        let origin = if origin { self.worker.envelope().incoming } else { None };
        self.bot
            .send(OutgoingMessage {
                protocol,
                target,
                text: text.to_string(),
                format: self.format,
                origin,
            })
            .await
    }

    /// Post to the pipeline's channel, or DM the user when there is none.
    pub async fn say(&self, text: &str) -> RetVal {
        let envelope = self.worker.envelope();
        if self.direct && !envelope.user.is_empty() {
            return self.send_user_message(&envelope.user, text).await;
        }
        self.bot.say_as(&envelope, text, self.format, self.threaded).await
    }

    /// Address the user in the pipeline's channel.
    pub async fn reply(&self, text: &str) -> RetVal {
        let envelope = self.worker.envelope();
        if self.direct && !envelope.user.is_empty() {
            return self.send_user_message(&envelope.user, text).await;
        }
        self.bot.reply_as(&envelope, text, self.format, self.threaded).await
    }

    pub async fn say_thread(&self, text: &str) -> RetVal {
        self.threaded().say(text).await
    }

    pub async fn reply_thread(&self, text: &str) -> RetVal {
        self.threaded().reply(text).await
    }

    pub async fn send_channel_message(&self, channel: &str, text: &str) -> RetVal {
        self.send_channel_thread_message(channel, "", text).await
    }

    pub async fn send_channel_thread_message(&self, channel: &str, thread: &str, text: &str) -> RetVal {
        let envelope = self.worker.envelope();
        let target = Target::Channel {
            channel: channel.to_string(),
            thread: thread.to_string(),
        };
        self.send_to(self.protocol(&envelope), target, text, false).await
    }

    pub async fn send_user_message(&self, user: &str, text: &str) -> RetVal {
        let envelope = self.worker.envelope();
        let target = Target::Direct {
            user: self.user_target(&envelope, user),
        };
        self.send_to(self.protocol(&envelope), target, text, false).await
    }

    pub async fn send_user_channel_message(&self, user: &str, channel: &str, text: &str) -> RetVal {
        self.send_user_channel_thread_message(user, channel, "", text).await
    }

    pub async fn send_user_channel_thread_message(
        &self,
        user: &str,
        channel: &str,
        thread: &str,
        text: &str,
    ) -> RetVal {
        let envelope = self.worker.envelope();
        let protocol = self.protocol(&envelope);
        self.send_protocol_user_channel_thread(&protocol, user, channel, thread, text)
            .await
    }

    /// Send through a specific connector, e.g. from a job on the terminal
    /// to a user on a secondary protocol.
    pub async fn send_protocol_user_channel_message(
        &self,
        protocol: &str,
        user: &str,
        channel: &str,
        text: &str,
    ) -> RetVal {
        self.send_protocol_user_channel_thread(protocol, user, channel, "", text)
            .await
    }

    async fn send_protocol_user_channel_thread(
        &self,
        protocol: &str,
        user: &str,
        channel: &str,
        thread: &str,
        text: &str,
    ) -> RetVal {
        let settings = self.bot.settings();
        let target = if channel.is_empty() {
            Target::Direct { user: user.to_string() }
        } else if user.is_empty() {
            Target::Channel {
                channel: channel.to_string(),
                thread: thread.to_string(),
            }
        } else {
            Target::UserInChannel {
                user_id: settings.user_id_for_name(protocol, user).unwrap_or_default(),
                user_name: user.to_string(),
                channel: channel.to_string(),
                thread: thread.to_string(),
            }
        };
        self.send_to(protocol.to_string(), target, text, false).await
    }

    fn reply_regex(&self, regex_id: &str) -> Option<Regex> {
        if prompt::is_stock_id(regex_id) {
            return prompt::stock_regex(regex_id).cloned();
        }
        self.task.reply_matcher(regex_id).map(|matcher| matcher.regex.clone())
    }

    fn reply_timeout(&self, protocol: &str) -> Duration {
        let local = matches!(
            self.task.common.exec,
            ExecKind::InProcess { .. } | ExecKind::Interpreted { .. }
        );
        if local && prompt::is_interactive_protocol(protocol) {
            INTERACTIVE_REPLY_TIMEOUT
        } else {
            REPLY_TIMEOUT
        }
    }

    /// Prompt the user in the current channel (or thread, for threaded
    /// messages) and wait for a reply matching `regex_id`.
    pub async fn prompt_for_reply(&self, regex_id: &str, prompt: &str) -> (String, RetVal) {
        let envelope = self.worker.envelope();
        let thread = if self.threaded { envelope.thread.clone() } else { String::new() };
        self.prompt_user_channel_thread_for_reply(regex_id, &envelope.user, &envelope.channel, &thread, prompt)
            .await
    }

    pub async fn prompt_thread_for_reply(&self, regex_id: &str, prompt: &str) -> (String, RetVal) {
        let envelope = self.worker.envelope();
        self.prompt_user_channel_thread_for_reply(
            regex_id,
            &envelope.user,
            &envelope.channel,
            &envelope.thread,
            prompt,
        )
        .await
    }

    /// Prompt `user` by DM.
    pub async fn prompt_user_for_reply(&self, regex_id: &str, user: &str, prompt: &str) -> (String, RetVal) {
        self.prompt_user_channel_thread_for_reply(regex_id, user, "", "", prompt)
            .await
    }

    pub async fn prompt_user_channel_for_reply(
        &self,
        regex_id: &str,
        user: &str,
        channel: &str,
        prompt: &str,
    ) -> (String, RetVal) {
        self.prompt_user_channel_thread_for_reply(regex_id, user, channel, "", prompt)
            .await
    }

    pub async fn prompt_user_channel_thread_for_reply(
        &self,
        regex_id: &str,
        user: &str,
        channel: &str,
        thread: &str,
        prompt: &str,
    ) -> (String, RetVal) {
        let Some(regex) = self.reply_regex(regex_id) else {
            tracing::error!(task = self.task.name(), regex_id, "no reply matcher with that ID");
            return (String::new(), RetVal::MatcherNotFound);
        };
        let envelope = self.worker.envelope();
        let protocol = self.protocol(&envelope);
        let key = ReplyKey {
            protocol: protocol.clone(),
            user: user.to_string(),
            channel: channel.to_string(),
            thread: if channel.is_empty() { String::new() } else { thread.to_string() },
        };
        let timeout = self.reply_timeout(&protocol);
        let protocol = protocol.as_str();
        self.bot
            .replies
            .prompt(&key, &regex, timeout, || async move {
                if channel.is_empty() {
                    self.send_user_message(user, prompt).await
                } else {
                    self.send_protocol_user_channel_thread(protocol, user, channel, thread, prompt)
                        .await
                }
            })
            .await
    }

    /// Look up an attribute of the user who sent the message.
    pub async fn sender_attribute(&self, attr: &str) -> (String, RetVal) {
        let envelope = self.worker.envelope();
        match attr.to_lowercase().as_str() {
            "name" | "username" | "handle" => return (envelope.user.clone(), RetVal::Ok),
            "id" | "internalid" => return (envelope.user_id.clone(), RetVal::Ok),
            _ => {}
        }
        self.user_attribute(&envelope.user, attr).await
    }

    /// Look up a user attribute: the configured roster first, then the
    /// connector.
    pub async fn user_attribute(&self, user: &str, attr: &str) -> (String, RetVal) {
        let settings = self.bot.settings();
        if let Some(value) = settings.roster_user(user).and_then(|info| info.attribute(attr)) {
            return (value, RetVal::Ok);
        }
        let envelope = self.worker.envelope();
        self.bot
            .connectors
            .user_attribute(&self.protocol(&envelope), user, attr)
            .await
    }

    pub fn bot_attribute(&self, attr: &str) -> (String, RetVal) {
        let settings = self.bot.settings();
        if attr.eq_ignore_ascii_case("alias") {
            return (settings.alias.clone(), RetVal::Ok);
        }
        if attr.eq_ignore_ascii_case("protocol") {
            return (self.protocol(&self.worker.envelope()), RetVal::Ok);
        }
        match settings.bot.attribute(attr) {
            Some(value) => (value, RetVal::Ok),
            None => (String::new(), RetVal::AttributeNotFound),
        }
    }

    /// A value from the task's environment: parameters, namespace values
    /// and pipeline settings.
    pub fn parameter(&self, name: &str) -> String {
        self.worker.state().task_env.get(name).cloned().unwrap_or_default()
    }

    /// Set a pipeline-wide parameter seen by every later task.
    pub fn set_parameter(&self, name: &str, value: &str) -> bool {
        if name.is_empty() || crate::env::is_sensitive(name) {
            return false;
        }
        let mut state = self.worker.state();
        state.environment.insert(name.to_string(), value.to_string());
        state.task_env.insert(name.to_string(), value.to_string());
        true
    }

    /// The task's free-form `Config` section decoded as `T`.
    pub fn task_config<T: DeserializeOwned>(&self) -> Result<T, RetVal> {
        let Some(config) = &self.task.common.config else {
            return Err(RetVal::NoConfigFound);
        };
        serde_json::from_value(config.clone()).map_err(|error| {
            tracing::error!(task = self.task.name(), %error, "decoding task configuration");
            RetVal::ConfigUnmarshalError
        })
    }

    pub fn task_config_value(&self) -> Option<&serde_json::Value> {
        self.task.common.config.as_ref()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        level.emit(self.task.name(), message);
    }

    pub fn check_admin(&self) -> bool {
        self.bot.settings().is_admin(&self.worker.envelope().user)
    }

    /// Run the task's elevator now, unless the pipeline is already elevated.
    pub async fn elevate(&self, immediate: bool) -> bool {
        if self.worker.state().elevated && !immediate {
            return true;
        }
        security::elevate(&self.bot, &self.worker, &self.task, immediate).await == TaskRetVal::Success
    }

    pub fn random_int(&self, below: i64) -> i64 {
        if below <= 0 {
            return 0;
        }
        rand::rng().random_range(0..below)
    }

    pub fn random_string(&self, choices: &[String]) -> String {
        choices.choose(&mut rand::rng()).cloned().unwrap_or_default()
    }

    /// Sleep, waking early on shutdown.
    pub async fn pause(&self, seconds: f64) {
        if !seconds.is_finite() || seconds <= 0.0 {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
            _ = self.worker.cancel.cancelled() => {}
        }
    }

    pub async fn join_channel(&self, channel: &str) -> RetVal {
        self.bot.connectors.join_channel(channel).await
    }

    fn subscription_key(&self) -> Option<SubscriptionKey> {
        let envelope = self.worker.envelope();
        if envelope.channel.is_empty() || envelope.thread.is_empty() {
            return None;
        }
        Some(SubscriptionKey::new(
            &self.protocol(&envelope),
            &envelope.channel,
            &envelope.thread,
        ))
    }

    /// Receive every unaddressed message in the current thread.
    pub fn subscribe(&self) -> bool {
        let Some(key) = self.subscription_key() else {
            tracing::warn!(task = self.task.name(), "subscribe outside a channel thread");
            return false;
        };
        if !self.task.is_plugin() {
            tracing::error!(task = self.task.name(), "only plugins can subscribe to threads");
            return false;
        }
        self.bot.subscriptions.subscribe(&key, self.task.name())
    }

    pub fn unsubscribe(&self) -> bool {
        let Some(key) = self.subscription_key() else {
            return false;
        };
        self.bot.subscriptions.unsubscribe(&key, self.task.name())
    }

    pub async fn email(&self, subject: &str, body: &str) -> RetVal {
        let envelope = self.worker.envelope();
        self.email_user(&envelope.user, subject, body).await
    }

    pub async fn email_user(&self, user: &str, subject: &str, body: &str) -> RetVal {
        let (address, ret) = self.user_attribute(user, "email").await;
        if ret != RetVal::Ok || address.is_empty() {
            tracing::warn!(task = self.task.name(), user, "no email address for user");
            return RetVal::NoUserEmail;
        }
        self.email_address(&address, subject, body).await
    }

    pub async fn email_address(&self, address: &str, subject: &str, body: &str) -> RetVal {
        if self.bot.settings().bot.email.is_empty() {
            return RetVal::NoBotEmail;
        }
        tracing::error!(task = self.task.name(), address, subject, bytes = body.len(), "no mail transport configured");
        RetVal::MailError
    }

    pub fn raise_priv(&self, reason: &str) -> bool {
        tracing::debug!(task = self.task.name(), reason, "privilege separation not available, raise_priv is a no-op");
        true
    }

    pub fn drop_priv(&self) {
        tracing::debug!(task = self.task.name(), "privilege separation not available, drop_priv is a no-op");
    }
}
