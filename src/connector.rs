//! Connector trait, dynamic dispatch companion, and the shipped connectors.

pub mod null;
pub mod runtime;
pub mod terminal;
pub mod test;

pub use runtime::{ConnectorRuntime, ConnectorStatus};

use crate::error::ConnectorError;
use crate::message::{BotInfo, ConnectorMessage};
use crate::retval::{MessageFormat, RetVal};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel connectors push heard messages into.
pub type IncomingSender = mpsc::Sender<ConnectorMessage>;

/// Where an outgoing message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A channel, optionally inside a thread.
    Channel { channel: String, thread: String },
    /// A user addressed inside a channel or thread.
    UserInChannel {
        user_id: String,
        user_name: String,
        channel: String,
        thread: String,
    },
    /// A direct message; `user` is a name or a bracketed protocol ID.
    Direct { user: String },
}

/// A message for a connector to deliver.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Protocol to route through; empty means the primary connector.
    pub protocol: String,
    pub target: Target,
    pub text: String,
    pub format: MessageFormat,
    /// The incoming message being answered, when there is one.
    pub origin: Option<ConnectorMessage>,
}

/// Static trait for connectors.
pub trait Connector: Send + Sync + 'static {
    /// Lowercase protocol tag this connector serves.
    fn protocol(&self) -> &str;

    /// Identity of the robot as known to the protocol.
    fn bot_info(&self) -> Option<BotInfo> {
        None
    }

    /// Map of configured user names to protocol IDs.
    fn set_user_map(&self, _map: HashMap<String, String>) {}

    fn user_attribute(
        &self,
        _user: &str,
        _attr: &str,
    ) -> impl Future<Output = (String, RetVal)> + Send {
        async { (String::new(), RetVal::AttributeNotFound) }
    }

    /// Hint that a message was heard and is being acted on.
    fn message_heard(&self, _user: &str, _channel: &str) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn format_help(&self, line: &str) -> String {
        line.to_string()
    }

    fn default_help(&self) -> Vec<String> {
        Vec::new()
    }

    fn join_channel(&self, _channel: &str) -> impl Future<Output = RetVal> + Send {
        async { RetVal::Ok }
    }

    fn send(&self, message: OutgoingMessage) -> impl Future<Output = RetVal> + Send;

    /// Main loop: push heard messages into `incoming` until `stop` fires.
    fn run(
        &self,
        incoming: IncomingSender,
        stop: CancellationToken,
    ) -> impl Future<Output = ()> + Send;

    fn injector(&self) -> Option<&dyn Injector> {
        None
    }

    fn message_source(&self) -> Option<&dyn MessageSource> {
        None
    }
}

/// Dynamic trait for storing connectors as `Arc<dyn ConnectorDyn>`.
pub trait ConnectorDyn: Send + Sync + 'static {
    fn protocol(&self) -> &str;

    fn bot_info(&self) -> Option<BotInfo>;

    fn set_user_map(&self, map: HashMap<String, String>);

    fn user_attribute<'a>(
        &'a self,
        user: &'a str,
        attr: &'a str,
    ) -> Pin<Box<dyn Future<Output = (String, RetVal)> + Send + 'a>>;

    fn message_heard<'a>(
        &'a self,
        user: &'a str,
        channel: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn format_help(&self, line: &str) -> String;

    fn default_help(&self) -> Vec<String>;

    fn join_channel<'a>(&'a self, channel: &'a str) -> Pin<Box<dyn Future<Output = RetVal> + Send + 'a>>;

    fn send<'a>(&'a self, message: OutgoingMessage) -> Pin<Box<dyn Future<Output = RetVal> + Send + 'a>>;

    fn run<'a>(
        &'a self,
        incoming: IncomingSender,
        stop: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn injector(&self) -> Option<&dyn Injector>;

    fn message_source(&self) -> Option<&dyn MessageSource>;
}

impl<T: Connector> ConnectorDyn for T {
    fn protocol(&self) -> &str {
        Connector::protocol(self)
    }

    fn bot_info(&self) -> Option<BotInfo> {
        Connector::bot_info(self)
    }

    fn set_user_map(&self, map: HashMap<String, String>) {
        Connector::set_user_map(self, map)
    }

    fn user_attribute<'a>(
        &'a self,
        user: &'a str,
        attr: &'a str,
    ) -> Pin<Box<dyn Future<Output = (String, RetVal)> + Send + 'a>> {
        Box::pin(Connector::user_attribute(self, user, attr))
    }

    fn message_heard<'a>(
        &'a self,
        user: &'a str,
        channel: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(Connector::message_heard(self, user, channel))
    }

    fn format_help(&self, line: &str) -> String {
        Connector::format_help(self, line)
    }

    fn default_help(&self) -> Vec<String> {
        Connector::default_help(self)
    }

    fn join_channel<'a>(&'a self, channel: &'a str) -> Pin<Box<dyn Future<Output = RetVal> + Send + 'a>> {
        Box::pin(Connector::join_channel(self, channel))
    }

    fn send<'a>(&'a self, message: OutgoingMessage) -> Pin<Box<dyn Future<Output = RetVal> + Send + 'a>> {
        Box::pin(Connector::send(self, message))
    }

    fn run<'a>(
        &'a self,
        incoming: IncomingSender,
        stop: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(Connector::run(self, incoming, stop))
    }

    fn injector(&self) -> Option<&dyn Injector> {
        Connector::injector(self)
    }

    fn message_source(&self) -> Option<&dyn MessageSource> {
        Connector::message_source(self)
    }
}

/// What a connector initializer is given.
#[derive(Debug, Clone, Default)]
pub struct ConnectorContext {
    pub protocol: String,
    /// The robot's `ProtocolConfig` section.
    pub config: Option<serde_json::Value>,
    /// Only the primary connector may report the robot's identity.
    pub bot_identity: bool,
    pub bot: BotInfo,
}

/// Constructs a connector for a protocol.
pub type ConnectorInit =
    Arc<dyn Fn(&ConnectorContext) -> Result<Arc<dyn ConnectorDyn>, ConnectorError> + Send + Sync>;

/// Initializers for the connectors compiled into the robot.
pub fn builtin_initializers() -> HashMap<String, ConnectorInit> {
    let mut initializers: HashMap<String, ConnectorInit> = HashMap::new();
    initializers.insert(
        "null".into(),
        Arc::new(|context: &ConnectorContext| {
            Ok(Arc::new(null::NullConnector::new(&context.protocol)) as Arc<dyn ConnectorDyn>)
        }),
    );
    initializers.insert(
        "terminal".into(),
        Arc::new(|context: &ConnectorContext| {
            let connector = terminal::TerminalConnector::from_context(context)?;
            Ok(Arc::new(connector) as Arc<dyn ConnectorDyn>)
        }),
    );
    initializers.insert(
        "test".into(),
        Arc::new(|context: &ConnectorContext| {
            let connector = test::TestConnector::from_context(context)?;
            Ok(connector as Arc<dyn ConnectorDyn>)
        }),
    );
    initializers
}

/// A message injected through the AI-dev interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InjectRequest {
    pub as_user: String,
    pub text: String,
    pub channel: String,
    pub thread: String,
    pub hidden: bool,
    pub direct: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InjectResult {
    pub protocol: String,
    pub user_name: String,
    pub user_id: String,
    pub channel: String,
    pub message_id: String,
    pub thread_id: String,
    pub hidden: bool,
    pub direct: bool,
    pub cursor: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MessageQuery {
    pub viewer: String,
    pub after_cursor: u64,
    pub limit: usize,
    pub timeout_ms: u64,
    pub all: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub cursor: u64,
    pub timestamp: String,
    pub user_name: String,
    pub user_id: String,
    pub is_bot: bool,
    pub channel: String,
    pub thread_id: String,
    pub message_id: String,
    pub threaded: bool,
    pub text: String,
    pub direct: bool,
    pub hidden: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBatch {
    pub protocol: String,
    pub viewer: String,
    pub messages: Vec<MessageEvent>,
    pub next_cursor: u64,
    pub latest: u64,
    pub timed_out: bool,
    pub has_more: bool,
}

/// Optional connector API for injecting inbound messages.
#[async_trait::async_trait]
pub trait Injector: Send + Sync {
    async fn inject_message(&self, request: InjectRequest) -> anyhow::Result<InjectResult>;
}

/// Optional connector API for cursor-based message retrieval.
#[async_trait::async_trait]
pub trait MessageSource: Send + Sync {
    async fn get_messages(&self, query: MessageQuery) -> anyhow::Result<MessageBatch>;
}
