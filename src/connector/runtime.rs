//! Connector runtime: one primary and any number of secondary connectors
//! behind a single router.
//!
//! Every connector pushes heard messages into the same fan-in channel. The
//! router sends outgoing messages through the connector for the message's
//! protocol, falling back to the primary.

use super::{ConnectorContext, ConnectorDyn, ConnectorInit, IncomingSender, OutgoingMessage};
use crate::error::ConnectorError;
use crate::message::{BotInfo, normalize_protocol};
use crate::retval::RetVal;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Reported state of one configured protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorStatus {
    pub protocol: String,
    /// `primary` or `secondary`.
    pub role: &'static str,
    /// `running`, `stopped` or `failed`.
    pub state: &'static str,
    pub error: String,
}

#[derive(Default)]
struct Managed {
    connector: Option<Arc<dyn ConnectorDyn>>,
    stop: Option<CancellationToken>,
    done: Option<watch::Receiver<bool>>,
    running: bool,
    stopping: bool,
    last_error: String,
}

#[derive(Default)]
struct RuntimeState {
    primary: String,
    runtimes: HashMap<String, Managed>,
    desired_secondary: BTreeSet<String>,
    user_maps: HashMap<String, HashMap<String, String>>,
    fallback_user_map: HashMap<String, String>,
}

pub struct ConnectorRuntime {
    initializers: HashMap<String, ConnectorInit>,
    state: Arc<Mutex<RuntimeState>>,
    incoming: IncomingSender,
    protocol_config: Option<serde_json::Value>,
    bot: BotInfo,
    shutting_down: Arc<AtomicBool>,
}

impl ConnectorRuntime {
    pub fn new(
        initializers: HashMap<String, ConnectorInit>,
        incoming: IncomingSender,
        protocol_config: Option<serde_json::Value>,
        bot: BotInfo,
    ) -> Self {
        Self {
            initializers,
            state: Arc::new(Mutex::new(RuntimeState::default())),
            incoming,
            protocol_config,
            bot,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RuntimeState>, ConnectorError> {
        self.state
            .lock()
            .map_err(|_| ConnectorError::Lifecycle("connector registry poisoned".into()))
    }

    /// Record the configured protocols and construct the primary. Secondary
    /// construction failures are logged, not fatal.
    pub fn initialize(&self, primary: &str, secondaries: &[String]) -> Result<(), ConnectorError> {
        let primary = normalize_protocol(primary);
        if primary.is_empty() {
            return Err(ConnectorError::Lifecycle("primary protocol not configured".into()));
        }
        {
            let mut state = self.lock()?;
            state.primary = primary.clone();
            state.runtimes.clear();
            state.desired_secondary = secondaries
                .iter()
                .map(|protocol| normalize_protocol(protocol))
                .filter(|protocol| !protocol.is_empty() && *protocol != primary)
                .collect();
        }
        self.ensure_initialized(&primary)?;
        for protocol in self.desired_secondaries() {
            if let Err(error) = self.ensure_initialized(&protocol) {
                tracing::error!(%protocol, %error, "secondary protocol initialization failed");
            }
        }
        Ok(())
    }

    fn desired_secondaries(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.desired_secondary.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_initialized(&self, protocol: &str) -> Result<(), ConnectorError> {
        let (is_primary, user_map) = {
            let mut state = self.lock()?;
            let managed = state.runtimes.entry(protocol.to_string()).or_default();
            if managed.connector.is_some() {
                return Ok(());
            }
            let user_map = state
                .user_maps
                .get(protocol)
                .cloned()
                .unwrap_or_else(|| state.fallback_user_map.clone());
            (state.primary == protocol, user_map)
        };

        let initializer = self
            .initializers
            .get(protocol)
            .ok_or_else(|| ConnectorError::UnknownProtocol(protocol.to_string()))?;
        let context = ConnectorContext {
            protocol: protocol.to_string(),
            config: self.protocol_config.clone(),
            bot_identity: is_primary,
            bot: self.bot.clone(),
        };
        let connector = initializer(&context)?;
        if !user_map.is_empty() {
            connector.set_user_map(user_map);
        }

        let mut state = self.lock()?;
        let managed = state.runtimes.entry(protocol.to_string()).or_default();
        managed.connector = Some(connector);
        managed.last_error.clear();
        Ok(())
    }

    /// Start the connector loop for `protocol`. Failures of non-required
    /// connectors are recorded in their status.
    pub fn start(&self, protocol: &str, required: bool) -> Result<(), ConnectorError> {
        let protocol = normalize_protocol(protocol);
        if protocol.is_empty() {
            return Err(ConnectorError::Lifecycle("invalid empty protocol name".into()));
        }
        if let Err(error) = self.ensure_initialized(&protocol) {
            if !required {
                tracing::error!(%protocol, %error, "connector failed to initialize");
            }
            if let Ok(mut state) = self.lock() {
                state.runtimes.entry(protocol.clone()).or_default().last_error = error.to_string();
            }
            return Err(error);
        }

        let (connector, stop, done_tx) = {
            let mut state = self.lock()?;
            let Some(managed) = state.runtimes.get_mut(&protocol) else {
                return Err(ConnectorError::Lifecycle(format!("connector '{protocol}' is unavailable")));
            };
            let Some(connector) = managed.connector.clone() else {
                return Err(ConnectorError::Lifecycle(format!("connector '{protocol}' is unavailable")));
            };
            if managed.running {
                return Ok(());
            }
            let stop = CancellationToken::new();
            let (done_tx, done_rx) = watch::channel(false);
            managed.stop = Some(stop.clone());
            managed.done = Some(done_rx);
            managed.running = true;
            managed.stopping = false;
            managed.last_error.clear();
            (connector, stop, done_tx)
        };

        let state = self.state.clone();
        let incoming = self.incoming.clone();
        let shutting_down = self.shutting_down.clone();
        tokio::spawn(async move {
            connector.run(incoming, stop).await;

            let mut unexpected = false;
            if let Ok(mut state) = state.lock()
                && let Some(managed) = state.runtimes.get_mut(&protocol)
            {
                unexpected = !managed.stopping && !shutting_down.load(Ordering::SeqCst);
                managed.running = false;
                managed.stopping = false;
                if unexpected {
                    managed.last_error = "connector exited".into();
                }
            }
            let _ = done_tx.send(true);
            if unexpected {
                tracing::error!(%protocol, "connector exited unexpectedly");
            } else {
                tracing::info!(%protocol, "connector stopped");
            }
        });
        Ok(())
    }

    /// Stop a running connector and wait for its loop to return.
    pub async fn stop(&self, protocol: &str) -> Result<(), ConnectorError> {
        let protocol = normalize_protocol(protocol);
        let (stop, done) = {
            let mut state = self.lock()?;
            let Some(managed) = state.runtimes.get_mut(&protocol) else {
                return Ok(());
            };
            if !managed.running {
                return Ok(());
            }
            managed.stopping = true;
            (managed.stop.clone(), managed.done.clone())
        };
        if let Some(stop) = stop {
            stop.cancel();
        }
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
        Ok(())
    }

    /// Start the primary (required) and every configured secondary.
    pub fn start_all(&self) -> Result<(), ConnectorError> {
        let primary = self.primary();
        if primary.is_empty() {
            return Err(ConnectorError::Lifecycle("primary protocol not configured".into()));
        }
        self.start(&primary, true)?;
        for protocol in self.desired_secondaries() {
            let _ = self.start(&protocol, false);
        }
        Ok(())
    }

    /// Stop every running connector, in protocol order.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut running: Vec<String> = self
            .state
            .lock()
            .map(|state| {
                state
                    .runtimes
                    .iter()
                    .filter(|(_, managed)| managed.running)
                    .map(|(protocol, _)| protocol.clone())
                    .collect()
            })
            .unwrap_or_default();
        running.sort();
        for protocol in running {
            if let Err(error) = self.stop(&protocol).await {
                tracing::error!(%protocol, %error, "stopping connector failed");
            }
        }
    }

    /// Bring secondaries in line with a reloaded configuration.
    pub async fn reconcile_secondary(&self, secondaries: &[String]) {
        let primary = self.primary();
        if primary.is_empty() {
            return;
        }
        let desired: BTreeSet<String> = secondaries
            .iter()
            .map(|protocol| normalize_protocol(protocol))
            .filter(|protocol| !protocol.is_empty() && *protocol != primary)
            .collect();

        for protocol in self.desired_secondaries() {
            if !desired.contains(&protocol) {
                let _ = self.stop(&protocol).await;
                if let Ok(mut state) = self.state.lock() {
                    state.runtimes.remove(&protocol);
                }
            }
        }
        if let Ok(mut state) = self.state.lock() {
            state.desired_secondary = desired.clone();
        }
        for protocol in desired {
            let _ = self.start(&protocol, false);
        }
    }

    fn check_secondary(&self, protocol: &str, action: &str) -> Result<String, ConnectorError> {
        let protocol = normalize_protocol(protocol);
        if protocol.is_empty() {
            return Err(ConnectorError::Lifecycle("protocol name is required".into()));
        }
        let state = self.lock()?;
        if protocol == state.primary {
            return Err(ConnectorError::Lifecycle(format!(
                "cannot {action} the primary protocol '{protocol}' while running"
            )));
        }
        if !state.desired_secondary.contains(&protocol) {
            return Err(ConnectorError::Lifecycle(format!(
                "protocol '{protocol}' is not configured in SecondaryProtocols"
            )));
        }
        Ok(protocol)
    }

    pub fn start_secondary(&self, protocol: &str) -> Result<(), ConnectorError> {
        let protocol = self.check_secondary(protocol, "start")?;
        self.start(&protocol, false)
    }

    pub async fn stop_secondary(&self, protocol: &str) -> Result<(), ConnectorError> {
        let protocol = self.check_secondary(protocol, "stop")?;
        self.stop(&protocol).await
    }

    pub async fn restart_secondary(&self, protocol: &str) -> Result<(), ConnectorError> {
        let protocol = self.check_secondary(protocol, "restart")?;
        self.stop(&protocol).await?;
        self.start(&protocol, false)
    }

    /// Status of the primary and every configured secondary, sorted by
    /// protocol.
    pub fn list_status(&self) -> Vec<ConnectorStatus> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut protocols: BTreeSet<&String> = state.desired_secondary.iter().collect();
        if !state.primary.is_empty() {
            protocols.insert(&state.primary);
        }
        protocols
            .into_iter()
            .map(|protocol| {
                let role = if *protocol == state.primary {
                    "primary"
                } else {
                    "secondary"
                };
                let (status, error) = match state.runtimes.get(protocol) {
                    Some(managed) if managed.running => ("running", String::new()),
                    Some(managed) if !managed.last_error.is_empty() => {
                        ("failed", managed.last_error.clone())
                    }
                    Some(_) => ("stopped", String::new()),
                    None => ("failed", "not initialized".to_string()),
                };
                ConnectorStatus {
                    protocol: protocol.clone(),
                    role,
                    state: status,
                    error,
                }
            })
            .collect()
    }

    pub fn primary(&self) -> String {
        self.state
            .lock()
            .map(|state| state.primary.clone())
            .unwrap_or_default()
    }

    pub fn is_primary(&self, protocol: &str) -> bool {
        let primary = self.primary();
        !primary.is_empty() && normalize_protocol(protocol) == primary
    }

    /// Provide per-protocol user maps; `fallback` serves protocols without
    /// their own map. Connectors already constructed are updated.
    pub fn set_user_maps(
        &self,
        per_protocol: HashMap<String, HashMap<String, String>>,
        fallback: HashMap<String, String>,
    ) {
        let connectors: Vec<(Arc<dyn ConnectorDyn>, HashMap<String, String>)> = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.user_maps = per_protocol
                .into_iter()
                .map(|(protocol, map)| (normalize_protocol(&protocol), map))
                .collect();
            state.fallback_user_map = fallback;
            state
                .runtimes
                .iter()
                .filter_map(|(protocol, managed)| {
                    let map = state
                        .user_maps
                        .get(protocol)
                        .cloned()
                        .unwrap_or_else(|| state.fallback_user_map.clone());
                    managed.connector.clone().map(|connector| (connector, map))
                })
                .collect()
        };
        for (connector, map) in connectors {
            connector.set_user_map(map);
        }
    }

    /// User map for `protocol`, name to protocol ID.
    pub fn user_map(&self, protocol: &str) -> HashMap<String, String> {
        let protocol = normalize_protocol(protocol);
        self.state
            .lock()
            .map(|state| {
                state
                    .user_maps
                    .get(&protocol)
                    .cloned()
                    .unwrap_or_else(|| state.fallback_user_map.clone())
            })
            .unwrap_or_default()
    }

    /// Active connector for `protocol`.
    pub fn connector(&self, protocol: &str) -> Option<Arc<dyn ConnectorDyn>> {
        let protocol = normalize_protocol(protocol);
        let state = self.state.lock().ok()?;
        state
            .runtimes
            .get(&protocol)
            .filter(|managed| managed.running || protocol == state.primary)
            .and_then(|managed| managed.connector.clone())
    }

    fn primary_connector(&self) -> Option<Arc<dyn ConnectorDyn>> {
        let state = self.state.lock().ok()?;
        state
            .runtimes
            .get(&state.primary)
            .and_then(|managed| managed.connector.clone())
    }

    fn route(&self, protocol: &str) -> Option<Arc<dyn ConnectorDyn>> {
        if !protocol.is_empty()
            && let Some(connector) = self.connector(protocol)
        {
            return Some(connector);
        }
        self.primary_connector()
    }

    pub async fn send(&self, message: OutgoingMessage) -> RetVal {
        let protocol = match (&message.origin, message.protocol.is_empty()) {
            (Some(origin), true) => origin.protocol.clone(),
            _ => message.protocol.clone(),
        };
        match self.route(&protocol) {
            Some(connector) => connector.send(message).await,
            None => {
                tracing::error!(%protocol, "no connector available for outgoing message");
                RetVal::FailedMessageSend
            }
        }
    }

    /// Join `channel` on every active connector; succeeds when any does.
    pub async fn join_channel(&self, channel: &str) -> RetVal {
        let connectors: Vec<Arc<dyn ConnectorDyn>> = self
            .state
            .lock()
            .map(|state| {
                state
                    .runtimes
                    .values()
                    .filter(|managed| managed.running)
                    .filter_map(|managed| managed.connector.clone())
                    .collect()
            })
            .unwrap_or_default();
        let mut ret = RetVal::FailedChannelJoin;
        for connector in connectors {
            if connector.join_channel(channel).await == RetVal::Ok {
                ret = RetVal::Ok;
            }
        }
        ret
    }

    pub async fn user_attribute(&self, protocol: &str, user: &str, attr: &str) -> (String, RetVal) {
        match self.route(protocol) {
            Some(connector) => connector.user_attribute(user, attr).await,
            None => (String::new(), RetVal::AttributeNotFound),
        }
    }

    pub async fn message_heard(&self, protocol: &str, user: &str, channel: &str) {
        if let Some(connector) = self.route(protocol) {
            connector.message_heard(user, channel).await;
        }
    }

    pub fn format_help(&self, protocol: &str, line: &str) -> String {
        self.route(protocol)
            .map(|connector| connector.format_help(line))
            .unwrap_or_else(|| line.to_string())
    }

    pub fn default_help(&self, protocol: &str) -> Vec<String> {
        self.route(protocol)
            .map(|connector| connector.default_help())
            .unwrap_or_default()
    }

    /// Robot identity, only ever from the primary connector.
    pub fn bot_info(&self) -> Option<BotInfo> {
        self.primary_connector().and_then(|connector| connector.bot_info())
    }
}

impl std::fmt::Debug for ConnectorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRuntime")
            .field("primary", &self.primary())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::builtin_initializers;
    use crate::connector::null::NullConnector;
    use tokio::sync::mpsc;

    fn runtime() -> (ConnectorRuntime, mpsc::Receiver<crate::message::ConnectorMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let mut initializers = builtin_initializers();
        initializers.insert(
            "irc".into(),
            Arc::new(|context: &ConnectorContext| {
                Ok(Arc::new(NullConnector::new(&context.protocol)) as Arc<dyn ConnectorDyn>)
            }),
        );
        (
            ConnectorRuntime::new(initializers, tx, None, BotInfo::default()),
            rx,
        )
    }

    #[tokio::test]
    async fn primary_and_secondaries_report_status() {
        let (runtime, _rx) = runtime();
        runtime
            .initialize("Null", &["irc".to_string(), "missing".to_string()])
            .expect("initialize");
        runtime.start_all().expect("start");
        tokio::task::yield_now().await;

        let status = runtime.list_status();
        assert_eq!(status.len(), 3);
        assert_eq!(status[0].protocol, "irc");
        assert_eq!(status[0].state, "running");
        assert_eq!(status[1].protocol, "missing");
        assert_eq!(status[1].state, "failed");
        assert_eq!(status[2].role, "primary");
        assert_eq!(status[2].state, "running");

        runtime.stop_secondary("irc").await.expect("stop irc");
        let status = runtime.list_status();
        assert_eq!(status[0].state, "stopped");

        assert!(runtime.stop_secondary("null").await.is_err());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_drops_removed_secondaries() {
        let (runtime, _rx) = runtime();
        runtime.initialize("null", &["irc".to_string()]).expect("initialize");
        runtime.start_all().expect("start");
        runtime.reconcile_secondary(&[]).await;
        let protocols: Vec<String> = runtime
            .list_status()
            .into_iter()
            .map(|status| status.protocol)
            .collect();
        assert_eq!(protocols, vec!["null"]);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn outgoing_messages_fall_back_to_primary() {
        let (runtime, _rx) = runtime();
        runtime.initialize("null", &[]).expect("initialize");
        runtime.start_all().expect("start");
        let ret = runtime
            .send(OutgoingMessage {
                protocol: "slack".into(),
                target: crate::connector::Target::Direct { user: "alice".into() },
                text: "hi".into(),
                format: Default::default(),
                origin: None,
            })
            .await;
        assert_eq!(ret, RetVal::Ok);
        runtime.shutdown().await;
    }
}
