//! The running robot: configuration, catalog, brain, connectors and the
//! registries pipelines coordinate through.
//!
//! A [`Bot`] is built once per process start (and again on in-process
//! restart). Everything shared lives here and is handed around as
//! `Arc<Bot>`; there are no free globals.

pub mod settings;
#[cfg(test)]
mod scenarios;

pub use settings::Settings;

use crate::brain::{self, Brain, Crypt};
use crate::catalog::build::{BuiltinTask, collect_sources};
use crate::catalog::{Catalog, TaskList, build_task_list};
use crate::config::{self, Paths, RobotConf};
use crate::connector::{self, ConnectorInit, ConnectorRuntime, OutgoingMessage, Target};
use crate::env::StartupEnv;
use crate::events::EventLog;
use crate::exclusive::RunQueues;
use crate::history::{self, HistoryProvider};
use crate::message::{ConnectorMessage, bracket_id};
use crate::pipeline::{Envelope, PipelineRequest, Workers, start_pipeline};
use crate::prompt::Replies;
use crate::retval::{MessageFormat, RetVal, TaskRetVal};
use crate::robot::TaskHandler;
use crate::rpc;
use crate::scheduler::Scheduler;
use crate::subscriptions::Subscriptions;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Capacity of the connector fan-in channel.
const INCOMING_BUFFER: usize = 256;

/// How often subscriptions and short-term memories are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything needed to build a [`Bot`].
pub struct BotOptions {
    pub paths: Paths,
    /// `GOPHER_PROTOCOL`, overriding `Protocol` in robot.yaml.
    pub protocol: Option<String>,
    /// `GOPHER_BRAIN`, overriding `Brain` in robot.yaml.
    pub brain: Option<String>,
    pub environment: String,
    pub encryption_key: Option<String>,
    pub initializers: HashMap<String, ConnectorInit>,
    pub handlers: Vec<(BuiltinTask, Arc<dyn TaskHandler>)>,
    /// Keep emitted events for [`EventLog::drain`].
    pub record_events: bool,
    pub lock_timeout: Duration,
    pub aidev_token: Option<String>,
}

impl BotOptions {
    /// Options from the process environment with every compiled-in
    /// connector and task.
    pub fn from_env(paths: Paths) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|value| !value.is_empty());
        Self {
            paths,
            protocol: var("GOPHER_PROTOCOL"),
            brain: var("GOPHER_BRAIN"),
            environment: var("GOPHER_ENVIRONMENT").unwrap_or_else(|| "production".into()),
            encryption_key: var("GOPHER_ENCRYPTION_KEY"),
            initializers: connector::builtin_initializers(),
            handlers: crate::builtins::handlers(),
            record_events: false,
            lock_timeout: brain::DEFAULT_LOCK_TIMEOUT,
            aidev_token: var("GOPHER_AIDEV_TOKEN"),
        }
    }
}

impl std::fmt::Debug for BotOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotOptions")
            .field("paths", &self.paths)
            .field("protocol", &self.protocol)
            .field("brain", &self.brain)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

pub struct Bot {
    pub paths: Paths,
    settings: ArcSwap<Settings>,
    pub catalog: Catalog,
    pub brain: Arc<Brain>,
    pub history: Arc<dyn HistoryProvider>,
    pub connectors: ConnectorRuntime,
    pub replies: Replies,
    pub subscriptions: Subscriptions,
    pub run_queues: RunQueues,
    pub workers: Workers,
    pub events: EventLog,
    /// `GOPHER_ENVIRONMENT`.
    pub environment: String,
    pub startup_env: StartupEnv,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    builtins: Vec<BuiltinTask>,
    brain_key: Option<[u8; brain::crypt::KEY_LEN]>,
    /// Job name to the user who paused it.
    paused_jobs: Mutex<BTreeMap<String, String>>,
    scheduler: Mutex<Option<Scheduler>>,
    http_addr: Mutex<String>,
    aidev_token: Option<String>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    stopping: AtomicBool,
    restart: AtomicBool,
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("paths", &self.paths)
            .field("catalog", &self.catalog)
            .field("connectors", &self.connectors)
            .finish_non_exhaustive()
    }
}

fn load_tasks(
    paths: &Paths,
    conf: &RobotConf,
    builtins: &[BuiltinTask],
    defaults: &HashMap<String, String>,
    decrypt: Option<config::Decrypter<'_>>,
) -> TaskList {
    let sources = collect_sources(paths, conf, builtins, defaults, decrypt);
    build_task_list(conf, sources, paths)
}

impl Bot {
    /// Load configuration and assemble the robot. Connectors are constructed
    /// but not started; see [`run`](Self::run).
    pub async fn new(options: BotOptions) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<ConnectorMessage>)> {
        let BotOptions {
            paths,
            protocol,
            brain: brain_override,
            environment,
            encryption_key,
            initializers,
            handlers,
            record_events,
            lock_timeout,
            aidev_token,
        } = options;

        let brain_key = match &encryption_key {
            Some(passphrase) => {
                let operator = Crypt::from_passphrase(passphrase).context("invalid GOPHER_ENCRYPTION_KEY")?;
                let path = paths.config_dir.join(brain::crypt::KEY_FILE);
                Some(brain::crypt::load_or_create_brain_key(&path, &operator).context("loading brain key")?)
            }
            None => None,
        };
        let crypt = brain_key.as_ref().map(Crypt::new);
        let decrypt = |value: &str| crypt.as_ref().and_then(|crypt| crypt.decrypt_string(value).ok());

        let config = config::load_robot(&paths, Some(&decrypt)).context("loading robot configuration")?;
        let settings = Settings::from_config(&config, &paths, protocol.as_deref(), brain_override.as_deref());
        tracing::info!(protocol = %settings.protocol, brain = %settings.brain, "configuration loaded");

        let backend = brain::open_backend(&settings.brain, config.brain_config.as_ref(), &paths)
            .with_context(|| format!("opening brain '{}'", settings.brain))?;
        let brain_crypt = if config.conf.encrypt_brain {
            match &brain_key {
                Some(key) => Some(Crypt::new(key)),
                None => {
                    tracing::warn!("EncryptBrain set but no GOPHER_ENCRYPTION_KEY; brain is not encrypted");
                    None
                }
            }
        } else {
            None
        };
        let brain = Arc::new(Brain::new(backend, brain_crypt, lock_timeout));

        let history = history::open_provider(&config.conf.history_provider, config.history_config.as_ref(), &paths)
            .context("opening history provider")?;

        let mut builtins = Vec::with_capacity(handlers.len());
        let mut handler_map = HashMap::with_capacity(handlers.len());
        for (builtin, handler) in handlers {
            handler_map.insert(builtin.name.clone(), handler);
            builtins.push(builtin);
        }
        let defaults = rpc::parent::default_configs(&paths, &config.conf, &settings).await;
        let tasks = load_tasks(&paths, &config.conf, &builtins, &defaults, Some(&decrypt));
        tracing::info!(tasks = tasks.len(), "task catalog built");

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
        let connectors = ConnectorRuntime::new(
            initializers,
            incoming_tx,
            config.protocol_config.clone(),
            settings.bot.clone(),
        );
        let (per_protocol, fallback) = settings.connector_user_maps();
        connectors.set_user_maps(per_protocol, fallback);
        connectors
            .initialize(&settings.protocol, &settings.secondary_protocols)
            .context("initializing connectors")?;

        let bot = Arc::new(Self {
            settings: ArcSwap::from_pointee(settings),
            catalog: Catalog::new(tasks),
            brain,
            history,
            connectors,
            replies: Replies::new(),
            subscriptions: Subscriptions::new(),
            run_queues: RunQueues::new(),
            workers: Workers::new(),
            events: if record_events {
                EventLog::recording()
            } else {
                EventLog::discarding()
            },
            environment,
            startup_env: StartupEnv::capture(),
            handlers: handler_map,
            builtins,
            brain_key,
            paused_jobs: Mutex::new(BTreeMap::new()),
            scheduler: Mutex::new(None),
            http_addr: Mutex::new(String::new()),
            aidev_token,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            paths,
        });
        Ok((bot, incoming_rx))
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn aidev_token(&self) -> Option<&str> {
        self.aidev_token.as_deref()
    }

    /// Decrypt a value encrypted with the brain key.
    pub fn decrypt(&self, value: &str) -> Option<String> {
        let key = self.brain_key.as_ref()?;
        Crypt::new(key).decrypt_string(value).ok()
    }

    pub fn encrypt(&self, value: &str) -> Option<String> {
        let key = self.brain_key.as_ref()?;
        Crypt::new(key).encrypt_string(value).ok()
    }

    /// Start connectors, the scheduler and the HTTP listeners, then
    /// dispatch incoming messages until shutdown. Returns true when a
    /// restart was requested.
    pub async fn run(self: &Arc<Self>, mut incoming: mpsc::Receiver<ConnectorMessage>) -> anyhow::Result<bool> {
        self.connectors.start_all().context("starting primary connector")?;
        if let Some(reported) = self.connectors.bot_info() {
            let mut settings = (*self.settings()).clone();
            settings.adopt_bot_info(&reported);
            self.settings.store(Arc::new(settings));
        }
        self.subscriptions.restore(&self.brain).await;

        if let Err(error) = crate::api::start(self).await {
            tracing::error!(%error, "failed to start HTTP listeners");
        }
        self.init_plugins();
        self.restart_scheduler();
        Scheduler::run_init_jobs(self);
        self.spawn_sweeper();

        let settings = self.settings();
        tracing::info!(
            name = %settings.bot.user_name,
            alias = %settings.alias,
            protocol = %settings.protocol,
            "robot started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = incoming.recv() => match message {
                    Some(message) => {
                        let bot = self.clone();
                        self.tracker.spawn(async move {
                            crate::dispatch::handle_incoming(bot, message).await;
                        });
                    }
                    None => {
                        tracing::warn!("all connectors closed their message channel");
                        break;
                    }
                },
            }
        }

        self.stop().await;
        Ok(self.restart.load(Ordering::SeqCst))
    }

    async fn stop(&self) {
        tracing::info!(active = self.workers.len(), "robot shutting down");
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.replies.shutdown();
        if let Some(scheduler) = self.scheduler.lock().ok().and_then(|mut guard| guard.take()) {
            scheduler.stop();
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.connectors.shutdown().await;
        self.subscriptions.save_if_dirty(&self.brain).await;
        tracing::info!("robot stopped");
    }

    /// Ask the dispatch loop to stop. Safe to call from inside a pipeline.
    pub fn request_shutdown(&self, restart: bool) {
        if restart {
            self.restart.store(true, Ordering::SeqCst);
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancellation token for a new pipeline; fires on shutdown.
    pub fn worker_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Reload configuration: rebuild settings and the catalog, publish both,
    /// and bring connectors and the scheduler in line.
    pub async fn reload(self: &Arc<Self>) -> anyhow::Result<()> {
        let crypt = self.brain_key.as_ref().map(Crypt::new);
        let decrypt = |value: &str| crypt.as_ref().and_then(|crypt| crypt.decrypt_string(value).ok());
        let config = config::load_robot(&self.paths, Some(&decrypt)).context("reloading robot configuration")?;

        let current = self.settings();
        let mut settings = Settings::from_config(&config, &self.paths, Some(&current.protocol), Some(&current.brain));
        if let Some(reported) = self.connectors.bot_info() {
            settings.adopt_bot_info(&reported);
        }
        let defaults = rpc::parent::default_configs(&self.paths, &config.conf, &settings).await;
        let tasks = load_tasks(&self.paths, &config.conf, &self.builtins, &defaults, Some(&decrypt));
        let count = tasks.len();

        self.catalog.publish(tasks);
        let (per_protocol, fallback) = settings.connector_user_maps();
        let secondaries = settings.secondary_protocols.clone();
        self.settings.store(Arc::new(settings));
        self.connectors.set_user_maps(per_protocol, fallback);
        self.connectors.reconcile_secondary(&secondaries).await;
        self.restart_scheduler();
        tracing::info!(tasks = count, "configuration reloaded");
        Ok(())
    }

    fn restart_scheduler(self: &Arc<Self>) {
        let scheduler = Scheduler::start(self);
        if let Ok(mut guard) = self.scheduler.lock()
            && let Some(previous) = guard.replace(scheduler)
        {
            previous.stop();
        }
    }

    /// Run every plugin with the `init` command.
    fn init_plugins(self: &Arc<Self>) {
        let protocol = self.settings().protocol.clone();
        for task in self.catalog.load().plugins() {
            if task.is_disabled() {
                continue;
            }
            self.spawn_pipeline(PipelineRequest {
                task: task.clone(),
                ptype: crate::pipeline::PipelineType::PluginCommand,
                command: "init".into(),
                args: Vec::new(),
                envelope: Envelope::for_channel(&protocol, ""),
                automatic: true,
                cmd_mode: String::new(),
                parent: None,
            });
        }
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let bot = self.clone();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        bot.subscriptions.expire(chrono::Utc::now());
                        bot.subscriptions.save_if_dirty(&bot.brain).await;
                        let swept = bot.brain.short_term().sweep();
                        if swept > 0 {
                            tracing::trace!(swept, "expired short-term memories");
                        }
                    }
                }
            }
        });
    }

    /// Start a pipeline in the background, tracked for shutdown.
    pub fn spawn_pipeline(self: &Arc<Self>, request: PipelineRequest) {
        let bot = self.clone();
        self.tracker.spawn(async move {
            let name = request.task.name().to_string();
            let ret = start_pipeline(bot, request).await;
            if ret != TaskRetVal::Normal {
                tracing::debug!(task = %name, %ret, "pipeline finished");
            }
        });
    }

    pub fn paused_jobs(&self) -> BTreeMap<String, String> {
        self.paused_jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }

    /// Pause `job` on behalf of `user`; returns false if already paused.
    pub fn pause_job(&self, job: &str, user: &str) -> bool {
        let Ok(mut jobs) = self.paused_jobs.lock() else {
            return false;
        };
        if jobs.contains_key(job) {
            return false;
        }
        jobs.insert(job.to_string(), user.to_string());
        true
    }

    pub fn resume_job(&self, job: &str) -> Option<String> {
        self.paused_jobs.lock().ok()?.remove(job)
    }

    pub fn is_paused(&self, job: &str) -> Option<String> {
        self.paused_jobs.lock().ok()?.get(job).cloned()
    }

    pub fn set_http_addr(&self, addr: &str) {
        if let Ok(mut current) = self.http_addr.lock() {
            *current = addr.to_string();
        }
    }

    /// Base URL for task callbacks, exported as `GOPHER_HTTP_POST`.
    pub fn http_post(&self) -> String {
        let addr = self.http_addr.lock().map(|addr| addr.clone()).unwrap_or_default();
        if addr.is_empty() {
            String::new()
        } else {
            format!("http://{addr}")
        }
    }

    pub async fn send(&self, message: OutgoingMessage) -> RetVal {
        self.connectors.send(message).await
    }

    fn outgoing(&self, envelope: &Envelope, target: Target, text: &str, format: MessageFormat) -> OutgoingMessage {
        OutgoingMessage {
            protocol: envelope.protocol.clone(),
            target,
            text: text.to_string(),
            format,
            origin: envelope.incoming.clone(),
        }
    }

    fn direct_target(envelope: &Envelope) -> Target {
        let user = if envelope.user_id.is_empty() {
            envelope.user.clone()
        } else {
            bracket_id(&envelope.user_id)
        };
        Target::Direct { user }
    }

    /// Post to where the envelope's conversation is happening: the channel
    /// (inside the thread for threaded messages) or the DM.
    pub async fn say_as(&self, envelope: &Envelope, text: &str, format: MessageFormat, thread: bool) -> RetVal {
        let target = if envelope.channel.is_empty() {
            Self::direct_target(envelope)
        } else {
            Target::Channel {
                channel: envelope.channel.clone(),
                thread: if thread { envelope.thread.clone() } else { String::new() },
            }
        };
        self.send(self.outgoing(envelope, target, text, format)).await
    }

    /// Address the envelope's user in its channel or DM.
    pub async fn reply_as(&self, envelope: &Envelope, text: &str, format: MessageFormat, thread: bool) -> RetVal {
        let target = if envelope.channel.is_empty() {
            Self::direct_target(envelope)
        } else {
            Target::UserInChannel {
                user_id: envelope.user_id.clone(),
                user_name: envelope.user.clone(),
                channel: envelope.channel.clone(),
                thread: if thread { envelope.thread.clone() } else { String::new() },
            }
        };
        self.send(self.outgoing(envelope, target, text, format)).await
    }

    pub async fn say(&self, envelope: &Envelope, text: &str) -> RetVal {
        self.say_as(envelope, text, MessageFormat::default(), envelope.threaded)
            .await
    }

    pub async fn reply(&self, envelope: &Envelope, text: &str) -> RetVal {
        self.reply_as(envelope, text, MessageFormat::default(), envelope.threaded)
            .await
    }
}
