//! A robot wired to the in-memory test connector, for end-to-end tests.

use crate::bot::{Bot, BotOptions};
use crate::brain;
use crate::catalog::build::BuiltinTask;
use crate::config::{ConfigKind, Paths};
use crate::connector::test::{TestConnector, TestMessage, TestUser};
use crate::connector::{ConnectorContext, ConnectorDyn, ConnectorInit};
use crate::error::ConnectorError;
use crate::message::BotInfo;
use crate::robot::TaskHandler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

const ROBOT_YAML: &str = r#"
Protocol: test
Alias: ";"
AdminUsers: [ "alice" ]
DefaultChannels: [ "general", "random" ]
DefaultJobChannel: general
BotInfo:
  UserName: bender
  UserID: u0000
  FullName: Bender Rodriguez
"#;

pub const USERS: &[(&str, &str)] = &[("alice", "u0001"), ("bob", "u0002"), ("carol", "u0003"), ("david", "u0004")];
pub const CHANNELS: &[&str] = &["general", "random", "bottest"];

#[derive(Default)]
pub struct Builder {
    robot_yaml: String,
    files: Vec<(String, String)>,
    handlers: Vec<(BuiltinTask, Arc<dyn TaskHandler>)>,
    aidev_token: Option<String>,
}

impl Builder {
    /// Extra top-level keys for robot.yaml.
    pub fn robot(mut self, yaml: &str) -> Self {
        self.robot_yaml.push_str(yaml);
        self
    }

    /// Write `content` to `conf/<relpath>` in the custom configuration.
    pub fn file(mut self, relpath: &str, content: &str) -> Self {
        self.files.push((relpath.to_string(), content.to_string()));
        self
    }

    /// Add a compiled-in task alongside the stock ones.
    pub fn handler(mut self, name: &str, kind: ConfigKind, config: &str, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push((
            BuiltinTask {
                name: name.to_string(),
                kind,
                description: format!("test task {name}"),
                default_config: Some(config.to_string()),
            },
            handler,
        ));
        self
    }

    pub fn aidev_token(mut self, token: &str) -> Self {
        self.aidev_token = Some(token.to_string());
        self
    }

    pub async fn start(self) -> TestBot {
        let dir = tempfile::tempdir().expect("tempdir");
        let custom = dir.path().join("custom");
        let install = dir.path().join("install");
        let home = dir.path().join("home");
        for path in [custom.join("conf"), install.clone(), home.clone()] {
            std::fs::create_dir_all(path).expect("create dirs");
        }
        let robot_yaml = format!("{ROBOT_YAML}{}", self.robot_yaml);
        std::fs::write(custom.join("conf/robot.yaml"), robot_yaml).expect("write robot.yaml");
        for (relpath, content) in &self.files {
            let path = custom.join("conf").join(relpath);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("create conf dir");
            }
            std::fs::write(path, content).expect("write conf file");
        }

        let bot_info = BotInfo {
            user_name: "bender".into(),
            user_id: "u0000".into(),
            full_name: "Bender Rodriguez".into(),
            ..Default::default()
        };
        let users = USERS.iter().map(|(name, id)| TestUser::new(name, id)).collect();
        let channels = CHANNELS.iter().map(|channel| channel.to_string()).collect();
        let connector = TestConnector::new("test", bot_info, users, channels);
        let shared = connector.clone();
        let init: ConnectorInit = Arc::new(move |_context: &ConnectorContext| {
            Ok::<_, ConnectorError>(shared.clone() as Arc<dyn ConnectorDyn>)
        });
        let mut initializers = HashMap::new();
        initializers.insert("test".to_string(), init);

        let mut handlers = crate::builtins::handlers();
        handlers.extend(self.handlers);

        let options = BotOptions {
            paths: Paths::new(custom, install, home),
            protocol: None,
            brain: None,
            environment: "test".into(),
            encryption_key: None,
            initializers,
            handlers,
            record_events: true,
            lock_timeout: brain::DEFAULT_LOCK_TIMEOUT,
            aidev_token: self.aidev_token,
        };
        let (bot, incoming) = Bot::new(options).await.expect("robot starts");
        let runner = bot.clone();
        let run = tokio::spawn(async move { runner.run(incoming).await });

        TestBot {
            bot,
            connector,
            run,
            _dir: dir,
        }
    }
}

pub struct TestBot {
    pub bot: Arc<Bot>,
    pub connector: Arc<TestConnector>,
    run: JoinHandle<anyhow::Result<bool>>,
    _dir: tempfile::TempDir,
}

impl TestBot {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub async fn say(&self, user: &str, channel: &str, text: &str) {
        self.connector.say(user, channel, text).await.expect("message delivered");
    }

    /// The robot's next message.
    pub async fn reply(&self) -> TestMessage {
        self.connector.get_reply(REPLY_TIMEOUT).await.expect("reply from robot")
    }

    /// Replies until one contains `needle`.
    pub async fn reply_containing(&self, needle: &str) -> TestMessage {
        loop {
            let reply = self.reply().await;
            if reply.text.contains(needle) {
                return reply;
            }
        }
    }

    /// Wait for every running pipeline to finish.
    pub async fn settle(&self) {
        let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
        while self.bot.workers.len() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "pipelines still running");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stop(self) {
        self.bot.request_shutdown(false);
        let restart = tokio::time::timeout(REPLY_TIMEOUT, self.run)
            .await
            .expect("robot stops")
            .expect("run task")
            .expect("clean shutdown");
        assert!(!restart);
    }
}
