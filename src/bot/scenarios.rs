//! End-to-end conversations with a robot on the test connector.

use crate::builtins::totp;
use crate::config::ConfigKind;
use crate::events::Event;
use crate::pipeline::{Envelope, PipelineRequest, PipelineType, start_pipeline};
use crate::retval::{RetVal, TaskRetVal};
use crate::robot::{Robot, TaskHandler};
use crate::testing::TestBot;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// "12345678901234567890" in base32.
const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

const LAUNCHER_CONFIG: &str = r#"
AllChannels: true
Elevator: totp
ElevateImmediateCommands: [ "launch" ]
CommandMatchers:
- Command: launch
  Regex: '(?i:launch)'
"#;

const TOTP_USERS: &str = r#"
Config:
  TimeoutSeconds: 7200
  TimeoutType: idle
  Users:
  - User: alice
    Secret: GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ
"#;

#[derive(Default)]
struct Launcher {
    launched: AtomicUsize,
}

#[async_trait]
impl TaskHandler for Launcher {
    async fn run(&self, robot: &Robot, command: &str, _args: &[String]) -> TaskRetVal {
        if command == "launch" {
            self.launched.fetch_add(1, Ordering::SeqCst);
            robot.say("Launched").await;
        }
        TaskRetVal::Normal
    }
}

/// A job that holds `proj` until the test opens the gate.
#[derive(Default)]
struct Build {
    log: Mutex<Vec<String>>,
    gate: Notify,
}

impl Build {
    fn record(&self, entry: String) {
        self.log.lock().expect("log").push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().expect("log").clone()
    }

    async fn wait_for(&self, entry: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.entries().iter().any(|logged| logged == entry) {
            assert!(tokio::time::Instant::now() < deadline, "never saw '{entry}'");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl TaskHandler for Build {
    async fn run(&self, robot: &Robot, _command: &str, args: &[String]) -> TaskRetVal {
        let queue = args.first().is_some_and(|mode| mode == "queue");
        let name = args.get(1).cloned().unwrap_or_default();
        if !robot.exclusive("proj", queue) {
            self.record(format!("blocked {name}"));
            return TaskRetVal::Normal;
        }
        self.record(format!("start {name}"));
        self.gate.notified().await;
        self.record(format!("done {name}"));
        TaskRetVal::Normal
    }
}

fn job_request(harness: &TestBot, job: &str, args: Vec<String>) -> PipelineRequest {
    let task = harness.bot.catalog.load().get(job).expect("job");
    PipelineRequest {
        task,
        ptype: PipelineType::Scheduled,
        command: "run".into(),
        args,
        envelope: Envelope::for_channel("test", "general"),
        automatic: true,
        cmd_mode: String::new(),
        parent: None,
    }
}

fn build_request(harness: &TestBot, mode: &str, name: &str) -> PipelineRequest {
    job_request(harness, "build", vec![mode.to_string(), name.to_string()])
}

/// Where a [`Step`] queues a follow-up task.
#[derive(Clone, Copy)]
enum Then {
    Next(&'static str),
    Final(&'static str),
    Fail(&'static str),
}

/// A pipeline step that records its name, queues follow-ups and returns a
/// fixed result.
struct Step {
    name: &'static str,
    trail: Arc<Mutex<Vec<String>>>,
    then: Vec<Then>,
    ret: TaskRetVal,
}

impl Step {
    fn new(name: &'static str, trail: &Arc<Mutex<Vec<String>>>, then: Vec<Then>) -> Arc<Self> {
        Arc::new(Self {
            name,
            trail: trail.clone(),
            then,
            ret: TaskRetVal::Normal,
        })
    }

    fn failing(name: &'static str, trail: &Arc<Mutex<Vec<String>>>, then: Vec<Then>) -> Arc<Self> {
        Arc::new(Self {
            name,
            trail: trail.clone(),
            then,
            ret: TaskRetVal::Fail,
        })
    }
}

#[async_trait]
impl TaskHandler for Step {
    async fn run(&self, robot: &Robot, _command: &str, _args: &[String]) -> TaskRetVal {
        self.trail.lock().expect("trail").push(self.name.to_string());
        for then in &self.then {
            let (target, queued) = match *then {
                Then::Next(target) => (target, robot.add_task(target, &[])),
                Then::Final(target) => (target, robot.final_task(target, &[])),
                Then::Fail(target) => (target, robot.fail_task(target, &[])),
            };
            if queued != RetVal::Ok {
                self.trail.lock().expect("trail").push(format!("refused {target}: {queued}"));
            }
        }
        self.ret
    }
}

async fn build_harness(build: Arc<Build>) -> TestBot {
    TestBot::builder()
        .handler("build", ConfigKind::Job, "Quiet: true\n", build)
        .start()
        .await
}

#[tokio::test]
async fn ping_replies_pong() {
    let harness = TestBot::builder().start().await;
    harness.say("alice", "general", ";ping").await;

    let reply = harness.reply_containing("PONG").await;
    assert_eq!(reply.text, "PONG");
    assert_eq!(reply.user, "alice");
    assert_eq!(reply.channel, "general");

    harness.settle().await;
    let events = harness.bot.events.drain();
    assert!(events.contains(&Event::CommandPluginRan));
    assert!(events.contains(&Event::GoPluginRan));
    harness.stop().await;
}

#[tokio::test]
async fn admin_reload_swaps_the_catalog() {
    let harness = TestBot::builder().start().await;
    let before = harness.bot.catalog.load();

    harness.say("alice", "general", ";reload").await;
    let reply = harness.reply_containing("reload").await;
    assert_eq!(reply.text, "Configuration reloaded successfully");
    assert_eq!(reply.channel, "general");
    assert!(!Arc::ptr_eq(&before, &harness.bot.catalog.load()));
    harness.stop().await;
}

#[tokio::test]
async fn non_admins_cannot_reload() {
    let harness = TestBot::builder().start().await;
    let before = harness.bot.catalog.load();

    harness.say("bob", "general", ";reload").await;
    let reply = harness.reply().await;
    assert_ne!(reply.text, "Configuration reloaded successfully");
    harness.settle().await;
    assert!(Arc::ptr_eq(&before, &harness.bot.catalog.load()));
    harness.stop().await;
}

#[tokio::test]
async fn elevated_command_needs_a_fresh_code() {
    let launcher = Arc::new(Launcher::default());
    let harness = TestBot::builder()
        .handler("launcher", ConfigKind::Plugin, LAUNCHER_CONFIG, launcher.clone())
        .file("plugins/totp.yaml", TOTP_USERS)
        .start()
        .await;

    harness.say("alice", "general", ";launch").await;
    let prompt = harness.reply_containing("please provide a TOTP code").await;
    assert_eq!(prompt.user, "alice");
    let code = totp::current_code(SECRET);
    harness.say("alice", "general", &code).await;
    harness.reply_containing("Launched").await;
    harness.settle().await;
    assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);

    // Immediate elevation asks again, and the used code is refused.
    harness.say("alice", "general", ";launch").await;
    harness.reply_containing("please provide a TOTP code").await;
    harness.say("alice", "general", &code).await;
    harness.reply_containing("Invalid code").await;
    harness.settle().await;
    assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);
    harness.stop().await;
}

#[tokio::test]
async fn exclusive_queue_resumes_after_release() {
    let build = Arc::new(Build::default());
    let harness = build_harness(build.clone()).await;

    let first = tokio::spawn(start_pipeline(harness.bot.clone(), build_request(&harness, "queue", "first")));
    build.wait_for("start first").await;
    let second = tokio::spawn(start_pipeline(harness.bot.clone(), build_request(&harness, "queue", "second")));
    build.wait_for("blocked second").await;
    assert!(harness.bot.run_queues.is_held("build:proj"));
    assert_eq!(harness.bot.run_queues.waiting("build:proj"), 1);

    build.gate.notify_one();
    assert_eq!(first.await.expect("first pipeline"), TaskRetVal::Normal);
    build.wait_for("start second").await;
    build.gate.notify_one();
    assert_eq!(second.await.expect("second pipeline"), TaskRetVal::Normal);

    assert_eq!(
        build.entries(),
        ["start first", "blocked second", "done first", "start second", "done second"]
    );
    assert!(!harness.bot.run_queues.is_held("build:proj"));
    harness.stop().await;
}

#[tokio::test]
async fn exclusive_without_queueing_aborts() {
    let build = Arc::new(Build::default());
    let harness = build_harness(build.clone()).await;

    let first = tokio::spawn(start_pipeline(harness.bot.clone(), build_request(&harness, "queue", "first")));
    build.wait_for("start first").await;
    let second = start_pipeline(harness.bot.clone(), build_request(&harness, "abort", "second")).await;
    assert_eq!(second, TaskRetVal::PipelineAborted);

    build.gate.notify_one();
    assert_eq!(first.await.expect("first pipeline"), TaskRetVal::Normal);
    assert_eq!(build.entries(), ["start first", "blocked second", "done first"]);
    harness.stop().await;
}

#[tokio::test]
async fn short_term_memory_is_per_user_and_channel() {
    let harness = TestBot::builder().start().await;

    harness
        .say("david", "general", ";store Ferris Bueller is a Righteous Dude")
        .await;
    harness.reply_containing("eventually I'll forget").await;
    harness.settle().await;

    harness.say("david", "general", ";what is Ferris Bueller?").await;
    let reply = harness.reply().await;
    assert_eq!(reply.text, "Ferris Bueller is a Righteous Dude");
    assert_eq!(reply.channel, "general");

    harness.say("carol", "general", ";what is Ferris Bueller?").await;
    assert!(harness.reply().await.text.contains("no idea"));

    harness.say("david", "random", ";what is Ferris Bueller?").await;
    let reply = harness.reply().await;
    assert!(reply.text.contains("no idea"));
    assert_eq!(reply.channel, "random");
    harness.stop().await;
}

#[tokio::test]
async fn paused_job_reminders_go_to_each_user() {
    let harness = TestBot::builder()
        .robot("ScheduledJobs:\n- Name: pause-notifies\n  Schedule: \"@every 1s\"\n")
        .start()
        .await;
    assert!(harness.bot.pause_job("backup", "alice"));
    assert!(harness.bot.pause_job("build", "alice"));
    assert!(harness.bot.pause_job("deploy", "bob"));

    harness.reply_containing("Starting scheduled job 'pause-notifies'").await;
    let mut direct = Vec::new();
    loop {
        let message = harness.reply().await;
        if message.text.starts_with("Finished job 'pause-notifies'") {
            break;
        }
        if message.channel.is_empty() {
            direct.push((message.user, message.text));
        }
    }
    direct.sort();
    assert_eq!(
        direct,
        [
            ("alice".to_string(), "Reminder, you have paused jobs: backup, build".to_string()),
            ("bob".to_string(), "Reminder, you have paused jobs: deploy".to_string()),
        ]
    );
    harness.stop().await;
}

#[tokio::test]
async fn added_tasks_run_right_after_the_task_that_added_them() {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let harness = TestBot::builder()
        .handler(
            "flow",
            ConfigKind::Job,
            "Quiet: true\n",
            Step::new("flow", &trail, vec![Then::Next("step-a"), Then::Next("step-c")]),
        )
        .handler("step-a", ConfigKind::Task, "Description: a\n", Step::new("step-a", &trail, vec![Then::Next("step-b")]))
        .handler("step-b", ConfigKind::Task, "Description: b\n", Step::new("step-b", &trail, vec![]))
        .handler("step-c", ConfigKind::Task, "Description: c\n", Step::new("step-c", &trail, vec![Then::Next("step-d")]))
        .handler("step-d", ConfigKind::Task, "Description: d\n", Step::new("step-d", &trail, vec![]))
        .start()
        .await;

    let ret = start_pipeline(harness.bot.clone(), job_request(&harness, "flow", Vec::new())).await;
    assert_eq!(ret, TaskRetVal::Normal);
    // step-a is mid-pipeline, so step-b runs before step-c; step-c is last,
    // so step-d is appended after it.
    assert_eq!(
        trail.lock().expect("trail").clone(),
        ["flow", "step-a", "step-b", "step-c", "step-d"]
    );
    harness.stop().await;
}

#[tokio::test]
async fn fail_tasks_run_after_final_tasks_when_the_job_fails() {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let harness = TestBot::builder()
        .handler(
            "fragile",
            ConfigKind::Job,
            "Quiet: true\n",
            Step::failing("fragile", &trail, vec![Then::Fail("cleanup"), Then::Final("wrapup")]),
        )
        .handler("cleanup", ConfigKind::Task, "Description: cleanup\n", Step::new("cleanup", &trail, vec![]))
        .handler("wrapup", ConfigKind::Task, "Description: wrapup\n", Step::new("wrapup", &trail, vec![]))
        .start()
        .await;

    let ret = start_pipeline(harness.bot.clone(), job_request(&harness, "fragile", Vec::new())).await;
    assert_ne!(ret, TaskRetVal::Normal);
    assert_eq!(trail.lock().expect("trail").clone(), ["fragile", "wrapup", "cleanup"]);
    harness.stop().await;

    trail.lock().expect("trail").clear();
    let steady = TestBot::builder()
        .handler(
            "steady",
            ConfigKind::Job,
            "Quiet: true\n",
            Step::new("steady", &trail, vec![Then::Fail("unused"), Then::Final("wrapup")]),
        )
        .handler("unused", ConfigKind::Task, "Description: unused\n", Step::new("unused", &trail, vec![]))
        .handler("wrapup", ConfigKind::Task, "Description: wrapup\n", Step::new("wrapup", &trail, vec![]))
        .start()
        .await;
    let ret = start_pipeline(steady.bot.clone(), job_request(&steady, "steady", Vec::new())).await;
    assert_eq!(ret, TaskRetVal::Normal);
    assert_eq!(trail.lock().expect("trail").clone(), ["steady", "wrapup"]);
    steady.stop().await;
}
