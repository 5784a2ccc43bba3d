//! Small pipeline tasks and jobs: the default fail pipeline
//! (`send-message`, `tail-log`), `pause-notifies` and `restart-robot`.

use crate::linebuffer::LineBuffer;
use crate::retval::{LogLevel, MessageFormat, RetVal, TaskRetVal};
use crate::robot::{Robot, TaskHandler};

use async_trait::async_trait;
use std::collections::BTreeMap;

/// Bytes of log `tail-log` shows.
const TAIL_SIZE: usize = 2048;
const TAIL_LINE: usize = 256;

pub struct SendMessage;

#[async_trait]
impl TaskHandler for SendMessage {
    async fn run(&self, robot: &Robot, _command: &str, args: &[String]) -> TaskRetVal {
        let text = args.join(" ");
        if text.trim().is_empty() {
            robot.log(LogLevel::Warn, "send-message called with no message");
            return TaskRetVal::Fail;
        }
        match robot.say(&text).await {
            RetVal::Ok => TaskRetVal::Normal,
            _ => TaskRetVal::Fail,
        }
    }
}

/// Keep the newest lines of `text` that fit in `size` bytes.
fn tail(text: &str, size: usize) -> String {
    let mut buffer = LineBuffer::new(size, TAIL_LINE, " ...");
    for line in text.lines() {
        let _ = buffer.write_line(line);
    }
    buffer.close();
    buffer.read_all().unwrap_or_default()
}

pub struct TailLog;

#[async_trait]
impl TaskHandler for TailLog {
    async fn run(&self, robot: &Robot, _command: &str, args: &[String]) -> TaskRetVal {
        let size = args
            .first()
            .and_then(|size| size.parse().ok())
            .unwrap_or(TAIL_SIZE);
        let output = robot.worker().output();
        let excerpt = tail(&output, size);
        if excerpt.trim().is_empty() {
            robot.say("(no log output)").await;
            return TaskRetVal::Normal;
        }
        robot
            .with_format(MessageFormat::Fixed)
            .say(excerpt.trim_end())
            .await;
        TaskRetVal::Normal
    }
}

pub struct PauseNotifies;

#[async_trait]
impl TaskHandler for PauseNotifies {
    async fn run(&self, robot: &Robot, _command: &str, _args: &[String]) -> TaskRetVal {
        let mut by_user: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (job, user) in robot.bot().paused_jobs() {
            by_user.entry(user).or_default().push(job);
        }
        for (user, jobs) in by_user {
            let jobs = jobs.join(", ");
            let ret = robot
                .send_user_message(&user, &format!("Reminder, you have paused jobs: {jobs}"))
                .await;
            if ret != RetVal::Ok {
                robot.log(
                    LogLevel::Error,
                    &format!("failed sending reminder to user {user} about paused jobs: {jobs}"),
                );
            }
        }
        TaskRetVal::Normal
    }
}

pub struct RestartRobot;

#[async_trait]
impl TaskHandler for RestartRobot {
    async fn run(&self, robot: &Robot, _command: &str, _args: &[String]) -> TaskRetVal {
        let bot = robot.bot();
        let pipeline = robot.worker().eid.clone();
        if bot.is_stopping() {
            tracing::warn!(%pipeline, "restart requested with shutdown already in progress");
            return TaskRetVal::Normal;
        }
        tracing::info!(%pipeline, running = bot.workers.len(), "restart triggered");
        bot.request_shutdown(true);
        TaskRetVal::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_the_newest_lines() {
        let log = (1..=50).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
        let excerpt = tail(&log, 32);
        assert!(excerpt.ends_with("line 50\n"));
        assert!(!excerpt.contains("line 1\n"));
        assert!(excerpt.len() <= 32);
    }
}
