//! `builtin-admin`: reload, shutdown and job pausing.

use crate::retval::TaskRetVal;
use crate::robot::{Robot, TaskHandler};

use async_trait::async_trait;

pub const CONFIG: &str = r#"
AllChannels: true
AllowDirect: true
RequireAdmin: true
Help:
- Keywords: [ "reload" ]
  Helptext: [ "(bot), reload - have the robot reload configuration files" ]
- Keywords: [ "quit" ]
  Helptext: [ "(bot), quit - request a graceful shutdown, waiting for all pipelines to finish" ]
- Keywords: [ "restart" ]
  Helptext: [ "(bot), restart - request a graceful restart" ]
- Keywords: [ "pause", "job", "jobs" ]
  Helptext: [ "(bot), pause-job <job> - stop a job from running on its schedule" ]
- Keywords: [ "resume", "job", "jobs" ]
  Helptext: [ "(bot), resume-job <job> - let a paused job run again" ]
- Keywords: [ "paused", "job", "jobs" ]
  Helptext: [ "(bot), list-paused - list paused jobs and who paused them" ]
CommandMatchers:
- Command: reload
  Regex: '(?i:reload)'
- Command: quit
  Regex: '(?i:quit|exit)'
- Command: restart
  Regex: '(?i:restart)'
- Command: pause-job
  Regex: '(?i:pause[ -]job ([\w-]+))'
- Command: resume-job
  Regex: '(?i:resume[ -]job ([\w-]+))'
- Command: list-paused
  Regex: '(?i:list[ -]paused(?:[ -]jobs)?)'
"#;

pub struct Admin;

#[async_trait]
impl TaskHandler for Admin {
    async fn run(&self, robot: &Robot, command: &str, args: &[String]) -> TaskRetVal {
        let bot = robot.bot();
        match command {
            "init" => {}
            "reload" => match bot.reload().await {
                Ok(()) => {
                    robot.reply("Configuration reloaded successfully").await;
                }
                Err(error) => {
                    tracing::error!(error = format!("{error:#}"), "reload failed");
                    robot
                        .reply("Error encountered during reload, check the logs")
                        .await;
                    return TaskRetVal::Fail;
                }
            },
            "quit" | "restart" => {
                let restart = command == "restart";
                let user = robot.message().user;
                tracing::info!(target: "gopherbot::audit", %user, restart, "shutdown requested");
                let text = if restart {
                    "Ok, I'll be right back"
                } else {
                    "It's been a pleasure, goodbye"
                };
                robot.reply(text).await;
                bot.request_shutdown(restart);
            }
            "pause-job" => {
                let Some(job) = args.first() else {
                    return TaskRetVal::Fail;
                };
                let exists = bot.catalog.load().get(job).is_some_and(|task| task.is_job());
                if !exists {
                    robot.reply(&format!("I don't have a job named '{job}'")).await;
                    return TaskRetVal::Fail;
                }
                let user = robot.message().user;
                if bot.pause_job(job, &user) {
                    tracing::info!(target: "gopherbot::audit", %user, %job, "job paused");
                    robot.reply(&format!("Ok, I'll pause job '{job}'")).await;
                } else {
                    let by = bot.is_paused(job).unwrap_or_default();
                    robot
                        .reply(&format!("Job '{job}' is already paused by {by}"))
                        .await;
                }
            }
            "resume-job" => {
                let Some(job) = args.first() else {
                    return TaskRetVal::Fail;
                };
                match bot.resume_job(job) {
                    Some(_) => {
                        tracing::info!(target: "gopherbot::audit", user = %robot.message().user, %job, "job resumed");
                        robot.reply(&format!("Ok, job '{job}' will run again")).await;
                    }
                    None => {
                        robot.reply(&format!("Job '{job}' wasn't paused")).await;
                    }
                }
            }
            "list-paused" => {
                let paused = bot.paused_jobs();
                if paused.is_empty() {
                    robot.say("There are no paused jobs").await;
                } else {
                    let lines: Vec<String> = paused
                        .iter()
                        .map(|(job, user)| format!("{job} (paused by {user})"))
                        .collect();
                    robot.say(&format!("Paused jobs:\n{}", lines.join("\n"))).await;
                }
            }
            other => {
                tracing::warn!(command = other, "unknown builtin-admin command");
            }
        }
        TaskRetVal::Normal
    }
}
