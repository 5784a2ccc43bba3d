//! The `run job <name> [args]` command.

use crate::bot::Bot;
use crate::brain::MemoryKey;
use crate::brain::shortterm::CONTEXT_PREFIX;
use crate::catalog::Task;
use crate::pipeline::{Envelope, PipelineRequest, PipelineType};
use crate::prompt::{REPLY_TIMEOUT, ReplyKey};
use crate::retval::RetVal;

use regex::Regex;
use std::sync::{Arc, LazyLock};

static RUN_JOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*run +job +([A-Za-z][\w-]*)(?: (.*))?\s*$").expect("hardcoded regex"));

/// Attempts at each job argument before giving up.
const ARGUMENT_TRIES: usize = 2;

/// Parse `run job <name> [args]`.
fn parse(text: &str) -> Option<(String, Vec<String>)> {
    let captures = RUN_JOB.captures(text)?;
    let name = captures.get(1)?.as_str().to_string();
    let args = captures
        .get(2)
        .map(|args| args.as_str().split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    Some((name, args))
}

/// Why a job can't be run by this user here, if it can't.
fn refusal(bot: &Bot, task: Option<&Arc<Task>>, name: &str, envelope: &Envelope) -> Option<String> {
    let Some(task) = task else {
        return Some(format!("Sorry, I don't have a task named '{name}' configured"));
    };
    if !task.is_job() {
        return Some(format!("Sorry, '{name}' isn't a job"));
    }
    let settings = bot.settings();
    let channel = if task.common.channel.is_empty() {
        settings.default_job_channel.clone()
    } else {
        task.common.channel.clone()
    };
    if envelope.channel != channel {
        return Some(format!(
            "Sorry, job '{name}' isn't available in this channel, try '{channel}'"
        ));
    }
    if task.common.require_admin && !settings.is_admin(&envelope.user) {
        return Some(format!("Sorry, '{name}' is only available to bot administrators"));
    }
    if !task.common.users.is_empty()
        && !task
            .common
            .users
            .iter()
            .any(|pattern| glob::Pattern::new(pattern).is_ok_and(|pattern| pattern.matches(&envelope.user)))
    {
        return Some("Sorry, you're not on the list of allowed users for that job".into());
    }
    None
}

/// Handle a `run job` command. Returns false when `text` is not one.
pub async fn handle(bot: &Arc<Bot>, envelope: &Envelope, cmd_mode: &str, text: &str) -> bool {
    let Some((name, mut args)) = parse(text) else {
        return false;
    };
    let task = bot.catalog.load().get(&name);
    if let Some(message) = refusal(bot, task.as_ref(), &name, envelope) {
        bot.say(envelope, &message).await;
        return true;
    }
    let Some(task) = task else {
        return true;
    };
    let Some(job) = task.job() else {
        return true;
    };

    bot.brain.short_term().remember(
        MemoryKey::new(&format!("{CONTEXT_PREFIX}task"), &envelope.user, &envelope.channel, None),
        &name,
    );

    if !args.is_empty() {
        if args.len() != job.arguments.len() {
            bot.say(
                envelope,
                &format!(
                    "Wrong number of arguments for job '{name}', {} configured but {} given",
                    job.arguments.len(),
                    args.len()
                ),
            )
            .await;
            return true;
        }
        for (value, argument) in args.iter().zip(&job.arguments) {
            if !argument.regex.is_match(value) {
                bot.say(
                    envelope,
                    &format!("'{value}' doesn't match the pattern for argument '{}'", argument.label),
                )
                .await;
                return true;
            }
        }
    } else {
        let key = ReplyKey {
            protocol: envelope.protocol.clone(),
            user: envelope.user.clone(),
            channel: envelope.channel.clone(),
            thread: if envelope.threaded {
                envelope.thread.clone()
            } else {
                String::new()
            },
        };
        for argument in &job.arguments {
            let question = format!("What's the value for '{}'?", argument.label);
            let mut answer = None;
            for _ in 0..ARGUMENT_TRIES {
                let (reply, ret) = bot
                    .replies
                    .prompt(&key, &argument.regex, REPLY_TIMEOUT, || bot.reply(envelope, &question))
                    .await;
                match ret {
                    RetVal::Ok => {
                        answer = Some(reply.trim().to_string());
                        break;
                    }
                    RetVal::ReplyNotMatched => {
                        bot.reply(
                            envelope,
                            &format!("That doesn't match the pattern for argument '{}'", argument.label),
                        )
                        .await;
                    }
                    _ => break,
                }
            }
            let Some(answer) = answer else {
                bot.say(envelope, &format!("Giving up on running job '{name}'")).await;
                return true;
            };
            args.push(answer);
        }
    }

    tracing::info!(job = %name, user = %envelope.user, channel = %envelope.channel, "job started by command");
    bot.spawn_pipeline(PipelineRequest {
        task: task.clone(),
        ptype: PipelineType::JobCommand,
        command: "run".into(),
        args,
        envelope: envelope.clone(),
        automatic: false,
        cmd_mode: cmd_mode.to_string(),
        parent: None,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_job_parsing() {
        assert_eq!(parse("run job backup"), Some(("backup".to_string(), Vec::new())));
        assert_eq!(
            parse("Run Job deploy prod  v1.2"),
            Some(("deploy".to_string(), vec!["prod".to_string(), "v1.2".to_string()]))
        );
        assert_eq!(parse("run jobs"), None);
        assert_eq!(parse("run job 9lives"), None);
    }
}
