//! The `help` plugin: keyword help, robot info and the catch-all reply.

use crate::catalog::Task;
use crate::dispatch::plugin_available;
use crate::pipeline::Envelope;
use crate::retval::TaskRetVal;
use crate::robot::{Robot, TaskHandler};

use async_trait::async_trait;

pub const CONFIG: &str = r#"
AllChannels: true
AllowDirect: true
CatchAll: true
Help:
- Keywords: [ "info", "information", "robot", "admin", "administrators" ]
  Helptext: [ "(bot), info | tell me about yourself - provide useful information for admins, or a list of admins" ]
- Keywords: [ "*", "help" ]
  Helptext: [ "(bot), help <keyword> - find help for commands matching <keyword>" ]
CommandMatchers:
- Command: help
  Regex: '(?i:help(?: ([\w-]+))?)'
- Command: info
  Regex: '(?i:info|tell me about yourself|about|information)'
"#;

const TOO_LONG: &str = "(the help output was pretty long, so I sent you a private message)";

pub struct Help;

/// Help lines for `keyword` (or every command when empty) the sender can
/// use here.
fn help_lines(robot: &Robot, envelope: &Envelope, keyword: &str) -> Vec<String> {
    let bot = robot.bot();
    let settings = bot.settings();
    let is_admin = settings.is_admin(&envelope.user);
    let name = if settings.bot.user_name.is_empty() {
        settings.alias.clone()
    } else {
        settings.bot.user_name.clone()
    };
    let keyword = keyword.to_lowercase();
    let catalog = bot.catalog.load();

    let mut lines = Vec::new();
    for task in catalog.plugins() {
        let available = plugin_available(
            task,
            &envelope.user,
            &envelope.channel,
            envelope.direct,
            !keyword.is_empty(),
            is_admin,
        );
        if !available.available {
            continue;
        }
        let Some(plugin) = task.plugin() else {
            continue;
        };
        for help in &plugin.help {
            let matches = keyword.is_empty() || help.keywords.iter().any(|word| word.eq_ignore_ascii_case(&keyword));
            if !matches {
                continue;
            }
            for text in &help.helptext {
                let mut line = text.replace("(bot)", &name);
                if !keyword.is_empty()
                    && let Some(channels) = channel_note(task)
                {
                    line.push_str(&channels);
                }
                lines.push(line);
            }
        }
    }
    lines
}

fn channel_note(task: &Task) -> Option<String> {
    let common = &task.common;
    if common.all_channels {
        return None;
    }
    let mut channels = common.channels.clone();
    if channels.is_empty() && !common.channel.is_empty() {
        channels.push(common.channel.clone());
    }
    (!channels.is_empty()).then(|| format!(" (channels: {})", channels.join(", ")))
}

#[async_trait]
impl TaskHandler for Help {
    async fn run(&self, robot: &Robot, command: &str, args: &[String]) -> TaskRetVal {
        let envelope = robot.message();
        let settings = robot.bot().settings();
        match command {
            "init" => {}
            "help" => {
                let keyword = args.first().map(String::as_str).unwrap_or_default();
                let lines = help_lines(robot, &envelope, keyword);
                if lines.is_empty() {
                    robot
                        .reply(&format!("Sorry, I didn't find any commands matching your keyword '{keyword}'"))
                        .await;
                    return TaskRetVal::Normal;
                }
                let header = if keyword.is_empty() {
                    "Command(s) available in this channel:".to_string()
                } else {
                    format!("Command(s) matching keyword: {keyword}")
                };
                let text = format!("{header}\n{}", lines.join("\n\n"));
                if lines.len() > settings.help_line_threshold && !envelope.direct {
                    robot.reply(TOO_LONG).await;
                    robot.send_user_message(&envelope.user, &text).await;
                } else {
                    robot.say(&text).await;
                }
            }
            "info" => {
                let mut text = String::from("Here's some information about me and my running environment:\n");
                text.push_str(&format!("The hostname for the server I'm running on is: {}\n", hostname()));
                if !settings.bot.user_name.is_empty() {
                    text.push_str(&format!("My name is '{}'", settings.bot.user_name));
                    if !settings.alias.is_empty() {
                        text.push_str(&format!(", and my alias is '{}'", settings.alias));
                    }
                    text.push('\n');
                }
                text.push_str(&format!("I'm running gopherbot version {}\n", env!("CARGO_PKG_VERSION")));
                if settings.admins.is_empty() {
                    text.push_str("No administrators have been configured");
                } else {
                    text.push_str(&format!("My administrators are: {}", settings.admins.join(", ")));
                }
                robot.say(&text).await;
            }
            "catchall" => {
                let name = if settings.bot.user_name.is_empty() {
                    settings.alias.clone()
                } else {
                    settings.bot.user_name.clone()
                };
                robot
                    .reply(&format!(
                        "Sorry, that didn't match any commands I know, or may refer to a command that's not available in this channel; try '{name}, help <keyword>'"
                    ))
                    .await;
            }
            _ => {}
        }
        TaskRetVal::Normal
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "(unknown)".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExecKind, TaskCommon, TaskKind};

    fn task(all_channels: bool, channels: &[&str]) -> Task {
        let mut common = TaskCommon::new("weather", ExecKind::external("plugins/weather.sh".into()));
        common.all_channels = all_channels;
        common.channels = channels.iter().map(|channel| channel.to_string()).collect();
        Task {
            common,
            kind: TaskKind::Plugin(Default::default()),
        }
    }

    #[test]
    fn keyword_help_names_channels() {
        assert_eq!(channel_note(&task(true, &["general"])), None);
        assert_eq!(
            channel_note(&task(false, &["general", "random"])).as_deref(),
            Some(" (channels: general, random)")
        );
        assert_eq!(channel_note(&task(false, &[])), None);
    }
}
