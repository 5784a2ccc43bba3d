//! Turning an incoming message into zero or more pipelines.

pub mod addressing;
pub mod available;
pub mod jobcmd;

pub use addressing::Addressing;
pub use available::{Availability, plugin_available};

use crate::bot::{Bot, Settings};
use crate::brain::MemoryKey;
use crate::catalog::Task;
use crate::events::Event;
use crate::message::{ConnectorMessage, bracket_id, normalize_protocol};
use crate::pipeline::{Envelope, PipelineRequest, PipelineType};
use crate::prompt::ReplyKey;
use crate::subscriptions::SubscriptionKey;

use std::sync::Arc;

/// Short-term memory holding a user's last unaddressed message, replayed
/// when they follow up with just the robot's name.
const LAST_MESSAGE_KEY: &str = "lastMsg";

/// How a message addressed the robot.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Addressed {
    is_command: bool,
    /// `alias`, `name`, `direct` or empty.
    cmd_mode: &'static str,
    text: String,
}

/// Canonical name for the sender, and whether they are a known user.
fn resolve_user(settings: &Settings, message: &ConnectorMessage) -> (String, bool) {
    if let Some(name) = settings.user_name_for_id(&message.protocol, &message.user_id) {
        return (name, true);
    }
    let name = if message.user_id.is_empty() {
        message.user_name.clone()
    } else {
        bracket_id(&message.user_id)
    };
    tracing::info!(
        protocol = %message.protocol,
        user_id = %message.user_id,
        user_name = %message.user_name,
        "user not listed in roster, dispatching as {name}"
    );
    (name, false)
}

fn from_robot(settings: &Settings, message: &ConnectorMessage) -> bool {
    let bot = &settings.bot;
    (!bot.user_id.is_empty() && message.user_id == bot.user_id)
        || (!bot.user_name.is_empty() && message.user_name.eq_ignore_ascii_case(&bot.user_name))
}

fn addressing(settings: &Settings, text: &str, direct: bool) -> Addressed {
    let stripped = settings.addressing.command_text(text);
    if direct {
        return Addressed {
            is_command: true,
            cmd_mode: "direct",
            text: stripped.unwrap_or_else(|| text.to_string()),
        };
    }
    match stripped {
        Some(command) => {
            let by_alias = !settings.alias.is_empty() && text.trim_start().starts_with(settings.alias.as_str());
            Addressed {
                is_command: true,
                cmd_mode: if by_alias { "alias" } else { "name" },
                text: command,
            }
        }
        None => Addressed {
            is_command: false,
            cmd_mode: "",
            text: text.to_string(),
        },
    }
}

/// Handle one message heard by a connector.
pub async fn handle_incoming(bot: Arc<Bot>, mut message: ConnectorMessage) {
    message.protocol = normalize_protocol(&message.protocol);
    let settings = bot.settings();
    let (user, listed) = resolve_user(&settings, &message);

    if settings.is_ignored(&user) || settings.is_ignored(&message.user_name) {
        tracing::debug!(%user, "ignoring message from user on ignore list");
        return;
    }
    if !listed && settings.ignore_unlisted_users {
        tracing::debug!(%user, "ignoring message from unlisted user");
        bot.events.emit(Event::IgnoredUser);
        return;
    }
    if from_robot(&settings, &message) {
        tracing::trace!("ignoring message from self");
        return;
    }

    let channel = if message.direct_message {
        String::new()
    } else {
        message.channel_name.clone()
    };
    let thread = if message.threaded_message {
        message.thread_id.clone()
    } else {
        String::new()
    };
    let raw = message.message_text.trim().to_string();
    let mut addressed = addressing(&settings, &raw, message.direct_message);

    if message.bot_user {
        if message.direct_message {
            tracing::debug!(%user, "ignoring direct message from bot user");
            bot.events.emit(Event::BotDirectMessage);
            return;
        }
        if !addressed.is_command {
            // Other bots only ever start jobs through triggers.
            let envelope = Envelope::from_message(&message, &user);
            check_triggers(&bot, &envelope, &message.user_name, &raw);
            return;
        }
    }

    let memories = bot.brain.short_term();
    let last_key = MemoryKey::new(LAST_MESSAGE_KEY, &user, &channel, None);
    if !addressed.is_command && settings.addressing.is_bare_name(&raw) {
        let replayed = memories.recall(&last_key).unwrap_or_default();
        tracing::debug!(%user, %channel, text = %replayed, "bare name, replaying last message as a command");
        addressed = Addressed {
            is_command: true,
            cmd_mode: "name",
            text: replayed,
        };
    } else if !addressed.is_command {
        memories.remember(last_key, &raw);
    }

    let mut envelope = Envelope::from_message(&message, &user);
    envelope.text = addressed.text.clone();
    let text = addressed.text.as_str();

    if !addressed.is_command && message.threaded_message {
        let key = SubscriptionKey::new(&message.protocol, &channel, &thread);
        if let Some(plugin) = bot.subscriptions.lookup(&key) {
            match bot.catalog.load().get(&plugin).filter(|task| task.is_plugin()) {
                Some(task) => {
                    tracing::debug!(%plugin, %channel, %thread, "delivering message to subscribed plugin");
                    bot.spawn_pipeline(PipelineRequest {
                        task,
                        ptype: PipelineType::PluginCommand,
                        command: "subscribed".into(),
                        args: vec![raw.clone()],
                        envelope,
                        automatic: false,
                        cmd_mode: String::new(),
                        parent: None,
                    });
                    return;
                }
                None => tracing::warn!(%plugin, "subscribed plugin no longer exists"),
            }
        }
    }

    let reply_key = ReplyKey {
        protocol: message.protocol.clone(),
        user: user.clone(),
        channel: channel.clone(),
        thread: thread.clone(),
    };
    if bot.replies.deliver(&reply_key, text, addressed.is_command) {
        tracing::debug!(%user, %channel, "message consumed by waiting prompt");
        return;
    }

    if addressed.is_command {
        bot.connectors.message_heard(&message.protocol, &user, &channel).await;
    }

    let tasks = bot.catalog.load();
    let is_admin = settings.is_admin(&user);
    let mut matched = false;
    let mut catch_alls: Vec<(Arc<Task>, bool)> = Vec::new();

    for task in tasks.plugins() {
        let Some(plugin) = task.plugin() else {
            continue;
        };
        let availability = plugin_available(task, &user, &channel, message.direct_message, false, is_admin);
        if !availability.available {
            continue;
        }
        if addressed.is_command && plugin.catch_all {
            catch_alls.push((task.clone(), availability.specific));
        }
        if addressed.is_command
            && !matched
            && let Some((command, args)) = plugin.match_command(text, message.threaded_message)
        {
            matched = true;
            tracing::debug!(task = task.name(), %command, "command matched");
            bot.spawn_pipeline(PipelineRequest {
                task: task.clone(),
                ptype: PipelineType::PluginCommand,
                command,
                args,
                envelope: envelope.clone(),
                automatic: false,
                cmd_mode: addressed.cmd_mode.into(),
                parent: None,
            });
            continue;
        }
        if (plugin.ambient_match_command || !addressed.is_command)
            && let Some((command, args)) = plugin.match_message(&raw, message.threaded_message)
        {
            matched = true;
            tracing::debug!(task = task.name(), %command, "ambient message matched");
            bot.spawn_pipeline(PipelineRequest {
                task: task.clone(),
                ptype: PipelineType::PluginMessage,
                command,
                args,
                envelope: envelope.clone(),
                automatic: false,
                cmd_mode: addressed.cmd_mode.into(),
                parent: None,
            });
        }
    }

    if check_triggers(&bot, &envelope, &message.user_name, &raw) {
        matched = true;
    }

    if addressed.is_command && !matched && jobcmd::handle(&bot, &envelope, addressed.cmd_mode, text).await {
        matched = true;
    }

    if addressed.is_command && !matched {
        let specific = catch_alls.iter().any(|(_, specific)| *specific);
        let selected: Vec<_> = catch_alls
            .into_iter()
            .filter(|(_, is_specific)| !specific || *is_specific)
            .map(|(task, _)| task)
            .collect();
        if selected.is_empty() {
            tracing::debug!(%user, %channel, command = text, "no command matched and no catch-all available");
        }
        for task in selected {
            bot.spawn_pipeline(PipelineRequest {
                task,
                ptype: PipelineType::CatchAll,
                command: "catchall".into(),
                args: vec![text.to_string()],
                envelope: envelope.clone(),
                automatic: false,
                cmd_mode: addressed.cmd_mode.into(),
                parent: None,
            });
        }
    }
}

/// Start every job whose trigger matches. Returns whether any fired.
fn check_triggers(bot: &Arc<Bot>, envelope: &Envelope, sender: &str, text: &str) -> bool {
    if envelope.channel.is_empty() {
        return false;
    }
    let mut fired = false;
    for task in bot.catalog.load().jobs() {
        let Some(job) = task.job() else {
            continue;
        };
        if task.is_disabled() {
            continue;
        }
        let captures = job.triggers.iter().find_map(|trigger| {
            trigger
                .fires(&envelope.user, &envelope.channel, text)
                .or_else(|| trigger.fires(sender, &envelope.channel, text))
        });
        if let Some(args) = captures {
            fired = true;
            tracing::info!(job = task.name(), user = %envelope.user, channel = %envelope.channel, "job triggered");
            bot.spawn_pipeline(PipelineRequest {
                task: task.clone(),
                ptype: PipelineType::JobTrigger,
                command: "run".into(),
                args,
                envelope: envelope.clone(),
                automatic: true,
                cmd_mode: String::new(),
                parent: None,
            });
        }
    }
    fired
}
