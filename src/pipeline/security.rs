//! Checks run before a user-invoked plugin or job: admin-only commands,
//! hidden commands, authorization and elevation.

use super::calltask::call_task;
use super::{TaskSpec, Worker};
use crate::bot::Bot;
use crate::catalog::Task;
use crate::events::Event;
use crate::retval::TaskRetVal;

use std::sync::Arc;

const CONFIG_AUTH_ERROR: &str = "Sorry, authorization failed due to a configuration error";
const TECHNICAL_AUTH_ERROR: &str = "Sorry, authorization failed due to a problem with the authorization plugin";
const TECHNICAL_ELEV_ERROR: &str = "Sorry, elevation failed due to a problem with the elevation plugin";

/// Run every check in order, stopping at the first that does not succeed.
pub async fn check_all(bot: &Arc<Bot>, worker: &Arc<Worker>, spec: &TaskSpec) -> TaskRetVal {
    let task = &spec.task;
    if !check_admin(bot, worker, task, &spec.command).await {
        return TaskRetVal::Fail;
    }
    if !check_hidden(bot, worker, task, &spec.command).await {
        return TaskRetVal::Fail;
    }
    let auth = check_authorization(bot, worker, spec).await;
    if auth != TaskRetVal::Success {
        return TaskRetVal::Fail;
    }
    if !worker.state().elevated {
        let elevation = check_elevation(bot, worker, spec).await;
        if elevation != TaskRetVal::Success {
            return TaskRetVal::Fail;
        }
    }
    TaskRetVal::Success
}

/// Admin-only plugins and commands refuse non-admins.
pub async fn check_admin(bot: &Arc<Bot>, worker: &Arc<Worker>, task: &Task, command: &str) -> bool {
    let admin_only = task.common.require_admin
        || task
            .plugin()
            .is_some_and(|plugin| plugin.admin_commands.iter().any(|admin| admin == command));
    if !admin_only {
        return true;
    }
    let envelope = worker.envelope();
    if bot.settings().is_admin(&envelope.user) {
        return true;
    }
    tracing::warn!(target: "gopherbot::audit", user = %envelope.user, task = task.name(), command, "non-admin attempted admin command");
    bot.say(
        &envelope,
        &format!("Sorry, '{}/{command}' is only available to bot administrators", task.name()),
    )
    .await;
    false
}

/// Hidden messages may only run commands the plugin explicitly allows.
pub async fn check_hidden(bot: &Arc<Bot>, worker: &Arc<Worker>, task: &Task, command: &str) -> bool {
    let envelope = worker.envelope();
    if !envelope.hidden {
        return true;
    }
    let allowed = task
        .plugin()
        .is_some_and(|plugin| plugin.allowed_hidden_commands.iter().any(|hidden| hidden == command));
    if allowed {
        return true;
    }
    tracing::info!(user = %envelope.user, task = task.name(), command, "refusing hidden command");
    bot.reply(
        &envelope,
        &format!(
            "Sorry, '{}/{command}' cannot be run as a hidden command - use the robot's name or alias",
            task.name()
        ),
    )
    .await;
    false
}

fn requires_authorization(task: &Task, command: &str) -> bool {
    match task.plugin() {
        Some(plugin) => {
            plugin.authorize_all_commands || plugin.authorized_commands.iter().any(|authorized| authorized == command)
        }
        None => task.is_job() && !task.common.authorizer.is_empty(),
    }
}

/// Ask the task's authorizer whether this user may run the command here.
/// Returns `Success` when no authorization is needed.
pub async fn check_authorization(bot: &Arc<Bot>, worker: &Arc<Worker>, spec: &TaskSpec) -> TaskRetVal {
    let task = &spec.task;
    let envelope = worker.envelope();
    let settings = bot.settings();
    let required = requires_authorization(task, &spec.command);

    if !required {
        let authorizes_nothing = task
            .plugin()
            .is_some_and(|plugin| !plugin.authorize_all_commands && plugin.authorized_commands.is_empty());
        if authorizes_nothing && !task.common.authorizer.is_empty() {
            tracing::error!(task = task.name(), authorizer = %task.common.authorizer,
                "Authorizer set but no commands require authorization");
            bot.say(&envelope, CONFIG_AUTH_ERROR).await;
            return TaskRetVal::ConfigurationError;
        }
        return TaskRetVal::Success;
    }

    let authorizer = if task.common.authorizer.is_empty() {
        settings.default_authorizer.clone()
    } else {
        task.common.authorizer.clone()
    };
    if authorizer.is_empty() {
        tracing::error!(target: "gopherbot::audit", task = task.name(), command = %spec.command,
            "authorization required but no authorizer configured");
        bot.events.emit(Event::AuthNoRunMisconfigured);
        bot.say(&envelope, CONFIG_AUTH_ERROR).await;
        return TaskRetVal::ConfigurationError;
    }
    let Some(auth_task) = bot.catalog.load().get(&authorizer).filter(|auth| auth.is_plugin()) else {
        tracing::error!(target: "gopherbot::audit", task = task.name(), %authorizer, "authorizer plugin not found");
        bot.events.emit(Event::AuthNoRunNotFound);
        bot.say(&envelope, TECHNICAL_AUTH_ERROR).await;
        return TaskRetVal::ConfigurationError;
    };

    let mut args = vec![
        task.name().to_string(),
        task.common.auth_require.clone(),
        spec.command.clone(),
    ];
    args.extend(spec.args.iter().cloned());
    let (ret, _) = call_task(
        bot,
        worker,
        &TaskSpec {
            task: auth_task,
            command: "authorize".into(),
            args,
        },
    )
    .await;

    match ret {
        TaskRetVal::Success => {
            tracing::info!(target: "gopherbot::audit", user = %envelope.user, task = task.name(), command = %spec.command,
                %authorizer, "authorization succeeded");
            bot.events.emit(Event::AuthRanSuccess);
            TaskRetVal::Success
        }
        TaskRetVal::Fail => {
            tracing::warn!(target: "gopherbot::audit", user = %envelope.user, task = task.name(), command = %spec.command,
                %authorizer, "authorization denied");
            bot.events.emit(Event::AuthRanFail);
            bot.say(&envelope, "Sorry, you're not authorized for that command in this channel")
                .await;
            TaskRetVal::Fail
        }
        TaskRetVal::MechanismFail => {
            tracing::error!(target: "gopherbot::audit", task = task.name(), %authorizer, "authorizer mechanism failure");
            bot.events.emit(Event::AuthRanMechanismFailed);
            bot.say(&envelope, TECHNICAL_AUTH_ERROR).await;
            TaskRetVal::MechanismFail
        }
        other => {
            tracing::error!(target: "gopherbot::audit", task = task.name(), %authorizer, ret = %other,
                "authorizer returned unexpected value");
            bot.events.emit(Event::AuthRanFailOther);
            bot.say(&envelope, TECHNICAL_AUTH_ERROR).await;
            TaskRetVal::MechanismFail
        }
    }
}

/// Whether the command needs elevation, and if so whether immediately.
fn elevation_required(task: &Task, command: &str) -> Option<bool> {
    match task.plugin() {
        Some(plugin) => {
            if plugin.elevate_immediate_commands.iter().any(|elevated| elevated == command) {
                Some(true)
            } else if plugin.elevated_commands.iter().any(|elevated| elevated == command) {
                Some(false)
            } else {
                None
            }
        }
        None => (task.is_job() && !task.common.elevator.is_empty()).then_some(false),
    }
}

/// Run the elevator for commands that need it. Returns `Success` when no
/// elevation is needed.
pub async fn check_elevation(bot: &Arc<Bot>, worker: &Arc<Worker>, spec: &TaskSpec) -> TaskRetVal {
    let task = &spec.task;
    let Some(immediate) = elevation_required(task, &spec.command) else {
        return TaskRetVal::Success;
    };
    elevate(bot, worker, task, immediate).await
}

/// Call the elevator for `task`; sets the pipeline's elevated flag on
/// success.
pub async fn elevate(bot: &Arc<Bot>, worker: &Arc<Worker>, task: &Task, immediate: bool) -> TaskRetVal {
    let envelope = worker.envelope();
    let elevator = if task.common.elevator.is_empty() {
        bot.settings().default_elevator.clone()
    } else {
        task.common.elevator.clone()
    };
    let elevator_task = (!elevator.is_empty())
        .then(|| bot.catalog.load().get(&elevator))
        .flatten()
        .filter(|elevator| elevator.is_plugin());
    let Some(elevator_task) = elevator_task else {
        tracing::error!(target: "gopherbot::audit", task = task.name(), %elevator, "elevation required but elevator not found");
        bot.events.emit(Event::ElevNoRunNotFound);
        bot.say(&envelope, TECHNICAL_ELEV_ERROR).await;
        return TaskRetVal::MechanismFail;
    };

    let (ret, _) = call_task(
        bot,
        worker,
        &TaskSpec {
            task: elevator_task,
            command: "elevate".into(),
            args: vec![immediate.to_string()],
        },
    )
    .await;
    if ret == TaskRetVal::Success {
        tracing::info!(target: "gopherbot::audit", user = %envelope.user, task = task.name(), %elevator, "elevation succeeded");
        bot.events.emit(Event::ElevRanSuccess);
        worker.state().elevated = true;
        TaskRetVal::Success
    } else {
        tracing::warn!(target: "gopherbot::audit", user = %envelope.user, task = task.name(), %elevator, %ret, "elevation failed");
        bot.events.emit(Event::ElevRanFail);
        TaskRetVal::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExecKind, JobSpec, PluginSpec, TaskCommon, TaskKind};

    fn with_kind(kind: TaskKind, elevator: &str) -> Task {
        let mut common = TaskCommon::new(
            "secure",
            ExecKind::InProcess {
                handler: "secure".into(),
            },
        );
        common.elevator = elevator.into();
        Task { common, kind }
    }

    #[test]
    fn elevation_is_per_command_for_plugins() {
        let plugin = PluginSpec {
            elevated_commands: vec!["deploy".into()],
            elevate_immediate_commands: vec!["destroy".into()],
            ..Default::default()
        };
        let task = with_kind(TaskKind::Plugin(plugin), "");
        assert_eq!(elevation_required(&task, "deploy"), Some(false));
        assert_eq!(elevation_required(&task, "destroy"), Some(true));
        assert_eq!(elevation_required(&task, "status"), None);
    }

    #[test]
    fn jobs_elevate_when_they_name_an_elevator() {
        let task = with_kind(TaskKind::Job(JobSpec::default()), "totp");
        assert_eq!(elevation_required(&task, ""), Some(false));
        let task = with_kind(TaskKind::Job(JobSpec::default()), "");
        assert_eq!(elevation_required(&task, ""), None);
    }

    #[test]
    fn authorization_requirements() {
        let plugin = PluginSpec {
            authorized_commands: vec!["deploy".into()],
            ..Default::default()
        };
        let task = with_kind(TaskKind::Plugin(plugin), "");
        assert!(requires_authorization(&task, "deploy"));
        assert!(!requires_authorization(&task, "status"));

        let plugin = PluginSpec {
            authorize_all_commands: true,
            ..Default::default()
        };
        assert!(requires_authorization(&with_kind(TaskKind::Plugin(plugin), ""), "anything"));
    }
}
