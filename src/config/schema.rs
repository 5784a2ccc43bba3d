//! Strict YAML schema for `robot.yaml` and per-task files.
//!
//! Every struct rejects unknown fields. Free-form sections (`ProtocolConfig`,
//! `BrainConfig`, `HistoryConfig`, task `Config`) are removed before decoding
//! and carried separately as JSON values.

use crate::message::{BotInfo, UserInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level robot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct RobotConf {
    pub bot_info: BotInfo,
    pub alias: String,
    pub admin_users: Vec<String>,
    pub ignore_users: Vec<String>,
    pub ignore_unlisted_users: bool,
    pub default_channels: Vec<String>,
    pub default_job_channel: String,
    pub default_elevator: String,
    pub default_authorizer: String,
    pub default_allow_direct: Option<bool>,
    pub time_zone: String,
    pub protocol: String,
    pub secondary_protocols: Vec<String>,
    pub brain: String,
    pub encrypt_brain: bool,
    pub history_provider: String,
    pub work_space: String,
    pub log_level: String,
    pub http_listen: String,
    pub help_line_threshold: Option<usize>,
    pub external_plugins: Vec<TaskSettings>,
    pub external_jobs: Vec<TaskSettings>,
    pub external_tasks: Vec<TaskSettings>,
    pub go_plugins: Vec<TaskSettings>,
    pub go_jobs: Vec<TaskSettings>,
    pub go_tasks: Vec<TaskSettings>,
    pub name_spaces: BTreeMap<String, ParameterList>,
    pub parameter_sets: BTreeMap<String, ParameterList>,
    pub scheduled_jobs: Vec<ScheduledTaskConf>,
    pub user_roster: Vec<UserInfo>,
    /// Per-protocol maps of canonical user name to protocol user ID.
    pub user_maps: BTreeMap<String, BTreeMap<String, String>>,
    /// File extension to interpreter command for interpreted tasks.
    pub interpreters: BTreeMap<String, String>,
}

/// Sections of `robot.yaml` that are not strictly typed.
pub const ROBOT_FREE_FORM: &[&str] = &["ProtocolConfig", "BrainConfig", "HistoryConfig"];

/// Sections of task files that are not strictly typed.
pub const TASK_FREE_FORM: &[&str] = &["Config"];

/// A task declaration in `robot.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct TaskSettings {
    pub name: String,
    pub path: String,
    pub description: String,
    pub name_space: String,
    pub parameters: Vec<Parameter>,
    pub parameter_sets: Vec<String>,
    pub privileged: Option<bool>,
    pub homed: bool,
    pub disabled: bool,
}

/// A name/value pair destined for a task environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct ParameterList {
    pub description: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct ScheduledTaskConf {
    pub name: String,
    pub schedule: String,
    pub command: String,
    pub arguments: Vec<String>,
    /// Zone for this entry's cron fields; the robot's `TimeZone` when empty.
    pub time_zone: String,
}

/// Regex matcher as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct MatcherConf {
    pub label: String,
    pub command: String,
    pub regex: String,
    pub contexts: Vec<String>,
    pub channel_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct HelpConf {
    pub keywords: Vec<String>,
    pub helptext: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct TriggerConf {
    pub user: String,
    pub channel: String,
    pub regex: String,
}

/// Contents of `conf/plugins/<name>.yaml`, `conf/jobs/<name>.yaml` or
/// `conf/tasks/<name>.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct TaskConf {
    pub description: String,
    pub name_space: String,
    pub parameters: Vec<Parameter>,
    pub parameter_sets: Vec<String>,
    pub channel: String,
    pub channels: Vec<String>,
    pub all_channels: bool,
    pub direct_only: bool,
    pub allow_direct: Option<bool>,
    pub users: Vec<String>,
    pub require_admin: bool,
    pub elevator: String,
    pub authorizer: String,
    pub auth_require: String,
    pub reply_matchers: Vec<MatcherConf>,
    pub disabled: bool,
    pub disabled_reason: String,
    pub privileged: Option<bool>,
    pub homed: Option<bool>,

    // plugin fields
    pub command_matchers: Vec<MatcherConf>,
    pub message_matchers: Vec<MatcherConf>,
    pub help: Vec<HelpConf>,
    pub admin_commands: Vec<String>,
    pub elevated_commands: Vec<String>,
    pub elevate_immediate_commands: Vec<String>,
    pub authorized_commands: Vec<String>,
    pub authorize_all_commands: bool,
    pub allowed_hidden_commands: Vec<String>,
    pub catch_all: bool,
    pub ambient_match_command: bool,

    // job fields
    pub triggers: Vec<TriggerConf>,
    pub arguments: Vec<MatcherConf>,
    pub keep_logs: Option<usize>,
    pub quiet: bool,
}

impl TaskConf {
    /// Names of plugin-only fields set on a non-plugin task.
    pub fn plugin_fields_in_use(&self) -> Vec<&'static str> {
        let mut used = Vec::new();
        if !self.command_matchers.is_empty() {
            used.push("CommandMatchers");
        }
        if !self.message_matchers.is_empty() {
            used.push("MessageMatchers");
        }
        if !self.help.is_empty() {
            used.push("Help");
        }
        if !self.admin_commands.is_empty() {
            used.push("AdminCommands");
        }
        if !self.elevated_commands.is_empty() || !self.elevate_immediate_commands.is_empty() {
            used.push("ElevatedCommands");
        }
        if !self.authorized_commands.is_empty() || self.authorize_all_commands {
            used.push("AuthorizedCommands");
        }
        if !self.allowed_hidden_commands.is_empty() {
            used.push("AllowedHiddenCommands");
        }
        if self.catch_all {
            used.push("CatchAll");
        }
        used
    }

    /// Names of job-only fields set on a non-job task.
    pub fn job_fields_in_use(&self) -> Vec<&'static str> {
        let mut used = Vec::new();
        if !self.triggers.is_empty() {
            used.push("Triggers");
        }
        if !self.arguments.is_empty() {
            used.push("Arguments");
        }
        if self.keep_logs.is_some() {
            used.push("KeepLogs");
        }
        if self.quiet {
            used.push("Quiet");
        }
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robot_conf_rejects_unknown_fields() {
        let error = serde_yaml::from_str::<RobotConf>("Alias: ';'\nAliases: [x]\n")
            .expect_err("unknown field must fail");
        assert!(error.to_string().contains("Aliases"));
    }

    #[test]
    fn task_conf_decodes_plugin_fields() {
        let conf: TaskConf = serde_yaml::from_str(
            "CommandMatchers:\n  - Regex: 'ping'\n    Command: ping\nAllowedHiddenCommands: [ping]\n",
        )
        .expect("valid plugin conf");
        assert_eq!(conf.command_matchers[0].command, "ping");
        assert_eq!(conf.plugin_fields_in_use(), vec!["CommandMatchers", "AllowedHiddenCommands"]);
        assert!(conf.job_fields_in_use().is_empty());
    }
}
