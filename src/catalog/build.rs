//! Building a [`TaskList`] from loaded configuration.
//!
//! Problems with an individual task never abort the build: the task is
//! registered disabled, with the reason recorded, so that invoking it reports
//! a configuration error instead of silently doing nothing.

use super::{
    Anchor, ExecKind, InputMatcher, JobSpec, JobTrigger, PluginSpec, Task, TaskCommon, TaskKind,
    TaskList,
};
use crate::config::{self, ConfigKind, Decrypter, Paths, RobotConf, TaskConf, TaskSettings};
use regex::Regex;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static TASK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][\w-]*$").expect("hardcoded regex"));

const DEFAULT_KEEP_LOGS: usize = 14;

/// A compiled-in task offered by the robot binary.
#[derive(Debug, Clone)]
pub struct BuiltinTask {
    pub name: String,
    pub kind: ConfigKind,
    pub description: String,
    /// Stock YAML configuration merged underneath installed and custom files.
    pub default_config: Option<String>,
}

/// One task declaration with its merged configuration document.
#[derive(Debug, Clone)]
pub struct TaskSource {
    pub settings: TaskSettings,
    pub kind: ConfigKind,
    pub in_process: bool,
    pub document: Option<serde_yaml::Value>,
    /// Set when the configuration could not be read.
    pub load_error: Option<String>,
}

/// Gather every task declaration: compiled-in tasks first, then external
/// plugins, jobs and tasks in declaration order.
///
/// `defaults` holds stock configuration reported by external tasks
/// themselves, keyed by task name.
pub fn collect_sources(
    paths: &Paths,
    robot: &RobotConf,
    builtins: &[BuiltinTask],
    defaults: &HashMap<String, String>,
    decrypt: Option<Decrypter<'_>>,
) -> Vec<TaskSource> {
    let mut sources = Vec::new();

    for builtin in builtins {
        let declared = match builtin.kind {
            ConfigKind::Plugin => &robot.go_plugins,
            ConfigKind::Job => &robot.go_jobs,
            _ => &robot.go_tasks,
        };
        let settings = declared
            .iter()
            .find(|settings| settings.name == builtin.name)
            .cloned()
            .unwrap_or_else(|| TaskSettings {
                name: builtin.name.clone(),
                description: builtin.description.clone(),
                ..Default::default()
            });
        sources.push(load_source(
            paths,
            settings,
            builtin.kind,
            true,
            builtin.default_config.as_deref(),
            decrypt,
        ));
    }

    for declared in robot.go_plugins.iter().chain(&robot.go_jobs).chain(&robot.go_tasks) {
        if !builtins.iter().any(|builtin| builtin.name == declared.name) {
            tracing::error!(task = %declared.name, "no compiled-in handler for configured Go task, skipping");
        }
    }

    let external = [
        (&robot.external_plugins, ConfigKind::Plugin),
        (&robot.external_jobs, ConfigKind::Job),
        (&robot.external_tasks, ConfigKind::Task),
    ];
    for (declared, kind) in external {
        for settings in declared {
            let default = defaults.get(&settings.name).map(String::as_str);
            sources.push(load_source(paths, settings.clone(), kind, false, default, decrypt));
        }
    }

    sources
}

fn load_source(
    paths: &Paths,
    settings: TaskSettings,
    kind: ConfigKind,
    in_process: bool,
    default_config: Option<&str>,
    decrypt: Option<Decrypter<'_>>,
) -> TaskSource {
    let relpath = format!("{}/{}.yaml", kind.directory(), settings.name);
    let defaults = match default_config {
        Some(text) => match config::parse_document(&format!("default config for {}", settings.name), text, decrypt) {
            Ok(doc) => Some(doc),
            Err(error) => {
                return TaskSource {
                    settings,
                    kind,
                    in_process,
                    document: None,
                    load_error: Some(error.to_string()),
                };
            }
        },
        None => None,
    };

    match config::read_layered(paths, &relpath, defaults, decrypt) {
        Ok(document) => TaskSource {
            settings,
            kind,
            in_process,
            document,
            load_error: None,
        },
        Err(error) => TaskSource {
            settings,
            kind,
            in_process,
            document: None,
            load_error: Some(error.to_string()),
        },
    }
}

/// Validate and compile every source into an immutable task list.
pub fn build_task_list(robot: &RobotConf, sources: Vec<TaskSource>, paths: &Paths) -> TaskList {
    let mut list = TaskList::default();

    for source in sources {
        let name = source.settings.name.clone();
        if !TASK_NAME.is_match(&name) {
            tracing::error!(task = %name, "invalid task name, skipping");
            continue;
        }
        if name == "bot" {
            tracing::error!("task name 'bot' is reserved, skipping");
            continue;
        }
        let task = compile_task(robot, source, paths);
        if let Some(reason) = &task.common.disabled {
            tracing::warn!(task = %name, %reason, "task disabled");
        }
        if !list.insert(task) {
            tracing::error!(task = %name, "duplicate task name, skipping");
        }
    }

    for (name, params) in &robot.name_spaces {
        list.namespaces.insert(name.clone(), params.parameters.clone());
    }
    for (name, params) in &robot.parameter_sets {
        list.parameter_sets.insert(name.clone(), params.parameters.clone());
    }
    list.scheduled = robot.scheduled_jobs.clone();

    tracing::debug!(tasks = list.len(), "task list built");
    list
}

fn compile_task(robot: &RobotConf, source: TaskSource, paths: &Paths) -> Task {
    let TaskSource {
        settings,
        kind,
        in_process,
        document,
        load_error,
    } = source;

    let mut disabled = load_error;
    let origin = format!("{}/{}.yaml", kind.directory(), settings.name);
    let id = content_id(kind, &settings, document.as_ref());

    let (conf, free_form) = match document {
        Some(doc) => match config::decode_task(&origin, kind, doc) {
            Ok(decoded) => decoded,
            Err(error) => {
                disabled.get_or_insert_with(|| error.to_string());
                (TaskConf::default(), None)
            }
        },
        None => (TaskConf::default(), None),
    };

    if settings.disabled || conf.disabled {
        let reason = if conf.disabled_reason.is_empty() {
            "disabled in configuration".to_string()
        } else {
            conf.disabled_reason.clone()
        };
        disabled.get_or_insert(reason);
    }

    let exec = if in_process {
        ExecKind::InProcess {
            handler: settings.name.clone(),
        }
    } else if settings.path.is_empty() {
        disabled.get_or_insert_with(|| "external task has no Path".to_string());
        ExecKind::External {
            path: PathBuf::new(),
        }
    } else {
        ExecKind::external(resolve_task_path(paths, &settings.path))
    };

    let mut compile_errors = Vec::new();
    let mut compile = |matchers: &[config::MatcherConf], anchor: Anchor| -> Vec<InputMatcher> {
        matchers
            .iter()
            .filter_map(|matcher| match InputMatcher::compile(matcher, anchor) {
                Ok(compiled) => Some(compiled),
                Err(error) => {
                    compile_errors.push(format!("bad regex '{}': {error}", matcher.regex));
                    None
                }
            })
            .collect()
    };

    let reply_matchers = compile(&conf.reply_matchers, Anchor::Reply);
    let task_kind = match kind {
        ConfigKind::Plugin => {
            let command_matchers = compile(&conf.command_matchers, Anchor::Command);
            let message_matchers = compile(&conf.message_matchers, Anchor::Ambient);
            TaskKind::Plugin(PluginSpec {
                command_matchers,
                message_matchers,
                help: conf.help.clone(),
                admin_commands: conf.admin_commands.clone(),
                elevated_commands: conf.elevated_commands.clone(),
                elevate_immediate_commands: conf.elevate_immediate_commands.clone(),
                authorized_commands: conf.authorized_commands.clone(),
                authorize_all_commands: conf.authorize_all_commands,
                allowed_hidden_commands: conf.allowed_hidden_commands.clone(),
                catch_all: conf.catch_all,
                ambient_match_command: conf.ambient_match_command,
            })
        }
        ConfigKind::Job => {
            let arguments = compile(&conf.arguments, Anchor::Reply);
            let mut triggers = Vec::new();
            for trigger in &conf.triggers {
                match JobTrigger::compile(trigger) {
                    Ok(compiled) => triggers.push(compiled),
                    Err(error) => {
                        compile_errors.push(format!("bad trigger regex '{}': {error}", trigger.regex))
                    }
                }
            }
            TaskKind::Job(JobSpec {
                triggers,
                arguments,
                keep_logs: conf.keep_logs.unwrap_or(DEFAULT_KEEP_LOGS),
                quiet: conf.quiet,
            })
        }
        _ => TaskKind::Plain,
    };
    if !compile_errors.is_empty() {
        disabled.get_or_insert_with(|| compile_errors.join("; "));
    }

    let namespace = [&settings.name_space, &conf.name_space]
        .into_iter()
        .find(|ns| !ns.is_empty())
        .cloned()
        .unwrap_or_else(|| settings.name.clone());

    let mut parameters = conf.parameters.clone();
    parameters.extend(settings.parameters.iter().cloned());
    let mut parameter_sets = conf.parameter_sets.clone();
    parameter_sets.extend(settings.parameter_sets.iter().cloned());

    let channels = if conf.channels.is_empty() && !conf.all_channels {
        robot.default_channels.clone()
    } else {
        conf.channels.clone()
    };
    let channel = if conf.channel.is_empty() {
        robot.default_job_channel.clone()
    } else {
        conf.channel.clone()
    };

    let description = if conf.description.is_empty() {
        settings.description.clone()
    } else {
        conf.description.clone()
    };

    Task {
        common: TaskCommon {
            name: settings.name.clone(),
            id,
            description,
            exec,
            namespace,
            parameters,
            parameter_sets,
            channel,
            channels,
            all_channels: conf.all_channels,
            direct_only: conf.direct_only,
            allow_direct: conf
                .allow_direct
                .unwrap_or(robot.default_allow_direct.unwrap_or(true)),
            users: conf.users.clone(),
            require_admin: conf.require_admin,
            elevator: conf.elevator.clone(),
            authorizer: conf.authorizer.clone(),
            auth_require: conf.auth_require.clone(),
            reply_matchers,
            disabled,
            privileged: settings.privileged.or(conf.privileged).unwrap_or(in_process),
            homed: settings.homed || conf.homed.unwrap_or(false),
            config: free_form,
        },
        kind: task_kind,
    }
}

/// Relative task paths resolve against the custom tree first, then the
/// installation.
pub fn resolve_task_path(paths: &Paths, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    let custom = paths.config_dir.join(candidate);
    if custom.exists() {
        custom
    } else {
        paths.install_dir.join(candidate)
    }
}

fn content_id(kind: ConfigKind, settings: &TaskSettings, document: Option<&serde_yaml::Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind:?}\0{}\0{}\0", settings.name, settings.path).as_bytes());
    if let Some(doc) = document
        && let Ok(text) = serde_yaml::to_string(doc)
    {
        hasher.update(text.as_bytes());
    }
    hex::encode(hasher.finalize())
}
