//! Task environment composition.
//!
//! Each task run gets an environment assembled from layers, lowest priority
//! first: pass-through process variables, task parameters, attached
//! parameter sets, the task's namespace, (for privileged tasks) the
//! pipeline's inherited sets and namespace, fixed `GOPHER_*` values, and
//! finally the pipeline environment built with `SetParameter`.

use crate::catalog::{Task, TaskList};
use crate::config::Parameter;
use std::collections::BTreeMap;

/// Process variables copied into every task environment.
pub const PASS_THROUGH: &[&str] = &["HOSTNAME", "LANG", "PATH", "USER"];

/// Variables that must never reach a child process.
pub const SENSITIVE: &[&str] = &["GOPHER_ENCRYPTION_KEY", "GOPHER_DEPLOY_KEY", "GOPHER_HOST_KEYS"];

pub type Environment = BTreeMap<String, String>;

pub fn is_sensitive(key: &str) -> bool {
    SENSITIVE.contains(&key)
}

/// Remove sensitive keys in place.
pub fn sanitize(env: &mut Environment) {
    env.retain(|key, _| !is_sensitive(key));
}

/// The current process environment minus sensitive keys, for children that
/// inherit rather than receive a composed environment.
pub fn sanitized_process_env() -> Environment {
    std::env::vars().filter(|(key, _)| !is_sensitive(key)).collect()
}

fn overlay(env: &mut Environment, parameters: &[Parameter]) {
    for parameter in parameters {
        env.insert(parameter.name.clone(), parameter.value.clone());
    }
}

/// Pipeline-level inputs to a task's environment.
#[derive(Debug, Default, Clone)]
pub struct PipelineEnv<'a> {
    /// Namespace inherited from the job that started the pipeline.
    pub inherited_namespace: Option<&'a str>,
    /// Parameter sets inherited from the task that started the pipeline.
    pub inherited_parameter_sets: &'a [String],
    /// Fixed `GOPHER_*` values for this run.
    pub fixed: Option<&'a Environment>,
    /// Values set with `SetParameter`, plus job start variables.
    pub pipeline: Option<&'a Environment>,
}

/// Whether `task` sees the pipeline environment. Unprivileged external
/// plugins do not.
pub fn receives_pipeline_env(task: &Task) -> bool {
    !(task.is_plugin() && !task.common.privileged && !task.common.exec.is_in_process())
}

/// Build the environment for one run of `task`.
pub fn compose(task: &Task, tasks: &TaskList, pipeline: &PipelineEnv<'_>) -> Environment {
    let mut env = Environment::new();
    for key in PASS_THROUGH {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }

    overlay(&mut env, &task.common.parameters);
    // Earlier sets win over later ones.
    for set in task.common.parameter_sets.iter().rev() {
        match tasks.parameter_set(set) {
            Some(parameters) => overlay(&mut env, parameters),
            None => tracing::warn!(task = task.name(), set, "unknown parameter set"),
        }
    }
    if let Some(parameters) = tasks.namespace(&task.common.namespace) {
        overlay(&mut env, parameters);
    }

    if task.common.privileged {
        for set in pipeline.inherited_parameter_sets.iter().rev() {
            if let Some(parameters) = tasks.parameter_set(set) {
                overlay(&mut env, parameters);
            }
        }
        if let Some(parameters) = pipeline
            .inherited_namespace
            .and_then(|namespace| tasks.namespace(namespace))
        {
            overlay(&mut env, parameters);
        }
    }

    if let Some(fixed) = pipeline.fixed {
        env.extend(fixed.iter().map(|(key, value)| (key.clone(), value.clone())));
    }
    if receives_pipeline_env(task)
        && let Some(values) = pipeline.pipeline
    {
        env.extend(values.iter().map(|(key, value)| (key.clone(), value.clone())));
    }

    sanitize(&mut env);
    env
}

/// `GOPHER_*` variables captured at startup. Children are spawned with a
/// cleared environment, so these only travel where the robot passes them;
/// a restart re-executes the robot with the saved set.
#[derive(Debug, Clone, Default)]
pub struct StartupEnv {
    vars: Environment,
}

impl StartupEnv {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars()
                .filter(|(key, _)| key.starts_with("GOPHER_"))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &Environment {
        &self.vars
    }
}
