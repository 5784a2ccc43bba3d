//! Configuration loading and validation.
//!
//! Configuration is YAML, read from two trees: the installed defaults under
//! `<installdir>/conf` and the robot's custom tree under `<configdir>/conf`.
//! Each document is template-expanded, the two copies are merged, the
//! `Append<Key>` fix-up runs, free-form sections are split off, and the rest
//! is decoded strictly.

pub mod expand;
pub mod merge;
pub mod schema;

pub use schema::{
    HelpConf, MatcherConf, Parameter, ParameterList, RobotConf, ScheduledTaskConf, TaskConf,
    TaskSettings, TriggerConf,
};

use crate::error::{ConfigError, Result};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Callback that turns an encrypted configuration value into plaintext.
pub type Decrypter<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Filesystem locations the robot works from.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Custom configuration repository (`GOPHER_CONFIGDIR`).
    pub config_dir: PathBuf,
    /// Installation directory holding stock configuration and scripts.
    pub install_dir: PathBuf,
    /// Robot home; the process working directory.
    pub home_dir: PathBuf,
    /// Default working directory for tasks that are not homed.
    pub workspace: PathBuf,
}

impl Paths {
    /// Resolve paths from `GOPHER_*` variables, falling back to the current
    /// directory (or the user's home) and the executable's directory.
    pub fn from_env() -> Self {
        let home_dir = std::env::var_os("GOPHER_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let install_dir = std::env::var_os("GOPHER_INSTALLDIR")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(Path::to_path_buf))
            })
            .unwrap_or_else(|| home_dir.clone());
        let config_dir = std::env::var_os("GOPHER_CONFIGDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir.join("custom"));
        Self::new(config_dir, install_dir, home_dir)
    }

    pub fn new(config_dir: PathBuf, install_dir: PathBuf, home_dir: PathBuf) -> Self {
        Self {
            workspace: home_dir.clone(),
            config_dir,
            install_dir,
            home_dir,
        }
    }

    pub fn installed(&self, relpath: &str) -> PathBuf {
        self.install_dir.join("conf").join(relpath)
    }

    pub fn custom(&self, relpath: &str) -> PathBuf {
        self.config_dir.join("conf").join(relpath)
    }
}

/// Which schema a configuration file is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Robot,
    Plugin,
    Job,
    Task,
}

impl ConfigKind {
    /// Classify a file by its parent directory name.
    pub fn for_path(relpath: &Path) -> Self {
        let parent = relpath
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str());
        match parent {
            Some("plugins") => Self::Plugin,
            Some("jobs") => Self::Job,
            Some("tasks") => Self::Task,
            _ => Self::Robot,
        }
    }

    pub fn directory(self) -> &'static str {
        match self {
            Self::Robot => "",
            Self::Plugin => "plugins",
            Self::Job => "jobs",
            Self::Task => "tasks",
        }
    }
}

/// Loaded `robot.yaml` with its free-form sections.
#[derive(Debug, Clone, Default)]
pub struct RobotConfig {
    pub conf: RobotConf,
    pub protocol_config: Option<serde_json::Value>,
    pub brain_config: Option<serde_json::Value>,
    pub history_config: Option<serde_json::Value>,
}

/// Read and template-expand one YAML file. Missing files yield `None`.
pub fn read_document(path: &Path, decrypt: Option<Decrypter<'_>>) -> Result<Option<Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(ConfigError::Load {
                path: path.display().to_string(),
                source: Arc::new(error),
            }
            .into());
        }
    };
    parse_document(&path.display().to_string(), &text, decrypt).map(Some)
}

/// Expand and parse YAML text; `origin` names it in errors.
pub fn parse_document(origin: &str, text: &str, decrypt: Option<Decrypter<'_>>) -> Result<Value> {
    let expanded = expand::expand_env(text, decrypt);
    let value: Value = serde_yaml::from_str(&expanded).map_err(|error| ConfigError::Parse {
        path: origin.to_string(),
        message: error.to_string(),
    })?;
    Ok(match value {
        Value::Null => Value::Mapping(Default::default()),
        other => other,
    })
}

/// Read the installed and custom copies of `relpath` and merge them, custom
/// last. `defaults` is merged underneath both.
pub fn read_layered(
    paths: &Paths,
    relpath: &str,
    defaults: Option<Value>,
    decrypt: Option<Decrypter<'_>>,
) -> Result<Option<Value>> {
    let installed = read_document(&paths.installed(relpath), decrypt)?;
    let custom = read_document(&paths.custom(relpath), decrypt)?;
    let layers = [defaults, installed, custom];
    let merged = layers
        .into_iter()
        .flatten()
        .reduce(merge::merge_values);
    Ok(merged)
}

/// Load `robot.yaml`, which must exist in at least one tree.
pub fn load_robot(paths: &Paths, decrypt: Option<Decrypter<'_>>) -> Result<RobotConfig> {
    let Some(doc) = read_layered(paths, "robot.yaml", None, decrypt)? else {
        return Err(ConfigError::MissingKey(format!(
            "robot.yaml not found under {} or {}",
            paths.custom("").display(),
            paths.installed("").display()
        ))
        .into());
    };
    decode_robot("robot.yaml", doc)
}

/// Fix up, split and strictly decode a merged robot document.
pub fn decode_robot(origin: &str, mut doc: Value) -> Result<RobotConfig> {
    merge::fixup_append_keys(&mut doc);
    let sections = merge::take_sections(&mut doc, schema::ROBOT_FREE_FORM);
    let conf: RobotConf = serde_yaml::from_value(doc).map_err(|error| ConfigError::Parse {
        path: origin.to_string(),
        message: error.to_string(),
    })?;

    let mut config = RobotConfig {
        conf,
        ..Default::default()
    };
    for (name, value) in sections {
        let json = yaml_to_json(origin, &value)?;
        match name.as_str() {
            "ProtocolConfig" => config.protocol_config = Some(json),
            "BrainConfig" => config.brain_config = Some(json),
            _ => config.history_config = Some(json),
        }
    }
    Ok(config)
}

/// Fix up, split and strictly decode a merged task document, returning the
/// typed fields and the free-form `Config` section.
pub fn decode_task(
    origin: &str,
    kind: ConfigKind,
    mut doc: Value,
) -> Result<(TaskConf, Option<serde_json::Value>)> {
    merge::fixup_append_keys(&mut doc);
    let mut sections = merge::take_sections(&mut doc, schema::TASK_FREE_FORM);
    let conf: TaskConf = serde_yaml::from_value(doc).map_err(|error| ConfigError::Parse {
        path: origin.to_string(),
        message: error.to_string(),
    })?;

    let misplaced = match kind {
        ConfigKind::Plugin => conf.job_fields_in_use(),
        ConfigKind::Job => conf.plugin_fields_in_use(),
        ConfigKind::Task => {
            let mut fields = conf.plugin_fields_in_use();
            fields.extend(conf.job_fields_in_use());
            fields
        }
        ConfigKind::Robot => Vec::new(),
    };
    if !misplaced.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{origin}: fields not valid for this task type: {}",
            misplaced.join(", ")
        ))
        .into());
    }

    let free_form = match sections.pop() {
        Some((_, value)) => Some(yaml_to_json(origin, &value)?),
        None => None,
    };
    Ok((conf, free_form))
}

/// Validate a single file's text against the schema for its location.
pub fn validate_text(relpath: &Path, text: &str) -> Result<()> {
    let origin = relpath.display().to_string();
    let doc = parse_document(&origin, text, None)?;
    match ConfigKind::for_path(relpath) {
        ConfigKind::Robot => decode_robot(&origin, doc).map(|_| ()),
        kind => decode_task(&origin, kind, doc).map(|_| ()),
    }
}

fn yaml_to_json(origin: &str, value: &Value) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|error| {
        ConfigError::Parse {
            path: origin.to_string(),
            message: format!("free-form section is not representable as JSON: {error}"),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, text).expect("write");
    }

    fn fixture() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = Paths::new(
            dir.path().join("custom"),
            dir.path().join("install"),
            dir.path().to_path_buf(),
        );
        (dir, paths)
    }

    #[test]
    fn custom_config_overrides_and_appends_installed() {
        let (_dir, paths) = fixture();
        write(
            &paths.installed("robot.yaml"),
            "Alias: ';'\nAdminUsers: [alice]\nProtocol: test\n",
        );
        write(
            &paths.custom("robot.yaml"),
            "AppendAdminUsers: [bob]\nProtocol: terminal\nBrainConfig:\n  Dir: brain\n",
        );

        let config = load_robot(&paths, None).expect("robot config loads");
        assert_eq!(config.conf.alias, ";");
        assert_eq!(config.conf.admin_users, vec!["alice", "bob"]);
        assert_eq!(config.conf.protocol, "terminal");
        assert_eq!(
            config.brain_config,
            Some(serde_json::json!({"Dir": "brain"}))
        );
    }

    #[test]
    fn leftover_append_keys_decode_strictly() {
        let (_dir, paths) = fixture();
        write(&paths.custom("robot.yaml"), "AppendIgnoreUsers: [otherbot]\n");
        let config = load_robot(&paths, None).expect("robot config loads");
        assert_eq!(config.conf.ignore_users, vec!["otherbot"]);
    }

    #[test]
    fn missing_robot_yaml_is_an_error() {
        let (_dir, paths) = fixture();
        assert!(load_robot(&paths, None).is_err());
    }

    #[test]
    fn job_files_reject_plugin_fields() {
        let doc = parse_document(
            "jobs/backup.yaml",
            "CommandMatchers:\n  - Regex: x\n    Command: x\n",
            None,
        )
        .expect("parse");
        let error = decode_task("jobs/backup.yaml", ConfigKind::Job, doc)
            .expect_err("plugin field on job");
        assert!(error.to_string().contains("CommandMatchers"));
    }

    #[test]
    fn task_config_section_is_free_form() {
        let doc = parse_document(
            "plugins/weather.yaml",
            "Description: weather\nConfig:\n  APIKey: abc\n  Units: [c, f]\n",
            None,
        )
        .expect("parse");
        let (conf, free_form) =
            decode_task("plugins/weather.yaml", ConfigKind::Plugin, doc).expect("decode");
        assert_eq!(conf.description, "weather");
        assert_eq!(
            free_form,
            Some(serde_json::json!({"APIKey": "abc", "Units": ["c", "f"]}))
        );
    }

    #[test]
    fn file_kind_follows_parent_directory() {
        assert_eq!(ConfigKind::for_path(Path::new("plugins/ping.yaml")), ConfigKind::Plugin);
        assert_eq!(ConfigKind::for_path(Path::new("jobs/backup.yaml")), ConfigKind::Job);
        assert_eq!(ConfigKind::for_path(Path::new("robot.yaml")), ConfigKind::Robot);
    }
}
