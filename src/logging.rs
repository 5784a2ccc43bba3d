//! Tracing subscriber setup for the robot and the CLI.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use std::path::{Path, PathBuf};

/// Target for `Audit` level log lines; always enabled.
pub const AUDIT_TARGET: &str = "gopherbot::audit";

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// A daily rolling file; the date is appended to the file name.
    File(PathBuf),
}

impl LogTarget {
    /// `--log` value, falling back to `GOPHER_LOGFILE`. CLI operations and
    /// the terminal connector log to `robot.log` so output stays readable.
    pub fn resolve(flag: Option<&str>, env: Option<&str>, quiet_console: bool) -> Self {
        let chosen = flag.or(env).filter(|value| !value.is_empty());
        match chosen {
            Some("stderr") => Self::Stderr,
            Some(path) => Self::File(PathBuf::from(path)),
            None if quiet_console => Self::File(PathBuf::from("robot.log")),
            None => Self::Stderr,
        }
    }
}

/// Filter directives for a `GOPHER_LOGLEVEL` value.
pub fn level_directives(level: &str) -> String {
    let level = match level.trim().to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    };
    format!("{level},{AUDIT_TARGET}=info")
}

fn build_env_filter(level: &str) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(level_directives(level)),
    }
}

fn fmt_layer<W>(writer: W, ansi: bool, plain: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi && !plain);
    if plain {
        layer.without_time().boxed()
    } else {
        layer.boxed()
    }
}

fn split_path(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "robot.log".into());
    (dir, name)
}

/// Install the global subscriber. The returned guard flushes file output
/// and must be held for the life of the process.
pub fn init(target: &LogTarget, level: &str, plain: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = build_env_filter(level);
    let (layer, guard) = match target {
        LogTarget::Stderr => (fmt_layer(std::io::stderr, true, plain), None),
        LogTarget::File(path) => {
            let (dir, name) = split_path(path);
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (fmt_layer(writer, false, plain), Some(guard))
        }
    };
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gopher_levels_keep_audit_lines() {
        assert_eq!(level_directives("Debug"), "debug,gopherbot::audit=info");
        assert_eq!(level_directives("fatal"), "error,gopherbot::audit=info");
        assert_eq!(level_directives(""), "info,gopherbot::audit=info");
    }

    #[test]
    fn log_target_prefers_the_flag() {
        assert_eq!(LogTarget::resolve(Some("stderr"), Some("x.log"), true), LogTarget::Stderr);
        assert_eq!(
            LogTarget::resolve(None, Some("/var/log/robot.log"), false),
            LogTarget::File("/var/log/robot.log".into())
        );
        assert_eq!(LogTarget::resolve(None, None, true), LogTarget::File("robot.log".into()));
        assert_eq!(LogTarget::resolve(None, None, false), LogTarget::Stderr);
    }

    #[test]
    fn bare_file_names_log_to_the_working_directory() {
        assert_eq!(split_path(Path::new("robot.log")), (PathBuf::from("."), "robot.log".into()));
        assert_eq!(
            split_path(Path::new("/tmp/logs/bot.log")),
            (PathBuf::from("/tmp/logs"), "bot.log".into())
        );
    }
}
