//! Cron scheduler: starts automatic pipelines for `ScheduledJobs`.
//!
//! Each entry gets its own tokio task that sleeps until the next fire time
//! in the robot's time zone. The whole scheduler is rebuilt on every
//! configuration reload; `stop` cancels every timer.

use crate::bot::Bot;
use crate::catalog::{Task, TaskList};
use crate::config::ScheduledTaskConf;
use crate::pipeline::{Envelope, PipelineRequest, PipelineType};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Schedule for jobs that run once when the robot starts.
pub const INIT_SCHEDULE: &str = "@init";

#[derive(Debug, Clone)]
enum Timing {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl Timing {
    fn parse(expression: &str) -> anyhow::Result<Self> {
        let expression = expression.trim();
        if let Some(interval) = expression.strip_prefix("@every ") {
            let interval = parse_interval(interval.trim())?;
            anyhow::ensure!(!interval.is_zero(), "@every interval must be positive");
            return Ok(Self::Every(interval));
        }
        let normalized = normalize_expression(expression);
        let schedule = cron::Schedule::from_str(&normalized).context("parse cron expression")?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// Time until the next fire after `now`.
    fn next_after(&self, now: DateTime<Utc>, tz: Option<Tz>) -> Option<Duration> {
        let next = match self {
            Self::Every(interval) => return Some(*interval),
            Self::Cron(schedule) => match tz {
                Some(tz) => schedule.after(&now.with_timezone(&tz)).next()?.with_timezone(&Utc),
                None => schedule.after(&now.with_timezone(&chrono::Local)).next()?.with_timezone(&Utc),
            },
        };
        Some((next - now).to_std().unwrap_or_default())
    }
}

/// Five-field expressions get a leading seconds field.
fn normalize_expression(expression: &str) -> String {
    if expression.starts_with('@') || expression.split_whitespace().count() != 5 {
        expression.to_string()
    } else {
        format!("0 {expression}")
    }
}

/// `1h30m`, `45s`, `10m`.
fn parse_interval(text: &str) -> anyhow::Result<Duration> {
    let mut total = 0u64;
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits.parse().with_context(|| format!("invalid interval '{text}'"))?;
        digits.clear();
        let unit = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            other => anyhow::bail!("invalid interval unit '{other}' in '{text}'"),
        };
        total = value
            .checked_mul(unit)
            .and_then(|seconds| total.checked_add(seconds))
            .with_context(|| format!("interval '{text}' is too large"))?;
    }
    anyhow::ensure!(digits.is_empty(), "interval '{text}' is missing a unit");
    Ok(Duration::from_secs(total))
}

/// One schedulable task.
#[derive(Debug, Clone)]
struct Entry {
    task: Arc<Task>,
    command: String,
    args: Vec<String>,
    timing: Option<Timing>,
    /// Overrides the robot's zone for this entry.
    time_zone: Option<Tz>,
}

impl Entry {
    fn request(&self, protocol: &str, ptype: PipelineType) -> PipelineRequest {
        PipelineRequest {
            task: self.task.clone(),
            ptype,
            command: self.command.clone(),
            args: self.args.clone(),
            envelope: Envelope::for_channel(protocol, &self.task.common.channel),
            automatic: true,
            cmd_mode: String::new(),
            parent: None,
        }
    }
}

/// Validate a configured entry against the catalog.
fn build_entry(tasks: &TaskList, scheduled: &ScheduledTaskConf) -> anyhow::Result<Entry> {
    let task = tasks
        .get(&scheduled.name)
        .with_context(|| format!("task not found when scheduling '{}'", scheduled.name))?;
    if let Some(reason) = &task.common.disabled {
        anyhow::bail!("not scheduling disabled task '{}': {reason}", scheduled.name);
    }
    if task.common.channel.is_empty() {
        anyhow::bail!("not scheduling task '{}': zero-length Channel", scheduled.name);
    }
    let command = if task.is_plugin() {
        anyhow::ensure!(
            !scheduled.command.is_empty(),
            "empty Command for scheduled plugin '{}'",
            scheduled.name
        );
        scheduled.command.clone()
    } else {
        "run".to_string()
    };
    let timing = if scheduled.schedule.trim() == INIT_SCHEDULE {
        None
    } else {
        Some(Timing::parse(&scheduled.schedule).with_context(|| {
            format!("invalid schedule '{}' for '{}'", scheduled.schedule, scheduled.name)
        })?)
    };
    let time_zone = match scheduled.time_zone.trim() {
        "" => None,
        zone => Some(
            zone.parse::<Tz>()
                .map_err(|error| anyhow::anyhow!("invalid TimeZone '{zone}' for '{}': {error}", scheduled.name))?,
        ),
    };
    Ok(Entry {
        task,
        command,
        args: scheduled.arguments.clone(),
        timing,
        time_zone,
    })
}

fn build_entries(tasks: &TaskList) -> Vec<Entry> {
    tasks
        .scheduled()
        .iter()
        .filter_map(|scheduled| match build_entry(tasks, scheduled) {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::error!(task = %scheduled.name, %error, "skipping scheduled task");
                None
            }
        })
        .collect()
}

/// Start a pipeline for `entry` unless its job is paused.
fn fire(bot: &Arc<Bot>, entry: &Entry, ptype: PipelineType) {
    let name = entry.task.name();
    if entry.task.is_job()
        && let Some(user) = bot.is_paused(name)
    {
        tracing::info!(job = name, paused_by = %user, "skipping paused job");
        return;
    }
    tracing::debug!(task = name, command = %entry.command, "starting scheduled task");
    bot.spawn_pipeline(entry.request(&bot.settings().protocol, ptype));
}

/// Running cron timers.
#[derive(Debug)]
pub struct Scheduler {
    cancel: CancellationToken,
    entries: usize,
}

impl Scheduler {
    /// Build entries from the published catalog and start their timers.
    pub fn start(bot: &Arc<Bot>) -> Self {
        let cancel = bot.shutdown_token().child_token();
        let tz = bot.settings().time_zone;
        match tz {
            Some(tz) => tracing::info!(time_zone = %tz, "scheduling tasks"),
            None => tracing::info!("scheduling tasks in system default time zone"),
        }

        let tasks = bot.catalog.load();
        let mut count = 0;
        for entry in build_entries(&tasks) {
            let Some(timing) = entry.timing.clone() else {
                continue;
            };
            let tz = entry.time_zone.or(tz);
            tracing::info!(task = %entry.task.name(), time_zone = ?tz, "scheduled task registered");
            count += 1;
            let bot = bot.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let Some(wait) = timing.next_after(Utc::now(), tz) else {
                        tracing::warn!(task = %entry.task.name(), "schedule has no upcoming times");
                        return;
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(wait) => fire(&bot, &entry, PipelineType::Scheduled),
                    }
                    // Cron resolution is one second; don't fire twice in it.
                    if matches!(timing, Timing::Cron(_)) {
                        tokio::time::sleep(Duration::from_millis(1000)).await;
                    }
                }
            });
        }
        Self { cancel, entries: count }
    }

    /// Run every `@init` job once; called at startup only.
    pub fn run_init_jobs(bot: &Arc<Bot>) {
        let tasks = bot.catalog.load();
        for entry in build_entries(&tasks) {
            if entry.timing.is_none() {
                tracing::info!(task = %entry.task.name(), "running init job");
                fire(bot, &entry, PipelineType::InitJob);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
