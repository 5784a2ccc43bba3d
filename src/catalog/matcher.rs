//! Compiled regex matchers for commands, ambient messages, replies and job
//! triggers.

use crate::config::{MatcherConf, TriggerConf};
use regex::Regex;

/// How a matcher's regex is anchored when compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// `^\s*<re>\s*$`, case-insensitive; used for commands.
    Command,
    /// Unanchored, case-insensitive; used for ambient messages.
    Ambient,
    /// `^\s*<re>\s*$`, case-sensitive; used for replies and arguments.
    Reply,
}

#[derive(Debug, Clone)]
pub struct InputMatcher {
    pub label: String,
    pub command: String,
    pub regex: Regex,
    pub contexts: Vec<String>,
    pub channel_only: bool,
}

impl InputMatcher {
    pub fn compile(conf: &MatcherConf, anchor: Anchor) -> Result<Self, regex::Error> {
        let pattern = match anchor {
            Anchor::Command => format!(r"^(?i:\s*{}\s*)$", conf.regex),
            Anchor::Ambient => format!(r"(?i:{})", conf.regex),
            Anchor::Reply => format!(r"^\s*{}\s*$", conf.regex),
        };
        Ok(Self {
            label: conf.label.clone(),
            command: conf.command.clone(),
            regex: Regex::new(&pattern)?,
            contexts: conf.contexts.clone(),
            channel_only: conf.channel_only,
        })
    }

    /// Reply matchers are looked up by label, falling back to command.
    pub fn reply_key(&self) -> &str {
        if self.label.is_empty() {
            &self.command
        } else {
            &self.label
        }
    }

    /// Match `text`, returning the capture groups (excluding the whole match)
    /// as arguments. Unmatched optional groups become empty strings.
    pub fn captures(&self, text: &str) -> Option<Vec<String>> {
        let captures = self.regex.captures(text)?;
        Some(
            captures
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

/// A job trigger: messages from `user` in `channel` matching `regex` start
/// the job.
#[derive(Debug, Clone)]
pub struct JobTrigger {
    pub user: String,
    pub channel: String,
    pub regex: Regex,
}

impl JobTrigger {
    pub fn compile(conf: &TriggerConf) -> Result<Self, regex::Error> {
        Ok(Self {
            user: conf.user.clone(),
            channel: conf.channel.clone(),
            regex: Regex::new(&format!(r"^(?i:{})$", conf.regex))?,
        })
    }

    /// Returns the capture groups when the trigger fires.
    pub fn fires(&self, user: &str, channel: &str, text: &str) -> Option<Vec<String>> {
        if !self.user.eq_ignore_ascii_case(user) || !self.channel.eq_ignore_ascii_case(channel) {
            return None;
        }
        let captures = self.regex.captures(text)?;
        Some(
            captures
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(regex: &str, command: &str) -> MatcherConf {
        MatcherConf {
            regex: regex.to_string(),
            command: command.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn command_matchers_are_anchored_and_case_insensitive() {
        let matcher = InputMatcher::compile(&conf("ping", "ping"), Anchor::Command).expect("compile");
        assert!(matcher.captures("  PING ").is_some());
        assert!(matcher.captures("ping me").is_none());
    }

    #[test]
    fn ambient_matchers_search_anywhere() {
        let matcher =
            InputMatcher::compile(&conf(r"what is ([\w ]+)\??", "recall"), Anchor::Ambient).expect("compile");
        let args = matcher.captures("hey, What is Ferris Bueller?").expect("match");
        assert_eq!(args, vec!["Ferris Bueller"]);
    }

    #[test]
    fn optional_groups_become_empty_arguments() {
        let matcher = InputMatcher::compile(&conf(r"echo(?: (.*))?", "echo"), Anchor::Command).expect("compile");
        assert_eq!(matcher.captures("echo").expect("match"), vec![String::new()]);
    }

    #[test]
    fn reply_key_prefers_label() {
        let mut labelled = conf("yes|no", "confirm");
        labelled.label = "answer".into();
        let matcher = InputMatcher::compile(&labelled, Anchor::Reply).expect("compile");
        assert_eq!(matcher.reply_key(), "answer");
    }

    #[test]
    fn triggers_require_user_and_channel() {
        let trigger = JobTrigger::compile(&TriggerConf {
            user: "ci-bot".into(),
            channel: "builds".into(),
            regex: r"build (\w+) finished".into(),
        })
        .expect("compile");
        assert_eq!(
            trigger.fires("CI-Bot", "builds", "build web finished"),
            Some(vec!["web".to_string()])
        );
        assert!(trigger.fires("alice", "builds", "build web finished").is_none());
    }
}
