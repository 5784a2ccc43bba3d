//! Deciding whether a message is addressed to the robot.
//!
//! A message is a command when it starts with the robot's alias or name
//! (`;ping`, `floyd ping`, `@floyd: ping`), ends with the name
//! (`ping, floyd`), or arrives as a direct message. Connectors whose users
//! @-mention the robot by a protocol handle (`@U024BE7LH ping`) supply that
//! handle as well. A message holding only the name is a bare-name mention.

use regex::Regex;

/// Characters allowed as a one-character alias.
pub const ALIAS_CHARS: &str = "&!;:-%#@~<>/";

/// Alias characters that are regex metacharacters.
const ESCAPED_ALIAS_CHARS: &str = "*+^$?\\[]{}";

#[derive(Debug, Clone, Default)]
pub struct Addressing {
    pre: Option<Regex>,
    post: Option<Regex>,
    bare: Option<Regex>,
}

impl Addressing {
    /// Compile the addressing regexes for a robot `name`, the protocol
    /// `mention` handle (may be empty) and optional one-character `alias`.
    /// An invalid alias is ignored with an error log.
    pub fn new(name: &str, mention: &str, alias: &str) -> Self {
        let alias = match alias.chars().count() {
            0 => None,
            1 if ALIAS_CHARS.contains(alias) || ESCAPED_ALIAS_CHARS.contains(alias) => Some(regex::escape(alias)),
            _ => {
                tracing::error!(alias, "invalid alias, must be one of {ALIAS_CHARS}");
                None
            }
        };
        let name = name.trim();
        let name = (!name.is_empty()).then(|| regex::escape(name));
        let mention = mention.trim().trim_start_matches('@');
        let mention = (!mention.is_empty()).then(|| regex::escape(mention));

        let mut names = Vec::new();
        let mut bare_names = Vec::new();
        if let Some(alias) = &alias {
            names.push(alias.clone());
            bare_names.push(alias.clone());
        }
        match (&name, &mention) {
            // With a protocol handle, `@` belongs to the handle alone.
            (Some(name), Some(_)) => {
                names.push(format!(r"{name}[:, ]"));
                bare_names.push(format!(r"{name}\??"));
            }
            (Some(name), None) => {
                names.push(format!(r"@?{name}[:, ]"));
                bare_names.push(format!(r"@?{name}\??"));
            }
            (None, _) => {}
        }
        if let Some(mention) = &mention {
            names.push(format!(r"@{mention}[:, ]"));
            bare_names.push(format!(r"@{mention}\??"));
        }
        if names.is_empty() {
            tracing::warn!("robot has no name or alias, and will only respond to direct messages");
            return Self::default();
        }

        let compile = |pattern: String| match Regex::new(&pattern) {
            Ok(regex) => Some(regex),
            Err(error) => {
                tracing::error!(%pattern, %error, "failed to compile addressing regex");
                None
            }
        };
        Self {
            pre: compile(format!(r"^(?s)(?i:{}\s*)(.*)$", names.join("|"))),
            post: name
                .as_ref()
                .and_then(|name| compile(format!(r"^([^,@]+),\s+(?i:@?{name})([.?!])?$"))),
            bare: compile(format!(r"^@?(?i:{})$", bare_names.join("|"))),
        }
    }

    /// The command text when `text` addresses the robot by alias or name.
    pub fn command_text(&self, text: &str) -> Option<String> {
        if let Some(captures) = self.pre.as_ref().and_then(|pre| pre.captures(text)) {
            return captures.get(1).map(|m| m.as_str().to_string());
        }
        let captures = self.post.as_ref()?.captures(text)?;
        let command = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let punctuation = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        Some(format!("{command}{punctuation}"))
    }

    /// Whether `text` is nothing but the robot's name or alias.
    pub fn is_bare_name(&self, text: &str) -> bool {
        self.bare
            .as_ref()
            .is_some_and(|bare| bare.is_match(text.trim()))
    }
}
