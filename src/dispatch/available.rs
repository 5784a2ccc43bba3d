//! Visibility rules: whether a plugin can be used by a user in a channel.

use crate::catalog::Task;

/// Result of [`plugin_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Availability {
    pub available: bool,
    /// The plugin lists this channel explicitly rather than through
    /// `AllChannels` or help.
    pub specific: bool,
}

impl Availability {
    const NO: Self = Self {
        available: false,
        specific: false,
    };
    const YES: Self = Self {
        available: true,
        specific: false,
    };
}

/// Decide whether `task` is usable by `user` in `channel`. `help` relaxes
/// channel restrictions so help can list commands available elsewhere.
pub fn plugin_available(
    task: &Task,
    user: &str,
    channel: &str,
    direct: bool,
    help: bool,
    is_admin: bool,
) -> Availability {
    let common = &task.common;
    if common.disabled.is_some() {
        return Availability::NO;
    }
    if common.direct_only && !direct && !help {
        tracing::debug!(task = %common.name, "plugin not available outside direct messages");
        return Availability::NO;
    }
    if direct && !common.allow_direct && !common.direct_only && !help {
        tracing::debug!(task = %common.name, "plugin not available in direct messages");
        return Availability::NO;
    }
    if common.require_admin && !is_admin {
        return Availability::NO;
    }
    if !common.users.is_empty() && !user_allowed(&common.users, user) {
        tracing::debug!(task = %common.name, user, "user not in plugin's user list");
        return Availability::NO;
    }
    if direct && (common.allow_direct || common.direct_only) {
        return Availability::YES;
    }
    if common.channels.iter().any(|allowed| allowed == channel) {
        return Availability {
            available: true,
            specific: true,
        };
    }
    if common.all_channels || help {
        return Availability::YES;
    }
    Availability::NO
}

fn user_allowed(patterns: &[String], user: &str) -> bool {
    patterns.iter().any(|pattern| match glob::Pattern::new(pattern) {
        Ok(pattern) => pattern.matches(user),
        Err(error) => {
            tracing::error!(%pattern, %error, "invalid glob in plugin Users list");
            false
        }
    })
}
