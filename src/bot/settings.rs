//! Robot-wide settings derived from `robot.yaml`, replaced as a whole on
//! reload.

use crate::config::{Paths, RobotConfig};
use crate::dispatch::Addressing;
use crate::message::{BotInfo, UserInfo, normalize_protocol};

use std::collections::HashMap;
use std::path::PathBuf;

/// Lines of help shown in a channel before the rest goes to a DM.
pub const DEFAULT_HELP_LINE_THRESHOLD: usize = 7;

/// Interpreters for task extensions run under the pipeline child protocol.
pub const DEFAULT_INTERPRETERS: &[(&str, &str)] = &[("lua", "lua"), ("js", "node"), ("go", "yaegi")];

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub bot: BotInfo,
    pub alias: String,
    pub addressing: Addressing,
    pub admins: Vec<String>,
    pub ignore_users: Vec<String>,
    pub ignore_unlisted_users: bool,
    pub default_channels: Vec<String>,
    pub default_job_channel: String,
    pub default_elevator: String,
    pub default_authorizer: String,
    pub time_zone: Option<chrono_tz::Tz>,
    pub protocol: String,
    pub secondary_protocols: Vec<String>,
    pub brain: String,
    pub help_line_threshold: usize,
    pub roster: Vec<UserInfo>,
    /// Protocol to (user name to protocol ID).
    pub user_maps: HashMap<String, HashMap<String, String>>,
    pub interpreters: HashMap<String, String>,
    pub workspace: PathBuf,
    pub http_listen: String,
}

impl Settings {
    /// Derive settings from a loaded configuration. `protocol` and `brain`
    /// override the configured values when set from the environment.
    pub fn from_config(
        config: &RobotConfig,
        paths: &Paths,
        protocol: Option<&str>,
        brain: Option<&str>,
    ) -> Self {
        let conf = &config.conf;
        let time_zone = if conf.time_zone.is_empty() {
            None
        } else {
            match conf.time_zone.parse::<chrono_tz::Tz>() {
                Ok(tz) => Some(tz),
                Err(error) => {
                    tracing::error!(time_zone = %conf.time_zone, %error, "invalid TimeZone, using local time");
                    None
                }
            }
        };

        let mut interpreters: HashMap<String, String> = DEFAULT_INTERPRETERS
            .iter()
            .map(|(ext, interp)| (ext.to_string(), interp.to_string()))
            .collect();
        interpreters.extend(conf.interpreters.clone());

        let workspace = if conf.work_space.is_empty() {
            paths.workspace.clone()
        } else {
            let workspace = PathBuf::from(&conf.work_space);
            if workspace.is_absolute() {
                workspace
            } else {
                paths.home_dir.join(workspace)
            }
        };

        let user_maps = conf
            .user_maps
            .iter()
            .map(|(protocol, map)| {
                (
                    normalize_protocol(protocol),
                    map.iter().map(|(name, id)| (name.clone(), id.clone())).collect(),
                )
            })
            .collect();

        let protocol = protocol
            .filter(|protocol| !protocol.is_empty())
            .unwrap_or(&conf.protocol);
        let brain = brain.filter(|brain| !brain.is_empty()).unwrap_or(&conf.brain);

        Self {
            addressing: Addressing::new(&conf.bot_info.user_name, &conf.bot_info.mention, &conf.alias),
            bot: conf.bot_info.clone(),
            alias: conf.alias.clone(),
            admins: conf.admin_users.clone(),
            ignore_users: conf.ignore_users.iter().map(|user| user.to_lowercase()).collect(),
            ignore_unlisted_users: conf.ignore_unlisted_users,
            default_channels: conf.default_channels.clone(),
            default_job_channel: conf.default_job_channel.clone(),
            default_elevator: conf.default_elevator.clone(),
            default_authorizer: conf.default_authorizer.clone(),
            time_zone,
            protocol: normalize_protocol(protocol),
            secondary_protocols: conf.secondary_protocols.clone(),
            brain: brain.to_string(),
            help_line_threshold: conf.help_line_threshold.unwrap_or(DEFAULT_HELP_LINE_THRESHOLD),
            roster: conf.user_roster.clone(),
            user_maps,
            interpreters,
            workspace,
            http_listen: conf.http_listen.clone(),
        }
    }

    /// Fill identity gaps from what the primary connector reports, then
    /// recompile addressing for the final name.
    pub fn adopt_bot_info(&mut self, reported: &BotInfo) {
        let fields = [
            (&mut self.bot.user_name, &reported.user_name),
            (&mut self.bot.user_id, &reported.user_id),
            (&mut self.bot.email, &reported.email),
            (&mut self.bot.full_name, &reported.full_name),
            (&mut self.bot.first_name, &reported.first_name),
            (&mut self.bot.last_name, &reported.last_name),
            (&mut self.bot.mention, &reported.mention),
        ];
        for (mine, theirs) in fields {
            if mine.is_empty() && !theirs.is_empty() {
                *mine = theirs.clone();
            }
        }
        self.addressing = Addressing::new(&self.bot.user_name, &self.bot.mention, &self.alias);
    }

    /// Canonical user name for a protocol ID: the protocol's user map
    /// first, then the roster.
    pub fn user_name_for_id(&self, protocol: &str, id: &str) -> Option<String> {
        if id.is_empty() {
            return None;
        }
        if let Some(map) = self.user_maps.get(&normalize_protocol(protocol))
            && let Some((name, _)) = map.iter().find(|(_, mapped)| mapped.as_str() == id)
        {
            return Some(name.clone());
        }
        self.roster
            .iter()
            .find(|user| user.user_id == id)
            .map(|user| user.user_name.clone())
    }

    /// Protocol ID for a canonical user name.
    pub fn user_id_for_name(&self, protocol: &str, name: &str) -> Option<String> {
        if let Some(id) = self
            .user_maps
            .get(&normalize_protocol(protocol))
            .and_then(|map| map.get(name))
        {
            return Some(id.clone());
        }
        self.roster
            .iter()
            .find(|user| user.user_name == name && !user.user_id.is_empty())
            .map(|user| user.user_id.clone())
    }

    pub fn roster_user(&self, name: &str) -> Option<&UserInfo> {
        self.roster.iter().find(|user| user.user_name == name)
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|admin| admin == user)
    }

    pub fn is_ignored(&self, user: &str) -> bool {
        let user = user.to_lowercase();
        self.ignore_users.iter().any(|ignored| *ignored == user)
    }

    /// User maps for the connector runtime: per-protocol maps plus a
    /// roster-derived fallback.
    pub fn connector_user_maps(&self) -> (HashMap<String, HashMap<String, String>>, HashMap<String, String>) {
        let fallback = self
            .roster
            .iter()
            .filter(|user| !user.user_id.is_empty())
            .map(|user| (user.user_name.clone(), user.user_id.clone()))
            .collect();
        (self.user_maps.clone(), fallback)
    }

    pub fn interpreter(&self, extension: &str) -> Option<&str> {
        self.interpreters.get(extension).map(String::as_str)
    }

    /// Current time in the robot's zone, formatted for messages.
    pub fn now_string(&self, format: &str) -> String {
        match self.time_zone {
            Some(tz) => chrono::Utc::now().with_timezone(&tz).format(format).to_string(),
            None => chrono::Local::now().format(format).to_string(),
        }
    }
}
