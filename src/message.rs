//! Message envelopes and user records exchanged with connectors.

use serde::{Deserialize, Serialize};

/// An incoming message as delivered by a connector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorMessage {
    pub protocol: String,
    pub user_name: String,
    pub user_id: String,
    pub channel_name: String,
    pub channel_id: String,
    pub message_text: String,
    pub thread_id: String,
    pub message_id: String,
    pub direct_message: bool,
    pub hidden_message: bool,
    pub threaded_message: bool,
    /// Set by connectors that can tell when the sender is another bot.
    pub bot_user: bool,
}

/// A user known to the robot, from the roster or a connector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct UserInfo {
    pub user_name: String,
    #[serde(rename = "UserID", default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub bot_user: bool,
}

impl UserInfo {
    /// Look up a named attribute the way tasks request them.
    pub fn attribute(&self, attr: &str) -> Option<String> {
        let value = match attr.to_lowercase().as_str() {
            "name" | "username" | "handle" => &self.user_name,
            "id" | "internalid" => &self.user_id,
            "email" => &self.email,
            "phone" => &self.phone,
            "fullname" | "realname" => &self.full_name,
            "firstname" | "givenname" => &self.first_name,
            "lastname" | "surname" => &self.last_name,
            _ => return None,
        };
        if value.is_empty() {
            None
        } else {
            Some(value.clone())
        }
    }
}

/// Identity of the robot itself, supplied by configuration and the primary
/// connector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct BotInfo {
    #[serde(default)]
    pub user_name: String,
    #[serde(rename = "UserID", default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub phone: String,
    /// Protocol handle users @-mention, when it differs from `user_name`.
    /// Only connectors set it.
    #[serde(skip)]
    pub mention: String,
}

impl BotInfo {
    pub fn attribute(&self, attr: &str) -> Option<String> {
        let value = match attr.to_lowercase().as_str() {
            "name" | "username" | "handle" => &self.user_name,
            "id" | "internalid" => &self.user_id,
            "email" => &self.email,
            "fullname" | "realname" => &self.full_name,
            "firstname" | "givenname" => &self.first_name,
            "lastname" | "surname" => &self.last_name,
            "phone" => &self.phone,
            _ => return None,
        };
        if value.is_empty() {
            None
        } else {
            Some(value.clone())
        }
    }
}

/// Normalize a protocol tag for use as a map key.
pub fn normalize_protocol(protocol: &str) -> String {
    protocol.trim().to_lowercase()
}

/// Render an opaque protocol ID in the bracketed form used for unknown users
/// and channels.
pub fn bracket_id(id: &str) -> String {
    format!("<{id}>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_attributes_resolve_aliases() {
        let user = UserInfo {
            user_name: "alice".into(),
            email: "alice@example.com".into(),
            first_name: "Alice".into(),
            ..Default::default()
        };
        assert_eq!(user.attribute("Email").as_deref(), Some("alice@example.com"));
        assert_eq!(user.attribute("givenname").as_deref(), Some("Alice"));
        assert_eq!(user.attribute("phone"), None);
        assert_eq!(user.attribute("shoesize"), None);
    }

    #[test]
    fn protocol_normalization_trims_and_lowercases() {
        assert_eq!(normalize_protocol("  Slack "), "slack");
        assert_eq!(bracket_id("U123"), "<U123>");
    }
}
