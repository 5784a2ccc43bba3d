//! Minimal template expansion applied to configuration text before parsing.
//!
//! Supported actions:
//! - `{{ env "NAME" }}`: the environment value, or empty.
//! - `{{ default "value" (env "NAME") }}`: the environment value, or `value`.
//! - `{{ decrypt "base64" }}`: decrypted with the robot key when available.

use regex::Regex;
use std::sync::LazyLock;

static ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("hardcoded regex")
});

static ENV_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^env\s+"([^"]*)"$"#).expect("hardcoded regex"));

static DEFAULT_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^default\s+"([^"]*)"\s+\(\s*env\s+"([^"]*)"\s*\)$"#).expect("hardcoded regex")
});

static DECRYPT_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^decrypt\s+"([^"]*)"$"#).expect("hardcoded regex"));

/// Expand template actions in `text`.
///
/// `lookup` resolves environment names; `decrypt` turns a base64 ciphertext
/// into plaintext. Unrecognized actions are left verbatim and logged.
pub fn expand(
    text: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    decrypt: Option<&dyn Fn(&str) -> Option<String>>,
) -> String {
    ACTION
        .replace_all(text, |captures: &regex::Captures<'_>| {
            let action = captures[1].trim();
            if let Some(call) = ENV_CALL.captures(action) {
                return lookup(&call[1]).unwrap_or_default();
            }
            if let Some(call) = DEFAULT_CALL.captures(action) {
                return lookup(&call[2])
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| call[1].to_string());
            }
            if let Some(call) = DECRYPT_CALL.captures(action) {
                if let Some(decrypt) = decrypt
                    && let Some(plain) = decrypt(&call[1])
                {
                    return plain;
                }
                tracing::warn!("unable to decrypt configuration value, leaving it empty");
                return String::new();
            }
            tracing::warn!(action, "unsupported configuration template action");
            captures[0].to_string()
        })
        .into_owned()
}

/// Expand using the process environment.
pub fn expand_env(text: &str, decrypt: Option<&dyn Fn(&str) -> Option<String>>) -> String {
    expand(text, &|name| std::env::var(name).ok(), decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "GOPHER_PROTOCOL" => Some("slack".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn env_and_default_actions_expand() {
        let text = r#"Protocol: {{ env "GOPHER_PROTOCOL" }}
Brain: {{ default "mem" (env "GOPHER_BRAIN") }}
Other: {{ default "x" (env "EMPTY") }}"#;
        let expanded = expand(text, &lookup, None);
        assert_eq!(expanded, "Protocol: slack\nBrain: mem\nOther: x");
    }

    #[test]
    fn decrypt_uses_callback() {
        let decrypt = |cipher: &str| (cipher == "c2VjcmV0").then(|| "secret".to_string());
        let expanded = expand(r#"Token: {{ decrypt "c2VjcmV0" }}"#, &lookup, Some(&decrypt));
        assert_eq!(expanded, "Token: secret");
    }

    #[test]
    fn unknown_actions_are_preserved() {
        let expanded = expand("Value: {{ upper \"x\" }}", &lookup, None);
        assert_eq!(expanded, "Value: {{ upper \"x\" }}");
    }
}
