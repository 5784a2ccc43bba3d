//! YAML document merging and `Append<Key>` fix-ups.
//!
//! Installed defaults are overlaid by custom configuration. A custom key
//! spelled `Append<Key>` extends the sequence stored under `<Key>` instead of
//! replacing it. Before strict decoding, any `Append<Key>` left in a document
//! is renamed to `<Key>` so the typed schema never sees the prefix.

use serde_yaml::{Mapping, Value};

const APPEND_PREFIX: &str = "Append";

/// Merge `overlay` into `base`, recursing through mappings.
///
/// - `Append<Key>` sequences extend `<Key>` when it is a sequence in `base`.
/// - Nested mappings merge recursively.
/// - Anything else replaces the base value, except that a null overlay never
///   clobbers an existing value.
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                merge_entry(&mut base, key, value);
            }
            Value::Mapping(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

fn merge_entry(base: &mut Mapping, key: Value, value: Value) {
    if let (Some(name), Value::Sequence(items)) = (key.as_str(), &value)
        && let Some(target) = append_target(name)
    {
        let target_key = Value::String(target.to_string());
        if let Some(Value::Sequence(existing)) = base.get_mut(&target_key) {
            existing.extend(items.iter().cloned());
            return;
        }
        if let Some(Value::Sequence(existing)) = base.get_mut(&key) {
            existing.extend(items.iter().cloned());
            return;
        }
    }

    let merged = match base.remove(&key) {
        Some(existing) => merge_values(existing, value),
        None => value,
    };
    base.insert(key, merged);
}

fn append_target(name: &str) -> Option<&str> {
    let target = name.strip_prefix(APPEND_PREFIX)?;
    let first = target.chars().next()?;
    first.is_ascii_uppercase().then_some(target)
}

/// Rename every `Append<Key>` in the top-level mapping to `<Key>`.
///
/// When both spellings are present and both hold sequences, the appended
/// items follow the plain ones. Returns the renamed keys as
/// `(new_name, original_name)` pairs for diagnostics.
pub fn fixup_append_keys(doc: &mut Value) -> Vec<(String, String)> {
    let Value::Mapping(map) = doc else {
        return Vec::new();
    };

    let append_keys: Vec<String> = map
        .keys()
        .filter_map(|key| key.as_str())
        .filter(|name| append_target(name).is_some())
        .map(str::to_string)
        .collect();

    let mut renamed = Vec::with_capacity(append_keys.len());
    for original in append_keys {
        let Some(target) = append_target(&original).map(str::to_string) else {
            continue;
        };
        let Some(value) = map.remove(original.as_str()) else {
            continue;
        };
        let target_key = Value::String(target.clone());
        match (map.get_mut(&target_key), value) {
            (Some(Value::Sequence(existing)), Value::Sequence(items)) => existing.extend(items),
            (_, value) => {
                map.insert(target_key, value);
            }
        }
        tracing::debug!(key = %target, was = %original, "renamed Append-prefixed configuration key");
        renamed.push((target, original));
    }
    renamed
}

/// Remove free-form sections that the strict schema does not describe,
/// returning them keyed by name.
pub fn take_sections(doc: &mut Value, sections: &[&str]) -> Vec<(String, Value)> {
    let Value::Mapping(map) = doc else {
        return Vec::new();
    };
    sections
        .iter()
        .filter_map(|section| {
            map.remove(*section)
                .map(|value| ((*section).to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).expect("valid yaml")
    }

    #[test]
    fn overlay_replaces_scalars_and_merges_maps() {
        let base = yaml("Alias: ';'\nBotInfo:\n  UserName: floyd\n  Email: floyd@example.com\n");
        let overlay = yaml("Alias: '!'\nBotInfo:\n  UserName: bishop\n");
        let merged = merge_values(base, overlay);
        assert_eq!(merged, yaml("Alias: '!'\nBotInfo:\n  UserName: bishop\n  Email: floyd@example.com\n"));
    }

    #[test]
    fn append_prefix_extends_base_sequence() {
        let base = yaml("AdminUsers: [alice]\n");
        let overlay = yaml("AppendAdminUsers: [bob]\n");
        let merged = merge_values(base, overlay);
        assert_eq!(merged, yaml("AdminUsers: [alice, bob]\n"));
    }

    #[test]
    fn null_overlay_keeps_base_value() {
        let merged = merge_values(yaml("Alias: ';'\n"), yaml("Alias: ~\n"));
        assert_eq!(merged, yaml("Alias: ';'\n"));
    }

    #[test]
    fn fixup_renames_leftover_append_keys() {
        let mut doc = yaml("AppendHelp: [a]\nHelp: [b]\nAppendix: keep\n");
        let renamed = fixup_append_keys(&mut doc);
        assert_eq!(renamed, vec![("Help".to_string(), "AppendHelp".to_string())]);
        assert_eq!(doc, yaml("Help: [b, a]\nAppendix: keep\n"));
    }

    #[test]
    fn free_form_sections_are_removed() {
        let mut doc = yaml("Protocol: test\nProtocolConfig:\n  Anything: goes\n");
        let sections = take_sections(&mut doc, &["ProtocolConfig", "BrainConfig"]);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0, "ProtocolConfig");
        assert_eq!(doc, yaml("Protocol: test\n"));
    }
}
