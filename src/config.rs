// Merge Overrides - per-call configuration layered over schema defaults
//
// Overrides are raw JSON, keyed by field or relation name, deep-merged on top
// of whatever the schema declares. The merged result is parsed by the same
// strategy/directive code that handles the defaults, so overrides can never
// express anything the defaults cannot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-merge configuration overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeOverrides {
    /// Field name → strategy configuration (tag or object).
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,

    /// Relation name → directive configuration (tag or object).
    #[serde(default)]
    pub relations: BTreeMap<String, Value>,
}

impl MergeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: &str, config: Value) -> Self {
        self.fields.insert(field.to_string(), config);
        self
    }

    pub fn with_relation(mut self, relation: &str, config: Value) -> Self {
        self.relations.insert(relation.to_string(), config);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.relations.is_empty()
    }
}

/// Overlay one configuration value onto a base.
///
/// Objects merge key-by-key with the overlay winning on conflicts; any other
/// overlay value replaces the base wholesale. A base tag ("last_write") under
/// an object overlay is treated as `{"strategy": tag}` so partial overrides
/// like `{"allow": [..]}` compose with a declared tag.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let entry = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        (Value::String(tag), Value::Object(overlay_map))
            if !overlay_map.contains_key("strategy")
                && !overlay_map.contains_key("action")
                && !overlay_map.contains_key("callback") =>
        {
            let mut merged = overlay_map.clone();
            merged.insert("strategy".to_string(), Value::String(tag.clone()));
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_objects_merge_key_by_key() {
        let base = json!({"action": "reassign", "deduplicate": true});
        let overlay = json!({"delete_conflicts": false});

        let merged = deep_merge(&base, &overlay);
        assert_eq!(
            merged,
            json!({"action": "reassign", "deduplicate": true, "delete_conflicts": false})
        );
    }

    #[test]
    fn test_overlay_wins_on_conflict() {
        let base = json!({"strategy": "whitelist", "allow": ["a"]});
        let overlay = json!({"allow": ["b", "c"]});

        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged["strategy"], json!("whitelist"));
        assert_eq!(merged["allow"], json!(["b", "c"]));
    }

    #[test]
    fn test_scalar_overlay_replaces_base() {
        assert_eq!(
            deep_merge(&json!({"strategy": "whitelist"}), &json!("last_write")),
            json!("last_write")
        );
        assert_eq!(deep_merge(&json!("skip"), &json!("merge")), json!("merge"));
    }

    #[test]
    fn test_tag_base_absorbs_option_overlay() {
        let merged = deep_merge(&json!("whitelist"), &json!({"allow": ["email"]}));
        assert_eq!(
            merged,
            json!({"strategy": "whitelist", "allow": ["email"]})
        );

        // An overlay that names its own strategy replaces the tag
        let merged = deep_merge(&json!("whitelist"), &json!({"strategy": "last_write"}));
        assert_eq!(merged, json!({"strategy": "last_write"}));
    }

    #[test]
    fn test_overrides_deserialize_with_defaults() {
        let overrides: MergeOverrides = serde_json::from_value(json!({
            "fields": {"email": "prefer_non_null"}
        }))
        .unwrap();
        assert_eq!(overrides.fields["email"], json!("prefer_non_null"));
        assert!(overrides.relations.is_empty());

        let empty: MergeOverrides = serde_json::from_value(json!({})).unwrap();
        assert!(empty.is_empty());
    }
}
