// Strategy Catalog + Field Resolver
//
// The catalog is a closed set: every variant is matched exhaustively, so a
// new strategy cannot be added without the compiler pointing at every place
// that must handle it. Custom strategies are named callbacks resolved
// through the CallbackRegistry; raw function values never travel inside
// configuration payloads.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::Record;
use crate::error::{MergeError, Result};
use crate::relations::{RelationContext, RelationOutcome};

/// Separator for ConcatText joins.
const CONCAT_SEPARATOR: &str = " — ";

// ============================================================================
// STRATEGY CATALOG
// ============================================================================

/// Which side of the merge supplied a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Target,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Target => "target",
        }
    }
}

/// Closed set of field/relation resolution policies.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeStrategy {
    /// Whichever record was modified more recently wins; ties and missing
    /// timestamps keep the target's value.
    LastWrite,
    /// Target's value if non-empty, else source's, else unchanged.
    PreferNonNull,
    /// Ordered, de-duplicated join of target then source text.
    ConcatText,
    /// PreferNonNull, but only for fields in the allow set.
    Whitelist { allow: Vec<String> },
    /// Named callback resolved through the CallbackRegistry.
    Custom { callback: String },
    /// Placeholder: resolution must already have happened upstream.
    /// Reaching this at resolve time is an error.
    UserPrompt,
    /// A choice already made by a user: keep the target, or take the
    /// captured value from the chosen record.
    FieldSelection {
        selected_role: Role,
        value: Option<Value>,
    },
}

impl MergeStrategy {
    pub fn tag(&self) -> &'static str {
        match self {
            MergeStrategy::LastWrite => "last_write",
            MergeStrategy::PreferNonNull => "prefer_non_null",
            MergeStrategy::ConcatText => "concat_text",
            MergeStrategy::Whitelist { .. } => "whitelist",
            MergeStrategy::Custom { .. } => "custom",
            MergeStrategy::UserPrompt => "user_prompt",
            MergeStrategy::FieldSelection { .. } => "field_selection",
        }
    }

    /// Parse a strategy from its configuration form: a bare tag string, or
    /// an object with a `strategy` tag (or just a `callback`).
    pub fn from_config(name: &str, raw: &Value) -> Result<MergeStrategy> {
        match raw {
            Value::String(tag) => Self::from_tag(name, tag, &Map::new()),
            Value::Object(options) => {
                if let Some(Value::String(tag)) = options.get("strategy") {
                    Self::from_tag(name, tag, options)
                } else if options.contains_key("callback") {
                    Self::from_tag(name, "custom", options)
                } else {
                    Err(MergeError::configuration(
                        name,
                        "strategy object needs a 'strategy' tag or a 'callback'",
                    ))
                }
            }
            other => Err(MergeError::configuration(
                name,
                format!("expected strategy tag or object, got {other}"),
            )),
        }
    }

    fn from_tag(name: &str, tag: &str, options: &Map<String, Value>) -> Result<MergeStrategy> {
        match tag {
            "last_write" => Ok(MergeStrategy::LastWrite),
            "prefer_non_null" => Ok(MergeStrategy::PreferNonNull),
            "concat_text" => Ok(MergeStrategy::ConcatText),
            "whitelist" => {
                let allow = options
                    .get("allow")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(MergeStrategy::Whitelist { allow })
            }
            "custom" => match options.get("callback").and_then(Value::as_str) {
                Some(callback) if !callback.is_empty() => Ok(MergeStrategy::Custom {
                    callback: callback.to_string(),
                }),
                _ => Err(MergeError::configuration(
                    name,
                    "custom strategy requires a non-empty 'callback' name",
                )),
            },
            "user_prompt" => Ok(MergeStrategy::UserPrompt),
            "field_selection" => {
                let selected_role = match options.get("selected_role").and_then(Value::as_str) {
                    Some("source") => Role::Source,
                    Some("target") => Role::Target,
                    _ => {
                        return Err(MergeError::configuration(
                            name,
                            "field_selection requires 'selected_role' of 'source' or 'target'",
                        ))
                    }
                };
                Ok(MergeStrategy::FieldSelection {
                    selected_role,
                    value: options.get("value").cloned(),
                })
            }
            other => Err(MergeError::unsupported_strategy(
                other,
                name,
                "unknown strategy tag",
            )),
        }
    }

    /// Canonical configuration form, used for the audit strategy map and for
    /// deep-merging defaults with overrides.
    pub fn to_config(&self) -> Value {
        match self {
            MergeStrategy::Whitelist { allow } => serde_json::json!({
                "strategy": "whitelist",
                "allow": allow,
            }),
            MergeStrategy::Custom { callback } => serde_json::json!({
                "strategy": "custom",
                "callback": callback,
            }),
            MergeStrategy::FieldSelection {
                selected_role,
                value,
            } => {
                let mut config = serde_json::json!({
                    "strategy": "field_selection",
                    "selected_role": selected_role.as_str(),
                });
                if let Some(value) = value {
                    config["value"] = value.clone();
                }
                config
            }
            simple => Value::String(simple.tag().to_string()),
        }
    }
}

// ============================================================================
// FIELD RESOLUTION
// ============================================================================

/// Either a concrete value to stage onto the target, or the sentinel meaning
/// "leave the target's current value alone".
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Unchanged,
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldResolution {
    pub resolved: Resolved,
    pub note: Option<String>,
    pub source_role: Role,
}

impl FieldResolution {
    pub fn unchanged() -> Self {
        FieldResolution {
            resolved: Resolved::Unchanged,
            note: None,
            source_role: Role::Target,
        }
    }

    pub fn from_source(value: Value) -> Self {
        FieldResolution {
            resolved: Resolved::Value(value),
            note: None,
            source_role: Role::Source,
        }
    }

    pub fn from_target(value: Value) -> Self {
        FieldResolution {
            resolved: Resolved::Value(value),
            note: None,
            source_role: Role::Target,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self.resolved, Resolved::Unchanged)
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.resolved {
            Resolved::Value(value) => Some(value),
            Resolved::Unchanged => None,
        }
    }
}

/// Last-modified timestamps for both sides, feeding LastWrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveContext {
    pub source_modified: Option<DateTime<Utc>>,
    pub target_modified: Option<DateTime<Utc>>,
}

impl ResolveContext {
    fn source_is_newer(&self) -> bool {
        match (self.source_modified, self.target_modified) {
            (Some(source), Some(target)) => source > target,
            _ => false,
        }
    }
}

// ============================================================================
// FIELD RESOLVER
// ============================================================================

/// Evaluate one field's strategy against source and target.
pub fn resolve_field(
    strategy: &MergeStrategy,
    field: &str,
    source: &Record,
    target: &Record,
    ctx: ResolveContext,
    callbacks: &CallbackRegistry,
    options: &Map<String, Value>,
) -> Result<FieldResolution> {
    let source_value = source.get_or_null(field);
    let target_value = target.get_or_null(field);

    match strategy {
        MergeStrategy::LastWrite => {
            if ctx.source_is_newer() {
                Ok(FieldResolution::from_source(source_value)
                    .with_note("source modified more recently"))
            } else {
                Ok(FieldResolution::unchanged())
            }
        }

        MergeStrategy::PreferNonNull => Ok(prefer_non_null(&source_value, &target_value)),

        MergeStrategy::ConcatText => Ok(concat_text(&source_value, &target_value)),

        MergeStrategy::Whitelist { allow } => {
            if allow.iter().any(|allowed| allowed == field) {
                Ok(prefer_non_null(&source_value, &target_value))
            } else {
                Ok(FieldResolution::unchanged())
            }
        }

        MergeStrategy::Custom { callback } => match callbacks.field(callback) {
            Some(hook) => hook(field, source, target, options),
            None => Err(MergeError::configuration(
                field,
                format!("callback '{callback}' is not registered"),
            )),
        },

        MergeStrategy::UserPrompt => Err(MergeError::unsupported_strategy(
            "user_prompt",
            field,
            "must be converted to a field selection before the merge runs",
        )),

        MergeStrategy::FieldSelection {
            selected_role,
            value,
        } => match selected_role {
            Role::Target => Ok(FieldResolution::unchanged()),
            Role::Source => {
                let selected = value.clone().unwrap_or(source_value);
                Ok(FieldResolution::from_source(selected))
            }
        },
    }
}

fn prefer_non_null(source_value: &Value, target_value: &Value) -> FieldResolution {
    if !is_empty(target_value) {
        FieldResolution::from_target(target_value.clone())
    } else if !is_empty(source_value) {
        FieldResolution::from_source(source_value.clone())
    } else {
        FieldResolution::unchanged()
    }
}

fn concat_text(source_value: &Value, target_value: &Value) -> FieldResolution {
    let target_text = value_text(target_value).trim().to_string();
    let source_text = value_text(source_value).trim().to_string();

    let mut parts: Vec<String> = Vec::new();
    if !target_text.is_empty() {
        parts.push(target_text);
    }
    if !source_text.is_empty() && !parts.contains(&source_text) {
        parts.push(source_text);
    }

    if parts.is_empty() {
        return FieldResolution::unchanged();
    }

    let role = if parts.len() > 1 || value_text(target_value).trim().is_empty() {
        Role::Source
    } else {
        Role::Target
    };

    FieldResolution {
        resolved: Resolved::Value(Value::String(parts.join(CONCAT_SEPARATOR))),
        note: None,
        source_role: role,
    }
}

/// Emptiness check used by PreferNonNull: null, blank string (after trim),
/// or a zero-length collection.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// RELATION-FLAVORED RESOLUTION
// ============================================================================

/// Evaluate a strategy over membership id sets instead of scalar values.
/// `None` means "leave the target's membership alone"; `Some(ids)` fully
/// replaces it.
pub fn resolve_relation_members(
    strategy: &MergeStrategy,
    relation: &str,
    source_ids: &[i64],
    target_ids: &[i64],
    ctx: ResolveContext,
    callbacks: &CallbackRegistry,
    options: &Map<String, Value>,
) -> Result<Option<Vec<i64>>> {
    match strategy {
        MergeStrategy::LastWrite => {
            if ctx.source_is_newer() {
                Ok(Some(source_ids.to_vec()))
            } else {
                Ok(None)
            }
        }

        MergeStrategy::PreferNonNull => {
            if !target_ids.is_empty() || source_ids.is_empty() {
                Ok(None)
            } else {
                Ok(Some(source_ids.to_vec()))
            }
        }

        MergeStrategy::ConcatText => Ok(ordered_union(source_ids, target_ids)),

        MergeStrategy::Whitelist { allow } => {
            if allow.iter().any(|allowed| allowed == relation) {
                Ok(ordered_union(source_ids, target_ids))
            } else {
                Ok(None)
            }
        }

        MergeStrategy::Custom { callback } => match callbacks.member(callback) {
            Some(hook) => hook(relation, source_ids, target_ids, options),
            None => Err(MergeError::configuration(
                relation,
                format!("callback '{callback}' is not registered"),
            )),
        },

        MergeStrategy::UserPrompt | MergeStrategy::FieldSelection { .. } => {
            Err(MergeError::unsupported_strategy(
                strategy.tag(),
                relation,
                "not valid for relation membership",
            ))
        }
    }
}

/// Target order first, then source members not already present.
/// `None` when the source adds nothing.
fn ordered_union(source_ids: &[i64], target_ids: &[i64]) -> Option<Vec<i64>> {
    let mut union = target_ids.to_vec();
    for id in source_ids {
        if !union.contains(id) {
            union.push(*id);
        }
    }
    if union.len() == target_ids.len() {
        None
    } else {
        Some(union)
    }
}

// ============================================================================
// CALLBACK REGISTRY
// ============================================================================

/// Field-level custom strategy: `(field, source, target, options) -> resolution`.
pub type FieldCallback =
    dyn Fn(&str, &Record, &Record, &Map<String, Value>) -> Result<FieldResolution> + Send + Sync;

/// Membership-level custom strategy: `(relation, source_ids, target_ids,
/// options) -> replacement id set` (`None` = unchanged).
pub type MemberCallback =
    dyn Fn(&str, &[i64], &[i64], &Map<String, Value>) -> Result<Option<Vec<i64>>> + Send + Sync;

/// Whole-relation custom directive; returning `None` yields an empty
/// "custom" outcome.
pub type RelationCallback =
    dyn Fn(&RelationContext<'_>) -> Result<Option<RelationOutcome>> + Send + Sync;

/// Lookup table of named callbacks, consulted at merge time.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    fields: HashMap<String, Arc<FieldCallback>>,
    members: HashMap<String, Arc<MemberCallback>>,
    relations: HashMap<String, Arc<RelationCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_field<F>(&mut self, name: &str, callback: F)
    where
        F: Fn(&str, &Record, &Record, &Map<String, Value>) -> Result<FieldResolution>
            + Send
            + Sync
            + 'static,
    {
        self.fields.insert(name.to_string(), Arc::new(callback));
    }

    pub fn register_member<F>(&mut self, name: &str, callback: F)
    where
        F: Fn(&str, &[i64], &[i64], &Map<String, Value>) -> Result<Option<Vec<i64>>>
            + Send
            + Sync
            + 'static,
    {
        self.members.insert(name.to_string(), Arc::new(callback));
    }

    pub fn register_relation<F>(&mut self, name: &str, callback: F)
    where
        F: Fn(&RelationContext<'_>) -> Result<Option<RelationOutcome>> + Send + Sync + 'static,
    {
        self.relations.insert(name.to_string(), Arc::new(callback));
    }

    pub fn field(&self, name: &str) -> Option<Arc<FieldCallback>> {
        self.fields.get(name).cloned()
    }

    pub fn member(&self, name: &str) -> Option<Arc<MemberCallback>> {
        self.members.get(name).cloned()
    }

    pub fn relation(&self, name: &str) -> Option<Arc<RelationCallback>> {
        self.relations.get(name).cloned()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(fields: Value) -> Record {
        let map = fields
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Record {
            entity_type: "contact".to_string(),
            pk: 1,
            fields: map,
        }
    }

    fn resolve(
        strategy: &MergeStrategy,
        field: &str,
        source: &Record,
        target: &Record,
    ) -> FieldResolution {
        resolve_field(
            strategy,
            field,
            source,
            target,
            ResolveContext::default(),
            &CallbackRegistry::new(),
            &Map::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_prefer_non_null_keeps_populated_target() {
        let source = record(json!({"x": ""}));
        let target = record(json!({"x": "A"}));

        let resolution = resolve(&MergeStrategy::PreferNonNull, "x", &source, &target);
        assert_eq!(resolution.value(), Some(&json!("A")));
        assert_eq!(resolution.source_role, Role::Target);
    }

    #[test]
    fn test_prefer_non_null_takes_source_when_target_blank() {
        let source = record(json!({"x": "B"}));
        let target = record(json!({"x": ""}));

        let resolution = resolve(&MergeStrategy::PreferNonNull, "x", &source, &target);
        assert_eq!(resolution.value(), Some(&json!("B")));
        assert_eq!(resolution.source_role, Role::Source);
    }

    #[test]
    fn test_prefer_non_null_both_blank_is_unchanged() {
        let source = record(json!({"x": "  "}));
        let target = record(json!({"x": null}));

        let resolution = resolve(&MergeStrategy::PreferNonNull, "x", &source, &target);
        assert!(resolution.is_unchanged());
    }

    #[test]
    fn test_last_write_source_newer() {
        let source = record(json!({"name": "Source"}));
        let target = record(json!({"name": "Target"}));

        let newer = ResolveContext {
            source_modified: Some("2025-02-01T00:00:00Z".parse().unwrap()),
            target_modified: Some("2025-01-01T00:00:00Z".parse().unwrap()),
        };
        let resolution = resolve_field(
            &MergeStrategy::LastWrite,
            "name",
            &source,
            &target,
            newer,
            &CallbackRegistry::new(),
            &Map::new(),
        )
        .unwrap();
        assert_eq!(resolution.value(), Some(&json!("Source")));
        assert_eq!(resolution.source_role, Role::Source);
    }

    #[test]
    fn test_last_write_tie_or_missing_keeps_target() {
        let source = record(json!({"name": "Source"}));
        let target = record(json!({"name": "Target"}));

        let tie = ResolveContext {
            source_modified: Some("2025-01-01T00:00:00Z".parse().unwrap()),
            target_modified: Some("2025-01-01T00:00:00Z".parse().unwrap()),
        };
        assert!(resolve_field(
            &MergeStrategy::LastWrite,
            "name",
            &source,
            &target,
            tie,
            &CallbackRegistry::new(),
            &Map::new(),
        )
        .unwrap()
        .is_unchanged());

        let resolution = resolve(&MergeStrategy::LastWrite, "name", &source, &target);
        assert!(resolution.is_unchanged());
    }

    #[test]
    fn test_concat_text_joins_and_dedupes() {
        let source = record(json!({"notes": "call back"}));
        let target = record(json!({"notes": "met at expo"}));
        let resolution = resolve(&MergeStrategy::ConcatText, "notes", &source, &target);
        assert_eq!(resolution.value(), Some(&json!("met at expo — call back")));

        // Identical text is not repeated
        let duplicate = record(json!({"notes": "met at expo"}));
        let resolution = resolve(&MergeStrategy::ConcatText, "notes", &duplicate, &target);
        assert_eq!(resolution.value(), Some(&json!("met at expo")));

        // Both blank leaves the target alone
        let blank_source = record(json!({"notes": ""}));
        let blank_target = record(json!({"notes": "   "}));
        let resolution = resolve(&MergeStrategy::ConcatText, "notes", &blank_source, &blank_target);
        assert!(resolution.is_unchanged());
    }

    #[test]
    fn test_whitelist_gates_fields() {
        let strategy = MergeStrategy::Whitelist {
            allow: vec!["email".to_string()],
        };
        let source = record(json!({"email": "s@x.com", "name": "Source"}));
        let target = record(json!({"email": "", "name": ""}));

        let inside = resolve(&strategy, "email", &source, &target);
        assert_eq!(inside.value(), Some(&json!("s@x.com")));

        let outside = resolve(&strategy, "name", &source, &target);
        assert!(outside.is_unchanged());
    }

    #[test]
    fn test_field_selection() {
        let source = record(json!({"name": "Source"}));
        let target = record(json!({"name": "Target"}));

        let keep_target = MergeStrategy::FieldSelection {
            selected_role: Role::Target,
            value: None,
        };
        assert!(resolve(&keep_target, "name", &source, &target).is_unchanged());

        let explicit = MergeStrategy::FieldSelection {
            selected_role: Role::Source,
            value: Some(json!("Captured")),
        };
        let resolution = resolve(&explicit, "name", &source, &target);
        assert_eq!(resolution.value(), Some(&json!("Captured")));

        // Without a captured value the source's current value is used
        let implicit = MergeStrategy::FieldSelection {
            selected_role: Role::Source,
            value: None,
        };
        let resolution = resolve(&implicit, "name", &source, &target);
        assert_eq!(resolution.value(), Some(&json!("Source")));
    }

    #[test]
    fn test_user_prompt_fails_at_resolution() {
        let source = record(json!({"name": "Source"}));
        let target = record(json!({"name": "Target"}));
        let err = resolve_field(
            &MergeStrategy::UserPrompt,
            "name",
            &source,
            &target,
            ResolveContext::default(),
            &CallbackRegistry::new(),
            &Map::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::UnsupportedStrategy { .. }));
    }

    #[test]
    fn test_custom_callback_dispatch() {
        let mut callbacks = CallbackRegistry::new();
        callbacks.register_field("upper_source", |field, source, _target, _options| {
            let text = source
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_uppercase();
            Ok(FieldResolution::from_source(json!(text)))
        });

        let source = record(json!({"name": "source co"}));
        let target = record(json!({"name": "Target"}));
        let strategy = MergeStrategy::Custom {
            callback: "upper_source".to_string(),
        };

        let resolution = resolve_field(
            &strategy,
            "name",
            &source,
            &target,
            ResolveContext::default(),
            &callbacks,
            &Map::new(),
        )
        .unwrap();
        assert_eq!(resolution.value(), Some(&json!("SOURCE CO")));

        // Unregistered name is a configuration error
        let missing = MergeStrategy::Custom {
            callback: "nope".to_string(),
        };
        let err = resolve_field(
            &missing,
            "name",
            &source,
            &target,
            ResolveContext::default(),
            &callbacks,
            &Map::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::Configuration { .. }));
    }

    #[test]
    fn test_strategy_config_round_trip() {
        let strategies = vec![
            MergeStrategy::LastWrite,
            MergeStrategy::PreferNonNull,
            MergeStrategy::Whitelist {
                allow: vec!["email".to_string()],
            },
            MergeStrategy::Custom {
                callback: "cb".to_string(),
            },
            MergeStrategy::FieldSelection {
                selected_role: Role::Source,
                value: Some(json!("v")),
            },
        ];
        for strategy in strategies {
            let parsed = MergeStrategy::from_config("f", &strategy.to_config()).unwrap();
            assert_eq!(parsed, strategy);
        }

        let err = MergeStrategy::from_config("f", &json!("no_such_strategy")).unwrap_err();
        assert!(matches!(err, MergeError::UnsupportedStrategy { .. }));

        let err = MergeStrategy::from_config("f", &json!({"strategy": "custom"})).unwrap_err();
        assert!(matches!(err, MergeError::Configuration { .. }));
    }

    #[test]
    fn test_relation_members_union_and_prefer() {
        let union = resolve_relation_members(
            &MergeStrategy::ConcatText,
            "tags",
            &[3, 1, 4],
            &[1, 2],
            ResolveContext::default(),
            &CallbackRegistry::new(),
            &Map::new(),
        )
        .unwrap();
        assert_eq!(union, Some(vec![1, 2, 3, 4]));

        // Target already populated: PreferNonNull leaves it alone
        let kept = resolve_relation_members(
            &MergeStrategy::PreferNonNull,
            "tags",
            &[3],
            &[1, 2],
            ResolveContext::default(),
            &CallbackRegistry::new(),
            &Map::new(),
        )
        .unwrap();
        assert_eq!(kept, None);

        // Field selection makes no sense for membership
        let err = resolve_relation_members(
            &MergeStrategy::UserPrompt,
            "tags",
            &[],
            &[],
            ResolveContext::default(),
            &CallbackRegistry::new(),
            &Map::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::UnsupportedStrategy { .. }));
    }
}
