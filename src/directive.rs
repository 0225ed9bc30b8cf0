// Directive Normalizer - raw relation configuration → canonical directive
//
// Shape validation happens here, not at execution time: a Strategy directive
// on anything but a many-to-many relation is rejected before the merge
// touches the store.

use serde_json::{Map, Value};

use crate::entity::{RelationDescriptor, RelationKind};
use crate::error::{MergeError, Result};
use crate::strategy::MergeStrategy;

// ============================================================================
// RELATION DIRECTIVE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RelationAction {
    /// Repoint source-owned references to the target.
    Reassign,
    /// Add source membership to target membership, de-duplicated.
    Merge,
    /// Leave the relation alone.
    Skip,
    /// Delegate membership reconciliation to a merge strategy
    /// (many-to-many only).
    Strategy(MergeStrategy),
    /// Named relation callback.
    Custom(String),
}

impl RelationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationAction::Reassign => "reassign",
            RelationAction::Merge => "merge",
            RelationAction::Skip => "skip",
            RelationAction::Strategy(_) => "strategy",
            RelationAction::Custom(_) => "custom",
        }
    }
}

/// Canonical form of one relation's merge configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDirective {
    pub action: RelationAction,
    pub options: Map<String, Value>,
}

impl RelationDirective {
    pub fn skip() -> Self {
        RelationDirective {
            action: RelationAction::Skip,
            options: Map::new(),
        }
    }

    fn option_flag(&self, key: &str, default: bool) -> bool {
        self.options
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Reassign option: check target-side uniqueness before repointing.
    pub fn deduplicate(&self) -> bool {
        self.option_flag("deduplicate", false)
    }

    /// Dedup option: delete colliding source rows instead of skipping them.
    pub fn delete_conflicts(&self) -> bool {
        self.option_flag("delete_conflicts", true)
    }

    /// Configuration form for the audit strategy map.
    pub fn to_config(&self) -> Value {
        let mut config = Map::new();
        config.insert(
            "action".to_string(),
            Value::String(self.action.as_str().to_string()),
        );
        match &self.action {
            RelationAction::Strategy(strategy) => {
                config.insert("strategy".to_string(), strategy.to_config());
            }
            RelationAction::Custom(callback) => {
                config.insert("callback".to_string(), Value::String(callback.clone()));
            }
            _ => {}
        }
        for (key, value) in &self.options {
            config.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(config)
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Reduce raw configuration to a canonical directive.
///
/// Accepted forms: nothing (defaults by relation shape), a bare action or
/// strategy tag, or an object carrying `action`, `strategy` or `callback`
/// plus options.
pub fn normalize(relation: &RelationDescriptor, raw: Option<&Value>) -> Result<RelationDirective> {
    let directive = match raw {
        None | Some(Value::Null) => default_directive(relation),
        Some(Value::String(tag)) => from_tag(relation, tag, &Map::new())?,
        Some(Value::Object(options)) => from_object(relation, options)?,
        Some(other) => {
            return Err(MergeError::configuration(
                &relation.name,
                format!("expected directive tag or object, got {other}"),
            ))
        }
    };

    validate(relation, &directive)?;
    Ok(directive)
}

fn default_directive(relation: &RelationDescriptor) -> RelationDirective {
    let action = match relation.kind {
        RelationKind::ManyToMany => RelationAction::Merge,
        RelationKind::ToOne | RelationKind::OneToOne => RelationAction::Reassign,
        RelationKind::OneToMany => RelationAction::Skip,
    };
    RelationDirective {
        action,
        options: Map::new(),
    }
}

fn from_tag(
    relation: &RelationDescriptor,
    tag: &str,
    options: &Map<String, Value>,
) -> Result<RelationDirective> {
    let mut trimmed = options.clone();
    trimmed.remove("action");
    trimmed.remove("strategy");
    trimmed.remove("callback");

    let action = match tag {
        "reassign" => RelationAction::Reassign,
        "merge" => RelationAction::Merge,
        "skip" => RelationAction::Skip,
        // Anything else must be a strategy tag
        other => RelationAction::Strategy(MergeStrategy::from_config(
            &relation.name,
            &Value::String(other.to_string()),
        )?),
    };

    Ok(RelationDirective {
        action,
        options: trimmed,
    })
}

fn from_object(
    relation: &RelationDescriptor,
    options: &Map<String, Value>,
) -> Result<RelationDirective> {
    if let Some(Value::String(action)) = options.get("action") {
        return from_tag(relation, action, options);
    }

    if let Some(callback) = options.get("callback") {
        let name = callback.as_str().unwrap_or_default();
        if name.is_empty() {
            return Err(MergeError::configuration(
                &relation.name,
                "custom directive requires a non-empty 'callback' name",
            ));
        }
        let mut trimmed = options.clone();
        trimmed.remove("callback");
        trimmed.remove("action");
        return Ok(RelationDirective {
            action: RelationAction::Custom(name.to_string()),
            options: trimmed,
        });
    }

    if let Some(strategy_cfg) = options.get("strategy") {
        // Nested strategy config may itself be a tag or an object; pass the
        // whole object through so options like `allow` stay visible.
        let strategy = match strategy_cfg {
            Value::String(_) => {
                MergeStrategy::from_config(&relation.name, &Value::Object(options.clone()))?
            }
            nested => MergeStrategy::from_config(&relation.name, nested)?,
        };
        let mut trimmed = options.clone();
        trimmed.remove("strategy");
        return Ok(RelationDirective {
            action: RelationAction::Strategy(strategy),
            options: trimmed,
        });
    }

    Err(MergeError::configuration(
        &relation.name,
        "directive object needs an 'action', 'strategy' or 'callback'",
    ))
}

fn validate(relation: &RelationDescriptor, directive: &RelationDirective) -> Result<()> {
    match &directive.action {
        RelationAction::Strategy(_) if relation.kind != RelationKind::ManyToMany => {
            Err(MergeError::configuration(
                &relation.name,
                format!(
                    "strategy directives are only valid for many-to-many relations, not {}",
                    relation.kind.as_str()
                ),
            ))
        }
        RelationAction::Custom(name) if name.is_empty() => Err(MergeError::configuration(
            &relation.name,
            "custom directive requires a non-empty 'callback' name",
        )),
        _ => Ok(()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::RelationDescriptor;
    use serde_json::json;

    fn m2m() -> RelationDescriptor {
        RelationDescriptor::many_to_many("tags", "contact_tags", "contact_id", "tag_id")
    }

    fn one_to_many() -> RelationDescriptor {
        RelationDescriptor::one_to_many("phones", "phone_numbers", "contact_id")
    }

    #[test]
    fn test_defaults_by_relation_shape() {
        let tags = normalize(&m2m(), None).unwrap();
        assert_eq!(tags.action, RelationAction::Merge);

        let profile =
            RelationDescriptor::one_to_one("profile", "profiles", "contact_id");
        assert_eq!(
            normalize(&profile, None).unwrap().action,
            RelationAction::Reassign
        );

        let org = RelationDescriptor::to_one("organization", "contacts", "organization_id");
        assert_eq!(
            normalize(&org, None).unwrap().action,
            RelationAction::Reassign
        );

        assert_eq!(
            normalize(&one_to_many(), None).unwrap().action,
            RelationAction::Skip
        );
    }

    #[test]
    fn test_bare_tags() {
        let directive = normalize(&one_to_many(), Some(&json!("reassign"))).unwrap();
        assert_eq!(directive.action, RelationAction::Reassign);

        let directive = normalize(&m2m(), Some(&json!("concat_text"))).unwrap();
        assert_eq!(
            directive.action,
            RelationAction::Strategy(MergeStrategy::ConcatText)
        );

        let err = normalize(&m2m(), Some(&json!("not_a_thing"))).unwrap_err();
        assert!(matches!(err, MergeError::UnsupportedStrategy { .. }));
    }

    #[test]
    fn test_object_forms() {
        let directive = normalize(
            &one_to_many(),
            Some(&json!({"action": "reassign", "deduplicate": true, "delete_conflicts": false})),
        )
        .unwrap();
        assert_eq!(directive.action, RelationAction::Reassign);
        assert!(directive.deduplicate());
        assert!(!directive.delete_conflicts());

        let directive = normalize(&m2m(), Some(&json!({"callback": "rebalance"}))).unwrap();
        assert_eq!(
            directive.action,
            RelationAction::Custom("rebalance".to_string())
        );

        let directive = normalize(
            &m2m(),
            Some(&json!({"strategy": "whitelist", "allow": ["tags"]})),
        )
        .unwrap();
        assert_eq!(
            directive.action,
            RelationAction::Strategy(MergeStrategy::Whitelist {
                allow: vec!["tags".to_string()]
            })
        );
    }

    #[test]
    fn test_delete_conflicts_defaults_true() {
        let directive = normalize(
            &one_to_many(),
            Some(&json!({"action": "reassign", "deduplicate": true})),
        )
        .unwrap();
        assert!(directive.delete_conflicts());
    }

    #[test]
    fn test_strategy_rejected_outside_many_to_many() {
        let err = normalize(&one_to_many(), Some(&json!("prefer_non_null"))).unwrap_err();
        assert!(matches!(err, MergeError::Configuration { .. }));

        let profile = RelationDescriptor::one_to_one("profile", "profiles", "contact_id");
        let err = normalize(&profile, Some(&json!({"strategy": "last_write"}))).unwrap_err();
        assert!(matches!(err, MergeError::Configuration { .. }));
    }

    #[test]
    fn test_custom_requires_callback_name() {
        let err = normalize(&m2m(), Some(&json!({"callback": ""}))).unwrap_err();
        assert!(matches!(err, MergeError::Configuration { .. }));

        let err = normalize(&m2m(), Some(&json!({"callback": null}))).unwrap_err();
        assert!(matches!(err, MergeError::Configuration { .. }));
    }

    #[test]
    fn test_directive_to_config() {
        let directive = normalize(
            &one_to_many(),
            Some(&json!({"action": "reassign", "deduplicate": true})),
        )
        .unwrap();
        let config = directive.to_config();
        assert_eq!(config["action"], json!("reassign"));
        assert_eq!(config["deduplicate"], json!(true));
    }
}
