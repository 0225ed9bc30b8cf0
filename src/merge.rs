// Merge Orchestrator - one transactional pass from validation to audit
//
// Ordering is fixed: validate, resolve fields, apply relations, archive,
// write the audit row, delete the source, commit. Any error on the way out
// rolls the transaction back, so a failed merge leaves the store exactly as
// it found it. Real merges take an immediate transaction so the write lock
// covers the dedup-check window; dry runs stay deferred and never write.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::{Connection, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::audit::{self, MergeLogEntry};
use crate::config::{deep_merge, MergeOverrides};
use crate::directive::normalize;
use crate::entity::{EntityRegistry, Mergeable, Record};
use crate::error::{MergeError, Result};
use crate::relations::{RelationExecutor, RelationOutcome};
use crate::snapshot;
use crate::store;
use crate::strategy::{resolve_field, CallbackRegistry, MergeStrategy, ResolveContext};

// ============================================================================
// REQUEST / OPTIONS / RESULT
// ============================================================================

/// A record named by type and primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub entity_type: String,
    pub pk: i64,
}

impl RecordRef {
    pub fn new(entity_type: &str, pk: i64) -> Self {
        RecordRef {
            entity_type: entity_type.to_string(),
            pk,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub performed_by: String,
    /// Compute the full result without changing the store.
    pub dry_run: bool,
    /// Snapshot the source and invoke the entity's archive hook.
    pub archive: bool,
    pub overrides: MergeOverrides,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            performed_by: "system".to_string(),
            dry_run: false,
            archive: true,
            overrides: MergeOverrides::default(),
        }
    }
}

impl MergeOptions {
    pub fn performed_by(mut self, who: &str) -> Self {
        self.performed_by = who.to_string();
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn without_archive(mut self) -> Self {
        self.archive = false;
        self
    }

    pub fn with_overrides(mut self, overrides: MergeOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Everything a caller learns from one merge.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// Audit row id; `None` for dry runs.
    pub merge_id: Option<String>,
    /// The surviving record with resolved values applied.
    pub target: Record,
    /// Field name → { value, source_role, note } for every field that changed.
    pub resolved_fields: Map<String, Value>,
    /// Per-relation outcome, in schema declaration order.
    pub relation_actions: Vec<(String, RelationOutcome)>,
    pub dry_run: bool,
}

impl MergeResult {
    pub fn fields_changed(&self) -> usize {
        self.resolved_fields.len()
    }

    pub fn relation_changes(&self) -> usize {
        self.relation_actions
            .iter()
            .map(|(_, outcome)| outcome.total_changes())
            .sum()
    }

    pub fn relation_outcome(&self, relation: &str) -> Option<&RelationOutcome> {
        self.relation_actions
            .iter()
            .find(|(name, _)| name == relation)
            .map(|(_, outcome)| outcome)
    }
}

/// Handed to the failure hook after rollback.
#[derive(Debug, Clone)]
pub struct FailureSignal {
    pub entity_type: String,
    pub source_pk: i64,
    pub target_pk: i64,
    pub error: String,
}

type FailureHook = dyn Fn(&FailureSignal) + Send + Sync;

// ============================================================================
// ENGINE
// ============================================================================

pub struct MergeEngine {
    registry: EntityRegistry,
    callbacks: CallbackRegistry,
    on_failure: Option<Arc<FailureHook>>,
}

impl MergeEngine {
    pub fn new(registry: EntityRegistry) -> Self {
        MergeEngine {
            registry,
            callbacks: CallbackRegistry::new(),
            on_failure: None,
        }
    }

    pub fn with_callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_failure_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FailureSignal) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Merge `source` into `target` and delete the source.
    pub fn merge(
        &self,
        conn: &mut Connection,
        source: &RecordRef,
        target: &RecordRef,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        info!(
            entity_type = %target.entity_type,
            source_pk = source.pk,
            target_pk = target.pk,
            dry_run = options.dry_run,
            "starting merge"
        );

        match self.run(conn, source, target, options) {
            Ok(result) => {
                info!(
                    merge_id = result.merge_id.as_deref().unwrap_or("dry-run"),
                    fields_changed = result.fields_changed(),
                    relation_changes = result.relation_changes(),
                    "merge finished"
                );
                Ok(result)
            }
            Err(error) => {
                error!(
                    entity_type = %target.entity_type,
                    source_pk = source.pk,
                    target_pk = target.pk,
                    %error,
                    "merge rolled back"
                );
                if let Some(hook) = &self.on_failure {
                    hook(&FailureSignal {
                        entity_type: target.entity_type.clone(),
                        source_pk: source.pk,
                        target_pk: target.pk,
                        error: error.to_string(),
                    });
                }
                Err(error)
            }
        }
    }

    fn run(
        &self,
        conn: &mut Connection,
        source_ref: &RecordRef,
        target_ref: &RecordRef,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        // ----------------------------------------------------------------------
        // Validate
        // ----------------------------------------------------------------------
        if source_ref.entity_type == target_ref.entity_type && source_ref.pk == target_ref.pk {
            return Err(MergeError::IdenticalRecords {
                entity_type: target_ref.entity_type.clone(),
                pk: target_ref.pk,
            });
        }
        if source_ref.entity_type != target_ref.entity_type {
            return Err(MergeError::TypeMismatch {
                source_type: source_ref.entity_type.clone(),
                target_type: target_ref.entity_type.clone(),
            });
        }
        let entity = self
            .registry
            .get(&target_ref.entity_type)
            .ok_or_else(|| MergeError::UnsupportedEntity(target_ref.entity_type.clone()))?;
        let schema = entity.schema();

        let behavior = if options.dry_run {
            TransactionBehavior::Deferred
        } else {
            TransactionBehavior::Immediate
        };
        let tx = conn.transaction_with_behavior(behavior)?;

        let source = store::load_record(&tx, schema, source_ref.pk)?.ok_or_else(|| {
            MergeError::RecordNotFound {
                entity_type: source_ref.entity_type.clone(),
                pk: source_ref.pk,
            }
        })?;
        let mut target = store::load_record(&tx, schema, target_ref.pk)?.ok_or_else(|| {
            MergeError::RecordNotFound {
                entity_type: target_ref.entity_type.clone(),
                pk: target_ref.pk,
            }
        })?;

        let ctx = ResolveContext {
            source_modified: source.modified_at(schema),
            target_modified: target.modified_at(schema),
        };
        let target_before = snapshot::capture(&tx, schema, &target)?;

        // ----------------------------------------------------------------------
        // Resolve fields
        // ----------------------------------------------------------------------
        let mut staged = std::collections::HashMap::new();
        let mut resolved_fields = Map::new();
        let mut field_strategies = Map::new();

        for field in &schema.fields {
            let (strategy, config) =
                effective_field_strategy(entity.as_ref(), field, &options.overrides)?;
            let strategy_options = field_options(&config);
            field_strategies.insert(field.clone(), config);

            let resolution = resolve_field(
                &strategy,
                field,
                &source,
                &target,
                ctx,
                &self.callbacks,
                &strategy_options,
            )?;
            let Some(value) = resolution.value() else {
                continue;
            };
            if target.get_or_null(field) == *value {
                continue;
            }

            let mut entry = Map::new();
            entry.insert("value".to_string(), value.clone());
            entry.insert(
                "source_role".to_string(),
                Value::String(resolution.source_role.as_str().to_string()),
            );
            if let Some(note) = &resolution.note {
                entry.insert("note".to_string(), Value::String(note.clone()));
            }
            resolved_fields.insert(field.clone(), Value::Object(entry));
            staged.insert(field.clone(), value.clone());
        }

        if !options.dry_run {
            store::persist_fields(&tx, schema, target.pk, &staged)?;
        }
        for (field, value) in &staged {
            target.set(field, value.clone());
        }

        // ----------------------------------------------------------------------
        // Apply relations
        // ----------------------------------------------------------------------
        let executor = RelationExecutor::new(&tx, &self.callbacks, &schema.pk_column);
        let mut relation_actions = Vec::with_capacity(schema.relations.len());
        let mut relation_strategies = Map::new();
        // Physical-column idempotency: a second descriptor over the same
        // (table, fk, member) columns is a no-op, whatever its directive says
        let mut processed: HashSet<(String, String, String)> = HashSet::new();

        for relation in &schema.relations {
            let key = (
                relation.table.clone(),
                relation.fk_column.clone(),
                relation.member_column.clone().unwrap_or_default(),
            );
            if !processed.insert(key) {
                debug!(relation = %relation.name, "duplicate relation descriptor, skipping");
                relation_actions.push((relation.name.clone(), RelationOutcome::skip()));
                continue;
            }

            let raw = relation_config(entity.as_ref(), &relation.name, &options.overrides);
            let directive = normalize(relation, raw.as_ref())?;
            relation_strategies.insert(relation.name.clone(), directive.to_config());

            let outcome = executor.apply(
                &directive,
                relation,
                &source,
                &target,
                ctx,
                options.dry_run,
            )?;
            debug!(
                relation = %relation.name,
                action = %outcome.action,
                updated = outcome.updated,
                added = outcome.added,
                skipped = outcome.skipped,
                deleted = outcome.deleted,
                "relation applied"
            );
            relation_actions.push((relation.name.clone(), outcome));
        }

        // ----------------------------------------------------------------------
        // Archive, audit, delete source
        // ----------------------------------------------------------------------
        let source_snapshot = if options.archive {
            Some(snapshot::capture(&tx, schema, &source)?)
        } else {
            None
        };

        let merge_id = if options.dry_run {
            tx.rollback()?;
            None
        } else {
            if options.archive {
                entity.archive(&tx, &source, source_snapshot.as_ref())?;
            }

            let target_after = snapshot::capture(&tx, schema, &target)?;
            let merge_id = uuid::Uuid::new_v4().to_string();
            audit::insert_merge_log(
                &tx,
                &MergeLogEntry {
                    id: merge_id.clone(),
                    entity_type: target.entity_type.clone(),
                    source_pk: source.pk,
                    target_pk: target.pk,
                    resolved_values: Value::Object(resolved_fields.clone()),
                    strategy_map: serde_json::json!({
                        "fields": field_strategies,
                        "relations": relation_strategies,
                    }),
                    source_snapshot,
                    target_before,
                    target_after,
                    performed_by: options.performed_by.clone(),
                    executed_at: chrono::Utc::now(),
                },
            )?;

            store::delete_record(&tx, schema, source.pk)?;
            tx.commit()?;
            Some(merge_id)
        };

        Ok(MergeResult {
            merge_id,
            target,
            resolved_fields,
            relation_actions,
            dry_run: options.dry_run,
        })
    }
}

fn effective_field_strategy(
    entity: &dyn Mergeable,
    field: &str,
    overrides: &MergeOverrides,
) -> Result<(MergeStrategy, Value)> {
    let default = entity.default_field_strategy(field);
    match overrides.fields.get(field) {
        None => {
            let config = default.to_config();
            Ok((default, config))
        }
        Some(raw) => {
            let merged = deep_merge(&default.to_config(), raw);
            let strategy = MergeStrategy::from_config(field, &merged)?;
            Ok((strategy, merged))
        }
    }
}

/// Option keys forwarded to the field resolver: everything in the effective
/// configuration except the strategy selectors themselves, mirroring how
/// relation directives carry their options.
fn field_options(config: &Value) -> Map<String, Value> {
    match config {
        Value::Object(map) => {
            let mut options = map.clone();
            options.remove("strategy");
            options.remove("callback");
            options
        }
        _ => Map::new(),
    }
}

fn relation_config(
    entity: &dyn Mergeable,
    relation: &str,
    overrides: &MergeOverrides,
) -> Option<Value> {
    match (
        entity.default_relation_config(relation),
        overrides.relations.get(relation),
    ) {
        (Some(default), Some(overlay)) => Some(deep_merge(&default, overlay)),
        (Some(default), None) => Some(default),
        (None, Some(overlay)) => Some(overlay.clone()),
        (None, None) => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================
