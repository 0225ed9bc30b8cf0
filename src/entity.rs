// Entity Contract - what a record type must declare to be mergeable
//
// No runtime reflection: every mergeable type declares its fields and
// relations as explicit descriptors in an EntitySchema. The schema is an
// immutable per-type configuration object; the registry hands out Arc
// snapshots so a running merge never observes configuration changes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::strategy::MergeStrategy;

// ============================================================================
// RECORD
// ============================================================================

/// A loaded record: stable primary key plus a field-name → value map.
///
/// The primary key is assigned by the store and never changes; everything in
/// `fields` is a value that a merge may replace.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub entity_type: String,
    pub pk: i64,
    pub fields: HashMap<String, Value>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field value, with missing fields read as null.
    pub fn get_or_null(&self, field: &str) -> Value {
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.fields.insert(field.to_string(), value);
    }

    /// Last-modified timestamp, if the schema declares a modified column and
    /// the stored value parses as RFC 3339.
    pub fn modified_at(&self, schema: &EntitySchema) -> Option<DateTime<Utc>> {
        let column = schema.modified_column.as_ref()?;
        match self.fields.get(column)? {
            Value::String(raw) => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }
}

// ============================================================================
// RELATION DESCRIPTORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    /// Foreign-key column on the entity's own table.
    ToOne,
    /// Related table holds a unique back-reference to the entity.
    OneToOne,
    /// Related table holds a plain back-reference to the entity.
    OneToMany,
    /// Join table between the entity and a member table.
    ManyToMany,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::ToOne => "to_one",
            RelationKind::OneToOne => "one_to_one",
            RelationKind::OneToMany => "one_to_many",
            RelationKind::ManyToMany => "many_to_many",
        }
    }
}

/// Statically-declared description of one relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub name: String,
    pub kind: RelationKind,

    /// Table holding the reference: the entity's own table for `ToOne`, the
    /// related table for the reverse kinds, the join table for `ManyToMany`.
    pub table: String,

    /// Column in `table` that references the entity (for `ToOne`: the column
    /// on the entity table that references the far side).
    pub fk_column: String,

    /// Join-table column naming the far-side member (`ManyToMany` only).
    pub member_column: Option<String>,

    /// Columns that together with `fk_column` must stay unique; consulted by
    /// reassign-with-deduplicate.
    pub unique_with: Vec<String>,

    /// Join rows carry attributes beyond bare membership ("through" links).
    pub has_link_attributes: bool,
}

impl RelationDescriptor {
    fn new(name: &str, kind: RelationKind, table: &str, fk_column: &str) -> Self {
        RelationDescriptor {
            name: name.to_string(),
            kind,
            table: table.to_string(),
            fk_column: fk_column.to_string(),
            member_column: None,
            unique_with: Vec::new(),
            has_link_attributes: false,
        }
    }

    /// Foreign-key column on the entity table itself. The column must not
    /// also be listed as a mergeable field, or field strategies and the
    /// relation directive would both try to resolve it.
    pub fn to_one(name: &str, entity_table: &str, fk_column: &str) -> Self {
        Self::new(name, RelationKind::ToOne, entity_table, fk_column)
    }

    pub fn one_to_one(name: &str, related_table: &str, fk_column: &str) -> Self {
        Self::new(name, RelationKind::OneToOne, related_table, fk_column)
    }

    pub fn one_to_many(name: &str, related_table: &str, fk_column: &str) -> Self {
        Self::new(name, RelationKind::OneToMany, related_table, fk_column)
    }

    pub fn many_to_many(name: &str, join_table: &str, fk_column: &str, member_column: &str) -> Self {
        let mut descriptor = Self::new(name, RelationKind::ManyToMany, join_table, fk_column);
        descriptor.member_column = Some(member_column.to_string());
        descriptor
    }

    pub fn with_unique_with<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_with = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_link_attributes(mut self) -> Self {
        self.has_link_attributes = true;
        self
    }
}

// ============================================================================
// ENTITY SCHEMA
// ============================================================================

/// Per-type merge configuration: table layout, mergeable fields, declared
/// relations and default strategies. Built once, registered, never mutated.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub entity_type: String,
    pub table: String,
    pub pk_column: String,
    pub fields: Vec<String>,
    pub display_fields: Vec<String>,
    /// Column feeding the LastWrite strategy (RFC 3339 text).
    pub modified_column: Option<String>,
    pub relations: Vec<RelationDescriptor>,
    pub default_field_strategies: HashMap<String, MergeStrategy>,
    /// Raw relation configuration, normalized per merge after overrides are
    /// deep-merged on top.
    pub default_relation_config: HashMap<String, Value>,
}

impl EntitySchema {
    pub fn new(entity_type: &str, table: &str) -> Self {
        EntitySchema {
            entity_type: entity_type.to_string(),
            table: table.to_string(),
            pk_column: "id".to_string(),
            fields: Vec::new(),
            display_fields: Vec::new(),
            modified_column: None,
            relations: Vec::new(),
            default_field_strategies: HashMap::new(),
            default_relation_config: HashMap::new(),
        }
    }

    pub fn with_pk_column(mut self, column: &str) -> Self {
        self.pk_column = column.to_string();
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_display_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.display_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_modified_column(mut self, column: &str) -> Self {
        self.modified_column = Some(column.to_string());
        self
    }

    pub fn with_relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn with_default_strategy(mut self, field: &str, strategy: MergeStrategy) -> Self {
        self.default_field_strategies
            .insert(field.to_string(), strategy);
        self
    }

    pub fn with_default_relation_config(mut self, relation: &str, config: Value) -> Self {
        self.default_relation_config
            .insert(relation.to_string(), config);
        self
    }

    /// Columns to read when loading a record: declared fields, the modified
    /// column, and any to-one foreign keys living on the entity table.
    pub fn load_columns(&self) -> Vec<String> {
        let mut columns = self.fields.clone();
        if let Some(modified) = &self.modified_column {
            if !columns.contains(modified) {
                columns.push(modified.clone());
            }
        }
        for relation in &self.relations {
            if relation.kind == RelationKind::ToOne && !columns.contains(&relation.fk_column) {
                columns.push(relation.fk_column.clone());
            }
        }
        columns
    }
}

// ============================================================================
// MERGEABLE TRAIT
// ============================================================================

/// The capability contract every mergeable record type satisfies.
///
/// `SchemaEntity` is the stock implementation; types that need custom
/// archival (soft-delete, external export) implement the trait directly.
pub trait Mergeable: Send + Sync {
    fn schema(&self) -> &EntitySchema;

    /// Default strategy for a field; `PreferNonNull` when none is declared.
    fn default_field_strategy(&self, field: &str) -> MergeStrategy {
        self.schema()
            .default_field_strategies
            .get(field)
            .cloned()
            .unwrap_or(MergeStrategy::PreferNonNull)
    }

    /// Raw default configuration for a relation, if any was declared.
    fn default_relation_config(&self, relation: &str) -> Option<Value> {
        self.schema().default_relation_config.get(relation).cloned()
    }

    /// Field names a calling UI should show when presenting this type.
    /// Not consulted by the engine itself.
    fn display_fields(&self) -> Vec<String> {
        let schema = self.schema();
        if schema.display_fields.is_empty() {
            schema.fields.clone()
        } else {
            schema.display_fields.clone()
        }
    }

    /// Archive hook invoked with the source record before deletion.
    /// Runs inside the merge transaction.
    fn archive(&self, conn: &Connection, source: &Record, snapshot: Option<&Value>)
        -> Result<()>;
}

/// Schema-backed implementation that archives into the `archived_records`
/// table created by `store::setup_database`.
pub struct SchemaEntity {
    schema: EntitySchema,
}

impl SchemaEntity {
    pub fn new(schema: EntitySchema) -> Self {
        SchemaEntity { schema }
    }
}

impl Mergeable for SchemaEntity {
    fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn archive(
        &self,
        conn: &Connection,
        source: &Record,
        snapshot: Option<&Value>,
    ) -> Result<()> {
        let snapshot_json = match snapshot {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        conn.execute(
            "INSERT INTO archived_records (archive_id, entity_type, source_pk, snapshot, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                source.entity_type,
                source.pk,
                snapshot_json,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }
}

// ============================================================================
// ENTITY REGISTRY
// ============================================================================

/// Registry of mergeable entity types, keyed by type identifier.
///
/// Lookups return Arc clones, so a merge in flight keeps a read-only snapshot
/// of the contract even if the registry is rebuilt afterwards.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    types: HashMap<String, Arc<dyn Mergeable>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        EntityRegistry {
            types: HashMap::new(),
        }
    }

    pub fn register(&mut self, entity: impl Mergeable + 'static) {
        let entity_type = entity.schema().entity_type.clone();
        self.types.insert(entity_type, Arc::new(entity));
    }

    /// Register a plain schema with the stock archive behavior.
    pub fn register_schema(&mut self, schema: EntitySchema) {
        self.register(SchemaEntity::new(schema));
    }

    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn Mergeable>> {
        self.types.get(entity_type).cloned()
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.types.contains_key(entity_type)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

// ============================================================================
// TESTS
// ============================================================================
