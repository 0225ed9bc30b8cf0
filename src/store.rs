// Store boundary - generic record access over SQLite
//
// The engine owns only two tables (merge_log, archived_records); the entity
// tables themselves belong to the caller and are reached through the
// EntitySchema descriptors. Field values cross the boundary as JSON values.

use std::collections::HashMap;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::Value;

use crate::entity::{EntitySchema, Record};
use crate::error::Result;

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    crate::audit::setup_merge_log(conn)?;

    // ==========================================================================
    // Archived Records Table (default archive hook target)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS archived_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            archive_id TEXT UNIQUE NOT NULL,
            entity_type TEXT NOT NULL,
            source_pk INTEGER NOT NULL,
            snapshot TEXT,
            archived_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_archived_entity
         ON archived_records(entity_type, source_pk)",
        [],
    )?;

    Ok(())
}

/// Load one record by primary key; `None` when it does not exist.
pub fn load_record(conn: &Connection, schema: &EntitySchema, pk: i64) -> Result<Option<Record>> {
    let columns = schema.load_columns();
    if columns.is_empty() {
        // Still confirm existence so validation can distinguish missing pks
        return Ok(record_exists(conn, schema, pk)?.then(|| Record {
            entity_type: schema.entity_type.clone(),
            pk,
            fields: HashMap::new(),
        }));
    }

    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        columns.join(", "),
        schema.table,
        schema.pk_column
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([pk])?;

    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let mut fields = HashMap::new();
    for (index, name) in columns.iter().enumerate() {
        fields.insert(name.clone(), json_from_sql(row.get_ref(index)?));
    }

    Ok(Some(Record {
        entity_type: schema.entity_type.clone(),
        pk,
        fields,
    }))
}

/// Persist staged field changes in a single UPDATE. Returns the number of
/// rows touched (0 or 1).
pub fn persist_fields(
    conn: &Connection,
    schema: &EntitySchema,
    pk: i64,
    changes: &HashMap<String, Value>,
) -> Result<usize> {
    if changes.is_empty() {
        return Ok(0);
    }

    let mut assignments = Vec::with_capacity(changes.len());
    let mut bindings: Vec<SqlValue> = Vec::with_capacity(changes.len() + 1);
    for (index, (name, value)) in changes.iter().enumerate() {
        assignments.push(format!("{} = ?{}", name, index + 1));
        bindings.push(sql_from_json(value));
    }
    bindings.push(SqlValue::Integer(pk));

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        schema.table,
        assignments.join(", "),
        schema.pk_column,
        changes.len() + 1
    );

    Ok(conn.execute(&sql, rusqlite::params_from_iter(bindings))?)
}

pub fn record_exists(conn: &Connection, schema: &EntitySchema, pk: i64) -> Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} = ?1",
        schema.table, schema.pk_column
    );
    let count: i64 = conn.query_row(&sql, [pk], |row| row.get(0))?;
    Ok(count > 0)
}

pub fn delete_record(conn: &Connection, schema: &EntitySchema, pk: i64) -> Result<usize> {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?1",
        schema.table, schema.pk_column
    );
    Ok(conn.execute(&sql, [pk])?)
}

// ============================================================================
// VALUE CONVERSION
// ============================================================================

pub(crate) fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|byte| format!("{byte:02x}")).collect())
        }
    }
}

pub(crate) fn sql_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(*flag as i64),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or(0.0)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        // Structured values are stored as JSON text
        other => SqlValue::Text(other.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
