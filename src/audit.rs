// Audit Log - append-only record of every executed merge
//
// One row per successful merge, written inside the merge transaction: if the
// transaction rolls back, no row exists. Rows are never updated afterwards.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeLogEntry {
    /// Merge id (UUID).
    pub id: String,
    pub entity_type: String,
    pub source_pk: i64,
    pub target_pk: i64,
    /// Field name → { value, source_role, note } for every staged field.
    pub resolved_values: Value,
    /// Effective strategy configuration: { fields: {..}, relations: {..} }.
    pub strategy_map: Value,
    /// Null when the caller opted out of archiving.
    pub source_snapshot: Option<Value>,
    pub target_before: Value,
    pub target_after: Value,
    pub performed_by: String,
    pub executed_at: DateTime<Utc>,
}

pub fn setup_merge_log(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            merge_id TEXT UNIQUE NOT NULL,
            entity_type TEXT NOT NULL,
            source_pk INTEGER NOT NULL,
            target_pk INTEGER NOT NULL,
            resolved_values TEXT NOT NULL,
            strategy_map TEXT NOT NULL,
            source_snapshot TEXT,
            target_before TEXT NOT NULL,
            target_after TEXT NOT NULL,
            performed_by TEXT NOT NULL,
            executed_at TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_merge_log_target
         ON merge_log(entity_type, target_pk)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_merge_log_source
         ON merge_log(entity_type, source_pk)",
        [],
    )?;

    Ok(())
}

pub fn insert_merge_log(conn: &Connection, entry: &MergeLogEntry) -> Result<()> {
    let source_snapshot = match &entry.source_snapshot {
        Some(snapshot) => Some(serde_json::to_string(snapshot)?),
        None => None,
    };

    conn.execute(
        "INSERT INTO merge_log (
            merge_id, entity_type, source_pk, target_pk,
            resolved_values, strategy_map, source_snapshot,
            target_before, target_after, performed_by, executed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.id,
            entry.entity_type,
            entry.source_pk,
            entry.target_pk,
            serde_json::to_string(&entry.resolved_values)?,
            serde_json::to_string(&entry.strategy_map)?,
            source_snapshot,
            serde_json::to_string(&entry.target_before)?,
            serde_json::to_string(&entry.target_after)?,
            entry.performed_by,
            entry.executed_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

/// Merges in which a record participated (as source or target), newest first.
pub fn merge_history_for(
    conn: &Connection,
    entity_type: &str,
    pk: i64,
) -> Result<Vec<MergeLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT merge_id, entity_type, source_pk, target_pk,
                resolved_values, strategy_map, source_snapshot,
                target_before, target_after, performed_by, executed_at
         FROM merge_log
         WHERE entity_type = ?1 AND (source_pk = ?2 OR target_pk = ?2)
         ORDER BY executed_at DESC, id DESC",
    )?;

    type RawRow = (
        String,
        String,
        i64,
        i64,
        String,
        String,
        Option<String>,
        String,
        String,
        String,
        String,
    );

    let raw_rows = stmt
        .query_map(params![entity_type, pk], |row| {
            Ok::<RawRow, rusqlite::Error>((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut entries = Vec::with_capacity(raw_rows.len());
    for row in raw_rows {
        let source_snapshot = match row.6 {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        entries.push(MergeLogEntry {
            id: row.0,
            entity_type: row.1,
            source_pk: row.2,
            target_pk: row.3,
            resolved_values: serde_json::from_str(&row.4)?,
            strategy_map: serde_json::from_str(&row.5)?,
            source_snapshot,
            target_before: serde_json::from_str(&row.7)?,
            target_after: serde_json::from_str(&row.8)?,
            performed_by: row.9,
            executed_at: DateTime::parse_from_rfc3339(&row.10)?.with_timezone(&Utc),
        });
    }

    Ok(entries)
}

pub fn merge_log_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM merge_log", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_entry(source_pk: i64, target_pk: i64) -> MergeLogEntry {
        MergeLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: "contact".to_string(),
            source_pk,
            target_pk,
            resolved_values: json!({"name": {"value": "Ada", "source_role": "source"}}),
            strategy_map: json!({"fields": {"name": "last_write"}, "relations": {}}),
            source_snapshot: Some(json!({"pk": source_pk})),
            target_before: json!({"pk": target_pk, "fields": {"name": "A."}}),
            target_after: json!({"pk": target_pk, "fields": {"name": "Ada"}}),
            performed_by: "admin".to_string(),
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_query_history() {
        let conn = Connection::open_in_memory().unwrap();
        setup_merge_log(&conn).unwrap();

        insert_merge_log(&conn, &sample_entry(2, 1)).unwrap();
        insert_merge_log(&conn, &sample_entry(3, 1)).unwrap();

        assert_eq!(merge_log_count(&conn).unwrap(), 2);

        let history = merge_history_for(&conn, "contact", 1).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].target_pk, 1);
        assert_eq!(history[0].performed_by, "admin");
        assert_eq!(
            history[0].resolved_values["name"]["value"],
            json!("Ada")
        );

        // A merged-away source shows up in its own history too
        let source_history = merge_history_for(&conn, "contact", 3).unwrap();
        assert_eq!(source_history.len(), 1);
        assert_eq!(source_history[0].source_pk, 3);

        // Other types see nothing
        assert!(merge_history_for(&conn, "invoice", 1).unwrap().is_empty());
    }

    #[test]
    fn test_null_source_snapshot_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        setup_merge_log(&conn).unwrap();

        let mut entry = sample_entry(5, 4);
        entry.source_snapshot = None;
        insert_merge_log(&conn, &entry).unwrap();

        let history = merge_history_for(&conn, "contact", 4).unwrap();
        assert!(history[0].source_snapshot.is_none());
    }
}
