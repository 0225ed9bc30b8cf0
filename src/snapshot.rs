// Snapshot Serializer - JSON-safe point-in-time view of a record
//
// Captures fields from the in-memory record and relation memberships from
// the store, so the snapshot reflects whatever the enclosing transaction can
// see at the moment of capture.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::entity::{EntitySchema, Record, RelationKind};
use crate::error::Result;
use crate::store::json_from_sql;

/// Capture a record's fields and relation memberships.
///
/// Relation views: to-one → the referenced pk (or null), reverse kinds → the
/// related row ids, many-to-many → the member ids.
pub fn capture(conn: &Connection, schema: &EntitySchema, record: &Record) -> Result<Value> {
    let mut relations = Map::new();

    for relation in &schema.relations {
        let view = match relation.kind {
            RelationKind::ToOne => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} = ?1",
                    relation.fk_column, relation.table, schema.pk_column
                );
                conn.query_row(&sql, [record.pk], |row| {
                    row.get_ref(0).map(json_from_sql)
                })?
            }
            RelationKind::OneToOne | RelationKind::OneToMany => {
                let sql = format!(
                    "SELECT rowid FROM {} WHERE {} = ?1 ORDER BY rowid",
                    relation.table, relation.fk_column
                );
                id_list(conn, &sql, record.pk)?
            }
            RelationKind::ManyToMany => {
                let member = relation.member_column.as_deref().unwrap_or("rowid");
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} = ?1 ORDER BY rowid",
                    member, relation.table, relation.fk_column
                );
                id_list(conn, &sql, record.pk)?
            }
        };
        relations.insert(relation.name.clone(), view);
    }

    Ok(serde_json::json!({
        "entity_type": record.entity_type,
        "pk": record.pk,
        "fields": record.fields,
        "relations": relations,
        "captured_at": Utc::now().to_rfc3339(),
    }))
}

fn id_list(conn: &Connection, sql: &str, pk: i64) -> Result<Value> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([pk], |row| row.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Value::from(ids))
}
