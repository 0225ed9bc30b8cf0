// Demo binary: seed two duplicate contacts, preview the merge, run it for
// real, and print the audit trail.

use anyhow::Result;
use rusqlite::Connection;
use serde_json::json;

use record_merge::{
    merge_history_for, setup_database, EntityRegistry, EntitySchema, MergeEngine, MergeOptions,
    MergeOverrides, MergeStrategy, RecordRef, RelationDescriptor,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "record_merge=info".into()),
        )
        .init();

    println!("🔀 Record Merge Engine v{}", record_merge::VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut conn = Connection::open_in_memory()?;
    setup_database(&conn)?;
    seed(&conn)?;

    let mut registry = EntityRegistry::new();
    registry.register_schema(contact_schema());
    let engine = MergeEngine::new(registry);

    let source = RecordRef::new("contact", 2);
    let target = RecordRef::new("contact", 1);

    // 1. Preview
    println!("\n🔍 Dry run: contact #2 → contact #1");
    let preview = engine.merge(&mut conn, &source, &target, &MergeOptions::default().dry_run())?;
    for (field, entry) in &preview.resolved_fields {
        println!("  {} ← {} (from {})", field, entry["value"], entry["source_role"]);
    }
    for (relation, outcome) in &preview.relation_actions {
        println!(
            "  {relation}: {} (updated {}, added {}, skipped {}, deleted {})",
            outcome.action, outcome.updated, outcome.added, outcome.skipped, outcome.deleted
        );
    }

    // 2. Execute
    println!("\n💾 Executing merge...");
    let options = MergeOptions::default()
        .performed_by("demo")
        .with_overrides(MergeOverrides::new().with_field("email", json!("prefer_non_null")));
    let result = engine.merge(&mut conn, &source, &target, &options)?;
    println!(
        "✓ Merge {} committed: {} fields resolved, {} relation changes",
        result.merge_id.as_deref().unwrap_or("-"),
        result.fields_changed(),
        result.relation_changes()
    );

    // 3. Audit trail
    println!("\n📜 Merge history for contact #1:");
    for entry in merge_history_for(&conn, "contact", 1)? {
        println!(
            "  {} | #{} → #{} by {} at {}",
            entry.id,
            entry.source_pk,
            entry.target_pk,
            entry.performed_by,
            entry.executed_at.to_rfc3339()
        );
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Done");
    Ok(())
}

fn contact_schema() -> EntitySchema {
    EntitySchema::new("contact", "contacts")
        .with_fields(["name", "email", "notes"])
        .with_display_fields(["name", "email"])
        .with_modified_column("modified_at")
        .with_relation(
            RelationDescriptor::one_to_many("phones", "phone_numbers", "contact_id")
                .with_unique_with(["number"]),
        )
        .with_relation(RelationDescriptor::many_to_many(
            "tags",
            "contact_tags",
            "contact_id",
            "tag_id",
        ))
        .with_default_strategy("name", MergeStrategy::LastWrite)
        .with_default_strategy("notes", MergeStrategy::ConcatText)
        .with_default_relation_config(
            "phones",
            json!({"action": "reassign", "deduplicate": true}),
        )
}

fn seed(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE contacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT,
            notes TEXT,
            modified_at TEXT
        );
        CREATE TABLE phone_numbers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id INTEGER NOT NULL,
            number TEXT NOT NULL
        );
        CREATE TABLE contact_tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id INTEGER NOT NULL,
            tag_id INTEGER NOT NULL
        );
        INSERT INTO contacts (name, email, notes, modified_at) VALUES
            ('A. Lovelace', NULL, 'prefers morning calls', '2025-01-01T00:00:00Z'),
            ('Ada Lovelace', 'ada@example.com', 'met at conference', '2025-06-01T00:00:00Z');
        INSERT INTO phone_numbers (contact_id, number) VALUES
            (1, '555-0100'), (2, '555-0100'), (2, '555-0199');
        INSERT INTO contact_tags (contact_id, tag_id) VALUES
            (1, 10), (2, 10), (2, 30);",
    )?;
    Ok(())
}
