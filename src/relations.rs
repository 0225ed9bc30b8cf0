// Relation Executor - applies a normalized directive to one relation
//
// Uniqueness conflicts are data, not failures: colliding rows are counted in
// the outcome (deleted or skipped per the directive's policy) and never turn
// into errors. Every path honors dry_run by computing counts from SELECTs
// and issuing zero writes.

use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::directive::{RelationAction, RelationDirective};
use crate::entity::{Record, RelationDescriptor, RelationKind};
use crate::error::{MergeError, Result};
use crate::strategy::{resolve_relation_members, CallbackRegistry, ResolveContext};

pub const REASON_TARGET_HAS_RELATION: &str = "target_has_relation";
pub const REASON_UNIQUENESS_CONFLICT: &str = "uniqueness_conflict";

// ============================================================================
// OUTCOME
// ============================================================================

/// What happened to one relation during a merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationOutcome {
    pub action: String,
    /// Rows repointed from source to target.
    pub updated: usize,
    /// Memberships added to the target.
    pub added: usize,
    /// Rows left untouched (collisions, refusals, duplicates).
    pub skipped: usize,
    /// Rows removed (conflict deletion, membership replacement).
    pub deleted: usize,
    pub reason: Option<String>,
}

impl RelationOutcome {
    pub fn new(action: &str) -> Self {
        RelationOutcome {
            action: action.to_string(),
            updated: 0,
            added: 0,
            skipped: 0,
            deleted: 0,
            reason: None,
        }
    }

    pub fn skip() -> Self {
        Self::new("skip")
    }

    pub fn total_changes(&self) -> usize {
        self.updated + self.added + self.deleted
    }
}

/// Everything a custom relation callback gets to work with. Mutations made
/// through `conn` run inside the merge transaction; callbacks must respect
/// `dry_run`.
pub struct RelationContext<'a> {
    pub conn: &'a Connection,
    pub relation: &'a RelationDescriptor,
    pub source: &'a Record,
    pub target: &'a Record,
    pub dry_run: bool,
    pub options: &'a Map<String, Value>,
}

// ============================================================================
// EXECUTOR
// ============================================================================

pub struct RelationExecutor<'a> {
    conn: &'a Connection,
    callbacks: &'a CallbackRegistry,
    /// Primary key column of the entity table, used when a to-one foreign
    /// key is updated in place.
    pk_column: &'a str,
}

impl<'a> RelationExecutor<'a> {
    pub fn new(conn: &'a Connection, callbacks: &'a CallbackRegistry, pk_column: &'a str) -> Self {
        RelationExecutor {
            conn,
            callbacks,
            pk_column,
        }
    }

    pub fn apply(
        &self,
        directive: &RelationDirective,
        relation: &RelationDescriptor,
        source: &Record,
        target: &Record,
        ctx: ResolveContext,
        dry_run: bool,
    ) -> Result<RelationOutcome> {
        match &directive.action {
            RelationAction::Skip => Ok(RelationOutcome::skip()),
            RelationAction::Reassign => {
                self.reassign(directive, relation, source, target, dry_run)
            }
            RelationAction::Merge => self.merge_members(relation, source, target, dry_run),
            RelationAction::Strategy(strategy) => self.apply_strategy(
                strategy, directive, relation, source, target, ctx, dry_run,
            ),
            RelationAction::Custom(name) => {
                self.custom(name, directive, relation, source, target, dry_run)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reassign
    // ------------------------------------------------------------------------

    fn reassign(
        &self,
        directive: &RelationDirective,
        relation: &RelationDescriptor,
        source: &Record,
        target: &Record,
        dry_run: bool,
    ) -> Result<RelationOutcome> {
        let mut outcome = RelationOutcome::new("reassign");

        match relation.kind {
            RelationKind::ToOne => {
                let target_holds = !target.get_or_null(&relation.fk_column).is_null();
                let source_value = source.get_or_null(&relation.fk_column);

                if source_value.is_null() {
                    // Nothing to carry over
                } else if target_holds {
                    outcome.skipped = 1;
                    outcome.reason = Some(REASON_TARGET_HAS_RELATION.to_string());
                } else {
                    if !dry_run {
                        let sql = format!(
                            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                            relation.table, relation.fk_column, self.pk_column
                        );
                        self.conn.execute(
                            &sql,
                            rusqlite::params![crate::store::sql_from_json(&source_value), target.pk],
                        )?;
                    }
                    outcome.updated = 1;
                }
            }

            RelationKind::OneToOne => {
                let target_held = self.count_rows(relation, target.pk)?;
                let source_held = self.count_rows(relation, source.pk)?;

                if target_held > 0 {
                    // Refuse to orphan the target's existing related record
                    outcome.skipped = source_held;
                    if source_held > 0 {
                        outcome.reason = Some(REASON_TARGET_HAS_RELATION.to_string());
                    }
                } else {
                    outcome.updated = self.repoint_all(relation, source.pk, target.pk, dry_run)?;
                }
            }

            RelationKind::OneToMany => {
                if directive.deduplicate() {
                    self.reassign_deduplicated(
                        directive,
                        relation,
                        source.pk,
                        target.pk,
                        dry_run,
                        &mut outcome,
                    )?;
                } else {
                    outcome.updated = self.repoint_all(relation, source.pk, target.pk, dry_run)?;
                }
            }

            RelationKind::ManyToMany => {
                return Err(MergeError::configuration(
                    &relation.name,
                    "reassign is not valid for many-to-many relations",
                ));
            }
        }

        Ok(outcome)
    }

    /// Dedup-aware reassign for reverse-to-many relations: rows whose
    /// `unique_with` columns would collide with an existing target-side row
    /// are deleted or skipped; the rest are repointed.
    fn reassign_deduplicated(
        &self,
        directive: &RelationDirective,
        relation: &RelationDescriptor,
        source_pk: i64,
        target_pk: i64,
        dry_run: bool,
        outcome: &mut RelationOutcome,
    ) -> Result<()> {
        if relation.unique_with.is_empty() {
            return Err(MergeError::configuration(
                &relation.name,
                "deduplicate requested but no uniqueness constraint declared (unique_with)",
            ));
        }

        let select = format!(
            "SELECT rowid, {} FROM {} WHERE {} = ?1 ORDER BY rowid",
            relation.unique_with.join(", "),
            relation.table,
            relation.fk_column
        );
        let mut stmt = self.conn.prepare(&select)?;
        let source_rows = stmt
            .query_map([source_pk], |row| {
                let rowid: i64 = row.get(0)?;
                let mut values = Vec::with_capacity(relation.unique_with.len());
                for index in 0..relation.unique_with.len() {
                    values.push(row.get::<_, SqlValue>(index + 1)?);
                }
                Ok((rowid, values))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // NULL-safe comparison via IS, so NULL unique columns collide with NULL
        let collision_check = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1 AND {}",
            relation.table,
            relation.fk_column,
            relation
                .unique_with
                .iter()
                .enumerate()
                .map(|(index, column)| format!("{} IS ?{}", column, index + 2))
                .collect::<Vec<_>>()
                .join(" AND ")
        );

        let delete_conflicts = directive.delete_conflicts();
        let mut keep = Vec::new();

        for (rowid, values) in source_rows {
            let mut bindings = vec![SqlValue::Integer(target_pk)];
            bindings.extend(values);
            let collisions: i64 = self.conn.query_row(
                &collision_check,
                rusqlite::params_from_iter(bindings),
                |row| row.get(0),
            )?;

            if collisions > 0 {
                if delete_conflicts {
                    if !dry_run {
                        let sql = format!("DELETE FROM {} WHERE rowid = ?1", relation.table);
                        self.conn.execute(&sql, [rowid])?;
                    }
                    outcome.deleted += 1;
                } else {
                    outcome.skipped += 1;
                    outcome.reason = Some(REASON_UNIQUENESS_CONFLICT.to_string());
                }
            } else {
                keep.push(rowid);
            }
        }

        if !keep.is_empty() {
            if !dry_run {
                let sql = format!(
                    "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
                    relation.table, relation.fk_column
                );
                let mut update = self.conn.prepare(&sql)?;
                for rowid in &keep {
                    update.execute(rusqlite::params![target_pk, rowid])?;
                }
            }
            outcome.updated = keep.len();
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Merge (many-to-many)
    // ------------------------------------------------------------------------

    /// Set-difference merge: source members absent from the target are
    /// repointed (preserving any link attributes); colliding links are
    /// dropped, the target-side link wins.
    fn merge_members(
        &self,
        relation: &RelationDescriptor,
        source: &Record,
        target: &Record,
        dry_run: bool,
    ) -> Result<RelationOutcome> {
        if relation.kind != RelationKind::ManyToMany {
            return Err(MergeError::configuration(
                &relation.name,
                format!(
                    "merge is only valid for many-to-many relations, not {}",
                    relation.kind.as_str()
                ),
            ));
        }
        let member_column = self.member_column(relation)?;
        let mut outcome = RelationOutcome::new("merge");

        let mut target_members: HashSet<i64> = self
            .member_ids(relation, member_column, target.pk)?
            .into_iter()
            .collect();
        let source_links = self.member_links(relation, member_column, source.pk)?;

        for (rowid, member) in source_links {
            if target_members.contains(&member) {
                if !dry_run {
                    let sql = format!("DELETE FROM {} WHERE rowid = ?1", relation.table);
                    self.conn.execute(&sql, [rowid])?;
                }
                outcome.skipped += 1;
            } else {
                if !dry_run {
                    let sql = format!(
                        "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
                        relation.table, relation.fk_column
                    );
                    self.conn.execute(&sql, rusqlite::params![target.pk, rowid])?;
                }
                target_members.insert(member);
                outcome.added += 1;
            }
        }

        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Strategy-driven membership replacement (many-to-many)
    // ------------------------------------------------------------------------

    fn apply_strategy(
        &self,
        strategy: &crate::strategy::MergeStrategy,
        directive: &RelationDirective,
        relation: &RelationDescriptor,
        source: &Record,
        target: &Record,
        ctx: ResolveContext,
        dry_run: bool,
    ) -> Result<RelationOutcome> {
        // The normalizer guarantees the shape, but custom directives can be
        // constructed by hand
        if relation.kind != RelationKind::ManyToMany {
            return Err(MergeError::configuration(
                &relation.name,
                "strategy directives are only valid for many-to-many relations",
            ));
        }
        let member_column = self.member_column(relation)?;
        let mut outcome = RelationOutcome::new("strategy");

        let target_ids = self.member_ids(relation, member_column, target.pk)?;
        let source_ids = self.member_ids(relation, member_column, source.pk)?;

        let Some(desired) = resolve_relation_members(
            strategy,
            &relation.name,
            &source_ids,
            &target_ids,
            ctx,
            self.callbacks,
            &directive.options,
        )?
        else {
            // Target membership stands; source links are dropped with the
            // source record
            let leftovers = self.count_rows(relation, source.pk)?;
            if !dry_run && leftovers > 0 {
                self.delete_links(relation, source.pk)?;
            }
            outcome.deleted = leftovers;
            return Ok(outcome);
        };

        let desired_set: HashSet<i64> = desired.iter().copied().collect();
        let target_set: HashSet<i64> = target_ids.iter().copied().collect();
        let source_links = self.member_links(relation, member_column, source.pk)?;

        // Drop target links the strategy voted out
        for member in &target_ids {
            if !desired_set.contains(member) {
                if !dry_run {
                    let sql = format!(
                        "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
                        relation.table, relation.fk_column, member_column
                    );
                    self.conn
                        .execute(&sql, rusqlite::params![target.pk, member])?;
                }
                outcome.deleted += 1;
            }
        }

        // Bring in new members, reusing the source's link row when one exists
        for member in &desired {
            if target_set.contains(member) {
                continue;
            }
            let source_row = source_links
                .iter()
                .find(|(_, linked)| linked == member)
                .map(|(rowid, _)| *rowid);
            if !dry_run {
                match source_row {
                    Some(rowid) => {
                        let sql = format!(
                            "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
                            relation.table, relation.fk_column
                        );
                        self.conn.execute(&sql, rusqlite::params![target.pk, rowid])?;
                    }
                    None => {
                        let sql = format!(
                            "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
                            relation.table, relation.fk_column, member_column
                        );
                        self.conn
                            .execute(&sql, rusqlite::params![target.pk, member])?;
                    }
                }
            }
            outcome.added += 1;
        }

        // Source links not carried over are removed with the source
        for (rowid, member) in &source_links {
            let moved = desired_set.contains(member) && !target_set.contains(member);
            if !moved {
                if !dry_run {
                    let sql = format!("DELETE FROM {} WHERE rowid = ?1", relation.table);
                    self.conn.execute(&sql, [rowid])?;
                }
                outcome.deleted += 1;
            }
        }

        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Custom
    // ------------------------------------------------------------------------

    fn custom(
        &self,
        name: &str,
        directive: &RelationDirective,
        relation: &RelationDescriptor,
        source: &Record,
        target: &Record,
        dry_run: bool,
    ) -> Result<RelationOutcome> {
        let Some(callback) = self.callbacks.relation(name) else {
            return Err(MergeError::configuration(
                &relation.name,
                format!("callback '{name}' is not registered"),
            ));
        };

        let context = RelationContext {
            conn: self.conn,
            relation,
            source,
            target,
            dry_run,
            options: &directive.options,
        };

        Ok(callback(&context)?.unwrap_or_else(|| RelationOutcome::new("custom")))
    }

    // ------------------------------------------------------------------------
    // Shared SQL helpers
    // ------------------------------------------------------------------------

    fn member_column<'r>(&self, relation: &'r RelationDescriptor) -> Result<&'r str> {
        relation.member_column.as_deref().ok_or_else(|| {
            MergeError::configuration(&relation.name, "many-to-many relation needs a member column")
        })
    }

    fn count_rows(&self, relation: &RelationDescriptor, pk: i64) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            relation.table, relation.fk_column
        );
        let count: i64 = self.conn.query_row(&sql, [pk], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn repoint_all(
        &self,
        relation: &RelationDescriptor,
        source_pk: i64,
        target_pk: i64,
        dry_run: bool,
    ) -> Result<usize> {
        if dry_run {
            return self.count_rows(relation, source_pk);
        }
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            relation.table, relation.fk_column, relation.fk_column
        );
        Ok(self
            .conn
            .execute(&sql, rusqlite::params![target_pk, source_pk])?)
    }

    fn member_ids(
        &self,
        relation: &RelationDescriptor,
        member_column: &str,
        pk: i64,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY rowid",
            member_column, relation.table, relation.fk_column
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([pk], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn member_links(
        &self,
        relation: &RelationDescriptor,
        member_column: &str,
        pk: i64,
    ) -> Result<Vec<(i64, i64)>> {
        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE {} = ?1 ORDER BY rowid",
            member_column, relation.table, relation.fk_column
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let links = stmt
            .query_map([pk], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(links)
    }

    fn delete_links(&self, relation: &RelationDescriptor, pk: i64) -> Result<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            relation.table, relation.fk_column
        );
        Ok(self.conn.execute(&sql, [pk])?)
    }
}

// ============================================================================
// TESTS
// ============================================================================
