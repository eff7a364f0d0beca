//! Id mappings and temp-id rewriting.

use super::helpers::{key, mentions_pattern};
use super::{StoreChange, StoreTxn};
use crate::error::StorageResult;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use splitsync_types::{
    replace_id_in_json, CachedBalance, CachedExpense, CachedGroup, EntityId, EntityType, IdMapping,
};

/// What a temp-id rewrite touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteReport {
    /// Cached rows (groups, expenses, balances) rewritten.
    pub rows: usize,
    /// Queued operations rewritten (payload, rollback, or grouping key).
    pub operations: usize,
}

impl StoreTxn<'_> {
    /// Records a mapping. Mappings are write-once: returns false if `temp_id`
    /// was already mapped, leaving the existing mapping untouched.
    pub fn insert_mapping(&self, mapping: &IdMapping) -> StorageResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO id_mappings (temp_id, server_id, entity_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                mapping.temp_id,
                mapping.server_id,
                mapping.entity_type.as_str(),
                mapping.created_at,
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_mapping(&self, temp_id: &str) -> StorageResult<Option<IdMapping>> {
        let raw: Option<(String, i64, String, i64)> = self
            .conn
            .query_row(
                "SELECT temp_id, server_id, entity_type, created_at FROM id_mappings WHERE temp_id = ?1",
                [temp_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        raw.map(|(temp_id, server_id, entity_type, created_at)| {
            Ok(IdMapping {
                temp_id,
                server_id,
                entity_type: EntityType::parse(&entity_type)?,
                created_at,
            })
        })
        .transpose()
    }

    pub fn list_mappings(&self) -> StorageResult<Vec<IdMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT temp_id, server_id, entity_type, created_at FROM id_mappings ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (temp_id, server_id, entity_type, created_at) = row?;
            out.push(IdMapping {
                temp_id,
                server_id,
                entity_type: EntityType::parse(&entity_type)?,
                created_at,
            });
        }
        Ok(out)
    }

    /// Resolves a temp id through the mapping table. Canonical ids and
    /// unmapped temp ids come back unchanged.
    pub fn resolve_id(&self, id: &EntityId) -> StorageResult<EntityId> {
        match id.as_temp() {
            Some(temp) => Ok(self
                .get_mapping(temp)?
                .map(|m| EntityId::Canonical(m.server_id))
                .unwrap_or_else(|| id.clone())),
            None => Ok(id.clone()),
        }
    }

    fn mentioning(&self, sql: &str, temp_id: &str) -> StorageResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![temp_id, mentions_pattern(temp_id)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replaces every reference to `temp_id` with `server_id` across cached
    /// rows and queued operations, re-keying rows whose primary key was the
    /// temp id. Must run in the same transaction as the mapping insert.
    pub fn rewrite_temp_id(&self, temp_id: &str, server_id: i64) -> StorageResult<RewriteReport> {
        let mut report = RewriteReport::default();
        let mut balances_changed = false;
        let from = EntityId::Temp(temp_id.to_string());
        let to = EntityId::Canonical(server_id);

        for (old_key, raw) in self.mentioning(
            "SELECT id, data_json FROM groups WHERE id = ?1 OR data_json LIKE ?2",
            temp_id,
        )? {
            let mut value: Value = serde_json::from_str(&raw)?;
            if replace_id_in_json(&mut value, temp_id, server_id) == 0 {
                continue;
            }
            let group: CachedGroup = serde_json::from_value(value)?;
            if key(&group.id) != old_key {
                self.conn
                    .execute("DELETE FROM groups WHERE id = ?1", [&old_key])?;
                self.record(StoreChange::Rekeyed {
                    entity_type: EntityType::Group,
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            self.put_group(&group)?;
            report.rows += 1;
        }

        for (old_key, raw) in self.mentioning(
            "SELECT id, data_json FROM expenses WHERE id = ?1 OR data_json LIKE ?2",
            temp_id,
        )? {
            let mut value: Value = serde_json::from_str(&raw)?;
            if replace_id_in_json(&mut value, temp_id, server_id) == 0 {
                continue;
            }
            let expense: CachedExpense = serde_json::from_value(value)?;
            if key(&expense.id) != old_key {
                self.conn
                    .execute("DELETE FROM expenses WHERE id = ?1", [&old_key])?;
                self.record(StoreChange::Rekeyed {
                    entity_type: EntityType::Expense,
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            self.put_expense(&expense)?;
            report.rows += 1;
        }

        for (old_key, raw) in self.mentioning(
            "SELECT key, data_json FROM balances WHERE key = ?1 OR data_json LIKE ?2",
            temp_id,
        )? {
            let mut value: Value = serde_json::from_str(&raw)?;
            if replace_id_in_json(&mut value, temp_id, server_id) == 0 {
                continue;
            }
            let balance: CachedBalance = serde_json::from_value(value)?;
            self.conn
                .execute("DELETE FROM balances WHERE key = ?1", [&old_key])?;
            self.put_balance(&balance)?;
            balances_changed = true;
            report.rows += 1;
        }

        let pattern = mentions_pattern(temp_id);
        let ops = {
            let sql = "SELECT seq, id, operation_json, base_version, rollback_json, created_at,
                        retry_count, last_error, next_attempt_at, status
                 FROM pending_operations
                 WHERE entity_id = ?1 OR operation_json LIKE ?2 OR rollback_json LIKE ?2
                 ORDER BY seq";
            self.query_operations(sql, params![temp_id, pattern])?
        };
        for mut op in ops {
            let mut replaced = op.operation.replace_id(temp_id, server_id)?;
            if let Some(rollback) = op.rollback.as_mut() {
                replaced += rollback.replace_id(temp_id, server_id)?;
            }
            if replaced > 0 {
                self.update_operation(&op)?;
                report.operations += 1;
            }
        }

        if balances_changed {
            self.record(StoreChange::BalancesReplaced);
        }
        Ok(report)
    }
}
