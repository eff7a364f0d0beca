//! The durable operation queue table.

use super::helpers::{from_json, key, to_json};
use super::{StoreChange, StoreTxn};
use crate::error::StorageResult;
use rusqlite::{params, OptionalExtension, Row};
use splitsync_types::{EntityId, OperationId, OperationStatus, PendingOperation};

const SELECT_COLUMNS: &str = "SELECT seq, id, operation_json, base_version, rollback_json, created_at,
        retry_count, last_error, next_attempt_at, status
 FROM pending_operations";

struct RawOperation {
    seq: i64,
    id: String,
    operation_json: String,
    base_version: i64,
    rollback_json: Option<String>,
    created_at: i64,
    retry_count: i64,
    last_error: Option<String>,
    next_attempt_at: Option<i64>,
    status: String,
}

impl RawOperation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            operation_json: row.get(2)?,
            base_version: row.get(3)?,
            rollback_json: row.get(4)?,
            created_at: row.get(5)?,
            retry_count: row.get(6)?,
            last_error: row.get(7)?,
            next_attempt_at: row.get(8)?,
            status: row.get(9)?,
        })
    }

    fn decode(self) -> StorageResult<PendingOperation> {
        Ok(PendingOperation {
            seq: self.seq,
            id: self.id.parse()?,
            operation: from_json(&self.operation_json)?,
            base_version: self.base_version.max(0) as u64,
            rollback: self.rollback_json.as_deref().map(from_json).transpose()?,
            created_at: self.created_at,
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at,
            status: OperationStatus::parse(&self.status)?,
        })
    }
}

impl StoreTxn<'_> {
    pub(super) fn query_operations(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StorageResult<Vec<PendingOperation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, RawOperation::from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.decode()?);
        }
        Ok(out)
    }

    /// Appends an operation and assigns its `seq`.
    pub fn insert_operation(&self, op: &mut PendingOperation) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO pending_operations
                (id, op_type, entity_type, entity_id, operation_json, base_version, rollback_json,
                 created_at, retry_count, last_error, next_attempt_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                op.id.to_string(),
                op.kind().as_str(),
                op.entity_type().as_str(),
                key(op.entity_id()),
                to_json(&op.operation)?,
                op.base_version as i64,
                op.rollback.as_ref().map(to_json).transpose()?,
                op.created_at,
                op.retry_count as i64,
                op.last_error,
                op.next_attempt_at,
                op.status.as_str(),
            ],
        )?;
        op.seq = self.conn.last_insert_rowid();
        self.record(StoreChange::QueueChanged);
        Ok(())
    }

    /// Rewrites every mutable column of an existing operation. `seq` is kept.
    pub fn update_operation(&self, op: &PendingOperation) -> StorageResult<bool> {
        let n = self.conn.execute(
            "UPDATE pending_operations SET
                op_type = ?2, entity_type = ?3, entity_id = ?4, operation_json = ?5,
                base_version = ?6, rollback_json = ?7, retry_count = ?8, last_error = ?9,
                next_attempt_at = ?10, status = ?11
             WHERE id = ?1",
            params![
                op.id.to_string(),
                op.kind().as_str(),
                op.entity_type().as_str(),
                key(op.entity_id()),
                to_json(&op.operation)?,
                op.base_version as i64,
                op.rollback.as_ref().map(to_json).transpose()?,
                op.retry_count as i64,
                op.last_error,
                op.next_attempt_at,
                op.status.as_str(),
            ],
        )?;
        if n > 0 {
            self.record(StoreChange::QueueChanged);
        }
        Ok(n > 0)
    }

    pub fn get_operation(&self, id: &OperationId) -> StorageResult<Option<PendingOperation>> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                [id.to_string()],
                RawOperation::from_row,
            )
            .optional()?;
        raw.map(RawOperation::decode).transpose()
    }

    pub fn delete_operation(&self, id: &OperationId) -> StorageResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM pending_operations WHERE id = ?1", [id.to_string()])?;
        if n > 0 {
            self.record(StoreChange::QueueChanged);
        }
        Ok(n > 0)
    }

    /// The whole queue in insertion order.
    pub fn list_operations(&self) -> StorageResult<Vec<PendingOperation>> {
        self.query_operations(&format!("{SELECT_COLUMNS} ORDER BY seq"), [])
    }

    /// Operations grouped under one entity id, in insertion order.
    pub fn operations_for_entity(&self, entity_id: &EntityId) -> StorageResult<Vec<PendingOperation>> {
        self.query_operations(
            &format!("{SELECT_COLUMNS} WHERE entity_id = ?1 ORDER BY seq"),
            [key(entity_id)],
        )
    }

    pub fn operations_with_status(
        &self,
        status: OperationStatus,
    ) -> StorageResult<Vec<PendingOperation>> {
        self.query_operations(
            &format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY seq"),
            [status.as_str()],
        )
    }

    /// Count of operations per status: `(active, conflicts)` where active is
    /// anything not yet in conflict.
    pub fn count_operations(&self) -> StorageResult<(usize, usize)> {
        let (active, conflicts): (i64, i64) = self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status != 'conflict' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'conflict' THEN 1 ELSE 0 END), 0)
             FROM pending_operations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((active as usize, conflicts as usize))
    }

    /// Returns interrupted in-flight operations to `pending`. Used on startup.
    pub fn reset_processing(&self) -> StorageResult<usize> {
        let n = self.conn.execute(
            "UPDATE pending_operations SET status = 'pending' WHERE status = 'processing'",
            [],
        )?;
        if n > 0 {
            self.record(StoreChange::QueueChanged);
        }
        Ok(n)
    }
}
