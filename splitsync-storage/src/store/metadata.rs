//! The `sync_metadata` singleton row.

use super::StoreTxn;
use crate::error::StorageResult;
use rusqlite::params;
use splitsync_types::SyncMetadata;

impl StoreTxn<'_> {
    pub fn metadata(&self) -> StorageResult<SyncMetadata> {
        let meta = self.conn.query_row(
            "SELECT last_full_sync_at, last_partial_sync_at, sync_in_progress, drain_started_at
             FROM sync_metadata WHERE id = 1",
            [],
            |row| {
                Ok(SyncMetadata {
                    last_full_sync_at: row.get(0)?,
                    last_partial_sync_at: row.get(1)?,
                    sync_in_progress: row.get::<_, i64>(2)? != 0,
                    drain_started_at: row.get(3)?,
                })
            },
        )?;
        Ok(meta)
    }

    pub fn put_metadata(&self, meta: &SyncMetadata) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_metadata
                (id, last_full_sync_at, last_partial_sync_at, sync_in_progress, drain_started_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                meta.last_full_sync_at,
                meta.last_partial_sync_at,
                meta.sync_in_progress as i64,
                meta.drain_started_at,
            ],
        )?;
        Ok(())
    }

    /// Marks a drain as started. Returns false if one is already marked.
    pub fn begin_drain(&self, now: i64) -> StorageResult<bool> {
        let n = self.conn.execute(
            "UPDATE sync_metadata SET sync_in_progress = 1, drain_started_at = ?1
             WHERE id = 1 AND sync_in_progress = 0",
            [now],
        )?;
        Ok(n > 0)
    }

    /// Clears the drain flag, stamping `last_partial_sync_at` when the drain
    /// finished without transient failures.
    pub fn end_drain(&self, clean: bool, now: i64) -> StorageResult<()> {
        if clean {
            self.conn.execute(
                "UPDATE sync_metadata SET sync_in_progress = 0, drain_started_at = NULL,
                    last_partial_sync_at = ?1
                 WHERE id = 1",
                [now],
            )?;
        } else {
            self.conn.execute(
                "UPDATE sync_metadata SET sync_in_progress = 0, drain_started_at = NULL WHERE id = 1",
                [],
            )?;
        }
        Ok(())
    }

    /// Clears a drain flag left behind by a crashed process. Returns true if one was set.
    pub fn clear_stale_drain(&self) -> StorageResult<bool> {
        let n = self.conn.execute(
            "UPDATE sync_metadata SET sync_in_progress = 0, drain_started_at = NULL
             WHERE id = 1 AND sync_in_progress = 1",
            [],
        )?;
        Ok(n > 0)
    }

    pub fn record_full_sync(&self, now: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE sync_metadata SET last_full_sync_at = ?1 WHERE id = 1",
            [now],
        )?;
        Ok(())
    }
}
