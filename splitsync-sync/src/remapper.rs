//! Temp-id to server-id mappings.

use crate::error::SyncResult;
use splitsync_storage::{LocalStore, RewriteReport, StorageResult, StoreTxn};
use splitsync_types::{now_millis, EntityId, EntityType, IdMapping, Operation};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct IdRemapper {
    store: LocalStore,
}

impl IdRemapper {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Records a mapping and rewrites every cached row and queued operation
    /// that mentions the temp id. Returns `None` if the temp id was already
    /// mapped; the existing mapping wins.
    pub fn record_mapping(
        &self,
        temp_id: &str,
        server_id: i64,
        entity_type: EntityType,
    ) -> SyncResult<Option<RewriteReport>> {
        Ok(self
            .store
            .write(|t| record_in(t, temp_id, server_id, entity_type, now_millis()))?)
    }

    pub fn resolve(&self, id: &EntityId) -> SyncResult<EntityId> {
        Ok(self.store.read(|t| t.resolve_id(id))?)
    }

    /// Rewrites any mapped temp ids inside `operation`. Returns how many
    /// occurrences changed.
    pub fn resolve_operation(&self, operation: &mut Operation) -> SyncResult<usize> {
        Ok(self.store.read(|t| resolve_in(t, operation))?)
    }

    pub fn mappings(&self) -> SyncResult<Vec<IdMapping>> {
        Ok(self.store.read(|t| t.list_mappings())?)
    }
}

pub(crate) fn record_in(
    t: &StoreTxn<'_>,
    temp_id: &str,
    server_id: i64,
    entity_type: EntityType,
    now: i64,
) -> StorageResult<Option<RewriteReport>> {
    let mapping = IdMapping {
        temp_id: temp_id.to_string(),
        server_id,
        entity_type,
        created_at: now,
    };
    if !t.insert_mapping(&mapping)? {
        let existing = t.get_mapping(temp_id)?.map(|m| m.server_id);
        warn!(
            temp_id,
            server_id,
            ?existing,
            "ignoring duplicate id mapping"
        );
        return Ok(None);
    }
    let report = t.rewrite_temp_id(temp_id, server_id)?;
    debug!(
        temp_id,
        server_id,
        %entity_type,
        rows = report.rows,
        operations = report.operations,
        "recorded id mapping"
    );
    Ok(Some(report))
}

pub(crate) fn resolve_in(t: &StoreTxn<'_>, operation: &mut Operation) -> StorageResult<usize> {
    let mut candidates = operation.temp_references();
    if operation.entity_id().is_temp() && !candidates.contains(operation.entity_id()) {
        candidates.push(operation.entity_id().clone());
    }
    let mut replaced = 0;
    for id in candidates {
        let Some(temp) = id.as_temp() else { continue };
        if let Some(mapping) = t.get_mapping(temp)? {
            replaced += operation.replace_id(temp, mapping.server_id)?;
        }
    }
    Ok(replaced)
}
