//! Row decoding helpers.

use crate::error::StorageResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use splitsync_types::EntityId;

/// Primary-key text for an entity id (`"42"` or `"temp_…"`).
pub(super) fn key(id: &EntityId) -> String {
    id.to_string()
}

pub(super) fn to_json<T: Serialize>(value: &T) -> StorageResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub(super) fn from_json<T: DeserializeOwned>(raw: &str) -> StorageResult<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Decode a column of JSON documents.
pub(super) fn collect_json<T: DeserializeOwned>(
    rows: impl Iterator<Item = rusqlite::Result<String>>,
) -> StorageResult<Vec<T>> {
    let mut out = Vec::new();
    for raw in rows {
        out.push(from_json(&raw?)?);
    }
    Ok(out)
}

/// `LIKE` pattern matching a JSON document that mentions `id` as a string.
pub(super) fn mentions_pattern(id: &str) -> String {
    format!("%\"{id}\"%")
}
