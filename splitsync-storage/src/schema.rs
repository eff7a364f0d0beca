//! DDL for the local store.

use crate::error::StorageResult;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

/// Cached server entities. Rows keep the full JSON shape in `data_json`;
/// indexed columns exist only for lookups.
const ENTITY_TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    data_json TEXT NOT NULL,
    cached_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
    id TEXT PRIMARY KEY,
    data_json TEXT NOT NULL,
    is_temp INTEGER NOT NULL DEFAULT 0,
    sync_state TEXT NOT NULL DEFAULT 'confirmed',
    local_version INTEGER NOT NULL DEFAULT 0,
    cached_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS expenses (
    id TEXT PRIMARY KEY,
    group_id TEXT,
    data_json TEXT NOT NULL,
    is_temp INTEGER NOT NULL DEFAULT 0,
    sync_state TEXT NOT NULL DEFAULT 'confirmed',
    local_version INTEGER NOT NULL DEFAULT 0,
    expense_date TEXT NOT NULL,
    cached_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_expenses_group ON expenses(group_id, expense_date);

CREATE TABLE IF NOT EXISTS balances (
    key TEXT PRIMARY KEY,
    group_id TEXT,
    data_json TEXT NOT NULL,
    cached_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_balances_group ON balances(group_id);

CREATE TABLE IF NOT EXISTS exchange_rates (
    base TEXT NOT NULL,
    quote TEXT NOT NULL,
    rate REAL NOT NULL,
    fetched_at INTEGER NOT NULL,
    PRIMARY KEY (base, quote)
);
"#;

/// Engine-internal tables.
const ENGINE_TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS pending_operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    op_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation_json TEXT NOT NULL,
    base_version INTEGER NOT NULL DEFAULT 0,
    rollback_json TEXT,
    created_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at INTEGER,
    status TEXT NOT NULL DEFAULT 'pending'
);
CREATE INDEX IF NOT EXISTS idx_pending_entity ON pending_operations(entity_id, seq);
CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_operations(status);

CREATE TABLE IF NOT EXISTS id_mappings (
    temp_id TEXT PRIMARY KEY,
    server_id INTEGER NOT NULL,
    entity_type TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_metadata (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_full_sync_at INTEGER,
    last_partial_sync_at INTEGER,
    sync_in_progress INTEGER NOT NULL DEFAULT 0,
    drain_started_at INTEGER
);
INSERT OR IGNORE INTO sync_metadata (id, sync_in_progress) VALUES (1, 0);
"#;

const SCHEMA_VERSION_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
"#;

/// Create every table if missing and stamp the schema version.
pub fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(SCHEMA_VERSION_DDL)?;
    conn.execute_batch(ENTITY_TABLES_DDL)?;
    conn.execute_batch(ENGINE_TABLES_DDL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, strftime('%s','now'))",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}
