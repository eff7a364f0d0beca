//! SQLite local store for splitsync.
//!
//! Provides the durable, keyed tables the offline-first engine works against:
//!
//! - Cached server entities: `users`, `groups`, `expenses`, `balances`, `exchange_rates`
//! - Engine tables: `pending_operations`, `id_mappings`, `sync_metadata`
//!
//! The store holds no business logic. Every multi-step mutation runs inside a
//! single SQLite transaction through [`LocalStore::write`], and committed
//! changes are broadcast to subscribers so views can re-render.

mod error;
mod schema;
mod store;

pub use error::{StorageError, StorageResult};
pub use schema::{initialize_schema, SCHEMA_VERSION};
pub use store::{LocalStore, RewriteReport, StoreChange, StoreTxn};

use std::path::Path;
use std::time::Duration;

/// Open a SQLite database file with the pragmas the store relies on.
///
/// WAL keeps readers from blocking the single writer; `busy_timeout` covers the
/// brief window where a previous process is still checkpointing on startup.
pub fn open_sqlite(path: &Path) -> StorageResult<rusqlite::Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}
