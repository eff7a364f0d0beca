//! `LocalStore`: the SQLite-backed cache and queue.
//!
//! Table access lives on [`StoreTxn`], split across files by concern the same
//! way the tables are: entities, operations, mappings, metadata.

mod entities;
mod helpers;
mod mappings;
mod metadata;
mod operations;

pub use mappings::RewriteReport;

use crate::error::{StorageError, StorageResult};
use crate::schema::initialize_schema;
use rusqlite::Connection;
use splitsync_types::{EntityId, EntityType};
use std::cell::RefCell;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A committed change, published after the transaction that made it commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Upserted {
        entity_type: EntityType,
        id: EntityId,
    },
    Removed {
        entity_type: EntityType,
        id: EntityId,
    },
    Rekeyed {
        entity_type: EntityType,
        from: EntityId,
        to: EntityId,
    },
    BalancesReplaced,
    ExchangeRatesUpdated,
    QueueChanged,
}

/// Durable local store. Cheap to clone; clones share the connection.
///
/// Assumes a single writer per database file: the mutex serializes writers
/// inside this process, nothing coordinates across processes.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<StoreChange>,
}

impl LocalStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_sqlite(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        initialize_schema(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("[LocalStore] recovering from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Runs `f` against a consistent view of the store.
    pub fn read<T, E>(&self, f: impl FnOnce(&StoreTxn<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let conn = self.lock_conn();
        let txn = StoreTxn::new(&conn);
        f(&txn)
    }

    /// Runs `f` inside one SQLite transaction.
    ///
    /// Commits if `f` returns `Ok`, rolls back otherwise. Changes recorded
    /// during `f` are broadcast only after a successful commit. The closure's
    /// error type is the caller's, so domain validation can abort the
    /// transaction too.
    pub fn write<T, E>(&self, f: impl FnOnce(&StoreTxn<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(StorageError::from)?;
        let (value, changes) = {
            let txn = StoreTxn::new(&tx);
            let value = f(&txn)?;
            (value, txn.changes.into_inner())
        };
        tx.commit().map_err(StorageError::from)?;
        drop(conn);

        for change in changes {
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
        Ok(value)
    }

    /// Subscribe to committed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// Table access within a read or a write transaction.
pub struct StoreTxn<'c> {
    conn: &'c Connection,
    changes: RefCell<Vec<StoreChange>>,
}

impl<'c> StoreTxn<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            changes: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn record(&self, change: StoreChange) {
        let mut changes = self.changes.borrow_mut();
        if !changes.contains(&change) {
            changes.push(change);
        }
    }
}
