//! Offline-first sync engine for splitsync.
//!
//! This crate ties the local store and the remote API together:
//! - [`EntityRepository`]: cache reads and optimistic, queued writes
//! - [`OperationQueue`]: durable per-entity FIFO of unconfirmed mutations
//! - [`IdRemapper`]: temp id to server id mappings and rewriting
//! - [`SyncOrchestrator`]: drains the queue, applies responses, pulls refreshes
//! - [`ConnectivityMonitor`]: decides when to drain
//! - [`SyncEngine`]: the service object hosts construct and own

pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod queue;
pub mod remapper;
pub mod repository;
pub mod validation;

pub use config::SyncConfig;
pub use connectivity::{ConnectivityHandle, ConnectivityMonitor, SyncTrigger};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use orchestrator::{DrainReport, DrainState, FullSyncReport, SyncOrchestrator};
pub use queue::{EnqueueOutcome, OperationQueue, DEPENDENCY_ERROR_PREFIX};
pub use remapper::IdRemapper;
pub use repository::{CachedEntity, EntityRepository, Mutation, WriteOutcome};
pub use validation::{SplitValidator, SumSplitValidator};
