//! Sync engine configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay before the first retry of a transient failure.
    pub backoff_base_ms: u64,
    /// Upper bound on any single backoff delay.
    pub backoff_cap_ms: u64,
    /// Transient failures tolerated before an operation goes to conflict.
    pub max_retries: u32,
    /// How often the monitor drains while online.
    pub poll_interval_secs: u64,
    /// Currencies whose exchange rates are refreshed on a full sync.
    pub exchange_rate_bases: Vec<String>,
    /// Pull every cached table after a drain that leaves the queue empty.
    pub pull_after_drain: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            max_retries: 8,
            poll_interval_secs: 30,
            exchange_rate_bases: Vec::new(),
            pull_after_drain: true,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> SyncResult<()> {
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(SyncError::Config(format!(
                "backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        if self.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(SyncError::Config("poll_interval_secs must be non-zero".into()));
        }
        if let Some(bad) = self
            .exchange_rate_bases
            .iter()
            .find(|c| c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_uppercase()))
        {
            return Err(SyncError::Config(format!("invalid currency code: {bad}")));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
