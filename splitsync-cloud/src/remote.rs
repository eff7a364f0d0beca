//! The remote API seam.

use crate::error::CloudResult;
use async_trait::async_trait;
use splitsync_types::{
    CachedBalance, CachedExpense, CachedGroup, CachedUser, ExchangeRate, Guest, Operation,
    OperationId,
};

/// Server representation returned for a successfully applied operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Expense(CachedExpense),
    Group(CachedGroup),
    Guest(Guest),
    /// Accepted with no body (deletes, removals).
    Empty,
}

impl ApiResponse {
    /// Canonical id assigned by the server, if the response carries one.
    pub fn server_id(&self) -> Option<i64> {
        match self {
            Self::Expense(e) => e.id.as_canonical(),
            Self::Group(g) => g.id.as_canonical(),
            Self::Guest(g) => g.id.as_canonical(),
            Self::Empty => None,
        }
    }
}

/// Everything the sync engine needs from the server.
///
/// `execute` sends one queued operation. Implementations must pass
/// `idempotency_key` along so a replay after a lost response is applied once.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn execute(
        &self,
        idempotency_key: &OperationId,
        operation: &Operation,
    ) -> CloudResult<ApiResponse>;

    async fn fetch_groups(&self) -> CloudResult<Vec<CachedGroup>>;

    async fn fetch_group_expenses(&self, group_id: i64) -> CloudResult<Vec<CachedExpense>>;

    async fn fetch_balances(&self) -> CloudResult<Vec<CachedBalance>>;

    async fn fetch_friends(&self) -> CloudResult<Vec<CachedUser>>;

    async fn fetch_exchange_rates(&self, base: &str) -> CloudResult<Vec<ExchangeRate>>;
}
