//! Remote API access for splitsync.
//!
//! - [`RemoteApi`]: the seam the sync engine drains the queue through
//! - [`HttpApiClient`]: reqwest implementation with bearer auth, refresh-on-401
//!   and per-operation idempotency keys
//! - [`TokenProvider`]: the external auth collaborator
//! - [`CloudError::class`]: transient / rejected / unauthorized classification

pub mod api_client;
pub mod auth;
pub mod config;
pub mod error;
pub mod remote;

pub use api_client::HttpApiClient;
pub use auth::{StaticTokenProvider, TokenProvider};
pub use config::CloudConfig;
pub use error::{CloudError, CloudResult, FailureClass};
pub use remote::{ApiResponse, RemoteApi};
