//! Certificate refresh for the tunnel side of the client
//!
//! The VPN certificate is short-lived and has to stay valid for as long as
//! the tunnel is up. This module keeps exactly one refresh planned at a
//! time, retries failures with a doubling delay and halts when the API
//! session is gone until the app forks a new one.
//!
//! ## Architecture
//!
//! - manager.rs: refresh planning, retry backoff, session-expiry halt
//! - provider.rs: app <-> extension message codec and request handler
//! - scheduler.rs: cancellable one-shot timer backing the refresh plan

pub mod manager;
pub mod provider;
pub mod scheduler;

pub use manager::CertificateRefreshManager;
pub use provider::{ProviderMessageError, ProviderRequest, ProviderResponse};
pub use scheduler::ScheduledTask;

use crate::api::types::ApiError;

/// Certificate refresh errors
#[derive(Debug, thiserror::Error)]
pub enum CertRefreshError {
    #[error("New device keys are required before a certificate can be issued")]
    NeedNewKeys,

    #[error("API session expired, certificate refreshes are halted")]
    SessionExpired,

    #[error("Too many certificate requests{}", .retry_after.map(|s| format!(", retry after {}s", s)).unwrap_or_default())]
    TooManyCertRequests { retry_after: Option<i64> },

    #[error("Certificate refreshes are stopped")]
    Stopped,

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

pub type CertRefreshResult<T> = Result<T, CertRefreshError>;
