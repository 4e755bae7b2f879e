//! Error types shared by every layer.

use thiserror::Error;

use super::types::{Address, MutationKind};

/// Top-level application error
///
/// `Clone` so that a single fetch outcome can be handed to every caller
/// waiting on the same in-flight request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppError {
    /// The operation needs a connected wallet and there is none
    #[error("A connected wallet identity is required")]
    IdentityRequired,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Another mutation of the same kind is still running for this caller
    #[error("A {kind} mutation is already in progress for {initiator}")]
    MutationInProgress {
        kind: MutationKind,
        initiator: Address,
    },

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Called outside a Tokio runtime, so there is nothing to drive the work
    #[error("No async runtime available")]
    RuntimeUnavailable,
}

impl AppError {
    /// Errors raised locally before any I/O was attempted.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::IdentityRequired
                | Self::Validation(_)
                | Self::MutationInProgress { .. }
                | Self::RuntimeUnavailable
        )
    }

    /// Transport-level failures that a read may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backend(BackendError::Unreachable(_) | BackendError::Timeout(_))
        )
    }
}

/// Locally detected parameter problems
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("{0}")]
    Multiple(String),
}

/// Failures reported by, or on the way to, a backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Network or transport failure
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The backend refused the input (duplicate registration and the like)
    #[error("Rejected by backend ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// A ledger transaction reached finality in a failed state
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Malformed backend response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}
