//! Domain traits defining contracts for external systems.

use std::time::Duration;

use async_trait::async_trait;

use super::error::AppError;
use super::types::{
    Address, ConfirmationStatus, Identity, MutationParams, NotificationLevel, SearchFilter,
    SourceKind, SubmissionHandle, User, WriteReceipt,
};

/// Supplies the identity of the current caller from the wallet session.
///
/// Must be side-effect free: it only reflects external session state.
pub trait IdentityResolver: Send + Sync {
    fn current_identity(&self) -> Identity;
}

/// Outbound toast/log channel for terminal outcomes
pub trait NotificationSink: Send + Sync {
    fn notify(&self, level: NotificationLevel, message: &str);
}

/// One physical backend holding user records.
///
/// Both the request/response service and the ledger implement this, so callers
/// pick a backend by [`SourceKind`] instead of branching at the call site.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Check backend connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Look up one record. `Ok(None)` means the backend has no such user.
    async fn fetch_by_key(&self, key: &Address) -> Result<Option<User>, AppError>;

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<User>, AppError>;

    /// Submit a write on behalf of `initiator`.
    async fn submit_write(
        &self,
        initiator: &Address,
        params: &MutationParams,
    ) -> Result<WriteReceipt, AppError>;

    /// Poll once for the finality of a submitted write
    async fn poll_confirmation(
        &self,
        handle: &SubmissionHandle,
    ) -> Result<ConfirmationStatus, AppError> {
        let _ = handle;
        Err(AppError::NotSupported(format!(
            "{} backend has no confirmation phase",
            self.kind()
        )))
    }

    /// Poll until the write is confirmed or fails, giving up after `timeout`.
    async fn await_confirmation(
        &self,
        handle: &SubmissionHandle,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, AppError> {
        let _ = (handle, timeout);
        Err(AppError::NotSupported(format!(
            "{} backend has no confirmation phase",
            self.kind()
        )))
    }

    /// Page through all records in registration order
    async fn list_users(&self, offset: u64, limit: u64) -> Result<Vec<User>, AppError> {
        let _ = (offset, limit);
        Err(AppError::NotSupported(format!(
            "list_users not implemented for {} backend",
            self.kind()
        )))
    }

    async fn total_users(&self) -> Result<u64, AppError> {
        Err(AppError::NotSupported(format!(
            "total_users not implemented for {} backend",
            self.kind()
        )))
    }

    /// Chain id reported by the backend, for backends that have one
    async fn chain_id(&self) -> Result<u64, AppError> {
        Err(AppError::NotSupported(format!(
            "chain_id not implemented for {} backend",
            self.kind()
        )))
    }
}
