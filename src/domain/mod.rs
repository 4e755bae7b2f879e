//! Domain layer containing core types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, BackendError, ConfigError, ValidationError};
pub use traits::{IdentityResolver, NotificationSink, RecordSource};
pub use types::{
    Address, ConfirmationStatus, HealthResponse, HealthStatus, Identity, LedgerStatus,
    MutationKind, MutationParams, MutationRecord, MutationStatus, NotificationLevel, QueryKey,
    QueryKind, QueryValue, ReadOptions, RegisterParams, Role, SearchFilter, SourceKind,
    StalePolicy, SubmissionHandle, User, UserId, WriteReceipt,
};
