//! Infrastructure layer implementations.

pub mod ledger;
pub mod notify;
pub mod service;
pub mod session;

pub use ledger::{HttpLedgerRpcProvider, LedgerClientConfig, LedgerRpcProvider, LedgerSource};
pub use notify::TracingNotificationSink;
pub use service::ServiceSource;
pub use session::WalletSession;
