//! Application layer: caching, mutation coordination and shared state.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod mutation;
pub mod service;
pub mod state;

pub use adapter::DualSourceAdapter;
pub use cache::{EntrySnapshot, KeyPattern, QueryCache, QueryObserver};
pub use config::SyncConfig;
pub use mutation::{MutationCoordinator, MutationHandle};
pub use service::ProfileService;
pub use state::AppState;
