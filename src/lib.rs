//! Client-side synchronization layer for a mentorship platform that keeps
//! user records in two backends: a request/response profile service and an
//! append-only ledger.

pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
