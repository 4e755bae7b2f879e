//! Test utilities: in-memory backends and a recording notification sink.

pub mod mocks;

pub use mocks::*;
