//! The base types used throughout the tracer

pub mod types;
pub use types::*;

pub mod util;

#[cfg(any(test, feature = "test_support"))]
pub mod proptest_strategies;
