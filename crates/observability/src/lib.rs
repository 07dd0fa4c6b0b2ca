//! Shared tracing/logging setup for orgsync processes.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogFormat, init, init_with_format};
