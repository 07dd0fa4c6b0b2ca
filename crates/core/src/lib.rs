//! `orgsync-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers and the shared error taxonomy used by the sync
//! engine.

pub mod error;
pub mod id;

pub use error::{ErrorKind, SyncError, SyncResult};
pub use id::{RunId, TenantId, WorkflowId};
