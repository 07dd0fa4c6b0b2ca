//! Organization-assignment change signals and their handler port.
//!
//! Signals are delivered at-least-once by an out-of-scope transport; the
//! event processor deduplicates them via the idempotency key computed here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use orgsync_core::{SyncResult, TenantId};

/// Kind of assignment change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSignalKind {
    Created,
    Deleted,
    Activated,
    Deactivated,
}

impl core::fmt::Display for AssignmentSignalKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AssignmentSignalKind::Created => f.write_str("created"),
            AssignmentSignalKind::Deleted => f.write_str("deleted"),
            AssignmentSignalKind::Activated => f.write_str("activated"),
            AssignmentSignalKind::Deactivated => f.write_str("deactivated"),
        }
    }
}

/// One organization-assignment change notification.
///
/// Modeled as a tagged variant (`kind` + shared payload) rather than four
/// separate message types, so the processor has a single dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentSignal {
    #[serde(rename = "type")]
    pub kind: AssignmentSignalKind,
    pub assignment_id: String,
    pub user_id: String,
    pub organization_id: String,
    /// Transport-specific extras, carried through to the handler untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl AssignmentSignal {
    /// Composite idempotency key identifying this logical change.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.kind, self.assignment_id, self.user_id, self.organization_id
        )
    }
}

/// Handler activities for the four assignment signal kinds.
///
/// Implementations are external collaborators; each invocation is an
/// isolated, retryable unit of work.
#[async_trait]
pub trait AssignmentHandlers: Send + Sync {
    async fn handle_created(&self, tenant_id: &TenantId, signal: &AssignmentSignal)
        -> SyncResult<()>;

    async fn handle_deleted(&self, tenant_id: &TenantId, signal: &AssignmentSignal)
        -> SyncResult<()>;

    async fn handle_activated(
        &self,
        tenant_id: &TenantId,
        signal: &AssignmentSignal,
    ) -> SyncResult<()>;

    async fn handle_deactivated(
        &self,
        tenant_id: &TenantId,
        signal: &AssignmentSignal,
    ) -> SyncResult<()>;

    /// Route a signal to the matching handler.
    async fn dispatch(&self, tenant_id: &TenantId, signal: &AssignmentSignal) -> SyncResult<()> {
        match signal.kind {
            AssignmentSignalKind::Created => self.handle_created(tenant_id, signal).await,
            AssignmentSignalKind::Deleted => self.handle_deleted(tenant_id, signal).await,
            AssignmentSignalKind::Activated => self.handle_activated(tenant_id, signal).await,
            AssignmentSignalKind::Deactivated => self.handle_deactivated(tenant_id, signal).await,
        }
    }
}
