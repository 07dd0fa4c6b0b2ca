//! Dead-letter handling for permanently failed durable processes.
//!
//! The handler is a pure transform: it shapes a structured failure record,
//! stamps it with its own identity and an ISO-8601 timestamp, and hands it to
//! a publisher port. It performs no retries and cannot fail — missing fields
//! are substituted, never raised.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use orgsync_core::{RunId, TenantId, WorkflowId};

/// Error detail carried into a DLQ entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// What the failure detector hands us about the dead process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRequest {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub workflow_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeadLetterError>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub event_data: serde_json::Value,
}

/// The shaped failure record handed to the external publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub workflow_type: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub event_data: serde_json::Value,
    pub error: DeadLetterError,
    pub timestamp: DateTime<Utc>,
    pub handler_workflow_id: WorkflowId,
    pub handler_run_id: RunId,
}

/// Result returned to whoever invoked the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterResponse {
    pub success: bool,
    pub dlq_entry: DeadLetterEntry,
    pub message: String,
}

/// Terminal sink for permanently failed orchestrator/processor instances.
#[derive(Debug, Clone)]
pub struct DeadLetterHandler {
    workflow_id: WorkflowId,
    run_id: RunId,
}

impl DeadLetterHandler {
    pub fn new() -> Self {
        Self {
            workflow_id: WorkflowId::new(),
            run_id: RunId::new(),
        }
    }

    /// Shape a DLQ entry from a failure report.
    ///
    /// Missing error/tenant details are substituted (`"Unknown error"` /
    /// `"unknown"`) rather than raised; this path must never escalate.
    pub fn handle(&self, request: DeadLetterRequest) -> DeadLetterResponse {
        let error = request.error.unwrap_or_else(|| DeadLetterError {
            message: "Unknown error".to_string(),
            error_type: "unknown".to_string(),
            stack: None,
        });
        let tenant_id = request
            .tenant_id
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        error!(
            workflow_id = %request.workflow_id,
            run_id = %request.run_id,
            workflow_type = %request.workflow_type,
            tenant = %tenant_id,
            error = %error.message,
            "durable process permanently failed, shaping DLQ entry"
        );

        let entry = DeadLetterEntry {
            workflow_id: request.workflow_id,
            run_id: request.run_id,
            workflow_type: request.workflow_type.clone(),
            tenant_id,
            event_data: request.event_data,
            error,
            timestamp: Utc::now(),
            handler_workflow_id: self.workflow_id,
            handler_run_id: self.run_id,
        };

        DeadLetterResponse {
            success: true,
            message: format!(
                "dead-lettered {} ({})",
                request.workflow_type, entry.workflow_id
            ),
            dlq_entry: entry,
        }
    }
}

impl Default for DeadLetterHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// External publication port for shaped DLQ entries. Publication transport is
/// out of scope; this subsystem's responsibility ends at the shaped record.
pub trait DeadLetterPublisher: Send + Sync {
    fn publish(&self, entry: DeadLetterEntry);
}

/// In-memory publisher that retains entries for inspection (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterPublisher {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl DeadLetterPublisher for InMemoryDeadLetterPublisher {
    fn publish(&self, entry: DeadLetterEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}
