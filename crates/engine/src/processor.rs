//! Per-tenant event processor: a resident loop that applies assignment
//! change signals exactly once.
//!
//! One instance per tenant, started once and kept alive indefinitely. Signals
//! are dispatched strictly sequentially in arrival order; duplicates (the
//! transport delivers at-least-once) are dropped against the idempotency
//! ledger, which is checkpointed so a restarted instance resumes with
//! identical state. A single handler failure never takes the loop down.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use orgsync_core::{RunId, SyncError, SyncResult, TenantId, WorkflowId};

use crate::dlq::{DeadLetterError, DeadLetterHandler, DeadLetterPublisher, DeadLetterRequest};
use crate::ledger::SignalLedgerStore;
use crate::retry::{ActivityOptions, with_retry};
use crate::signal::{AssignmentHandlers, AssignmentSignal};

const SIGNAL_BUFFER: usize = 64;

/// Snapshot of processor counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessorStats {
    pub received: u64,
    pub duplicates: u64,
    pub handled: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    received: AtomicU64,
    duplicates: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            received: self.received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Long-lived per-tenant signal processor.
pub struct TenantEventProcessor {
    tenant_id: TenantId,
    handlers: Arc<dyn AssignmentHandlers>,
    ledger_store: Arc<dyn SignalLedgerStore>,
    dlq_publisher: Arc<dyn DeadLetterPublisher>,
    options: ActivityOptions,
    workflow_id: WorkflowId,
    run_id: RunId,
}

impl TenantEventProcessor {
    pub fn new(
        tenant_id: TenantId,
        handlers: Arc<dyn AssignmentHandlers>,
        ledger_store: Arc<dyn SignalLedgerStore>,
        dlq_publisher: Arc<dyn DeadLetterPublisher>,
        options: ActivityOptions,
    ) -> Self {
        Self {
            tenant_id,
            handlers,
            ledger_store,
            dlq_publisher,
            options,
            workflow_id: WorkflowId::new(),
            run_id: RunId::new(),
        }
    }

    /// Start (or resume) the resident listening loop.
    ///
    /// Reloads the checkpointed idempotency ledger first, so a restarted
    /// instance dedups exactly like the one it replaced.
    pub fn start(self) -> SyncResult<ProcessorHandle> {
        let ledger = self
            .ledger_store
            .load(&self.tenant_id)
            .map_err(SyncError::from)?;

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(StatsInner::default());

        info!(
            tenant = %self.tenant_id,
            workflow_id = %self.workflow_id,
            ledger_size = ledger.len(),
            "tenant event processor started"
        );

        let join = tokio::spawn(run_loop(self, rx, ledger, shutdown.clone(), stats.clone()));

        Ok(ProcessorHandle {
            tx,
            shutdown,
            stats,
            join,
        })
    }
}

/// Handle to a running processor instance.
pub struct ProcessorHandle {
    tx: mpsc::Sender<AssignmentSignal>,
    shutdown: Arc<Notify>,
    stats: Arc<StatsInner>,
    join: tokio::task::JoinHandle<()>,
}

impl ProcessorHandle {
    /// Deliver one signal. Signals queue in arrival order; dispatch is
    /// strictly sequential.
    pub async fn signal(&self, signal: AssignmentSignal) -> SyncResult<()> {
        self.tx
            .send(signal)
            .await
            .map_err(|_| SyncError::handler("event processor is no longer running"))
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.snapshot()
    }

    /// Request graceful shutdown and wait for the loop to drain.
    ///
    /// Signals accepted through [`ProcessorHandle::signal`] before this call
    /// are still dispatched; only new deliveries are refused.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}

async fn run_loop(
    processor: TenantEventProcessor,
    mut rx: mpsc::Receiver<AssignmentSignal>,
    mut ledger: HashSet<String>,
    shutdown: Arc<Notify>,
    stats: Arc<StatsInner>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!(tenant = %processor.tenant_id, "tenant event processor received shutdown signal");
                // Refuse new sends, then fall through to drain what was
                // already accepted.
                rx.close();
                break;
            }
            received = rx.recv() => match received {
                Some(signal) => {
                    stats.received.fetch_add(1, Ordering::Relaxed);
                    dispatch_one(&processor, &mut ledger, &stats, signal).await;
                }
                None => {
                    info!(tenant = %processor.tenant_id, "signal channel closed, stopping processor");
                    return;
                }
            },
        }
    }

    // Accepted signals are never dropped: drain the queue before exiting.
    while let Some(signal) = rx.recv().await {
        stats.received.fetch_add(1, Ordering::Relaxed);
        dispatch_one(&processor, &mut ledger, &stats, signal).await;
    }

    info!(tenant = %processor.tenant_id, "tenant event processor stopped");
}

async fn dispatch_one(
    processor: &TenantEventProcessor,
    ledger: &mut HashSet<String>,
    stats: &StatsInner,
    signal: AssignmentSignal,
) {
    let key = signal.idempotency_key();

    if ledger.contains(&key) {
        debug!(
            tenant = %processor.tenant_id,
            key = %key,
            "duplicate signal dropped"
        );
        stats.duplicates.fetch_add(1, Ordering::Relaxed);
        return;
    }

    // Accept the key before dispatch so a duplicate arriving while the
    // handler runs (or after it fails) is still deduplicated.
    ledger.insert(key.clone());
    if let Err(err) = processor.ledger_store.record(&processor.tenant_id, &key) {
        // In-memory dedup still holds for this instance; the checkpoint
        // gap only matters if we crash before the next successful record.
        warn!(
            tenant = %processor.tenant_id,
            key = %key,
            error = %err,
            "failed to checkpoint idempotency key"
        );
    }

    let activity = format!("handleOrganizationAssignment:{}", signal.kind);
    let result = with_retry(&processor.options, &activity, || {
        processor.handlers.dispatch(&processor.tenant_id, &signal)
    })
    .await;

    match result {
        Ok(()) => {
            debug!(tenant = %processor.tenant_id, key = %key, "signal handled");
            stats.handled.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            // The key stays in the ledger: an identical redelivery would
            // re-fail the same way, so it is dropped rather than re-run.
            error!(
                tenant = %processor.tenant_id,
                key = %key,
                error = %err,
                "signal handler permanently failed, escalating to dead letter"
            );
            stats.failed.fetch_add(1, Ordering::Relaxed);

            let response = DeadLetterHandler::new().handle(DeadLetterRequest {
                workflow_id: processor.workflow_id,
                run_id: processor.run_id,
                workflow_type: "tenantEventProcessor".to_string(),
                tenant_id: Some(processor.tenant_id.clone()),
                error: Some(DeadLetterError {
                    message: err.to_string(),
                    error_type: err.error_type().to_string(),
                    stack: None,
                }),
                event_data: serde_json::to_value(&signal).unwrap_or_default(),
            });
            processor.dlq_publisher.publish(response.dlq_entry);
        }
    }
}
