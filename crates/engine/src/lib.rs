//! Tenant data synchronization engine.
//!
//! Coordinates per-tenant data synchronization from an upstream system of
//! record: a three-phase orchestrator (essential sync, reference sync,
//! validation), a TTL-locked sync status store, a resident per-tenant event
//! processor with an idempotency ledger, and a dead-letter path for
//! permanently failed runs.

pub mod activities;
pub mod dlq;
pub mod fetcher;
pub mod ledger;
pub mod orchestrator;
pub mod processor;
pub mod retry;
pub mod signal;
pub mod status;
pub mod store;

pub use activities::{
    PhaseInput, PhaseOutcome, PhaseStats, SkipReason, SyncActivities, ValidationOutcome,
};
pub use dlq::{
    DeadLetterEntry, DeadLetterError, DeadLetterHandler, DeadLetterPublisher, DeadLetterRequest,
    DeadLetterResponse, InMemoryDeadLetterPublisher,
};
pub use fetcher::TenantDataFetcher;
pub use ledger::{InMemorySignalLedgerStore, SignalLedgerStore};
pub use orchestrator::{
    PhaseReport, RunError, RunPhases, SyncOptions, SyncOrchestrator, SyncRequest, SyncRunResult,
    ValidationReport,
};
pub use processor::{ProcessorHandle, ProcessorStats, TenantEventProcessor};
pub use retry::{ActivityOptions, RetryPolicy, with_retry};
pub use signal::{AssignmentHandlers, AssignmentSignal, AssignmentSignalKind};
pub use status::{
    Collection, CollectionClass, CollectionStatus, SyncLock, SyncPhase, SyncState, SyncStatus,
    SYNC_LOCK_TTL,
};
pub use store::{InMemorySyncStatusStore, StoreError, SyncStatusStore};
