//! Tenant sync orchestrator: drives the three phases for one tenant run.
//!
//! A run walks essential sync, reference sync, and validation in order, with
//! every activity invocation wrapped in the shared retry policy. Continuation
//! rules differ per phase: an essential failure aborts the run and escalates
//! to the dead-letter handler, a reference failure is recorded but never
//! flips the run outcome, and a validation failure only produces a warning.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use orgsync_core::{RunId, SyncError, TenantId, WorkflowId};

use crate::activities::{PhaseInput, PhaseOutcome, PhaseStats, SkipReason, SyncActivities, ValidationOutcome};
use crate::dlq::{DeadLetterError, DeadLetterHandler, DeadLetterPublisher, DeadLetterRequest};
use crate::fetcher::TenantDataFetcher;
use crate::retry::{ActivityOptions, with_retry};
use crate::store::SyncStatusStore;

/// Caller-facing knobs for one sync run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Re-sync collections even when they are already completed, stealing a
    /// live lock if one is held.
    #[serde(default)]
    pub force_sync: bool,
    /// Stop after the essential phase.
    #[serde(default)]
    pub skip_reference_data: bool,
}

/// One tenant sync run request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub tenant_id: String,
    pub auth_token: String,
    #[serde(default)]
    pub options: SyncOptions,
}

/// Outcome of a single phase within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub success: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<PhaseStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_failure: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseReport {
    fn from_outcome(outcome: PhaseOutcome, elapsed_ms: u64) -> Self {
        Self {
            success: outcome.success,
            skipped: outcome.skipped,
            reason: outcome.reason,
            stats: outcome.stats,
            partial_failure: outcome.partial_failure,
            duration_ms: elapsed_ms,
            error: None,
        }
    }

    fn from_error(err: &SyncError, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            skipped: false,
            reason: None,
            stats: None,
            partial_failure: None,
            duration_ms: elapsed_ms,
            error: Some(err.to_string()),
        }
    }
}

/// Validation result attached to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Which phase a run-level error originated in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub phase: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Per-phase breakdown of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPhases {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub essential: Option<PhaseReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<PhaseReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

/// Final result of one tenant sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunResult {
    pub tenant_id: String,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub success: bool,
    pub phases: RunPhases,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Drives tenant sync runs against a status store and upstream fetcher.
pub struct SyncOrchestrator {
    activities: SyncActivities,
    dlq_handler: DeadLetterHandler,
    dlq_publisher: Arc<dyn DeadLetterPublisher>,
    options: ActivityOptions,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SyncStatusStore>,
        fetcher: Arc<dyn TenantDataFetcher>,
        dlq_publisher: Arc<dyn DeadLetterPublisher>,
    ) -> Self {
        Self {
            activities: SyncActivities::new(store, fetcher),
            dlq_handler: DeadLetterHandler::new(),
            dlq_publisher,
            options: ActivityOptions::default(),
        }
    }

    /// Override the per-activity retry/timeout settings.
    pub fn with_activity_options(mut self, options: ActivityOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the full sync for one tenant.
    ///
    /// Never returns `Err`: input problems and phase failures are reported in
    /// the result so the caller always gets the full per-phase breakdown.
    pub async fn run(&self, request: SyncRequest) -> SyncRunResult {
        let workflow_id = WorkflowId::new();
        let run_id = RunId::new();
        let start_time = Utc::now();
        let started = Instant::now();

        let finish = |success: bool, phases: RunPhases, error: Option<RunError>| {
            let end_time = Utc::now();
            SyncRunResult {
                tenant_id: request.tenant_id.clone(),
                workflow_id,
                run_id,
                success,
                phases,
                error,
                start_time,
                end_time,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        };

        let tenant_id = match self.validate(&request) {
            Ok(tenant_id) => tenant_id,
            Err(err) => {
                warn!(tenant = %request.tenant_id, error = %err, "rejecting sync request");
                return finish(
                    false,
                    RunPhases::default(),
                    Some(RunError {
                        phase: "input".into(),
                        error_type: err.error_type().into(),
                        message: err.to_string(),
                    }),
                );
            }
        };

        info!(
            tenant = %tenant_id,
            workflow_id = %workflow_id,
            force_sync = request.options.force_sync,
            skip_reference = request.options.skip_reference_data,
            "starting tenant sync run"
        );

        let input = PhaseInput {
            tenant_id: tenant_id.clone(),
            auth_token: request.auth_token.clone(),
            force_sync: request.options.force_sync,
        };
        let owner = workflow_id.to_string();
        let mut phases = RunPhases::default();

        // Phase 1: essential. Failure here aborts the run and dead-letters.
        let phase_start = Instant::now();
        let essential = with_retry(&self.options, "syncEssentialData", || {
            self.activities.sync_essential_data(&input, &owner)
        })
        .await;
        let elapsed = phase_start.elapsed().as_millis() as u64;

        let essential = match essential {
            Ok(outcome) => outcome,
            Err(err) => {
                phases.essential = Some(PhaseReport::from_error(&err, elapsed));
                self.dead_letter(workflow_id, run_id, &tenant_id, &request.options, &err);
                return finish(
                    false,
                    phases,
                    Some(RunError {
                        phase: "essential".into(),
                        error_type: err.error_type().into(),
                        message: err.to_string(),
                    }),
                );
            }
        };

        let skipped = essential.skipped;
        let skip_reason = essential.reason;
        phases.essential = Some(PhaseReport::from_outcome(essential, elapsed));

        // A skipped essential phase ends the run: either the tenant is fully
        // synced or another attempt owns the lock.
        if skipped {
            info!(
                tenant = %tenant_id,
                reason = %skip_reason.map(|r| r.to_string()).unwrap_or_default(),
                "tenant sync run ended without work"
            );
            return finish(true, phases, None);
        }

        // Phase 2: reference. Failures are recorded, never fatal.
        if request.options.skip_reference_data {
            info!(tenant = %tenant_id, "reference phase skipped by request");
            phases.reference = Some(PhaseReport {
                success: true,
                skipped: true,
                reason: None,
                stats: None,
                partial_failure: None,
                duration_ms: 0,
                error: None,
            });
        } else {
            let phase_start = Instant::now();
            let reference = with_retry(&self.options, "syncReferenceData", || {
                self.activities.sync_reference_data(&input, &owner)
            })
            .await;
            let elapsed = phase_start.elapsed().as_millis() as u64;

            phases.reference = Some(match reference {
                Ok(outcome) => PhaseReport::from_outcome(outcome, elapsed),
                Err(err) => {
                    warn!(
                        tenant = %tenant_id,
                        error = %err,
                        "reference phase failed, continuing to validation"
                    );
                    PhaseReport::from_error(&err, elapsed)
                }
            });
        }

        // Phase 3: validation is diagnostic only.
        let phase_start = Instant::now();
        let validation = with_retry(&self.options, "validateSyncCompletion", || {
            self.activities.validate_sync_completion(&input.tenant_id)
        })
        .await;
        let elapsed = phase_start.elapsed().as_millis() as u64;

        phases.validation = Some(match validation {
            Ok(ValidationOutcome {
                is_valid, issues, ..
            }) => {
                if !is_valid {
                    warn!(
                        tenant = %tenant_id,
                        issues = issues.len(),
                        "sync completed with validation issues: {}",
                        issues.join("; ")
                    );
                }
                ValidationReport {
                    is_valid,
                    issues,
                    duration_ms: elapsed,
                    error: None,
                }
            }
            Err(err) => {
                warn!(tenant = %tenant_id, error = %err, "validation phase failed");
                ValidationReport {
                    is_valid: false,
                    issues: Vec::new(),
                    duration_ms: elapsed,
                    error: Some(err.to_string()),
                }
            }
        });

        info!(
            tenant = %tenant_id,
            workflow_id = %workflow_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "tenant sync run completed"
        );
        finish(true, phases, None)
    }

    fn validate(&self, request: &SyncRequest) -> Result<TenantId, SyncError> {
        let tenant_id = TenantId::new(&request.tenant_id)?;
        if request.auth_token.trim().is_empty() {
            return Err(SyncError::validation("auth token must not be empty"));
        }
        Ok(tenant_id)
    }

    fn dead_letter(
        &self,
        workflow_id: WorkflowId,
        run_id: RunId,
        tenant_id: &TenantId,
        options: &SyncOptions,
        err: &SyncError,
    ) {
        // The auth token deliberately stays out of the DLQ payload.
        let response = self.dlq_handler.handle(DeadLetterRequest {
            workflow_id,
            run_id,
            workflow_type: "tenantSync".to_string(),
            tenant_id: Some(tenant_id.clone()),
            error: Some(DeadLetterError {
                message: err.to_string(),
                error_type: err.error_type().to_string(),
                stack: None,
            }),
            event_data: serde_json::json!({
                "tenantId": tenant_id.as_str(),
                "forceSync": options.force_sync,
                "skipReferenceData": options.skip_reference_data,
            }),
        });
        self.dlq_publisher.publish(response.dlq_entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::InMemoryDeadLetterPublisher;
    use crate::fetcher::testing::RecordingFetcher;
    use crate::retry::RetryPolicy;
    use crate::status::Collection;
    use crate::store::{InMemorySyncStatusStore, SyncStatusStore};
    use std::time::Duration;

    fn fast_options() -> ActivityOptions {
        ActivityOptions::new(
            RetryPolicy {
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 2.0,
                max_interval: Duration::from_millis(2),
                max_attempts: 2,
            },
            Duration::from_secs(5),
        )
    }

    fn setup() -> (
        Arc<InMemorySyncStatusStore>,
        Arc<RecordingFetcher>,
        Arc<InMemoryDeadLetterPublisher>,
        SyncOrchestrator,
    ) {
        let store = InMemorySyncStatusStore::arc();
        let fetcher = Arc::new(RecordingFetcher::new());
        let publisher = Arc::new(InMemoryDeadLetterPublisher::new());
        let orchestrator =
            SyncOrchestrator::new(store.clone(), fetcher.clone(), publisher.clone())
                .with_activity_options(fast_options());
        (store, fetcher, publisher, orchestrator)
    }

    fn request() -> SyncRequest {
        SyncRequest {
            tenant_id: "T1".into(),
            auth_token: "tok".into(),
            options: SyncOptions::default(),
        }
    }

    #[tokio::test]
    async fn full_run_reports_all_three_phases() {
        let (_store, _fetcher, publisher, orchestrator) = setup();

        let result = orchestrator.run(request()).await;

        assert!(result.success);
        assert!(result.error.is_none());
        let essential = result.phases.essential.unwrap();
        assert!(!essential.skipped);
        assert_eq!(essential.stats.unwrap().total_records, 50);
        let reference = result.phases.reference.unwrap();
        assert!(reference.success);
        assert!(result.phases.validation.unwrap().is_valid);
        assert!(publisher.entries().is_empty());
    }

    #[tokio::test]
    async fn empty_tenant_id_is_rejected_without_running_phases() {
        let (_store, fetcher, _publisher, orchestrator) = setup();

        let result = orchestrator
            .run(SyncRequest {
                tenant_id: "  ".into(),
                ..request()
            })
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.phase, "input");
        assert_eq!(error.error_type, "validation");
        assert!(result.phases.essential.is_none());
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_auth_token_is_rejected() {
        let (_store, _fetcher, _publisher, orchestrator) = setup();

        let result = orchestrator
            .run(SyncRequest {
                auth_token: "".into(),
                ..request()
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().phase, "input");
    }

    #[tokio::test]
    async fn essential_failure_aborts_and_dead_letters() {
        let (store, fetcher, publisher, orchestrator) = setup();
        fetcher.fail_collection(Collection::Organizations, SyncError::upstream("500"));

        let result = orchestrator.run(request()).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.phase, "essential");
        assert_eq!(error.error_type, "upstream");
        assert!(result.phases.reference.is_none());
        assert!(result.phases.validation.is_none());

        let entries = publisher.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].workflow_type, "tenantSync");
        assert_eq!(entries[0].tenant_id, "T1");
        // Credentials never travel into the DLQ payload.
        assert!(entries[0].event_data.get("authToken").is_none());

        let tenant = TenantId::new("T1").unwrap();
        assert!(store.get(&tenant).unwrap().is_some());
    }

    #[tokio::test]
    async fn second_run_is_skipped_as_already_synced() {
        let (_store, fetcher, _publisher, orchestrator) = setup();

        let first = orchestrator.run(request()).await;
        assert!(first.success);
        let calls_after_first = fetcher.call_count();

        let second = orchestrator.run(request()).await;
        assert!(second.success);
        let essential = second.phases.essential.unwrap();
        assert!(essential.skipped);
        assert_eq!(essential.reason, Some(SkipReason::AlreadySynced));
        assert!(second.phases.reference.is_none());
        assert_eq!(fetcher.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn force_sync_reruns_a_completed_tenant() {
        let (_store, fetcher, _publisher, orchestrator) = setup();

        orchestrator.run(request()).await;
        let calls_after_first = fetcher.call_count();

        let result = orchestrator
            .run(SyncRequest {
                options: SyncOptions {
                    force_sync: true,
                    skip_reference_data: false,
                },
                ..request()
            })
            .await;

        assert!(result.success);
        assert!(!result.phases.essential.unwrap().skipped);
        assert!(fetcher.call_count() > calls_after_first);
    }

    #[tokio::test]
    async fn reference_failure_does_not_flip_run_outcome() {
        let (_store, fetcher, publisher, orchestrator) = setup();
        fetcher.fail_collection(Collection::CreditConfigs, SyncError::upstream("502"));

        let result = orchestrator.run(request()).await;

        assert!(result.success);
        let reference = result.phases.reference.unwrap();
        assert!(reference.partial_failure.is_some());
        // A failed reference collection is a non-critical issue, so the
        // document still validates as a whole.
        let validation = result.phases.validation.unwrap();
        assert!(validation.is_valid);
        assert!(
            validation
                .issues
                .iter()
                .any(|i| i.contains("creditConfigs") && i.contains("(non-critical)"))
        );
        assert!(publisher.entries().is_empty());
    }

    #[tokio::test]
    async fn skip_reference_data_stops_after_essential() {
        let (_store, fetcher, _publisher, orchestrator) = setup();

        let result = orchestrator
            .run(SyncRequest {
                options: SyncOptions {
                    force_sync: false,
                    skip_reference_data: true,
                },
                ..request()
            })
            .await;

        assert!(result.success);
        let reference = result.phases.reference.unwrap();
        assert!(reference.skipped);
        // Essential phase only: five collections fetched.
        assert_eq!(fetcher.call_count(), 5);
        // Validation still ran and flags the unfinished reference set.
        assert!(!result.phases.validation.unwrap().is_valid);
    }

    /// Stalls the first `users` fetch past any start-to-close timeout, then
    /// behaves normally.
    #[derive(Default)]
    struct StallOnceFetcher {
        stalled: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl crate::fetcher::TenantDataFetcher for StallOnceFetcher {
        async fn sync_collection(
            &self,
            _tenant_id: &TenantId,
            _auth_token: &str,
            collection: Collection,
            _force: bool,
        ) -> orgsync_core::SyncResult<u64> {
            use std::sync::atomic::Ordering;
            if collection == Collection::Users && !self.stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(10)
        }
    }

    #[tokio::test]
    async fn timed_out_attempt_retries_and_reclaims_its_lock() {
        use crate::status::SyncState;

        let store = InMemorySyncStatusStore::arc();
        let publisher = Arc::new(InMemoryDeadLetterPublisher::new());
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            Arc::new(StallOnceFetcher::default()),
            publisher.clone(),
        )
        .with_activity_options(ActivityOptions::new(
            RetryPolicy {
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 2.0,
                max_interval: Duration::from_millis(2),
                max_attempts: 2,
            },
            Duration::from_millis(50),
        ));

        // The first essential attempt times out mid-fetch and never reaches
        // its lock release; the retry must get the same lock back instead of
        // reporting a bogus sync_in_progress skip.
        let result = orchestrator.run(request()).await;

        assert!(result.success);
        let essential = result.phases.essential.unwrap();
        assert!(!essential.skipped);

        let status = store
            .get(&TenantId::new("T1").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(status.status, SyncState::Completed);
        assert_eq!(status.attempt_count, 2);
        assert!(!status.sync_lock.is_locked);
        assert!(publisher.entries().is_empty());
    }

    #[tokio::test]
    async fn concurrent_run_yields_sync_in_progress() {
        let (store, _fetcher, _publisher, orchestrator) = setup();
        let tenant = TenantId::new("T1").unwrap();
        store
            .acquire_lock(&tenant, "other-wf", Duration::from_secs(600))
            .unwrap();

        let result = orchestrator.run(request()).await;

        assert!(result.success);
        let essential = result.phases.essential.unwrap();
        assert!(essential.skipped);
        assert_eq!(essential.reason, Some(SkipReason::SyncInProgress));
    }
}
