//! The three phase activities: essential sync, reference sync, and
//! completion validation.
//!
//! Each activity is an isolated, retryable unit of work; the orchestrator
//! wraps every invocation in the shared retry policy. The activities own the
//! idempotency short-circuits, the lock dance, and all status-document
//! mutation; the upstream fetch itself is delegated to [`TenantDataFetcher`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use orgsync_core::{SyncError, SyncResult, TenantId};

use crate::fetcher::TenantDataFetcher;
use crate::status::{Collection, CollectionClass, SyncPhase, SyncState, SyncStatus, SYNC_LOCK_TTL};
use crate::store::SyncStatusStore;

/// Input to the essential/reference sync activities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseInput {
    pub tenant_id: TenantId,
    pub auth_token: String,
    #[serde(default)]
    pub force_sync: bool,
}

/// Why a phase did no work.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The tenant is already fully synced and `forceSync` was off.
    AlreadySynced,
    /// Another attempt holds a live lock on this tenant.
    SyncInProgress,
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SkipReason::AlreadySynced => f.write_str("already_synced"),
            SkipReason::SyncInProgress => f.write_str("sync_in_progress"),
        }
    }
}

/// Per-collection record counts reported by a phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStats {
    pub records: BTreeMap<Collection, u64>,
    pub total_records: u64,
}

impl PhaseStats {
    fn record(&mut self, collection: Collection, count: u64) {
        self.records.insert(collection, count);
        self.total_records += count;
    }
}

/// Structured outcome of the essential/reference sync activities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseOutcome {
    pub success: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<PhaseStats>,
    /// Tolerated/non-critical collection failures, noted but non-fatal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_failure: Option<String>,
}

impl PhaseOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            success: true,
            skipped: true,
            reason: Some(reason),
            stats: None,
            partial_failure: None,
        }
    }

    fn completed(stats: PhaseStats, partial_failure: Option<String>) -> Self {
        Self {
            success: true,
            skipped: false,
            reason: None,
            stats: Some(stats),
            partial_failure,
        }
    }
}

/// Outcome of the validation activity (diagnostic only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub success: bool,
    pub is_valid: bool,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
}

/// The phase activities, bound to a status store and an upstream fetcher.
pub struct SyncActivities {
    store: Arc<dyn SyncStatusStore>,
    fetcher: Arc<dyn TenantDataFetcher>,
}

impl SyncActivities {
    pub fn new(store: Arc<dyn SyncStatusStore>, fetcher: Arc<dyn TenantDataFetcher>) -> Self {
        Self { store, fetcher }
    }

    /// Essential phase: tenant record, organizations, roles, users, plus the
    /// tolerated role-assignment collection.
    ///
    /// `owner` identifies the acquiring attempt for lock bookkeeping.
    pub async fn sync_essential_data(
        &self,
        input: &PhaseInput,
        owner: &str,
    ) -> SyncResult<PhaseOutcome> {
        let status = self.store.create_if_absent(&input.tenant_id)?;

        if status.is_fully_synced() && !input.force_sync {
            info!(tenant = %input.tenant_id, "essential sync skipped, already synced");
            return Ok(PhaseOutcome::skipped(SkipReason::AlreadySynced));
        }

        if !self
            .store
            .acquire_lock(&input.tenant_id, owner, SYNC_LOCK_TTL)?
        {
            if !input.force_sync {
                info!(tenant = %input.tenant_id, "essential sync skipped, another attempt holds the lock");
                return Ok(PhaseOutcome::skipped(SkipReason::SyncInProgress));
            }
            // forceSync steals a live lock: release, then re-acquire.
            warn!(tenant = %input.tenant_id, "forceSync stealing live sync lock");
            self.store.release_lock(&input.tenant_id)?;
            if !self
                .store
                .acquire_lock(&input.tenant_id, owner, SYNC_LOCK_TTL)?
            {
                return Ok(PhaseOutcome::skipped(SkipReason::SyncInProgress));
            }
        }

        let result = self.essential_locked(input).await;
        self.release_lock_logged(&input.tenant_id);
        result
    }

    async fn essential_locked(&self, input: &PhaseInput) -> SyncResult<PhaseOutcome> {
        // Re-read under the lock; the pre-lock read may be stale.
        let mut status = self.store.create_if_absent(&input.tenant_id)?;
        status.begin_attempt(Utc::now());
        self.store.save(&status)?;

        let mut stats = PhaseStats::default();
        let mut tolerated_failure = None;

        for collection in Collection::ESSENTIAL_PHASE {
            status.mark_collection_in_progress(collection);
            self.store.save(&status)?;

            match self
                .fetcher
                .sync_collection(&input.tenant_id, &input.auth_token, collection, input.force_sync)
                .await
            {
                Ok(count) => {
                    status.mark_collection_completed(collection, count);
                    self.store.save(&status)?;
                    stats.record(collection, count);
                }
                Err(err) if collection.class() == CollectionClass::Tolerated => {
                    warn!(
                        tenant = %input.tenant_id,
                        collection = %collection,
                        error = %err,
                        "tolerated collection failed during essential phase"
                    );
                    status.mark_collection_failed(collection, err.to_string());
                    self.store.save(&status)?;
                    tolerated_failure = Some(format!("{collection}: {err}"));
                }
                Err(err) => {
                    status.mark_collection_failed(collection, err.to_string());
                    status.mark_failed();
                    self.store.save(&status)?;
                    warn!(
                        tenant = %input.tenant_id,
                        collection = %collection,
                        error = %err,
                        "essential collection failed, aborting essential phase"
                    );
                    return Err(err);
                }
            }
        }

        status.advance_phase(SyncPhase::Dependent);
        self.store.save(&status)?;

        info!(
            tenant = %input.tenant_id,
            total_records = stats.total_records,
            partial = tolerated_failure.is_some(),
            "essential phase completed"
        );
        Ok(PhaseOutcome::completed(stats, tolerated_failure))
    }

    /// Reference phase: employee assignments, role assignments, credit
    /// configuration, entity credits. Individual failures are recorded but
    /// never abort the run.
    pub async fn sync_reference_data(
        &self,
        input: &PhaseInput,
        owner: &str,
    ) -> SyncResult<PhaseOutcome> {
        let status = self
            .store
            .get(&input.tenant_id)?
            .ok_or_else(|| {
                SyncError::not_found(format!(
                    "no sync status for tenant '{}': reference sync requires a prior essential phase",
                    input.tenant_id
                ))
            })?;

        if status.reference_all_synced() && !input.force_sync {
            info!(tenant = %input.tenant_id, "reference sync skipped, all reference collections synced");
            return Ok(PhaseOutcome::skipped(SkipReason::AlreadySynced));
        }

        if !self
            .store
            .acquire_lock(&input.tenant_id, owner, SYNC_LOCK_TTL)?
        {
            info!(tenant = %input.tenant_id, "reference sync skipped, another attempt holds the lock");
            return Ok(PhaseOutcome::skipped(SkipReason::SyncInProgress));
        }

        let result = self.reference_locked(input).await;
        self.release_lock_logged(&input.tenant_id);
        result
    }

    async fn reference_locked(&self, input: &PhaseInput) -> SyncResult<PhaseOutcome> {
        let mut status = self.store.get(&input.tenant_id)?.ok_or_else(|| {
            SyncError::not_found(format!("sync status vanished for tenant '{}'", input.tenant_id))
        })?;

        let mut stats = PhaseStats::default();
        let mut failed = Vec::new();

        for collection in Collection::REFERENCE_PHASE {
            let current = status.collection(collection);
            if current.status == SyncState::Completed && !input.force_sync {
                stats.record(collection, current.record_count);
                continue;
            }

            status.mark_collection_in_progress(collection);
            self.store.save(&status)?;

            match self
                .fetcher
                .sync_collection(&input.tenant_id, &input.auth_token, collection, input.force_sync)
                .await
            {
                Ok(count) => {
                    status.mark_collection_completed(collection, count);
                    self.store.save(&status)?;
                    stats.record(collection, count);
                }
                Err(err) => {
                    warn!(
                        tenant = %input.tenant_id,
                        collection = %collection,
                        error = %err,
                        "reference collection failed (non-critical)"
                    );
                    status.mark_collection_failed(collection, err.to_string());
                    self.store.save(&status)?;
                    failed.push(format!("{collection}: {err}"));
                }
            }
        }

        status.mark_completed(Utc::now());
        self.store.save(&status)?;

        let partial = if failed.is_empty() {
            None
        } else {
            Some(failed.join("; "))
        };
        info!(
            tenant = %input.tenant_id,
            total_records = stats.total_records,
            failed = partial.as_deref().unwrap_or("none"),
            "reference phase completed"
        );
        Ok(PhaseOutcome::completed(stats, partial))
    }

    /// Validation phase: diagnostic report of incomplete collections.
    pub async fn validate_sync_completion(
        &self,
        tenant_id: &TenantId,
    ) -> SyncResult<ValidationOutcome> {
        let status = self.store.get(tenant_id)?.ok_or_else(|| {
            SyncError::not_found(format!("no sync status for tenant '{}'", tenant_id))
        })?;

        let mut issues = Vec::new();
        let mut blocking = 0usize;

        for collection in Collection::ALL {
            let current = status.collection(collection);
            if current.status == SyncState::Completed {
                continue;
            }
            if collection.is_blocking() {
                blocking += 1;
                issues.push(format!(
                    "essential collection '{collection}' is not completed (status: {})",
                    state_name(current.status)
                ));
            } else {
                issues.push(format!(
                    "collection '{collection}' is not completed (status: {}) (non-critical)",
                    state_name(current.status)
                ));
            }
        }

        if status.status != SyncState::Completed {
            blocking += 1;
            issues.push(format!(
                "overall sync status is '{}', not 'completed'",
                state_name(status.status)
            ));
        }

        Ok(ValidationOutcome {
            success: true,
            is_valid: blocking == 0,
            issues,
            sync_status: Some(status),
        })
    }

    fn release_lock_logged(&self, tenant_id: &TenantId) {
        // The TTL is the backstop if this fails; never mask the phase result.
        if let Err(err) = self.store.release_lock(tenant_id) {
            warn!(tenant = %tenant_id, error = %err, "failed to release sync lock");
        }
    }
}

fn state_name(state: SyncState) -> &'static str {
    match state {
        SyncState::Pending => "pending",
        SyncState::InProgress => "in_progress",
        SyncState::Completed => "completed",
        SyncState::Failed => "failed",
    }
}
