//! Per-tenant sync status document: the sole unit of persisted orchestration
//! state.
//!
//! One `SyncStatus` exists per tenant. It is created lazily on the first
//! essential-phase attempt, mutated at phase boundaries and on every lock
//! acquire/release, and never deleted by the orchestration logic itself.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orgsync_core::TenantId;

/// TTL of the essential/reference phase lock. A crashed orchestrator releases
/// its exclusive claim automatically once this elapses, even if the explicit
/// release never ran.
pub const SYNC_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// Overall sync state of a tenant (also used per collection).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Pipeline phase. Advances forward only; a fresh `forceSync` run resets it
/// implicitly by starting over at `Independent`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Independent,
    Dependent,
    Completed,
}

/// Blocking class of a collection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CollectionClass {
    /// Failure blocks overall completion.
    Essential,
    /// Attempted during the essential phase but its failure only downgrades
    /// the run to a noted partial.
    Tolerated,
    /// Failure is non-fatal; recorded and reported as non-critical.
    Reference,
}

/// The eight synchronized collections.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Tenants,
    Organizations,
    Roles,
    Users,
    EmployeeAssignments,
    RoleAssignments,
    CreditConfigs,
    EntityCredits,
}

impl Collection {
    /// All collections, in the order the essential/reference phases walk them.
    pub const ALL: [Collection; 8] = [
        Collection::Tenants,
        Collection::Organizations,
        Collection::Roles,
        Collection::Users,
        Collection::EmployeeAssignments,
        Collection::RoleAssignments,
        Collection::CreditConfigs,
        Collection::EntityCredits,
    ];

    /// Collections synced during the essential phase. `RoleAssignments` comes
    /// last because its failure is tolerated rather than fatal.
    pub const ESSENTIAL_PHASE: [Collection; 5] = [
        Collection::Tenants,
        Collection::Organizations,
        Collection::Roles,
        Collection::Users,
        Collection::RoleAssignments,
    ];

    /// Collections synced during the reference phase.
    pub const REFERENCE_PHASE: [Collection; 4] = [
        Collection::EmployeeAssignments,
        Collection::RoleAssignments,
        Collection::CreditConfigs,
        Collection::EntityCredits,
    ];

    pub fn class(&self) -> CollectionClass {
        match self {
            Collection::Tenants
            | Collection::Organizations
            | Collection::Roles
            | Collection::Users => CollectionClass::Essential,
            Collection::RoleAssignments => CollectionClass::Tolerated,
            Collection::EmployeeAssignments
            | Collection::CreditConfigs
            | Collection::EntityCredits => CollectionClass::Reference,
        }
    }

    /// Whether a `Failed` state here blocks overall `status=completed`.
    pub fn is_blocking(&self) -> bool {
        self.class() == CollectionClass::Essential
    }

    /// Wire name, matching the persisted document layout.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Collection::Tenants => "tenants",
            Collection::Organizations => "organizations",
            Collection::Roles => "roles",
            Collection::Users => "users",
            Collection::EmployeeAssignments => "employeeAssignments",
            Collection::RoleAssignments => "roleAssignments",
            Collection::CreditConfigs => "creditConfigs",
            Collection::EntityCredits => "entityCredits",
        }
    }
}

impl core::fmt::Display for Collection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Outcome of syncing a single collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    pub status: SyncState,
    pub record_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionStatus {
    fn pending() -> Self {
        Self {
            status: SyncState::Pending,
            record_count: 0,
            error: None,
        }
    }
}

/// Time-bounded exclusive lock on a tenant's sync phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLock {
    pub is_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_expiry: Option<DateTime<Utc>>,
}

impl SyncLock {
    fn unlocked() -> Self {
        Self {
            is_locked: false,
            lock_owner: None,
            lock_expiry: None,
        }
    }

    /// A lock only counts as held while its expiry is in the future. A stale
    /// lock must be treated as unlocked by any acquirer.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.is_locked && self.lock_expiry.is_some_and(|expiry| expiry > now)
    }
}

/// Persisted per-tenant record of sync progress, lock state, and
/// per-collection outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub tenant_id: TenantId,
    pub status: SyncState,
    pub phase: SyncPhase,
    pub collections: BTreeMap<Collection, CollectionStatus>,
    pub sync_lock: SyncLock,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    /// Fresh document: `status=pending, phase=independent`, all collections
    /// pending, unlocked.
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            status: SyncState::Pending,
            phase: SyncPhase::Independent,
            collections: Collection::ALL
                .iter()
                .map(|c| (*c, CollectionStatus::pending()))
                .collect(),
            sync_lock: SyncLock::unlocked(),
            attempt_count: 0,
            last_attempt_at: None,
            completed_at: None,
        }
    }

    /// Derived sum of record counts across all collections.
    pub fn total_records(&self) -> u64 {
        self.collections.values().map(|c| c.record_count).sum()
    }

    pub fn collection(&self, collection: Collection) -> &CollectionStatus {
        // The map is fully populated at construction.
        &self.collections[&collection]
    }

    /// Whether the tenant is fully synced (idempotency short-circuit check).
    pub fn is_fully_synced(&self) -> bool {
        self.status == SyncState::Completed && self.phase == SyncPhase::Completed
    }

    /// Whether every reference collection completed (reference-phase
    /// short-circuit).
    pub fn reference_all_synced(&self) -> bool {
        Collection::REFERENCE_PHASE
            .iter()
            .all(|c| self.collection(*c).status == SyncState::Completed)
    }

    /// Whether any blocking (essential) collection failed.
    pub fn has_blocking_failure(&self) -> bool {
        self.collections
            .iter()
            .any(|(c, s)| c.is_blocking() && s.status == SyncState::Failed)
    }

    /// Begin an essential-phase attempt: counts the attempt and moves the
    /// document into `in_progress` at the independent phase.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = SyncState::InProgress;
        self.phase = SyncPhase::Independent;
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.completed_at = None;
    }

    pub fn mark_collection_in_progress(&mut self, collection: Collection) {
        self.set_collection(collection, SyncState::InProgress, 0, None);
    }

    pub fn mark_collection_completed(&mut self, collection: Collection, record_count: u64) {
        self.set_collection(collection, SyncState::Completed, record_count, None);
    }

    pub fn mark_collection_failed(&mut self, collection: Collection, error: String) {
        self.set_collection(collection, SyncState::Failed, 0, Some(error));
    }

    fn set_collection(
        &mut self,
        collection: Collection,
        status: SyncState,
        record_count: u64,
        error: Option<String>,
    ) {
        self.collections.insert(
            collection,
            CollectionStatus {
                status,
                record_count,
                error,
            },
        );
    }

    /// Phase only advances forward; a successful run never decrements it.
    pub fn advance_phase(&mut self, target: SyncPhase) {
        if target > self.phase {
            self.phase = target;
        }
    }

    /// Close out a successful run: `phase=completed, status=completed`,
    /// unless a blocking collection failed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        if self.has_blocking_failure() {
            self.status = SyncState::Failed;
            return;
        }
        self.advance_phase(SyncPhase::Completed);
        self.status = SyncState::Completed;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self) {
        self.status = SyncState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("T1").unwrap()
    }

    #[test]
    fn fresh_document_defaults() {
        let status = SyncStatus::new(tenant());
        assert_eq!(status.status, SyncState::Pending);
        assert_eq!(status.phase, SyncPhase::Independent);
        assert_eq!(status.collections.len(), 8);
        assert_eq!(status.total_records(), 0);
        assert!(!status.sync_lock.is_locked);
        assert!(!status.is_fully_synced());
    }

    #[test]
    fn phase_never_moves_backward() {
        let mut status = SyncStatus::new(tenant());
        status.advance_phase(SyncPhase::Dependent);
        assert_eq!(status.phase, SyncPhase::Dependent);
        status.advance_phase(SyncPhase::Independent);
        assert_eq!(status.phase, SyncPhase::Dependent);
        status.advance_phase(SyncPhase::Completed);
        assert_eq!(status.phase, SyncPhase::Completed);
    }

    #[test]
    fn essential_failure_blocks_completion() {
        let mut status = SyncStatus::new(tenant());
        status.mark_collection_failed(Collection::Users, "upstream 500".into());
        status.mark_completed(Utc::now());
        assert_eq!(status.status, SyncState::Failed);
        assert!(status.completed_at.is_none());
    }

    #[test]
    fn reference_failure_does_not_block_completion() {
        let mut status = SyncStatus::new(tenant());
        status.mark_collection_failed(Collection::EntityCredits, "upstream 500".into());
        status.mark_collection_failed(Collection::RoleAssignments, "upstream 500".into());
        status.mark_completed(Utc::now());
        assert_eq!(status.status, SyncState::Completed);
        assert_eq!(status.phase, SyncPhase::Completed);
    }

    #[test]
    fn stale_lock_is_not_held() {
        let now = Utc::now();
        let lock = SyncLock {
            is_locked: true,
            lock_owner: Some("wf-1".into()),
            lock_expiry: Some(now - chrono::Duration::seconds(1)),
        };
        assert!(!lock.is_held_at(now));

        let live = SyncLock {
            lock_expiry: Some(now + chrono::Duration::minutes(5)),
            ..lock
        };
        assert!(live.is_held_at(now));
    }

    #[test]
    fn total_records_sums_collections() {
        let mut status = SyncStatus::new(tenant());
        status.mark_collection_completed(Collection::Users, 40);
        status.mark_collection_completed(Collection::Roles, 2);
        assert_eq!(status.total_records(), 42);
    }

    #[test]
    fn document_serializes_with_camel_case_layout() {
        let status = SyncStatus::new(tenant());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["tenantId"], "T1");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["phase"], "independent");
        assert!(json["collections"]["roleAssignments"].is_object());
        assert_eq!(json["syncLock"]["isLocked"], false);
        assert_eq!(json["attemptCount"], 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn lock_with_past_or_missing_expiry_is_never_held(
                is_locked: bool,
                offset_secs in -86_400i64..0,
                has_expiry: bool,
            ) {
                let now = Utc::now();
                let lock = SyncLock {
                    is_locked,
                    lock_owner: Some("wf-1".into()),
                    lock_expiry: has_expiry
                        .then(|| now + chrono::Duration::seconds(offset_secs)),
                };
                prop_assert!(!lock.is_held_at(now));
            }
        }
    }

    #[test]
    fn begin_attempt_counts_attempts() {
        let mut status = SyncStatus::new(tenant());
        let now = Utc::now();
        status.begin_attempt(now);
        status.begin_attempt(now);
        assert_eq!(status.attempt_count, 2);
        assert_eq!(status.status, SyncState::InProgress);
        assert_eq!(status.last_attempt_at, Some(now));
    }
}
