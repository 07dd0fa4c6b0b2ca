//! Sync status persistence and the per-tenant sync lock.
//!
//! The store only needs atomic read-modify-write of whole documents plus
//! TTL-style lock expiry; the concrete engine behind it is out of scope.
//! Concurrent writers are prevented by the lock, not by optimistic
//! concurrency control, so callers re-read before mutating.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;

use orgsync_core::{SyncError, TenantId};

use crate::status::SyncStatus;

/// Store-level error. Surfaces to phases as a retryable `SyncError::Storage`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::storage(err.to_string())
    }
}

/// Sync status store + lock manager.
///
/// `acquire_lock`/`release_lock` are part of the store because lock state
/// lives inside the persisted document and must be written atomically with it.
pub trait SyncStatusStore: Send + Sync {
    /// Fetch the status document for a tenant, if one exists.
    fn get(&self, tenant_id: &TenantId) -> Result<Option<SyncStatus>, StoreError>;

    /// Fetch the status document, creating a fresh `pending/independent` one
    /// if the tenant has never synced.
    fn create_if_absent(&self, tenant_id: &TenantId) -> Result<SyncStatus, StoreError>;

    /// Atomic full-document replace.
    fn save(&self, status: &SyncStatus) -> Result<(), StoreError>;

    /// Try to take the tenant's exclusive sync lock.
    ///
    /// Succeeds iff no lock is held, the held lock's expiry has passed, or
    /// the held lock already belongs to `owner` (a retrying attempt whose
    /// earlier try was cut off mid-flight re-acquires its own lock rather
    /// than waiting out the TTL). On success the lock is persisted as `owner`
    /// with expiry `now + ttl`. Returns `false` (no mutation) otherwise.
    fn acquire_lock(
        &self,
        tenant_id: &TenantId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Unconditionally release the tenant's sync lock.
    ///
    /// Callers run this on every phase exit path, success or failure; the TTL
    /// is only the backstop for a crashed process that never got here.
    fn release_lock(&self, tenant_id: &TenantId) -> Result<(), StoreError>;
}

impl<S: SyncStatusStore + ?Sized> SyncStatusStore for Arc<S> {
    fn get(&self, tenant_id: &TenantId) -> Result<Option<SyncStatus>, StoreError> {
        (**self).get(tenant_id)
    }

    fn create_if_absent(&self, tenant_id: &TenantId) -> Result<SyncStatus, StoreError> {
        (**self).create_if_absent(tenant_id)
    }

    fn save(&self, status: &SyncStatus) -> Result<(), StoreError> {
        (**self).save(status)
    }

    fn acquire_lock(
        &self,
        tenant_id: &TenantId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).acquire_lock(tenant_id, owner, ttl)
    }

    fn release_lock(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        (**self).release_lock(tenant_id)
    }
}

/// In-memory status store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySyncStatusStore {
    documents: RwLock<HashMap<TenantId, SyncStatus>>,
}

impl InMemorySyncStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<TenantId, SyncStatus>>, StoreError> {
        self.documents
            .read()
            .map_err(|_| StoreError::Corrupted("status store lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<TenantId, SyncStatus>>, StoreError> {
        self.documents
            .write()
            .map_err(|_| StoreError::Corrupted("status store lock poisoned".into()))
    }
}

impl SyncStatusStore for InMemorySyncStatusStore {
    fn get(&self, tenant_id: &TenantId) -> Result<Option<SyncStatus>, StoreError> {
        Ok(self.read()?.get(tenant_id).cloned())
    }

    fn create_if_absent(&self, tenant_id: &TenantId) -> Result<SyncStatus, StoreError> {
        let mut docs = self.write()?;
        Ok(docs
            .entry(tenant_id.clone())
            .or_insert_with(|| SyncStatus::new(tenant_id.clone()))
            .clone())
    }

    fn save(&self, status: &SyncStatus) -> Result<(), StoreError> {
        self.write()?
            .insert(status.tenant_id.clone(), status.clone());
        Ok(())
    }

    fn acquire_lock(
        &self,
        tenant_id: &TenantId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut docs = self.write()?;
        let doc = docs
            .entry(tenant_id.clone())
            .or_insert_with(|| SyncStatus::new(tenant_id.clone()));

        let now = Utc::now();
        let held_by_other = doc.sync_lock.is_held_at(now)
            && doc.sync_lock.lock_owner.as_deref() != Some(owner);
        if held_by_other {
            return Ok(false);
        }

        doc.sync_lock.is_locked = true;
        doc.sync_lock.lock_owner = Some(owner.to_string());
        doc.sync_lock.lock_expiry =
            Some(now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()));
        Ok(true)
    }

    fn release_lock(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        let mut docs = self.write()?;
        if let Some(doc) = docs.get_mut(tenant_id) {
            doc.sync_lock.is_locked = false;
            doc.sync_lock.lock_owner = None;
            doc.sync_lock.lock_expiry = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{SyncPhase, SyncState};

    fn tenant() -> TenantId {
        TenantId::new("T1").unwrap()
    }

    #[test]
    fn create_if_absent_is_lazy_and_idempotent() {
        let store = InMemorySyncStatusStore::new();
        assert!(store.get(&tenant()).unwrap().is_none());

        let created = store.create_if_absent(&tenant()).unwrap();
        assert_eq!(created.status, SyncState::Pending);
        assert_eq!(created.phase, SyncPhase::Independent);

        let mut mutated = created.clone();
        mutated.attempt_count = 3;
        store.save(&mutated).unwrap();

        // Second call returns the existing document, not a fresh one.
        let again = store.create_if_absent(&tenant()).unwrap();
        assert_eq!(again.attempt_count, 3);
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let store = InMemorySyncStatusStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lock(&tenant(), "wf-a", ttl).unwrap());
        assert!(!store.acquire_lock(&tenant(), "wf-b", ttl).unwrap());

        // Losing acquirer must not have mutated the owner.
        let doc = store.get(&tenant()).unwrap().unwrap();
        assert_eq!(doc.sync_lock.lock_owner.as_deref(), Some("wf-a"));

        store.release_lock(&tenant()).unwrap();
        assert!(store.acquire_lock(&tenant(), "wf-b", ttl).unwrap());
    }

    #[test]
    fn owner_can_reacquire_its_own_live_lock() {
        let store = InMemorySyncStatusStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lock(&tenant(), "wf-a", ttl).unwrap());
        let first_expiry = store.get(&tenant()).unwrap().unwrap().sync_lock.lock_expiry;

        // The same owner retrying gets its lock back with a fresh expiry;
        // everyone else still bounces off.
        assert!(
            store
                .acquire_lock(&tenant(), "wf-a", Duration::from_secs(120))
                .unwrap()
        );
        assert!(!store.acquire_lock(&tenant(), "wf-b", ttl).unwrap());

        let doc = store.get(&tenant()).unwrap().unwrap();
        assert_eq!(doc.sync_lock.lock_owner.as_deref(), Some("wf-a"));
        assert!(doc.sync_lock.lock_expiry > first_expiry);
    }

    #[test]
    fn expired_lock_is_acquirable_regardless_of_flag() {
        let store = InMemorySyncStatusStore::new();
        let mut doc = store.create_if_absent(&tenant()).unwrap();
        doc.sync_lock.is_locked = true;
        doc.sync_lock.lock_owner = Some("crashed-wf".into());
        doc.sync_lock.lock_expiry = Some(Utc::now() - chrono::Duration::minutes(1));
        store.save(&doc).unwrap();

        assert!(
            store
                .acquire_lock(&tenant(), "wf-new", Duration::from_secs(60))
                .unwrap()
        );
        let doc = store.get(&tenant()).unwrap().unwrap();
        assert_eq!(doc.sync_lock.lock_owner.as_deref(), Some("wf-new"));
    }

    #[test]
    fn release_is_unconditional_and_tolerates_missing_tenant() {
        let store = InMemorySyncStatusStore::new();
        // Releasing a never-created tenant is a no-op, not an error.
        store.release_lock(&tenant()).unwrap();
    }
}
