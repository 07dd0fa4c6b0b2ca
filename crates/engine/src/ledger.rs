//! Idempotency-ledger checkpointing.
//!
//! The event processor's in-memory dedup set must survive restarts/replays.
//! This port persists the set per tenant; the processor checkpoints on every
//! accepted key and reloads an identical ledger when a new instance starts.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use orgsync_core::TenantId;

use crate::store::StoreError;

/// Checkpoint store for a tenant's processed-signal keys.
pub trait SignalLedgerStore: Send + Sync {
    /// Load the full ledger for a tenant. Empty iff the tenant's processor
    /// has never accepted a signal.
    fn load(&self, tenant_id: &TenantId) -> Result<HashSet<String>, StoreError>;

    /// Record one accepted key. Must be durable before the handler runs so a
    /// replayed delivery is still deduplicated.
    fn record(&self, tenant_id: &TenantId, key: &str) -> Result<(), StoreError>;
}

/// In-memory ledger store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySignalLedgerStore {
    ledgers: RwLock<HashMap<TenantId, HashSet<String>>>,
}

impl InMemorySignalLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalLedgerStore for InMemorySignalLedgerStore {
    fn load(&self, tenant_id: &TenantId) -> Result<HashSet<String>, StoreError> {
        let ledgers = self
            .ledgers
            .read()
            .map_err(|_| StoreError::Corrupted("ledger store lock poisoned".into()))?;
        Ok(ledgers.get(tenant_id).cloned().unwrap_or_default())
    }

    fn record(&self, tenant_id: &TenantId, key: &str) -> Result<(), StoreError> {
        let mut ledgers = self
            .ledgers
            .write()
            .map_err(|_| StoreError::Corrupted("ledger store lock poisoned".into()))?;
        ledgers
            .entry(tenant_id.clone())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }
}
