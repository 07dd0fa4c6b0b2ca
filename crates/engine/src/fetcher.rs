//! Upstream data-fetch port.
//!
//! The actual fetch/transform logic that talks to the external system of
//! record is out of scope; the engine only sees it as a per-collection
//! operation with a record-count result.

use async_trait::async_trait;

use orgsync_core::{SyncResult, TenantId};

use crate::status::Collection;

/// Pulls one collection of a tenant's organizational data from the system of
/// record into the local store and reports how many records landed.
#[async_trait]
pub trait TenantDataFetcher: Send + Sync {
    async fn sync_collection(
        &self,
        tenant_id: &TenantId,
        auth_token: &str,
        collection: Collection,
        force: bool,
    ) -> SyncResult<u64>;
}
