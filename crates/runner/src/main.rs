//! Command-line runner: drives one tenant sync run against in-memory
//! infrastructure and prints the run result as JSON.
//!
//! Configuration comes from the environment:
//! `ORGSYNC_TENANT_ID`, `ORGSYNC_AUTH_TOKEN`, `ORGSYNC_FORCE_SYNC`,
//! `ORGSYNC_SKIP_REFERENCE_DATA`, plus `RUST_LOG` / `ORGSYNC_LOG_FORMAT`
//! for logging.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use orgsync_core::{SyncResult, TenantId};
use orgsync_engine::{
    Collection, InMemoryDeadLetterPublisher, InMemorySyncStatusStore, SyncOptions, SyncOrchestrator,
    SyncRequest, TenantDataFetcher,
};

/// Stand-in upstream fetcher: reports a fixed record count per collection
/// after a short simulated round trip.
struct SimulatedFetcher;

#[async_trait]
impl TenantDataFetcher for SimulatedFetcher {
    async fn sync_collection(
        &self,
        tenant_id: &TenantId,
        _auth_token: &str,
        collection: Collection,
        force: bool,
    ) -> SyncResult<u64> {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let count = match collection {
            Collection::Tenants => 1,
            Collection::Organizations => 12,
            Collection::Roles => 8,
            Collection::Users => 140,
            Collection::RoleAssignments => 220,
            Collection::EmployeeAssignments => 95,
            Collection::CreditConfigs => 4,
            Collection::EntityCredits => 60,
        };
        info!(tenant = %tenant_id, collection = %collection, count, force, "fetched collection");
        Ok(count)
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orgsync_observability::init();

    let tenant_id =
        std::env::var("ORGSYNC_TENANT_ID").context("ORGSYNC_TENANT_ID must be set")?;
    let auth_token =
        std::env::var("ORGSYNC_AUTH_TOKEN").context("ORGSYNC_AUTH_TOKEN must be set")?;

    let request = SyncRequest {
        tenant_id,
        auth_token,
        options: SyncOptions {
            force_sync: env_flag("ORGSYNC_FORCE_SYNC"),
            skip_reference_data: env_flag("ORGSYNC_SKIP_REFERENCE_DATA"),
        },
    };

    let store = InMemorySyncStatusStore::arc();
    let publisher = Arc::new(InMemoryDeadLetterPublisher::new());
    let orchestrator =
        SyncOrchestrator::new(store, Arc::new(SimulatedFetcher), publisher.clone());

    let result = orchestrator.run(request).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    for entry in publisher.entries() {
        eprintln!("dead letter: {}", serde_json::to_string(&entry)?);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
