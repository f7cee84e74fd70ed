//! Built-in migrations

use crate::registry::{Migration, MigrationRegistry};
use async_trait::async_trait;
use routing_api::{Result, RouteFilter, RoutingError};
use routing_db::{Database, SchemaStep};
use tracing::{debug, info};

/// Owner recorded for entries registered before owners were tracked
pub const UNKNOWN_LOG_GUID: &str = "unknown";

/// v0: route storage
pub struct CreateRouteTable;

#[async_trait]
impl Migration for CreateRouteTable {
    fn version(&self) -> u32 {
        0
    }

    fn name(&self) -> &'static str {
        "create_route_table"
    }

    async fn run(&self, db: &dyn Database) -> Result<()> {
        db.apply_schema(SchemaStep::CreateRouteTable).await
    }
}

/// v1: give every entry an owner
///
/// Entries keep their remaining TTL. The backfill is not a heartbeat from
/// the entry's registrant and must not keep an abandoned entry alive.
pub struct BackfillLogGuid;

#[async_trait]
impl Migration for BackfillLogGuid {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "backfill_log_guid"
    }

    async fn run(&self, db: &dyn Database) -> Result<()> {
        let mut filled = 0usize;
        for entry in db.list(&RouteFilter::all()).await? {
            if entry.log_guid.is_some() {
                continue;
            }

            let revision = entry.revision;
            let id = entry.id();
            match db
                .amend(&entry.with_log_guid(UNKNOWN_LOG_GUID), revision)
                .await
            {
                Ok(_) => filled += 1,
                // changed or removed since the listing; the newer write stands
                Err(RoutingError::Conflict(_)) | Err(RoutingError::NotFound(_)) => {
                    debug!("Skipping {} during owner backfill", id);
                }
                Err(e) => return Err(e),
            }
        }

        info!("Backfilled owner on {} route entries", filled);
        Ok(())
    }
}

/// v2: index used by the expiry sweep
pub struct CreateExpiryIndex;

#[async_trait]
impl Migration for CreateExpiryIndex {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "create_expiry_index"
    }

    async fn run(&self, db: &dyn Database) -> Result<()> {
        db.apply_schema(SchemaStep::CreateExpiryIndex).await
    }
}

pub fn builtin_registry() -> Result<MigrationRegistry> {
    let units: Vec<Box<dyn Migration>> = vec![
        Box::new(CreateRouteTable),
        Box::new(BackfillLogGuid),
        Box::new(CreateExpiryIndex),
    ];
    MigrationRegistry::new(units)
}
