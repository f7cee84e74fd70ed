//! Storage port over a key-value store
//!
//! Layout under the namespace:
//! - `<ns>/routes/<hex(route)>/<hex(ip:port)>`: one JSON-encoded entry per key
//! - `<ns>/locks/migration`: the migration lock, written with a TTL equal to the lease
//! - `<ns>/migration/version`: the highest applied migration version
//!
//! Entries carry their own `revision`; the store's native `modified_index` is
//! what guards every conditional write.

use super::client::{KvClient, KvError, KvNode};
use crate::clock::{deadline, Clock};
use crate::store::{BackendKind, Coordinator, Database, LockLease, RouteStore, SchemaStep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use routing_api::{Result, RouteEntry, RouteFilter, RouteId, RoutingError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_NAMESPACE: &str = "/routing/v1";

pub struct KvStore {
    client: Arc<dyn KvClient>,
    clock: Arc<dyn Clock>,
    namespace: String,
}

impl KvStore {
    pub fn new(client: Arc<dyn KvClient>, clock: Arc<dyn Clock>) -> Self {
        Self::with_namespace(client, clock, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(
        client: Arc<dyn KvClient>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into().trim_end_matches('/').to_string();
        Self {
            client,
            clock,
            namespace,
        }
    }

    fn routes_prefix(&self) -> String {
        format!("{}/routes/", self.namespace)
    }

    fn route_key(&self, id: &RouteId) -> String {
        format!(
            "{}{}/{}",
            self.routes_prefix(),
            hex::encode(id.route.as_bytes()),
            hex::encode(id.address().as_bytes())
        )
    }

    fn lock_key(&self) -> String {
        format!("{}/locks/migration", self.namespace)
    }

    fn version_key(&self) -> String {
        format!("{}/migration/version", self.namespace)
    }

    /// Read an entry together with the node whose index guards its next write
    async fn read(&self, id: &RouteId) -> Result<(RouteEntry, KvNode)> {
        let node = self
            .client
            .get(&self.route_key(id))
            .await
            .map_err(|e| route_error(e, id))?;
        let entry: RouteEntry = serde_json::from_str(&node.value)?;
        Ok((entry, node))
    }

    /// TTL that lands on an existing `expiration`. `None` never expires.
    fn remaining(&self, id: &RouteId, expiration: Option<DateTime<Utc>>) -> Result<Option<Duration>> {
        let Some(at) = expiration else {
            return Ok(None);
        };
        match (at - self.clock.now()).to_std() {
            Ok(left) if !left.is_zero() => Ok(Some(left)),
            _ => Err(RoutingError::NotFound(id.to_string())),
        }
    }

    async fn rewrite(&self, entry: &RouteEntry, expected_revision: u64, renew: bool) -> Result<u64> {
        entry.validate()?;
        let id = entry.id();

        let (current, node) = self.read(&id).await?;
        if current.revision != expected_revision {
            debug!(
                "Update of {} rejected: revision {} != {}",
                id, current.revision, expected_revision
            );
            return Err(RoutingError::Conflict(id.to_string()));
        }

        let ttl = if renew {
            entry.ttl_duration()
        } else {
            self.remaining(&id, node.expiration)?
        };

        let mut stored = entry.clone();
        stored.revision = expected_revision + 1;
        let value = serde_json::to_string(&stored)?;

        self.client
            .compare_and_swap(&self.route_key(&id), &value, ttl, node.modified_index)
            .await
            .map_err(|e| route_error(e, &id))?;

        debug!("Updated route {} to revision {}", id, stored.revision);
        Ok(stored.revision)
    }

    async fn read_lock(&self) -> Result<Option<(LockLease, u64)>> {
        match self.client.get(&self.lock_key()).await {
            Ok(node) => Ok(Some((serde_json::from_str(&node.value)?, node.modified_index))),
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(coordination_error(e)),
        }
    }
}

fn route_error(err: KvError, id: &RouteId) -> RoutingError {
    match err {
        KvError::KeyNotFound(_) => RoutingError::NotFound(id.to_string()),
        KvError::NodeExists(_) | KvError::TestFailed(_) => RoutingError::Conflict(id.to_string()),
        KvError::Unavailable(msg) => RoutingError::Communication(msg),
        KvError::Protocol(msg) => RoutingError::Internal(msg),
    }
}

fn coordination_error(err: KvError) -> RoutingError {
    match err {
        KvError::KeyNotFound(key) => RoutingError::NotFound(key),
        KvError::NodeExists(key) | KvError::TestFailed(key) => RoutingError::Conflict(key),
        KvError::Unavailable(msg) => RoutingError::Communication(msg),
        KvError::Protocol(msg) => RoutingError::Internal(msg),
    }
}

fn decode_entries(nodes: Vec<KvNode>) -> Result<Vec<RouteEntry>> {
    nodes
        .into_iter()
        .map(|node| serde_json::from_str::<RouteEntry>(&node.value).map_err(RoutingError::from))
        .collect()
}

#[async_trait]
impl RouteStore for KvStore {
    async fn create(&self, entry: &RouteEntry) -> Result<u64> {
        entry.validate()?;
        let id = entry.id();

        let mut stored = entry.clone();
        stored.revision = 0;
        let value = serde_json::to_string(&stored)?;

        self.client
            .create(&self.route_key(&id), &value, entry.ttl_duration())
            .await
            .map_err(|e| route_error(e, &id))?;

        debug!("Created route {}", id);
        Ok(0)
    }

    async fn get(&self, id: &RouteId) -> Result<RouteEntry> {
        let (entry, _) = self.read(id).await?;
        Ok(entry)
    }

    async fn update(&self, entry: &RouteEntry, expected_revision: u64) -> Result<u64> {
        self.rewrite(entry, expected_revision, true).await
    }

    async fn amend(&self, entry: &RouteEntry, expected_revision: u64) -> Result<u64> {
        self.rewrite(entry, expected_revision, false).await
    }

    async fn delete(&self, id: &RouteId, expected_revision: u64) -> Result<()> {
        let (current, node) = self.read(id).await?;
        if current.revision != expected_revision {
            return Err(RoutingError::Conflict(id.to_string()));
        }

        self.client
            .compare_and_delete(&self.route_key(id), node.modified_index)
            .await
            .map_err(|e| route_error(e, id))?;

        debug!("Deleted route {}", id);
        Ok(())
    }

    async fn list(&self, filter: &RouteFilter) -> Result<Vec<RouteEntry>> {
        let nodes = self
            .client
            .list(&self.routes_prefix())
            .await
            .map_err(coordination_error)?;
        Ok(filter.apply(decode_entries(nodes)?))
    }

    async fn sweep_expired(&self) -> Result<usize> {
        self.client.sweep_expired().await.map_err(coordination_error)
    }
}

#[async_trait]
impl Coordinator for KvStore {
    async fn try_acquire_lock(&self, holder: &str, lease: Duration) -> Result<Option<LockLease>> {
        let now = self.clock.now();
        let record = LockLease {
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: deadline(now, lease),
        };
        let value = serde_json::to_string(&record)?;

        match self.client.create(&self.lock_key(), &value, Some(lease)).await {
            Ok(_) => Ok(Some(record)),
            Err(KvError::NodeExists(_)) => Ok(None),
            Err(e) => Err(coordination_error(e)),
        }
    }

    async fn renew_lock(&self, holder: &str, lease: Duration) -> Result<LockLease> {
        let (mut record, index) = match self.read_lock().await? {
            Some((record, index)) if record.holder == holder => (record, index),
            _ => return Err(RoutingError::LockTimeout(lease)),
        };

        record.expires_at = deadline(self.clock.now(), lease);
        let value = serde_json::to_string(&record)?;
        match self
            .client
            .compare_and_swap(&self.lock_key(), &value, Some(lease), index)
            .await
        {
            Ok(_) => Ok(record),
            Err(KvError::KeyNotFound(_)) | Err(KvError::TestFailed(_)) => {
                Err(RoutingError::LockTimeout(lease))
            }
            Err(e) => Err(coordination_error(e)),
        }
    }

    async fn release_lock(&self, holder: &str) -> Result<()> {
        let index = match self.read_lock().await? {
            Some((record, index)) if record.holder == holder => index,
            Some((record, _)) => {
                warn!(
                    "Migration lock is held by {}, not releasing it for {}",
                    record.holder, holder
                );
                return Ok(());
            }
            None => return Ok(()),
        };

        match self.client.compare_and_delete(&self.lock_key(), index).await {
            Ok(()) | Err(KvError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(coordination_error(e)),
        }
    }

    async fn migration_version(&self) -> Result<Option<u32>> {
        match self.client.get(&self.version_key()).await {
            Ok(node) => node
                .value
                .parse::<u32>()
                .map(Some)
                .map_err(|_| RoutingError::Internal(format!("invalid migration version: {}", node.value))),
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(coordination_error(e)),
        }
    }

    async fn set_migration_version(&self, version: u32) -> Result<()> {
        let key = self.version_key();
        let value = version.to_string();

        let result = match self.client.get(&key).await {
            Ok(node) => {
                let current = node.value.parse::<u32>().map_err(|_| {
                    RoutingError::Internal(format!("invalid migration version: {}", node.value))
                })?;
                if current >= version {
                    return Ok(());
                }
                self.client
                    .compare_and_swap(&key, &value, None, node.modified_index)
                    .await
            }
            Err(KvError::KeyNotFound(_)) => self.client.create(&key, &value, None).await,
            Err(e) => return Err(coordination_error(e)),
        };

        result.map(|_| ()).map_err(coordination_error)
    }
}

#[async_trait]
impl Database for KvStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Kv
    }

    async fn apply_schema(&self, step: SchemaStep) -> Result<()> {
        debug!("{:?} needs no change on the key-value backend", step);
        Ok(())
    }
}
