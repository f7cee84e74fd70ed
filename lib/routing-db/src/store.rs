//! Storage port and migration coordination contracts
//!
//! Both backends implement the same traits; the service picks one at startup
//! and never mixes them within a process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use routing_api::{Result, RouteEntry, RouteFilter, RouteId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Route entry persistence with per-entry optimistic concurrency
///
/// None of these operations retry internally. A backend that cannot be
/// reached fails with `RoutingError::Communication`.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Store a new entry. Returns its revision (always 0).
    async fn create(&self, entry: &RouteEntry) -> Result<u64>;

    async fn get(&self, id: &RouteId) -> Result<RouteEntry>;

    /// Replace an entry if its stored revision equals `expected_revision`.
    /// Returns the new revision, `expected_revision + 1`.
    async fn update(&self, entry: &RouteEntry, expected_revision: u64) -> Result<u64>;

    /// Like `update`, but the entry keeps the expiry it already had.
    /// Used for rewrites that are not a renewal by the entry's owner.
    async fn amend(&self, entry: &RouteEntry, expected_revision: u64) -> Result<u64>;

    async fn delete(&self, id: &RouteId, expected_revision: u64) -> Result<()>;

    /// Matching live entries, ordered by identifier
    async fn list(&self, filter: &RouteFilter) -> Result<Vec<RouteEntry>>;

    /// Physically remove entries whose TTL has elapsed. Returns how many were removed.
    async fn sweep_expired(&self) -> Result<usize>;
}

/// A held migration lock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Cross-process coordination state: the migration lock and version marker
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Take the lock unless another holder's lease is still valid.
    /// `Ok(None)` means someone else holds it.
    async fn try_acquire_lock(&self, holder: &str, lease: Duration) -> Result<Option<LockLease>>;

    /// Extend the caller's own lease. Fails with `LockTimeout` if the lease was lost.
    async fn renew_lock(&self, holder: &str, lease: Duration) -> Result<LockLease>;

    /// Drop the lock if `holder` still owns it
    async fn release_lock(&self, holder: &str) -> Result<()>;

    /// Highest applied migration version, `None` before the first run
    async fn migration_version(&self) -> Result<Option<u32>>;

    /// Advance the marker. A lower or equal version leaves it unchanged.
    async fn set_migration_version(&self, version: u32) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Kv,
    Sql,
}

/// Structural changes a migration can request from the active backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaStep {
    CreateRouteTable,
    CreateExpiryIndex,
}

/// A complete backend: what migrations and the service run against
#[async_trait]
pub trait Database: RouteStore + Coordinator {
    fn kind(&self) -> BackendKind;

    /// Apply a schema step idempotently. Schema-less backends accept every step as a no-op.
    async fn apply_schema(&self, step: SchemaStep) -> Result<()>;
}
