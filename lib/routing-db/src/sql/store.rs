//! Storage port over a relational database
//!
//! One row per entry keyed by (route, ip, port) with an integer `revision`
//! column. Conditional writes go first, so the transaction holds the write
//! lock before anything else. Only when no row matched is the row read back,
//! still inside that transaction, to tell "not found" from "conflict".

use super::schema;
use crate::clock::{deadline, Clock};
use crate::store::{BackendKind, Coordinator, Database, LockLease, RouteStore, SchemaStep};
use async_trait::async_trait;
use routing_api::{Result, RouteEntry, RouteFilter, RouteId, RoutingError};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const LOCK_NAME: &str = "migration";
const VERSION_ROW: i64 = 1;

const ENTRY_COLUMNS: &str =
    "route, ip, port, route_service_url, ttl, log_guid, annotations, revision";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            Err(RoutingError::Internal(format!(
                "unsupported database url scheme: {}",
                url.split(':').next().unwrap_or_default()
            )))
        }
    }
}

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RoutingError {
    match &err {
        sqlx::Error::RowNotFound => RoutingError::NotFound(err.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RoutingError::Conflict(db.message().to_string())
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Configuration(_) => RoutingError::Internal(err.to_string()),
        _ => RoutingError::Communication(err.to_string()),
    }
}

fn column_out_of_range(column: &str, value: i64) -> RoutingError {
    RoutingError::Internal(format!("column {} out of range: {}", column, value))
}

fn row_to_entry(row: &AnyRow) -> Result<RouteEntry> {
    let port: i64 = row.try_get("port").map_err(map_sqlx_err)?;
    let ttl: Option<i64> = row.try_get("ttl").map_err(map_sqlx_err)?;
    let revision: i64 = row.try_get("revision").map_err(map_sqlx_err)?;
    let annotations: String = row.try_get("annotations").map_err(map_sqlx_err)?;

    Ok(RouteEntry {
        route: row.try_get("route").map_err(map_sqlx_err)?,
        ip: row.try_get("ip").map_err(map_sqlx_err)?,
        port: u16::try_from(port).map_err(|_| column_out_of_range("port", port))?,
        route_service_url: row.try_get("route_service_url").map_err(map_sqlx_err)?,
        ttl: ttl
            .map(|t| u32::try_from(t).map_err(|_| column_out_of_range("ttl", t)))
            .transpose()?,
        log_guid: row.try_get("log_guid").map_err(map_sqlx_err)?,
        annotations: serde_json::from_str(&annotations)?,
        revision: u64::try_from(revision).map_err(|_| column_out_of_range("revision", revision))?,
    })
}

fn revision_param(revision: u64) -> Result<i64> {
    i64::try_from(revision)
        .map_err(|_| RoutingError::ProcessRequest(format!("revision out of range: {}", revision)))
}

pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
    clock: Arc<dyn Clock>,
}

impl SqlStore {
    /// Connect and create the migration bookkeeping tables.
    ///
    /// The route table itself is created by the first migration.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_url(url)?;

        let options = AnyPoolOptions::new().acquire_timeout(acquire_timeout);
        let options = if url.contains(":memory:") {
            // each connection to an in-memory database sees its own database
            options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(max_connections)
        };
        let pool = options.connect(url).await.map_err(map_sqlx_err)?;

        let store = Self {
            pool,
            dialect,
            clock,
        };
        store.ensure_bookkeeping().await?;
        info!("Connected to {:?} database", dialect);
        Ok(store)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn ensure_bookkeeping(&self) -> Result<()> {
        for ddl in [schema::CREATE_VERSION_TABLE, schema::CREATE_LOCK_TABLE] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        }
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry_ms(&self, entry: &RouteEntry) -> Option<i64> {
        entry
            .ttl_duration()
            .map(|ttl| deadline(self.clock.now(), ttl).timestamp_millis())
    }

    /// Why a conditional write on `id` matched no row
    async fn classify_miss(&self, conn: &mut AnyConnection, id: &RouteId) -> Result<RoutingError> {
        let row = sqlx::query(
            "SELECT expires_at FROM route_entries WHERE route = $1 AND ip = $2 AND port = $3",
        )
        .bind(id.route.clone())
        .bind(id.ip.clone())
        .bind(i64::from(id.port))
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;

        let Some(row) = row else {
            return Ok(RoutingError::NotFound(id.to_string()));
        };
        let expires_at: Option<i64> = row.try_get("expires_at").map_err(map_sqlx_err)?;
        if expires_at.is_some_and(|at| at <= self.now_ms()) {
            Ok(RoutingError::NotFound(id.to_string()))
        } else {
            Ok(RoutingError::Conflict(id.to_string()))
        }
    }

    /// Conditional rewrite of a live entry. With `renew` the expiry restarts
    /// from the entry's TTL, otherwise the stored expiry is left alone.
    async fn rewrite(&self, entry: &RouteEntry, expected_revision: u64, renew: bool) -> Result<u64> {
        entry.validate()?;
        let id = entry.id();
        let annotations = serde_json::to_string(&entry.annotations)?;
        let next_revision = expected_revision + 1;

        let statement = format!(
            r#"UPDATE route_entries
               SET route_service_url = $6, ttl = $7, log_guid = $8, annotations = $9,
                   revision = $10{}
               WHERE route = $1 AND ip = $2 AND port = $3 AND revision = $4
                 AND (expires_at IS NULL OR expires_at > $5)"#,
            if renew { ", expires_at = $11" } else { "" }
        );
        let mut query = sqlx::query(&statement)
            .bind(id.route.clone())
            .bind(id.ip.clone())
            .bind(i64::from(id.port))
            .bind(revision_param(expected_revision)?)
            .bind(self.now_ms())
            .bind(entry.route_service_url.clone())
            .bind(entry.ttl.map(i64::from))
            .bind(entry.log_guid.clone())
            .bind(annotations)
            .bind(revision_param(next_revision)?);
        if renew {
            query = query.bind(self.expiry_ms(entry));
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let updated = query.execute(&mut *tx).await.map_err(map_sqlx_err)?;

        if updated.rows_affected() == 0 {
            let err = self.classify_miss(&mut tx, &id).await?;
            debug!(
                "Update of {} at revision {} rejected: {}",
                id, expected_revision, err
            );
            return Err(err);
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        debug!("Updated route {} to revision {}", id, next_revision);
        Ok(next_revision)
    }
}

#[async_trait]
impl RouteStore for SqlStore {
    async fn create(&self, entry: &RouteEntry) -> Result<u64> {
        entry.validate()?;
        let id = entry.id();
        let now = self.now_ms();
        let annotations = serde_json::to_string(&entry.annotations)?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // an expired row that has not been swept yet does not block registration
        sqlx::query(
            "DELETE FROM route_entries WHERE route = $1 AND ip = $2 AND port = $3 \
             AND expires_at IS NOT NULL AND expires_at <= $4",
        )
        .bind(id.route.clone())
        .bind(id.ip.clone())
        .bind(i64::from(id.port))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let inserted = sqlx::query(
            r#"INSERT INTO route_entries
               (route, ip, port, route_service_url, ttl, log_guid, annotations, revision, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8)
               ON CONFLICT (route, ip, port) DO NOTHING"#,
        )
        .bind(id.route.clone())
        .bind(id.ip.clone())
        .bind(i64::from(id.port))
        .bind(entry.route_service_url.clone())
        .bind(entry.ttl.map(i64::from))
        .bind(entry.log_guid.clone())
        .bind(annotations)
        .bind(self.expiry_ms(entry))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if inserted.rows_affected() == 0 {
            return Err(RoutingError::Conflict(id.to_string()));
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        debug!("Created route {}", id);
        Ok(0)
    }

    async fn get(&self, id: &RouteId) -> Result<RouteEntry> {
        let select = format!(
            "SELECT {} FROM route_entries WHERE route = $1 AND ip = $2 AND port = $3 \
             AND (expires_at IS NULL OR expires_at > $4)",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&select)
            .bind(id.route.clone())
            .bind(id.ip.clone())
            .bind(i64::from(id.port))
            .bind(self.now_ms())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or_else(|| RoutingError::NotFound(id.to_string()))?;

        row_to_entry(&row)
    }

    async fn update(&self, entry: &RouteEntry, expected_revision: u64) -> Result<u64> {
        self.rewrite(entry, expected_revision, true).await
    }

    async fn amend(&self, entry: &RouteEntry, expected_revision: u64) -> Result<u64> {
        self.rewrite(entry, expected_revision, false).await
    }

    async fn delete(&self, id: &RouteId, expected_revision: u64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let deleted = sqlx::query(
            "DELETE FROM route_entries WHERE route = $1 AND ip = $2 AND port = $3 \
             AND revision = $4 AND (expires_at IS NULL OR expires_at > $5)",
        )
        .bind(id.route.clone())
        .bind(id.ip.clone())
        .bind(i64::from(id.port))
        .bind(revision_param(expected_revision)?)
        .bind(self.now_ms())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if deleted.rows_affected() == 0 {
            return Err(self.classify_miss(&mut tx, id).await?);
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        debug!("Deleted route {}", id);
        Ok(())
    }

    async fn list(&self, filter: &RouteFilter) -> Result<Vec<RouteEntry>> {
        let select = format!(
            "SELECT {} FROM route_entries WHERE expires_at IS NULL OR expires_at > $1 \
             ORDER BY route, ip, port",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&select)
            .bind(self.now_ms())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>>>()?;
        Ok(filter.apply(entries))
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM route_entries WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(self.now_ms())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl Coordinator for SqlStore {
    async fn try_acquire_lock(&self, holder: &str, lease: Duration) -> Result<Option<LockLease>> {
        let now = self.clock.now();
        let record = LockLease {
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: deadline(now, lease),
        };

        let result = sqlx::query(
            r#"INSERT INTO routing_migration_lock (name, holder, acquired_at, expires_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (name) DO UPDATE
               SET holder = excluded.holder,
                   acquired_at = excluded.acquired_at,
                   expires_at = excluded.expires_at
               WHERE routing_migration_lock.expires_at <= excluded.acquired_at"#,
        )
        .bind(LOCK_NAME)
        .bind(holder.to_string())
        .bind(record.acquired_at.timestamp_millis())
        .bind(record.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 1 {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    async fn renew_lock(&self, holder: &str, lease: Duration) -> Result<LockLease> {
        let now = self.clock.now();
        let expires_at = deadline(now, lease);

        let row = sqlx::query(
            r#"UPDATE routing_migration_lock SET expires_at = $3
               WHERE name = $1 AND holder = $2 AND expires_at > $4
               RETURNING acquired_at"#,
        )
        .bind(LOCK_NAME)
        .bind(holder.to_string())
        .bind(expires_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RoutingError::LockTimeout(lease))?;

        let acquired_ms: i64 = row.try_get("acquired_at").map_err(map_sqlx_err)?;
        let acquired_at = chrono::DateTime::from_timestamp_millis(acquired_ms)
            .ok_or_else(|| column_out_of_range("acquired_at", acquired_ms))?;

        Ok(LockLease {
            holder: holder.to_string(),
            acquired_at,
            expires_at,
        })
    }

    async fn release_lock(&self, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM routing_migration_lock WHERE name = $1 AND holder = $2")
            .bind(LOCK_NAME)
            .bind(holder.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn migration_version(&self) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT version FROM routing_migration_version WHERE id = $1")
            .bind(VERSION_ROW)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let version: i64 = row.try_get("version").map_err(map_sqlx_err)?;
                u32::try_from(version)
                    .map(Some)
                    .map_err(|_| column_out_of_range("version", version))
            }
        }
    }

    async fn set_migration_version(&self, version: u32) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO routing_migration_version (id, version) VALUES ($1, $2)
               ON CONFLICT (id) DO UPDATE SET version = excluded.version
               WHERE routing_migration_version.version < excluded.version"#,
        )
        .bind(VERSION_ROW)
        .bind(i64::from(version))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl Database for SqlStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    async fn apply_schema(&self, step: SchemaStep) -> Result<()> {
        let ddl = match step {
            SchemaStep::CreateRouteTable => schema::CREATE_ROUTE_TABLE,
            SchemaStep::CreateExpiryIndex => schema::CREATE_EXPIRY_INDEX,
        };
        sqlx::query(ddl)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        debug!("Applied {:?}", step);
        Ok(())
    }
}
