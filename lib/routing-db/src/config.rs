//! Backend selection

use crate::clock::Clock;
use crate::kv::{EtcdClient, KvStore, MemoryKv, DEFAULT_NAMESPACE};
use crate::sql::SqlStore;
use crate::store::Database;
use routing_api::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-process key-value store; state is lost on exit
    #[default]
    Memory,
    Etcd,
    Sql,
}

impl std::str::FromStr for BackendType {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendType::Memory),
            "etcd" => Ok(BackendType::Etcd),
            "sql" => Ok(BackendType::Sql),
            other => Err(RoutingError::ProcessRequest(format!(
                "unknown backend: {}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub url: String,
    pub namespace: String,
    pub timeout_ms: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:2379".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            timeout_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 10,
            acquire_timeout_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub backend: BackendType,
    pub etcd: EtcdConfig,
    pub sql: SqlConfig,
}

/// Open the configured backend
///
/// Exactly one backend is opened per call. The memory backend shares the
/// etcd namespace setting so key layout is the same in both.
pub async fn connect(config: &DbConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn Database>> {
    match config.backend {
        BackendType::Memory => {
            info!("Using in-memory backend");
            let client = Arc::new(MemoryKv::with_clock(clock.clone()));
            Ok(Arc::new(KvStore::with_namespace(
                client,
                clock,
                config.etcd.namespace.clone(),
            )))
        }
        BackendType::Etcd => {
            info!("Using etcd backend at {}", config.etcd.url);
            let client = EtcdClient::new(
                &config.etcd.url,
                Duration::from_millis(config.etcd.timeout_ms),
            )
            .map_err(|e| RoutingError::Communication(e.to_string()))?;
            Ok(Arc::new(KvStore::with_namespace(
                Arc::new(client),
                clock,
                config.etcd.namespace.clone(),
            )))
        }
        BackendType::Sql => {
            let store = SqlStore::connect(
                &config.sql.url,
                config.sql.max_connections,
                Duration::from_millis(config.sql.acquire_timeout_ms),
                clock,
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}
