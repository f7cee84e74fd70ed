//! Route entry persistence for the routing API
//!
//! This library provides:
//! - The storage port (`RouteStore`) and migration coordination (`Coordinator`) contracts
//! - A key-value adapter over etcd, with an in-process client for tests
//! - A relational adapter over PostgreSQL or SQLite
//! - Backend selection from configuration

pub mod clock;
pub mod config;
pub mod kv;
pub mod sql;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{connect, BackendType, DbConfig, EtcdConfig, SqlConfig};
pub use kv::{EtcdClient, KvClient, KvError, KvNode, KvStore, MemoryKv};
pub use routing_api::{Result, RoutingError};
pub use sql::SqlStore;
pub use store::{BackendKind, Coordinator, Database, LockLease, RouteStore, SchemaStep};
