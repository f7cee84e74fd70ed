//! Versioned migrations for the routing API backends
//!
//! This library provides:
//! - `Migration` and `MigrationRegistry`: versioned units in ascending order
//! - `MigrationRunner`: applies pending units while holding the migration lease
//! - The built-in units run at service startup

pub mod registry;
pub mod runner;
pub mod units;

pub use registry::{Migration, MigrationRegistry};
pub use runner::{MigrationReport, MigrationRunner, RunnerConfig};
pub use units::{builtin_registry, BackfillLogGuid, CreateExpiryIndex, CreateRouteTable, UNKNOWN_LOG_GUID};
