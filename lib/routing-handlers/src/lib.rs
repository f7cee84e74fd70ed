//! Shared pieces of the routing API handlers
//!
//! This library provides:
//! - `ErrorTranslator`: maps domain errors to HTTP outcomes
//! - `ApiMetrics`: the Prometheus registry behind `/metrics`

pub mod errors;
pub mod metrics;

pub use errors::{ErrorResponse, ErrorTranslator};
pub use metrics::ApiMetrics;
