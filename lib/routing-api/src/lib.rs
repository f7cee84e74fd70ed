//! Routing API domain types
//!
//! This library defines the data shared by every layer of the routing API:
//! - RouteEntry: a routable endpoint registered by a client
//! - RouteId: the identifier of an entry (route plus destination address)
//! - RouteFilter: selection criteria for listing entries
//! - RoutingError: the error taxonomy surfaced to callers

pub mod error;
pub mod route;

pub use error::{ApiError, ErrorKind, Result, RoutingError};
pub use route::{RouteEntry, RouteFilter, RouteId, MAX_TTL_SECONDS};
