//! Relational backend

mod schema;
mod store;

pub use store::{Dialect, SqlStore};
