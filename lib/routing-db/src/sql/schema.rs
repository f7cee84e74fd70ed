//! DDL for the relational backend
//!
//! Every statement is idempotent and valid on both PostgreSQL and SQLite.
//! Timestamps are unix milliseconds.

pub(crate) const CREATE_VERSION_TABLE: &str = r#"CREATE TABLE IF NOT EXISTS routing_migration_version (
    id BIGINT PRIMARY KEY,
    version BIGINT NOT NULL
)"#;

pub(crate) const CREATE_LOCK_TABLE: &str = r#"CREATE TABLE IF NOT EXISTS routing_migration_lock (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at BIGINT NOT NULL,
    expires_at BIGINT NOT NULL
)"#;

pub(crate) const CREATE_ROUTE_TABLE: &str = r#"CREATE TABLE IF NOT EXISTS route_entries (
    route TEXT NOT NULL,
    ip TEXT NOT NULL,
    port BIGINT NOT NULL,
    route_service_url TEXT,
    ttl BIGINT,
    log_guid TEXT,
    annotations TEXT NOT NULL,
    revision BIGINT NOT NULL,
    expires_at BIGINT,
    PRIMARY KEY (route, ip, port)
)"#;

pub(crate) const CREATE_EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS route_entries_expires_at ON route_entries (expires_at)";
