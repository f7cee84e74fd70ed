use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// A leaf node read from the key-value store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvNode {
    pub key: String,
    pub value: String,
    /// Store-wide index of the last write to this key
    pub modified_index: u64,
    pub expiration: Option<DateTime<Utc>>,
}

/// Native failure signals of the key-value store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key already exists: {0}")]
    NodeExists(String),

    #[error("Compare failed for key {0}")]
    TestFailed(String),

    #[error("Key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected key-value store response: {0}")]
    Protocol(String),
}

/// The conditional-write primitives the KV adapter is built on
///
/// Conditional writes compare against `modified_index`, never against the
/// value, so a write that observed index N fails with `TestFailed` once any
/// other writer has touched the key.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<KvNode, KvError>;

    /// Write only if the key does not exist
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<KvNode, KvError>;

    /// Write only if the key's current index equals `prev_index`
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> Result<KvNode, KvError>;

    /// Delete only if the key's current index equals `prev_index`
    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> Result<(), KvError>;

    /// All leaf nodes under `prefix`, recursively, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError>;

    /// Drop expired keys. Stores with native TTL expire keys themselves.
    async fn sweep_expired(&self) -> Result<usize, KvError> {
        Ok(0)
    }
}
