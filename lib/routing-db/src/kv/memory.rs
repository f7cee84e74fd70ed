//! In-process key-value store with etcd-style indexes and TTLs

use super::client::{KvClient, KvError, KvNode};
use crate::clock::{deadline, Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone, Debug)]
struct StoredNode {
    value: String,
    modified_index: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredNode {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    index: u64,
    nodes: BTreeMap<String, StoredNode>,
}

impl MemoryState {
    fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&StoredNode> {
        self.nodes.get(key).filter(|node| node.is_live(now))
    }

    fn put(
        &mut self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> KvNode {
        self.index += 1;
        let node = StoredNode {
            value: value.to_string(),
            modified_index: self.index,
            expires_at: ttl.map(|ttl| deadline(now, ttl)),
        };
        let out = to_kv_node(key, &node);
        self.nodes.insert(key.to_string(), node);
        out
    }
}

fn to_kv_node(key: &str, node: &StoredNode) -> KvNode {
    KvNode {
        key: key.to_string(),
        value: node.value.clone(),
        modified_index: node.modified_index,
        expiration: node.expires_at,
    }
}

/// Key-value store held in process memory
///
/// Keys past their TTL are invisible to every read and conditional write, and
/// are physically dropped by `sweep_expired`. The store can be switched to an
/// unavailable state to exercise communication failures.
#[derive(Debug)]
pub struct MemoryKv {
    state: RwLock<MemoryState>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> Result<KvNode, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        let state = self.state.read().await;
        state
            .live(key, now)
            .map(|node| to_kv_node(key, node))
            .ok_or_else(|| KvError::KeyNotFound(key.to_string()))
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<KvNode, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if state.live(key, now).is_some() {
            return Err(KvError::NodeExists(key.to_string()));
        }
        Ok(state.put(key, value, ttl, now))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> Result<KvNode, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        match state.live(key, now).map(|node| node.modified_index) {
            None => Err(KvError::KeyNotFound(key.to_string())),
            Some(index) if index != prev_index => {
                debug!("CAS on {} failed: index {} != {}", key, index, prev_index);
                Err(KvError::TestFailed(key.to_string()))
            }
            Some(_) => Ok(state.put(key, value, ttl, now)),
        }
    }

    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> Result<(), KvError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        match state.live(key, now).map(|node| node.modified_index) {
            None => Err(KvError::KeyNotFound(key.to_string())),
            Some(index) if index != prev_index => Err(KvError::TestFailed(key.to_string())),
            Some(_) => {
                state.index += 1;
                state.nodes.remove(key);
                Ok(())
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        let state = self.state.read().await;
        Ok(state
            .nodes
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, node)| node.is_live(now))
            .map(|(key, node)| to_kv_node(key, node))
            .collect())
    }

    async fn sweep_expired(&self) -> Result<usize, KvError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let before = state.nodes.len();
        state.nodes.retain(|_, node| node.is_live(now));
        Ok(before - state.nodes.len())
    }
}
