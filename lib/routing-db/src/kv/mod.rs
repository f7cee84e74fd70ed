//! Key-value backend

mod client;
mod etcd;
mod memory;
mod store;

pub use client::{KvClient, KvError, KvNode};
pub use etcd::EtcdClient;
pub use memory::MemoryKv;
pub use store::{KvStore, DEFAULT_NAMESPACE};
