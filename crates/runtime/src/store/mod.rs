//! Shared store abstraction.
//!
//! A narrow, Redis-shaped interface the registry, rate limiter and policy
//! engine are written against. Production uses [`RedisStore`]; tests use
//! [`MemoryStore`] with the same contract and a virtual clock.
//!
//! All operations are atomic per key. Multi-key flows (index updates,
//! sliding-window maintenance) are best-effort pipelines — no cross-key
//! transactions are assumed.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::StoreError;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

/// String-keyed store with hash, set, sorted-set and pub/sub primitives.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Returns true when the key existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, StoreError>;

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;

    async fn zset_count(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    /// Returns the number of members removed.
    async fn zset_remove_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<u64, StoreError>;

    async fn zset_card(&self, key: &str) -> Result<u64, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Best-effort subscription; messages published before the call are not
    /// replayed and ordering across publishers is not guaranteed.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError>;

    /// Returns true when the key existed and the TTL was applied.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
