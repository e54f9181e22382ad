//! In-memory store implementation for tests and single-process deployments.
//!
//! TTL expiry is lazy and driven by the injected [`Clock`], so tests can
//! advance a [`ManualClock`](crate::clock::ManualClock) instead of sleeping.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::SharedStore;
use crate::clock::Clock;
use crate::types::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    ZSet(BTreeMap<String, f64>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::ZSet(_) => "zset",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

impl Entry {
    fn fresh(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

/// In-memory [`SharedStore`] with per-key atomicity and lazy TTL eviction.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail with `StoreError::Unavailable`.
    /// Used by tests to exercise fail-open paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store failure injected".to_string(),
            ));
        }
        Ok(())
    }

    fn now(&self) -> f64 {
        self.clock.epoch_secs()
    }

    /// Drop the entry when its TTL has elapsed.
    fn purge(entries: &mut HashMap<String, Entry>, key: &str, now: f64) {
        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            entries.remove(key);
        }
    }

    fn wrong_kind(key: &str, found: &Value, wanted: &'static str) -> StoreError {
        StoreError::Operation(format!(
            "key {key} holds a {} value, expected {wanted}",
            found.kind()
        ))
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Str(s) => Ok(Some(s.clone())),
                other => Err(Self::wrong_kind(key, other, "string")),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| now + t.as_secs_f64()),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        Ok(entries.remove(key).is_some())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(map) => {
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            other => Err(Self::wrong_kind(key, other, "hash")),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(map.clone()),
                other => Err(Self::wrong_kind(key, other, "hash")),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(Value::Set(HashSet::new())));
        match &mut entry.value {
            Value::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            other => Err(Self::wrong_kind(key, other, "set")),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        let mut drop_key = false;
        match entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Set(set) => {
                    set.remove(member);
                    drop_key = set.is_empty();
                }
                other => return Err(Self::wrong_kind(key, other, "set")),
            },
            None => return Ok(()),
        }
        if drop_key {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.clone()),
                other => Err(Self::wrong_kind(key, other, "set")),
            },
            None => Ok(HashSet::new()),
        }
    }

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(Value::ZSet(BTreeMap::new())));
        match &mut entry.value {
            Value::ZSet(zset) => {
                zset.insert(member.to_string(), score);
                Ok(())
            }
            other => Err(Self::wrong_kind(key, other, "zset")),
        }
    }

    async fn zset_count(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::ZSet(zset) => Ok(zset
                    .values()
                    .filter(|score| **score >= min && **score <= max)
                    .count() as u64),
                other => Err(Self::wrong_kind(key, other, "zset")),
            },
            None => Ok(0),
        }
    }

    async fn zset_remove_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        let mut removed = 0u64;
        let mut drop_key = false;
        match entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::ZSet(zset) => {
                    let before = zset.len();
                    zset.retain(|_, score| *score < min || *score > max);
                    removed = (before - zset.len()) as u64;
                    drop_key = zset.is_empty();
                }
                other => return Err(Self::wrong_kind(key, other, "zset")),
            },
            None => return Ok(0),
        }
        if drop_key {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn zset_card(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::ZSet(zset) => Ok(zset.len() as u64),
                other => Err(Self::wrong_kind(key, other, "zset")),
            },
            None => Ok(0),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let sender = {
            let channels = self.channels.lock();
            channels.get(channel).cloned()
        };
        if let Some(sender) = sender {
            // No subscribers is fine — pub/sub is best-effort.
            let _ = sender.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        self.check_available()?;
        let mut broadcast_rx = {
            let mut channels = self.channels.lock();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(256).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl.as_secs_f64());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.expires_at.is_some_and(|at| at <= now));
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
