//! TTL-bounded cache from token fingerprint to authenticated subject.
//!
//! Raw token strings never live in the map — keys are SHA-256 fingerprints
//! so a heap dump cannot leak bearer secrets. Negative results are never
//! cached.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::types::Subject;

/// SHA-256 hex fingerprint of a raw token.
pub fn fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct CachedSubject {
    subject: Subject,
    expires_at: f64,
}

/// Bounded token cache. Expired entries are dropped on read and swept on
/// every insert, so the map never grows past the live token population.
pub struct TokenCache {
    entries: DashMap<String, CachedSubject>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Look up a subject by token fingerprint; expired entries miss.
    pub fn get(&self, token_hash: &str) -> Option<Subject> {
        let now = self.clock.epoch_secs();
        // The shard guard must drop before the removal below.
        let (hit, expired) = match self.entries.get(token_hash) {
            Some(entry) if entry.expires_at > now => (Some(entry.subject.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            self.entries.remove(token_hash);
        }
        hit
    }

    /// Cache a validated subject for the configured TTL.
    pub fn insert(&self, token_hash: String, subject: Subject) {
        let now = self.clock.epoch_secs();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.insert(
            token_hash,
            CachedSubject {
                subject,
                expires_at: now + self.ttl.as_secs_f64(),
            },
        );
    }

    /// Drop a single entry, e.g. on explicit token invalidation.
    pub fn invalidate(&self, token_hash: &str) -> bool {
        self.entries.remove(token_hash).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
