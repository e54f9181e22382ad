//! Redis-backed shared store.
//!
//! Thin mapping from the [`SharedStore`] contract onto a Redis-protocol
//! server through a multiplexed connection manager. Pub/sub uses a
//! dedicated connection per subscription, forwarded into an mpsc channel.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::SharedStore;
use crate::types::StoreError;

/// Connection settings for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL (`redis://host:port/db`).
    pub url: String,
    /// Timeout applied to the initial connection attempt.
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Production [`SharedStore`] backed by Redis.
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        info!(url = %config.url, "connecting to shared store");

        let client = Client::open(config.url.clone()).map_err(map_err)?;
        let connection = tokio::time::timeout(
            config.connect_timeout,
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| StoreError::Unavailable("store connection timed out".to_string()))?
        .map_err(map_err)?;

        let mut conn = connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        debug!(%pong, "shared store connected");

        Ok(Self { client, connection })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Operation(err.to_string())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(map_err),
            None => conn.set::<_, _, ()>(key, value).await.map_err(map_err),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: u64 = conn.del(key).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(map_err)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn();
        conn.hgetall(key).await.map_err(map_err)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(key, member).await.map_err(map_err)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(key, member).await.map_err(map_err)
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.conn();
        conn.smembers(key).await.map_err(map_err)
    }

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(map_err)
    }

    async fn zset_count(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        conn.zcount(key, min, max).await.map_err(map_err)
    }

    async fn zset_remove_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        conn.zrembyscore(key, min, max).await.map_err(map_err)
    }

    async fn zset_card(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        conn.zcard(key).await.map_err(map_err)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(map_err)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_err)?;
        pubsub.subscribe(channel).await.map_err(map_err)?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%channel, error = %err, "dropping undecodable pub/sub message");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        conn.expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(map_err)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        conn.keys(format!("{prefix}*")).await.map_err(map_err)
    }
}
