//! Redis-backed store capability.

mod batch;
mod pubsub;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::time::sleep;
use tracing::{debug, warn};

use taskproc_core::{RedisStoreConfig, TaskProcError, TaskProcResult};
use taskproc_domain::{PubSubConnection, Store, StoreBatch, StoreReply};

use pubsub::RedisPubSubConnection;

/// Multi-field pub/sub payloads are newline-joined on the Redis wire.
pub(crate) const FIELD_SEPARATOR: char = '\n';

pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisStore {
    /// Connect with bounded retry and verify the connection with PING.
    pub async fn connect(config: RedisStoreConfig) -> TaskProcResult<Self> {
        let url = config.build_connection_url();
        let client = Client::open(url)
            .map_err(|e| TaskProcError::store("create redis client", e))?;

        let mut last_error = None;
        for attempt in 0..config.max_retry_attempts.max(1) {
            let connect = client.get_multiplexed_async_connection();
            match tokio::time::timeout(
                Duration::from_secs(config.connection_timeout_seconds),
                connect,
            )
            .await
            {
                Ok(Ok(connection)) => {
                    let store = Self { client, connection };
                    store.ping().await?;
                    debug!(host = %config.host, port = config.port, "connected to redis");
                    return Ok(store);
                }
                Ok(Err(e)) => {
                    warn!(
                        attempt = attempt + 1,
                        attempts = config.max_retry_attempts,
                        error = %e,
                        "redis connection failed"
                    );
                    last_error = Some(TaskProcError::store("connect to redis", e));
                }
                Err(_) => {
                    warn!(
                        attempt = attempt + 1,
                        attempts = config.max_retry_attempts,
                        "redis connection timed out"
                    );
                    last_error = Some(TaskProcError::Store {
                        context: "connect to redis".to_string(),
                        source: "connection timed out".into(),
                    });
                }
            }
            if attempt + 1 < config.max_retry_attempts {
                sleep(Duration::from_secs(config.retry_delay_seconds)).await;
            }
        }
        Err(last_error.unwrap_or_else(|| TaskProcError::Store {
            context: "connect to redis".to_string(),
            source: "no connection attempts were made".into(),
        }))
    }

    pub async fn ping(&self) -> TaskProcResult<()> {
        let mut conn = self.connection.clone();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskProcError::store("PING", e))?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(TaskProcError::Store {
                context: "PING".to_string(),
                source: format!("unexpected response: {response}").into(),
            })
        }
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> TaskProcResult<Option<String>> {
        self.conn()
            .get(key)
            .await
            .map_err(|e| TaskProcError::store("GET", e))
    }

    async fn set(&self, key: &str, value: &str) -> TaskProcResult<()> {
        self.conn()
            .set(key, value)
            .await
            .map_err(|e| TaskProcError::store("SET", e))
    }

    async fn delete(&self, key: &str) -> TaskProcResult<bool> {
        let removed: i64 = self
            .conn()
            .del(key)
            .await
            .map_err(|e| TaskProcError::store("DEL", e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> TaskProcResult<bool> {
        self.conn()
            .exists(key)
            .await
            .map_err(|e| TaskProcError::store("EXISTS", e))
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> TaskProcResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut self.conn())
            .await
            .map_err(|e| TaskProcError::store("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> TaskProcResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| TaskProcError::store("SET NX PX", e))?;
        Ok(reply.is_some())
    }

    async fn expire_in(&self, key: &str, ttl: Duration) -> TaskProcResult<bool> {
        let set: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as i64)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| TaskProcError::store("PEXPIRE", e))?;
        Ok(set)
    }

    async fn time_to_live(&self, key: &str) -> TaskProcResult<Option<Duration>> {
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| TaskProcError::store("PTTL", e))?;
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn hash_get_all(&self, key: &str) -> TaskProcResult<HashMap<String, String>> {
        self.conn()
            .hgetall(key)
            .await
            .map_err(|e| TaskProcError::store("HGETALL", e))
    }

    async fn hash_get(&self, key: &str, field: &str) -> TaskProcResult<Option<String>> {
        self.conn()
            .hget(key, field)
            .await
            .map_err(|e| TaskProcError::store("HGET", e))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> TaskProcResult<()> {
        let _: i64 = self
            .conn()
            .hset(key, field, value)
            .await
            .map_err(|e| TaskProcError::store("HSET", e))?;
        Ok(())
    }

    async fn hash_set_many(
        &self,
        key: &str,
        entries: &[(String, String)],
    ) -> TaskProcResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _: () = self
            .conn()
            .hset_multiple(key, entries)
            .await
            .map_err(|e| TaskProcError::store("HSET (multiple)", e))?;
        Ok(())
    }

    async fn hash_delete_fields(&self, key: &str, fields: &[String]) -> TaskProcResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.conn()
            .hdel(key, fields)
            .await
            .map_err(|e| TaskProcError::store("HDEL", e))
    }

    async fn list_append(&self, key: &str, value: &str) -> TaskProcResult<()> {
        let _: i64 = self
            .conn()
            .rpush(key, value)
            .await
            .map_err(|e| TaskProcError::store("RPUSH", e))?;
        Ok(())
    }

    async fn list_pop_first(&self, key: &str) -> TaskProcResult<Option<String>> {
        self.conn()
            .lpop(key, None)
            .await
            .map_err(|e| TaskProcError::store("LPOP", e))
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> TaskProcResult<Vec<String>> {
        self.conn()
            .lrange(key, start as isize, stop as isize)
            .await
            .map_err(|e| TaskProcError::store("LRANGE", e))
    }

    async fn list_all(&self, key: &str) -> TaskProcResult<Vec<String>> {
        self.list_range(key, 0, -1).await
    }

    async fn list_remove(&self, key: &str, value: &str) -> TaskProcResult<u64> {
        self.conn()
            .lrem(key, 0, value)
            .await
            .map_err(|e| TaskProcError::store("LREM", e))
    }

    async fn set_add(&self, key: &str, member: &str) -> TaskProcResult<()> {
        let _: i64 = self
            .conn()
            .sadd(key, member)
            .await
            .map_err(|e| TaskProcError::store("SADD", e))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> TaskProcResult<()> {
        let _: i64 = self
            .conn()
            .srem(key, member)
            .await
            .map_err(|e| TaskProcError::store("SREM", e))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> TaskProcResult<Vec<String>> {
        self.conn()
            .smembers(key)
            .await
            .map_err(|e| TaskProcError::store("SMEMBERS", e))
    }

    async fn run_pipeline(&self, batch: StoreBatch) -> TaskProcResult<Vec<StoreReply>> {
        batch::run_pipeline(&mut self.conn(), batch, false).await
    }

    async fn run_transaction(&self, batch: StoreBatch) -> TaskProcResult<()> {
        batch::run_pipeline(&mut self.conn(), batch, true).await?;
        Ok(())
    }

    async fn search_keys(&self, pattern: &str) -> TaskProcResult<Vec<String>> {
        self.conn()
            .keys(pattern)
            .await
            .map_err(|e| TaskProcError::store("KEYS", e))
    }

    async fn publish(&self, channel: &str, fields: &[String]) -> TaskProcResult<()> {
        let payload = fields.join(&FIELD_SEPARATOR.to_string());
        let _: i64 = self
            .conn()
            .publish(channel, payload)
            .await
            .map_err(|e| TaskProcError::store("PUBLISH", e))?;
        Ok(())
    }

    async fn pubsub(&self) -> TaskProcResult<Box<dyn PubSubConnection>> {
        let connection = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| TaskProcError::store("open pubsub connection", e))?;
        Ok(Box::new(RedisPubSubConnection::new(connection)))
    }
}
