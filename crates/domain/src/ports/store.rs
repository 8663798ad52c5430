//! Store capability port.
//!
//! The minimal key/value/list/set/pub-sub surface the coordination layer
//! consumes. Backends live in the infrastructure crate; everything here is
//! implementation-agnostic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use taskproc_core::TaskProcResult;

/// One operation inside a pipelined or transactional batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Set { key: String, value: String },
    Delete { key: String },
    SetIfAbsent { key: String, value: String },
    ExpireIn { key: String, ttl: Duration },
    HashGetAll { key: String },
    HashSetMany { key: String, entries: Vec<(String, String)> },
    HashDeleteFields { key: String, fields: Vec<String> },
    ListAppend { key: String, value: String },
    ListPopFirst { key: String },
    ListRemove { key: String, value: String },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
}

/// Reply to a single batched operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreReply {
    Unit,
    Bool(bool),
    Int(i64),
    Value(Option<String>),
    Map(HashMap<String, String>),
}

impl StoreReply {
    pub fn into_value(self) -> Option<String> {
        match self {
            StoreReply::Value(value) => value,
            _ => None,
        }
    }

    pub fn into_map(self) -> HashMap<String, String> {
        match self {
            StoreReply::Map(map) => map,
            _ => HashMap::new(),
        }
    }
}

/// Ordered list of operations submitted in one round trip.
///
/// The same batch type backs both pipelines (no atomicity, replies
/// returned) and transactions (all-or-nothing apply).
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    ops: Vec<StoreOp>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: StoreOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(StoreOp::Set { key: key.into(), value: value.into() })
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(StoreOp::Delete { key: key.into() })
    }

    pub fn set_if_absent(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.push(StoreOp::SetIfAbsent { key: key.into(), value: value.into() })
    }

    pub fn expire_in(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(StoreOp::ExpireIn { key: key.into(), ttl })
    }

    pub fn hash_get_all(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(StoreOp::HashGetAll { key: key.into() })
    }

    pub fn hash_set_many(
        &mut self,
        key: impl Into<String>,
        entries: Vec<(String, String)>,
    ) -> &mut Self {
        self.push(StoreOp::HashSetMany { key: key.into(), entries })
    }

    pub fn hash_delete_fields(
        &mut self,
        key: impl Into<String>,
        fields: Vec<String>,
    ) -> &mut Self {
        self.push(StoreOp::HashDeleteFields { key: key.into(), fields })
    }

    pub fn list_append(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(StoreOp::ListAppend { key: key.into(), value: value.into() })
    }

    pub fn list_pop_first(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(StoreOp::ListPopFirst { key: key.into() })
    }

    pub fn list_remove(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(StoreOp::ListRemove { key: key.into(), value: value.into() })
    }

    pub fn set_add(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(StoreOp::SetAdd { key: key.into(), member: member.into() })
    }

    pub fn set_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(StoreOp::SetRemove { key: key.into(), member: member.into() })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Event delivered on a pub/sub connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubEvent {
    /// The server confirmed a SUBSCRIBE for this channel.
    Subscribed(String),
    /// The server confirmed an UNSUBSCRIBE for this channel.
    Unsubscribed(String),
    /// A message published on a subscribed channel.
    Message { channel: String, fields: Vec<String> },
}

/// One pub/sub connection.
///
/// Subscribe and unsubscribe queue the command; the confirmation arrives
/// later through [`PubSubConnection::next_event`], which must be
/// cancel-safe so a driver loop can `select!` over it.
#[async_trait]
pub trait PubSubConnection: Send {
    async fn subscribe(&mut self, channel: &str) -> TaskProcResult<()>;

    async fn unsubscribe(&mut self, channel: &str) -> TaskProcResult<()>;

    /// Next confirmation or message. `None` once the connection is closed.
    async fn next_event(&mut self) -> TaskProcResult<Option<PubSubEvent>>;
}

/// The store capability consumed by the registries and the message bus.
#[async_trait]
pub trait Store: Send + Sync {
    // -- strings ---------------------------------------------------------

    async fn get(&self, key: &str) -> TaskProcResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> TaskProcResult<()>;
    async fn delete(&self, key: &str) -> TaskProcResult<bool>;
    async fn exists(&self, key: &str) -> TaskProcResult<bool>;

    /// Conditional create; returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str) -> TaskProcResult<bool>;

    /// Conditional create with the TTL applied in the same store command,
    /// so a crash can never leave the key without an expiration.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> TaskProcResult<bool>;

    // -- expiration ------------------------------------------------------

    /// Set a TTL; returns false if the key does not exist.
    async fn expire_in(&self, key: &str, ttl: Duration) -> TaskProcResult<bool>;
    async fn time_to_live(&self, key: &str) -> TaskProcResult<Option<Duration>>;

    // -- hashes ----------------------------------------------------------

    async fn hash_get_all(&self, key: &str) -> TaskProcResult<HashMap<String, String>>;
    async fn hash_get(&self, key: &str, field: &str) -> TaskProcResult<Option<String>>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> TaskProcResult<()>;
    async fn hash_set_many(&self, key: &str, entries: &[(String, String)]) -> TaskProcResult<()>;
    async fn hash_delete_fields(&self, key: &str, fields: &[String]) -> TaskProcResult<u64>;

    // -- lists -----------------------------------------------------------

    async fn list_append(&self, key: &str, value: &str) -> TaskProcResult<()>;
    async fn list_pop_first(&self, key: &str) -> TaskProcResult<Option<String>>;
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> TaskProcResult<Vec<String>>;
    async fn list_all(&self, key: &str) -> TaskProcResult<Vec<String>>;
    async fn list_remove(&self, key: &str, value: &str) -> TaskProcResult<u64>;

    // -- sets ------------------------------------------------------------

    async fn set_add(&self, key: &str, member: &str) -> TaskProcResult<()>;
    async fn set_remove(&self, key: &str, member: &str) -> TaskProcResult<()>;
    async fn set_members(&self, key: &str) -> TaskProcResult<Vec<String>>;

    // -- batching --------------------------------------------------------

    /// One round trip, no atomicity; replies come back in op order.
    async fn run_pipeline(&self, batch: StoreBatch) -> TaskProcResult<Vec<StoreReply>>;

    /// All-or-nothing apply; replies are discarded.
    async fn run_transaction(&self, batch: StoreBatch) -> TaskProcResult<()>;

    // -- discovery -------------------------------------------------------

    /// Keys matching a glob-style pattern.
    async fn search_keys(&self, pattern: &str) -> TaskProcResult<Vec<String>>;

    // -- pub/sub ---------------------------------------------------------

    /// Publish a multi-field message; usable from any connection.
    async fn publish(&self, channel: &str, fields: &[String]) -> TaskProcResult<()>;

    /// Open a dedicated pub/sub connection.
    async fn pubsub(&self) -> TaskProcResult<Box<dyn PubSubConnection>>;
}
