//! In-memory store capability.
//!
//! A process-local twin of the Redis backend with the same trait surface,
//! used by embedded deployments and the test suite. Expiration runs on
//! `tokio::time::Instant`, so paused-clock tests can advance time
//! deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use taskproc_core::TaskProcResult;
use taskproc_domain::{PubSubConnection, PubSubEvent, Store, StoreBatch, StoreOp, StoreReply};

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    expirations: HashMap<String, Instant>,
}

impl MemoryState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove_key(&key);
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        let mut removed = self.strings.remove(key).is_some();
        removed |= self.hashes.remove(key).is_some();
        removed |= self.lists.remove(key).is_some();
        removed |= self.sets.remove(key).is_some();
        self.expirations.remove(key);
        removed
    }

    fn key_exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.lists.contains_key(key)
            || self.sets.contains_key(key)
    }

    fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .strings
            .keys()
            .chain(self.hashes.keys())
            .chain(self.lists.keys())
            .chain(self.sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn apply(&mut self, op: &StoreOp) -> StoreReply {
        match op {
            StoreOp::Set { key, value } => {
                self.strings.insert(key.clone(), value.clone());
                self.expirations.remove(key);
                StoreReply::Unit
            }
            StoreOp::Delete { key } => {
                let removed = self.remove_key(key);
                StoreReply::Int(removed as i64)
            }
            StoreOp::SetIfAbsent { key, value } => {
                if self.key_exists(key) {
                    StoreReply::Bool(false)
                } else {
                    self.strings.insert(key.clone(), value.clone());
                    StoreReply::Bool(true)
                }
            }
            StoreOp::ExpireIn { key, ttl } => {
                if self.key_exists(key) {
                    self.expirations.insert(key.clone(), Instant::now() + *ttl);
                    StoreReply::Bool(true)
                } else {
                    StoreReply::Bool(false)
                }
            }
            StoreOp::HashGetAll { key } => {
                StoreReply::Map(self.hashes.get(key).cloned().unwrap_or_default())
            }
            StoreOp::HashSetMany { key, entries } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                for (field, value) in entries {
                    hash.insert(field.clone(), value.clone());
                }
                StoreReply::Int(entries.len() as i64)
            }
            StoreOp::HashDeleteFields { key, fields } => {
                let mut removed = 0;
                if let Some(hash) = self.hashes.get_mut(key) {
                    for field in fields {
                        if hash.remove(field).is_some() {
                            removed += 1;
                        }
                    }
                    if hash.is_empty() {
                        self.hashes.remove(key);
                    }
                }
                StoreReply::Int(removed)
            }
            StoreOp::ListAppend { key, value } => {
                let list = self.lists.entry(key.clone()).or_default();
                list.push_back(value.clone());
                StoreReply::Int(list.len() as i64)
            }
            StoreOp::ListPopFirst { key } => {
                let popped = self.lists.get_mut(key).and_then(VecDeque::pop_front);
                if let Some(list) = self.lists.get(key) {
                    if list.is_empty() {
                        self.lists.remove(key);
                    }
                }
                StoreReply::Value(popped)
            }
            StoreOp::ListRemove { key, value } => {
                let mut removed = 0;
                if let Some(list) = self.lists.get_mut(key) {
                    let before = list.len();
                    list.retain(|item| item != value);
                    removed = (before - list.len()) as i64;
                    if list.is_empty() {
                        self.lists.remove(key);
                    }
                }
                StoreReply::Int(removed)
            }
            StoreOp::SetAdd { key, member } => {
                let added = self.sets.entry(key.clone()).or_default().insert(member.clone());
                StoreReply::Int(added as i64)
            }
            StoreOp::SetRemove { key, member } => {
                let mut removed = false;
                if let Some(set) = self.sets.get_mut(key) {
                    removed = set.remove(member);
                    if set.is_empty() {
                        self.sets.remove(key);
                    }
                }
                StoreReply::Int(removed as i64)
            }
        }
    }
}

struct Subscriber {
    sender: mpsc::UnboundedSender<PubSubEvent>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct Broker {
    subscribers: HashMap<u64, Subscriber>,
}

/// In-process implementation of the store capability.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<StdMutex<MemoryState>>,
    broker: Arc<StdMutex<Broker>>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.purge_expired();
        f(&mut state)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> TaskProcResult<Option<String>> {
        Ok(self.with_state(|s| s.strings.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> TaskProcResult<()> {
        self.with_state(|s| {
            s.apply(&StoreOp::Set {
                key: key.to_string(),
                value: value.to_string(),
            })
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> TaskProcResult<bool> {
        Ok(self.with_state(|s| s.remove_key(key)))
    }

    async fn exists(&self, key: &str) -> TaskProcResult<bool> {
        Ok(self.with_state(|s| s.key_exists(key)))
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> TaskProcResult<bool> {
        let reply = self.with_state(|s| {
            s.apply(&StoreOp::SetIfAbsent {
                key: key.to_string(),
                value: value.to_string(),
            })
        });
        Ok(reply == StoreReply::Bool(true))
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> TaskProcResult<bool> {
        Ok(self.with_state(|s| {
            if s.key_exists(key) {
                return false;
            }
            s.strings.insert(key.to_string(), value.to_string());
            s.expirations.insert(key.to_string(), Instant::now() + ttl);
            true
        }))
    }

    async fn expire_in(&self, key: &str, ttl: Duration) -> TaskProcResult<bool> {
        let reply = self.with_state(|s| {
            s.apply(&StoreOp::ExpireIn {
                key: key.to_string(),
                ttl,
            })
        });
        Ok(reply == StoreReply::Bool(true))
    }

    async fn time_to_live(&self, key: &str) -> TaskProcResult<Option<Duration>> {
        Ok(self.with_state(|s| {
            s.expirations
                .get(key)
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        }))
    }

    async fn hash_get_all(&self, key: &str) -> TaskProcResult<HashMap<String, String>> {
        Ok(self.with_state(|s| s.hashes.get(key).cloned().unwrap_or_default()))
    }

    async fn hash_get(&self, key: &str, field: &str) -> TaskProcResult<Option<String>> {
        Ok(self.with_state(|s| {
            s.hashes
                .get(key)
                .and_then(|hash| hash.get(field).cloned())
        }))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> TaskProcResult<()> {
        self.with_state(|s| {
            s.hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        });
        Ok(())
    }

    async fn hash_set_many(
        &self,
        key: &str,
        entries: &[(String, String)],
    ) -> TaskProcResult<()> {
        self.with_state(|s| {
            s.apply(&StoreOp::HashSetMany {
                key: key.to_string(),
                entries: entries.to_vec(),
            })
        });
        Ok(())
    }

    async fn hash_delete_fields(&self, key: &str, fields: &[String]) -> TaskProcResult<u64> {
        let reply = self.with_state(|s| {
            s.apply(&StoreOp::HashDeleteFields {
                key: key.to_string(),
                fields: fields.to_vec(),
            })
        });
        match reply {
            StoreReply::Int(removed) => Ok(removed as u64),
            _ => Ok(0),
        }
    }

    async fn list_append(&self, key: &str, value: &str) -> TaskProcResult<()> {
        self.with_state(|s| {
            s.apply(&StoreOp::ListAppend {
                key: key.to_string(),
                value: value.to_string(),
            })
        });
        Ok(())
    }

    async fn list_pop_first(&self, key: &str) -> TaskProcResult<Option<String>> {
        let reply = self.with_state(|s| {
            s.apply(&StoreOp::ListPopFirst {
                key: key.to_string(),
            })
        });
        Ok(reply.into_value())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> TaskProcResult<Vec<String>> {
        Ok(self.with_state(|s| {
            let Some(list) = s.lists.get(key) else {
                return Vec::new();
            };
            let len = list.len() as i64;
            let resolve = |index: i64| -> i64 {
                if index < 0 {
                    (len + index).max(0)
                } else {
                    index
                }
            };
            let start = resolve(start);
            let stop = resolve(stop).min(len - 1);
            if start > stop {
                return Vec::new();
            }
            list.iter()
                .skip(start as usize)
                .take((stop - start + 1) as usize)
                .cloned()
                .collect()
        }))
    }

    async fn list_all(&self, key: &str) -> TaskProcResult<Vec<String>> {
        self.list_range(key, 0, -1).await
    }

    async fn list_remove(&self, key: &str, value: &str) -> TaskProcResult<u64> {
        let reply = self.with_state(|s| {
            s.apply(&StoreOp::ListRemove {
                key: key.to_string(),
                value: value.to_string(),
            })
        });
        match reply {
            StoreReply::Int(removed) => Ok(removed as u64),
            _ => Ok(0),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> TaskProcResult<()> {
        self.with_state(|s| {
            s.apply(&StoreOp::SetAdd {
                key: key.to_string(),
                member: member.to_string(),
            })
        });
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> TaskProcResult<()> {
        self.with_state(|s| {
            s.apply(&StoreOp::SetRemove {
                key: key.to_string(),
                member: member.to_string(),
            })
        });
        Ok(())
    }

    async fn set_members(&self, key: &str) -> TaskProcResult<Vec<String>> {
        Ok(self.with_state(|s| {
            let mut members: Vec<String> = s
                .sets
                .get(key)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            members.sort();
            members
        }))
    }

    async fn run_pipeline(&self, batch: StoreBatch) -> TaskProcResult<Vec<StoreReply>> {
        Ok(self.with_state(|s| batch.ops().iter().map(|op| s.apply(op)).collect()))
    }

    async fn run_transaction(&self, batch: StoreBatch) -> TaskProcResult<()> {
        // One lock over the whole batch gives all-or-nothing visibility.
        self.with_state(|s| {
            for op in batch.ops() {
                s.apply(op);
            }
        });
        Ok(())
    }

    async fn search_keys(&self, pattern: &str) -> TaskProcResult<Vec<String>> {
        Ok(self.with_state(|s| {
            s.all_keys()
                .into_iter()
                .filter(|key| glob_match(pattern, key))
                .collect()
        }))
    }

    async fn publish(&self, channel: &str, fields: &[String]) -> TaskProcResult<()> {
        let broker = self.broker.lock().expect("memory broker poisoned");
        for subscriber in broker.subscribers.values() {
            if subscriber.channels.contains(channel) {
                let _ = subscriber.sender.send(PubSubEvent::Message {
                    channel: channel.to_string(),
                    fields: fields.to_vec(),
                });
            }
        }
        Ok(())
    }

    async fn pubsub(&self) -> TaskProcResult<Box<dyn PubSubConnection>> {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.broker
            .lock()
            .expect("memory broker poisoned")
            .subscribers
            .insert(
                id,
                Subscriber {
                    sender,
                    channels: HashSet::new(),
                },
            );
        Ok(Box::new(MemoryPubSubConnection {
            id,
            broker: self.broker.clone(),
            receiver,
        }))
    }
}

/// Glob matching for `KEYS`-style patterns (`*` and `?`).
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let mut memo = HashMap::new();
    fn matches(
        pattern: &[char],
        text: &[char],
        p: usize,
        t: usize,
        memo: &mut HashMap<(usize, usize), bool>,
    ) -> bool {
        if let Some(&result) = memo.get(&(p, t)) {
            return result;
        }
        let result = match pattern.get(p) {
            None => t == text.len(),
            Some('*') => {
                matches(pattern, text, p + 1, t, memo)
                    || (t < text.len() && matches(pattern, text, p, t + 1, memo))
            }
            Some('?') => t < text.len() && matches(pattern, text, p + 1, t + 1, memo),
            Some(&c) => t < text.len() && text[t] == c && matches(pattern, text, p + 1, t + 1, memo),
        };
        memo.insert((p, t), result);
        result
    }
    matches(&pattern, &text, 0, 0, &mut memo)
}

struct MemoryPubSubConnection {
    id: u64,
    broker: Arc<StdMutex<Broker>>,
    receiver: mpsc::UnboundedReceiver<PubSubEvent>,
}

#[async_trait]
impl PubSubConnection for MemoryPubSubConnection {
    async fn subscribe(&mut self, channel: &str) -> TaskProcResult<()> {
        let mut broker = self.broker.lock().expect("memory broker poisoned");
        if let Some(subscriber) = broker.subscribers.get_mut(&self.id) {
            subscriber.channels.insert(channel.to_string());
            let _ = subscriber
                .sender
                .send(PubSubEvent::Subscribed(channel.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> TaskProcResult<()> {
        let mut broker = self.broker.lock().expect("memory broker poisoned");
        if let Some(subscriber) = broker.subscribers.get_mut(&self.id) {
            subscriber.channels.remove(channel);
            // The backend confirms an unsubscribe even for channels that
            // were never subscribed, matching Redis semantics.
            let _ = subscriber
                .sender
                .send(PubSubEvent::Unsubscribed(channel.to_string()));
        }
        Ok(())
    }

    async fn next_event(&mut self) -> TaskProcResult<Option<PubSubEvent>> {
        Ok(self.receiver.recv().await)
    }
}

impl Drop for MemoryPubSubConnection {
    fn drop(&mut self) {
        if let Ok(mut broker) = self.broker.lock() {
            broker.subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_semantics_are_fifo() {
        let store = MemoryStore::new();
        store.list_append("q", "a").await.unwrap();
        store.list_append("q", "b").await.unwrap();
        assert_eq!(store.list_all("q").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.list_pop_first("q").await.unwrap(), Some("a".to_string()));
        assert_eq!(store.list_pop_first("q").await.unwrap(), Some("b".to_string()));
        assert_eq!(store.list_pop_first("q").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_their_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert!(store.expire_in("k", Duration::from_secs(5)).await.unwrap());
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "first").await.unwrap());
        assert!(!store.set_if_absent("k", "second").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_create_with_ttl_expires_and_never_overwrites() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent_with_ttl("k", "first", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store.time_to_live("k").await.unwrap().is_some());

        // A losing write neither replaces the value nor touches the TTL.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store
            .set_if_absent_with_ttl("k", "second", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("first".to_string()));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store
            .set_if_absent_with_ttl("k", "second", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn search_keys_uses_glob_patterns() {
        let store = MemoryStore::new();
        store.list_append("PendingTasks$bulk", "x").await.unwrap();
        store.list_append("PendingTasks$fast", "y").await.unwrap();
        store.list_append("PendingTasks", "z").await.unwrap();

        let mut keys = store.search_keys("PendingTasks$*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["PendingTasks$bulk", "PendingTasks$fast"]);
    }

    #[tokio::test]
    async fn publish_reaches_only_subscribed_connections() {
        let store = MemoryStore::new();
        let mut conn = store.pubsub().await.unwrap();
        conn.subscribe("alpha").await.unwrap();
        assert_eq!(
            conn.next_event().await.unwrap(),
            Some(PubSubEvent::Subscribed("alpha".to_string()))
        );

        store
            .publish("alpha", &["hello".to_string()])
            .await
            .unwrap();
        store.publish("beta", &["nope".to_string()]).await.unwrap();

        assert_eq!(
            conn.next_event().await.unwrap(),
            Some(PubSubEvent::Message {
                channel: "alpha".to_string(),
                fields: vec!["hello".to_string()],
            })
        );
    }
}
