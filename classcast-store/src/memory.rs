//! In-process coordination store.
//!
//! Used directly by single-instance gateways and tests, and as the keyspace
//! behind the store daemon. Expired keys are hidden on access and reclaimed
//! by [`MemoryStore::purge_expired`], which [`MemoryStore::spawn_sweeper`]
//! runs periodically.

use crate::coordination::{ChannelReceiver, CoordinationStore, Expiration};
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default per-channel buffer for pub/sub.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
enum Data {
    Hash(HashMap<String, Value>),
    Set(HashSet<String>),
    List(VecDeque<Value>),
}

impl Data {
    fn kind(&self) -> &'static str {
        match self {
            Data::Hash(_) => "hash",
            Data::Set(_) => "set",
            Data::List(_) => "list",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Data::Hash(h) => h.is_empty(),
            Data::Set(s) => s.is_empty(),
            Data::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn touch(&mut self, now: Instant, expiration: Option<Expiration>) {
        match expiration {
            Some(Expiration::Refresh(ttl)) => self.expires_at = Some(now + ttl),
            Some(Expiration::Once(ttl)) if self.expires_at.is_none() => {
                self.expires_at = Some(now + ttl)
            }
            _ => {}
        }
    }
}

type Keyspace = HashMap<String, Entry>;

fn drop_if_expired(keys: &mut Keyspace, key: &str, now: Instant) {
    if keys.get(key).is_some_and(|e| e.is_expired(now)) {
        keys.remove(key);
    }
}

fn live<'a>(keys: &'a mut Keyspace, key: &str) -> Option<&'a mut Entry> {
    drop_if_expired(keys, key, Instant::now());
    keys.get_mut(key)
}

fn wrong_type(key: &str, expected: &'static str, data: &Data) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
        actual: data.kind(),
    }
}

fn remove_if_empty(keys: &mut Keyspace, key: &str) {
    if keys.get(key).is_some_and(|e| e.data.is_empty()) {
        keys.remove(key);
    }
}

/// Keyspace and pub/sub channels held in process memory.
pub struct MemoryStore {
    keys: Mutex<Keyspace>,
    channels: DashMap<String, broadcast::Sender<Value>>,
    channel_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            channels: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Number of keys, including expired keys not yet purged.
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut keys = self.keys.lock();
        let entry = live(&mut keys, key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Removes every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let before = keys.len();
        keys.retain(|_, entry| !entry.is_expired(now));
        before - keys.len()
    }

    /// Runs [`MemoryStore::purge_expired`] every `every` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!("Purged {} expired keys", purged);
                }
            }
        })
    }

    /// Number of channels with at least one live subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.value().receiver_count() > 0)
            .count()
    }

    fn hset(
        &self,
        key: &str,
        field: &str,
        value: Value,
        expiration: Option<Expiration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        drop_if_expired(&mut keys, key, now);
        let entry = keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Data::Hash(HashMap::new())));
        let inserted = match &mut entry.data {
            Data::Hash(hash) => hash.insert(field.to_string(), value).is_none(),
            other => return Err(wrong_type(key, "hash", other)),
        };
        entry.touch(now, expiration);
        Ok(inserted)
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError> {
        let mut keys = self.keys.lock();
        match live(&mut keys, key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(entry) => Err(wrong_type(key, "hash", &entry.data)),
        }
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, Value>, StoreError> {
        let mut keys = self.keys.lock();
        match live(&mut keys, key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                data: Data::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(entry) => Err(wrong_type(key, "hash", &entry.data)),
        }
    }

    fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock();
        let removed = match live(&mut keys, key) {
            None => return Ok(false),
            Some(Entry {
                data: Data::Hash(hash),
                ..
            }) => hash.remove(field).is_some(),
            Some(entry) => return Err(wrong_type(key, "hash", &entry.data)),
        };
        remove_if_empty(&mut keys, key);
        Ok(removed)
    }

    fn sadd(
        &self,
        key: &str,
        member: &str,
        expiration: Option<Expiration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        drop_if_expired(&mut keys, key, now);
        let entry = keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Data::Set(HashSet::new())));
        let added = match &mut entry.data {
            Data::Set(set) => set.insert(member.to_string()),
            other => return Err(wrong_type(key, "set", other)),
        };
        entry.touch(now, expiration);
        Ok(added)
    }

    fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock();
        match live(&mut keys, key) {
            None => Ok(false),
            Some(Entry {
                data: Data::Set(set),
                ..
            }) => Ok(set.contains(member)),
            Some(entry) => Err(wrong_type(key, "set", &entry.data)),
        }
    }

    fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock();
        let removed = match live(&mut keys, key) {
            None => return Ok(false),
            Some(Entry {
                data: Data::Set(set),
                ..
            }) => set.remove(member),
            Some(entry) => return Err(wrong_type(key, "set", &entry.data)),
        };
        remove_if_empty(&mut keys, key);
        Ok(removed)
    }

    fn rpush(
        &self,
        key: &str,
        value: Value,
        expiration: Option<Expiration>,
    ) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        drop_if_expired(&mut keys, key, now);
        let entry = keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Data::List(VecDeque::new())));
        let len = match &mut entry.data {
            Data::List(list) => {
                list.push_back(value);
                list.len()
            }
            other => return Err(wrong_type(key, "list", other)),
        };
        entry.touch(now, expiration);
        Ok(len)
    }

    fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let mut keys = self.keys.lock();
        match live(&mut keys, key) {
            None => Ok(0),
            Some(Entry {
                data: Data::List(list),
                ..
            }) => Ok(list.len()),
            Some(entry) => Err(wrong_type(key, "list", &entry.data)),
        }
    }

    fn lrange(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        let mut keys = self.keys.lock();
        match live(&mut keys, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                data: Data::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(entry) => Err(wrong_type(key, "list", &entry.data)),
        }
    }

    fn lrem(&self, key: &str, value: &Value) -> Result<usize, StoreError> {
        let mut keys = self.keys.lock();
        let removed = match live(&mut keys, key) {
            None => return Ok(0),
            Some(Entry {
                data: Data::List(list),
                ..
            }) => {
                let before = list.len();
                list.retain(|v| v != value);
                before - list.len()
            }
            Some(entry) => return Err(wrong_type(key, "list", &entry.data)),
        };
        remove_if_empty(&mut keys, key);
        Ok(removed)
    }

    fn del(&self, key: &str) -> bool {
        let mut keys = self.keys.lock();
        drop_if_expired(&mut keys, key, Instant::now());
        keys.remove(key).is_some()
    }

    fn expire(&self, key: &str, ttl: Duration, only_if_unset: bool) -> bool {
        let mut keys = self.keys.lock();
        match live(&mut keys, key) {
            None => false,
            Some(entry) if only_if_unset && entry.expires_at.is_some() => false,
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
        }
    }

    fn publish_now(&self, channel: &str, payload: Value) -> usize {
        let delivered = match self.channels.get(channel) {
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => return 0,
        };
        if delivered == 0 {
            self.channels
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
        }
        delivered
    }

    fn subscribe_now(&self, channel: &str) -> ChannelReceiver {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_hash(&self, key: &str, field: &str, value: Value) -> Result<bool, StoreError> {
        self.hset(key, field, value, None)
    }

    async fn set_hash_with_expiration(
        &self,
        key: &str,
        field: &str,
        value: Value,
        expiration: Expiration,
    ) -> Result<bool, StoreError> {
        self.hset(key, field, value, Some(expiration))
    }

    async fn get_hash(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError> {
        self.hget(key, field)
    }

    async fn get_all_hash(&self, key: &str) -> Result<HashMap<String, Value>, StoreError> {
        self.hgetall(key)
    }

    async fn delete_hash_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.hdel(key, field)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.sadd(key, member, None)
    }

    async fn add_to_set_with_expiration(
        &self,
        key: &str,
        member: &str,
        expiration: Expiration,
    ) -> Result<bool, StoreError> {
        self.sadd(key, member, Some(expiration))
    }

    async fn is_in_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.sismember(key, member)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.srem(key, member)
    }

    async fn push_to_list(&self, key: &str, value: Value) -> Result<usize, StoreError> {
        self.rpush(key, value, None)
    }

    async fn push_to_list_with_expiration(
        &self,
        key: &str,
        value: Value,
        expiration: Expiration,
    ) -> Result<usize, StoreError> {
        self.rpush(key, value, Some(expiration))
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.llen(key)
    }

    async fn get_list(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        self.lrange(key)
    }

    async fn remove_from_list(&self, key: &str, value: &Value) -> Result<usize, StoreError> {
        self.lrem(key, value)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.del(key))
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        Ok(self.expire(key, ttl, false))
    }

    async fn set_expiration_if_absent(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.expire(key, ttl, true))
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<usize, StoreError> {
        Ok(self.publish_now(channel, payload))
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelReceiver, StoreError> {
        Ok(self.subscribe_now(channel))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
