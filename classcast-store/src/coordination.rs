//! The coordination store contract.
//!
//! Every piece of state shared between gateway processes goes through this
//! trait. Keys hold exactly one structure (hash, set or list); a key may carry
//! an expiration after which it reads as absent.
//!
//! Semantics follow the usual in-memory data store conventions:
//! - writing to an existing key keeps its expiration; a new key has none
//! - the `*_with_expiration` writes set the expiration in the same step, so
//!   an entry written that way is never left without one
//! - removing the last element of a structure deletes the key
//! - addressing a key through the wrong structure fails with
//!   [`StoreError::WrongType`]

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// Receiver side of a pub/sub channel subscription.
pub type ChannelReceiver = broadcast::Receiver<Value>;

/// Expiration applied by a write in the same step as the write itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Reset the key's lifetime on every write.
    Refresh(Duration),
    /// Set the lifetime only if the key has none, e.g. an outer session limit.
    Once(Duration),
}

impl Expiration {
    pub fn ttl(&self) -> Duration {
        match self {
            Expiration::Refresh(ttl) | Expiration::Once(ttl) => *ttl,
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, Expiration::Once(_))
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Sets `field` of the hash at `key`. Returns true if the field is new.
    async fn set_hash(&self, key: &str, field: &str, value: Value) -> Result<bool, StoreError>;

    /// Sets `field` and applies `expiration` atomically.
    async fn set_hash_with_expiration(
        &self,
        key: &str,
        field: &str,
        value: Value,
        expiration: Expiration,
    ) -> Result<bool, StoreError>;

    async fn get_hash(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError>;

    async fn get_all_hash(&self, key: &str) -> Result<HashMap<String, Value>, StoreError>;

    /// Removes one field. Returns true if it existed.
    async fn delete_hash_field(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Adds `member` to the set at `key`. Returns true if it was not present.
    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Adds `member` and applies `expiration` atomically.
    async fn add_to_set_with_expiration(
        &self,
        key: &str,
        member: &str,
        expiration: Expiration,
    ) -> Result<bool, StoreError>;

    async fn is_in_set(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Removes `member`. Returns true if it was present.
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Appends to the tail of the list at `key`. Returns the new length.
    async fn push_to_list(&self, key: &str, value: Value) -> Result<usize, StoreError>;

    /// Appends and applies `expiration` atomically.
    async fn push_to_list_with_expiration(
        &self,
        key: &str,
        value: Value,
        expiration: Expiration,
    ) -> Result<usize, StoreError>;

    /// Number of elements in the list at `key`, zero if absent.
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Returns the whole list, head first.
    async fn get_list(&self, key: &str) -> Result<Vec<Value>, StoreError>;

    /// Removes every element equal to `value`. Returns the number removed.
    async fn remove_from_list(&self, key: &str, value: &Value) -> Result<usize, StoreError>;

    /// Deletes a key of any structure. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Sets the expiration of an existing key. Returns false if the key is absent.
    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Sets the expiration only if the key exists and has none yet.
    async fn set_expiration_if_absent(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Publishes to a channel. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, payload: Value) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<ChannelReceiver, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn delete_hash(&self, key: &str) -> Result<bool, StoreError> {
        self.delete(key).await
    }

    async fn delete_set(&self, key: &str) -> Result<bool, StoreError> {
        self.delete(key).await
    }

    async fn delete_list(&self, key: &str) -> Result<bool, StoreError> {
        self.delete(key).await
    }
}
