//! Local connection registry.
//!
//! Tracks the connections served by this process and the rooms each has
//! joined, indexed both ways so room delivery and disconnect cleanup are
//! cheap. Every connection owns a bounded outbound queue; delivery never
//! waits on a slow client and drops the event instead.

use crate::room::Room;
use crate::session::ConnectionId;
use classcast_protocol::Outbound;
use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug)]
struct ConnectionEntry {
    namespace: String,
    user_id: String,
    sender: mpsc::Sender<Outbound>,
    rooms: HashSet<String>,
}

/// Outcome of delivering one event to local subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Subscribers whose outbound queue was full.
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
}

fn room_key(namespace: &str, room: &Room) -> String {
    format!("{}#{}", namespace, room)
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: ConnectionId,
        namespace: &str,
        user_id: &str,
        sender: mpsc::Sender<Outbound>,
    ) {
        self.connections.insert(
            id,
            ConnectionEntry {
                namespace: namespace.to_string(),
                user_id: user_id.to_string(),
                sender,
                rooms: HashSet::new(),
            },
        );
    }

    /// Removes a connection and every membership it still holds.
    pub fn unregister(&self, id: ConnectionId) {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return;
        };
        for key in entry.rooms {
            self.remove_member(&key, id);
        }
    }

    /// Subscribes a registered connection to a room of its namespace.
    pub fn join(&self, id: ConnectionId, room: &Room) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        let key = room_key(&entry.namespace, room);
        if !entry.rooms.insert(key.clone()) {
            return false;
        }
        drop(entry);
        self.rooms.entry(key).or_default().insert(id);
        true
    }

    pub fn leave(&self, id: ConnectionId, room: &Room) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        let key = room_key(&entry.namespace, room);
        if !entry.rooms.remove(&key) {
            return false;
        }
        drop(entry);
        self.remove_member(&key, id);
        true
    }

    fn remove_member(&self, key: &str, id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(key) {
            members.remove(&id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove_if(key, |_, m| m.is_empty());
            }
        }
    }

    /// Connections in any of `rooms`, each listed once.
    pub fn members(&self, namespace: &str, rooms: &[Room]) -> HashSet<ConnectionId> {
        rooms
            .iter()
            .filter_map(|room| self.rooms.get(&room_key(namespace, room)))
            .flat_map(|members| members.iter().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Queues `event` for every local subscriber of `rooms` except `except`.
    pub fn deliver(
        &self,
        namespace: &str,
        rooms: &[Room],
        event: &Outbound,
        except: Option<ConnectionId>,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        for id in self.members(namespace, rooms) {
            if Some(id) == except {
                continue;
            }
            let Some(entry) = self.connections.get(&id) else {
                continue;
            };
            match entry.sender.try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Outbound queue full for connection {} ({}), dropping {}",
                        id,
                        entry.user_id,
                        event.event
                    );
                    delivery.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Connection {} closed before delivery", id);
                }
            }
        }
        delivery
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_size(&self, namespace: &str, room: &Room) -> usize {
        self.rooms
            .get(&room_key(namespace, room))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn room(s: &str) -> Room {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_deliver_once_per_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = Uuid::new_v4();
        registry.register(id, "/gradebook", "u1", tx);
        registry.join(id, &room("class:c1"));
        registry.join(id, &room("school:s1"));

        let event = Outbound::new("grade_posted", json!({"score": 90}));
        let delivery = registry.deliver(
            "/gradebook",
            &[room("class:c1"), room("school:s1")],
            &event,
            None,
        );
        assert_eq!(delivery.delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), event);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rooms_are_namespaced() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = Uuid::new_v4();
        registry.register(id, "/attendance", "u1", tx);
        registry.join(id, &room("class:c1"));

        let event = Outbound::new("grade_posted", json!({}));
        let delivery = registry.deliver("/gradebook", &[room("class:c1")], &event, None);
        assert_eq!(delivery.delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = Uuid::new_v4();
        registry.register(id, "/live", "u1", tx);
        registry.join(id, &room("session:s1"));

        let event = Outbound::new("stroke", json!({}));
        let first = registry.deliver("/live", &[room("session:s1")], &event, None);
        let second = registry.deliver("/live", &[room("session:s1")], &event, None);
        assert_eq!(first, Delivery { delivered: 1, dropped: 0 });
        assert_eq!(second, Delivery { delivered: 0, dropped: 1 });
    }

    #[tokio::test]
    async fn test_except_and_leave() {
        let registry = ConnectionRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a, "/messaging", "a", tx_a);
        registry.register(b, "/messaging", "b", tx_b);
        let convo = room("conversation:x");
        registry.join(a, &convo);
        registry.join(b, &convo);

        let event = Outbound::new("typing", json!({}));
        assert_eq!(
            registry.deliver("/messaging", &[convo.clone()], &event, Some(a)).delivered,
            1
        );

        assert!(registry.leave(b, &convo));
        assert!(!registry.leave(b, &convo));
        assert_eq!(registry.room_size("/messaging", &convo), 1);

        registry.unregister(a);
        assert_eq!(registry.room_size("/messaging", &convo), 0);
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.connection_count(), 1);
    }
}
