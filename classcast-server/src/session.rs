//! Connection state.

use crate::auth::Identity;
use crate::room::Room;
use classcast_protocol::WireMode;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::time::Instant;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, waiting for the handshake frame.
    Connecting,
    /// Handshake received, credential being validated.
    Authenticating,
    /// Bound to an identity and a namespace.
    Connected,
    Disconnected,
}

/// A client connection.
#[derive(Debug)]
pub struct Session {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    state: ConnectionState,
    wire_mode: WireMode,
    namespace: Option<String>,
    identity: Option<Identity>,
    client_name: Option<String>,
    rooms: HashSet<Room>,
    created_at: Instant,
    last_seen: Instant,
    command_count: u64,
}

impl Session {
    pub fn new(remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            state: ConnectionState::Connecting,
            wire_mode: WireMode::default(),
            namespace: None,
            identity: None,
            client_name: None,
            rooms: HashSet::new(),
            created_at: now,
            last_seen: now,
            command_count: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Records receipt of the handshake.
    pub fn begin_authentication(&mut self, wire_mode: WireMode, client_name: Option<String>) {
        self.wire_mode = wire_mode;
        self.client_name = client_name;
        self.state = ConnectionState::Authenticating;
    }

    /// Binds the connection after a successful handshake.
    pub fn complete_handshake(&mut self, namespace: &str, identity: Identity) {
        self.namespace = Some(namespace.to_string());
        self.identity = Some(identity);
        self.state = ConnectionState::Connected;
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn wire_mode(&self) -> WireMode {
        self.wire_mode
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn rooms(&self) -> &HashSet<Room> {
        &self.rooms
    }

    pub fn is_in_room(&self, room: &Room) -> bool {
        self.rooms.contains(room)
    }

    /// Returns true if the room was not joined before.
    pub fn add_room(&mut self, room: Room) -> bool {
        self.rooms.insert(room)
    }

    pub fn remove_room(&mut self, room: &Room) -> bool {
        self.rooms.remove(room)
    }

    /// Empties the membership set, returning what it held.
    pub fn take_rooms(&mut self) -> Vec<Room> {
        self.rooms.drain().collect()
    }

    /// Any inbound frame counts as liveness.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn idle_duration(&self) -> std::time::Duration {
        self.last_seen.elapsed()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn record_command(&mut self) -> u64 {
        self.command_count += 1;
        self.command_count
    }

    pub fn command_count(&self) -> u64 {
        self.command_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Role, TenantPath};
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let mut session = Session::new(addr());
        assert_eq!(session.state(), ConnectionState::Connecting);

        session.begin_authentication(WireMode::Jsonl, Some("web".into()));
        assert_eq!(session.state(), ConnectionState::Authenticating);
        assert_eq!(session.wire_mode(), WireMode::Jsonl);

        let identity = Identity::new("u1", Role::Student, TenantPath::new("acme"));
        session.complete_handshake("/messaging", identity);
        assert!(session.is_connected());
        assert_eq!(session.namespace(), Some("/messaging"));
        assert_eq!(session.identity().unwrap().user_id, "u1");

        session.mark_disconnected();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_rooms() {
        let mut session = Session::new(addr());
        let room: Room = "class:c1".parse().unwrap();
        assert!(session.add_room(room.clone()));
        assert!(!session.add_room(room.clone()));
        assert!(session.is_in_room(&room));
        assert_eq!(session.take_rooms(), vec![room.clone()]);
        assert!(!session.is_in_room(&room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle() {
        let mut session = Session::new(addr());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(session.idle_duration(), Duration::from_secs(30));
        session.touch();
        assert_eq!(session.idle_duration(), Duration::ZERO);
        assert_eq!(session.record_command(), 1);
    }
}
