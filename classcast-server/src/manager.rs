//! Namespace manager and broadcast entry points.
//!
//! The manager owns the namespace table and the [`Broadcaster`]. Business
//! logic calls the entry points after committing a state change; the event
//! goes to local subscribers immediately and to every other gateway process
//! through the fan-out transport.

use crate::config::DeploymentMode;
use crate::error::ServerError;
use crate::fanout::{Envelope, FanoutTransport};
use crate::metrics::Metrics;
use crate::namespace::NamespaceHandler;
use crate::registry::{ConnectionRegistry, Delivery};
use crate::room::{Room, Scope};
use crate::session::ConnectionId;
use classcast_protocol::Outbound;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Delivers events locally and publishes them to other processes.
pub struct Broadcaster {
    origin: String,
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<dyn FanoutTransport>,
    metrics: Arc<Metrics>,
}

impl Broadcaster {
    pub fn new(
        origin: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        fanout: Arc<dyn FanoutTransport>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            origin: origin.into(),
            registry,
            fanout,
            metrics,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn fanout(&self) -> &Arc<dyn FanoutTransport> {
        &self.fanout
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Emits `event` with `payload` to one room.
    pub async fn to_room(
        &self,
        namespace: &str,
        room: &Room,
        event: &str,
        payload: Value,
        except: Option<ConnectionId>,
    ) -> Delivery {
        self.emit(
            namespace,
            std::slice::from_ref(room),
            Outbound::new(event, payload),
            except,
        )
        .await
    }

    /// Delivers to local subscribers, then publishes the envelope.
    ///
    /// A failed publish is retried once and then dropped; callers only learn
    /// about local delivery.
    pub async fn emit(
        &self,
        namespace: &str,
        rooms: &[Room],
        event: Outbound,
        except: Option<ConnectionId>,
    ) -> Delivery {
        self.metrics
            .broadcasts_total
            .with_label_values(&[namespace, &event.event])
            .inc();
        let delivery = self.deliver_local(namespace, rooms, &event, except);

        let envelope = Envelope {
            origin: self.origin.clone(),
            namespace: namespace.to_string(),
            rooms: rooms.to_vec(),
            event,
            except,
        };
        if let Err(first) = self.fanout.publish(&envelope).await {
            tracing::warn!(
                "Fan-out publish of '{}' in {} failed, retrying: {}",
                envelope.event.event,
                namespace,
                first
            );
            if let Err(second) = self.fanout.publish(&envelope).await {
                tracing::error!(
                    "Fan-out publish of '{}' in {} dropped: {}",
                    envelope.event.event,
                    namespace,
                    second
                );
                self.metrics.fanout_failures_total.inc();
            }
        }
        delivery
    }

    fn deliver_local(
        &self,
        namespace: &str,
        rooms: &[Room],
        event: &Outbound,
        except: Option<ConnectionId>,
    ) -> Delivery {
        let delivery = self.registry.deliver(namespace, rooms, event, except);
        if delivery.dropped > 0 {
            self.metrics
                .deliveries_dropped_total
                .with_label_values(&[namespace])
                .inc_by(delivery.dropped as f64);
        }
        delivery
    }

    /// Delivers an envelope received from the fan-out channel.
    ///
    /// Envelopes this process published were already delivered locally.
    pub fn dispatch(&self, envelope: &Envelope) -> Option<Delivery> {
        if envelope.origin == self.origin {
            return None;
        }
        Some(self.deliver_local(
            &envelope.namespace,
            &envelope.rooms,
            &envelope.event,
            envelope.except,
        ))
    }
}

/// Registry of namespace handlers plus the cross-process dispatch loop.
pub struct NamespaceManager {
    handlers: RwLock<HashMap<&'static str, Arc<dyn NamespaceHandler>>>,
    broadcaster: Arc<Broadcaster>,
    mode: DeploymentMode,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl NamespaceManager {
    pub fn new(broadcaster: Arc<Broadcaster>, mode: DeploymentMode) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            broadcaster,
            mode,
            dispatcher: Mutex::new(None),
        }
    }

    /// Registers a handler, replacing any previous one at the same path.
    pub fn register(&self, handler: Arc<dyn NamespaceHandler>) {
        let path = handler.path();
        if self.handlers.write().insert(path, handler).is_some() {
            tracing::warn!("Namespace {} registered twice; keeping the latest", path);
        }
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn NamespaceHandler>> {
        self.handlers.read().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<&'static str> {
        let mut paths: Vec<_> = self.handlers.read().keys().copied().collect();
        paths.sort_unstable();
        paths
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Subscribes to the fan-out channel and starts the dispatch loop.
    ///
    /// In multi-instance mode a transport failure is fatal. A single
    /// instance logs it and keeps serving local connections.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut receiver = match self.broadcaster.fanout().subscribe().await {
            Ok(receiver) => receiver,
            Err(e) if self.mode == DeploymentMode::Multi => {
                return Err(ServerError::Fanout(format!(
                    "cannot subscribe to fan-out channel: {}",
                    e
                )));
            }
            Err(e) => {
                tracing::warn!("Fan-out unavailable, serving local connections only: {}", e);
                return Ok(());
            }
        };

        let broadcaster = self.broadcaster.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(value) => match Envelope::from_value(value) {
                        Ok(envelope) => {
                            if let Some(delivery) = broadcaster.dispatch(&envelope) {
                                tracing::trace!(
                                    "Dispatched '{}' from {} to {} local connections",
                                    envelope.event.event,
                                    envelope.origin,
                                    delivery.delivered
                                );
                            }
                        }
                        Err(e) => tracing::warn!("Discarding malformed envelope: {}", e),
                    },
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Fan-out dispatch lagged, {} envelopes lost", n);
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Fan-out channel closed, dispatch loop exiting");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.dispatcher.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!(
            "Namespace manager started ({} namespaces, distributed: {})",
            self.handlers.read().len(),
            self.broadcaster.fanout().is_distributed()
        );
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }

    /// Broadcasts a named event to one room of a namespace.
    pub async fn broadcast(
        &self,
        namespace: &str,
        room: &Room,
        event: &str,
        payload: Value,
    ) -> Result<Delivery, ServerError> {
        let handler = self
            .get(namespace)
            .ok_or_else(|| ServerError::NotFound(format!("namespace {}", namespace)))?;
        if !handler.allows_scope(room.scope()) {
            return Err(ServerError::validation(format!(
                "{} does not serve {} rooms",
                namespace,
                room.scope()
            )));
        }
        Ok(self
            .broadcaster
            .to_room(handler.path(), room, event, payload, None)
            .await)
    }

    async fn emit_to(
        &self,
        namespace: &str,
        rooms: Vec<Room>,
        event: &str,
        payload: Value,
    ) -> Result<Delivery, ServerError> {
        if self.get(namespace).is_none() {
            return Err(ServerError::NotFound(format!("namespace {}", namespace)));
        }
        Ok(self
            .broadcaster
            .emit(namespace, &rooms, Outbound::new(event, payload), None)
            .await)
    }

    /// A grade was posted for a student: the class and the student hear it.
    pub async fn grade_posted(
        &self,
        class_id: &str,
        student_id: &str,
        payload: Value,
    ) -> Result<Delivery, ServerError> {
        let rooms = vec![Room::new(Scope::Class, class_id)?, Room::user(student_id)?];
        self.emit_to("/gradebook", rooms, "grade_posted", payload)
            .await
    }

    /// Gradebook structure of a class changed (columns, weights).
    pub async fn gradebook_changed(
        &self,
        class_id: &str,
        payload: Value,
    ) -> Result<Delivery, ServerError> {
        let rooms = vec![Room::new(Scope::Class, class_id)?];
        self.emit_to("/gradebook", rooms, "gradebook_changed", payload)
            .await
    }

    pub async fn message_created(
        &self,
        conversation_id: &str,
        payload: Value,
    ) -> Result<Delivery, ServerError> {
        let rooms = vec![Room::new(Scope::Conversation, conversation_id)?];
        self.emit_to("/messaging", rooms, "message_created", payload)
            .await
    }

    /// Attendance was marked in a class; the school office hears it too.
    pub async fn attendance_marked(
        &self,
        class_id: &str,
        school_id: Option<&str>,
        payload: Value,
    ) -> Result<Delivery, ServerError> {
        let mut rooms = vec![Room::new(Scope::Class, class_id)?];
        if let Some(school) = school_id {
            rooms.push(Room::new(Scope::School, school)?);
        }
        self.emit_to("/attendance", rooms, "attendance_marked", payload)
            .await
    }

    pub async fn notify_user(
        &self,
        user_id: &str,
        payload: Value,
    ) -> Result<Delivery, ServerError> {
        let rooms = vec![Room::user(user_id)?];
        self.emit_to("/notifications", rooms, "notification", payload)
            .await
    }

    /// Announcement to a tenant, district or school.
    pub async fn announce(&self, room: &Room, payload: Value) -> Result<Delivery, ServerError> {
        if !room.scope().is_organizational() {
            return Err(ServerError::validation(format!(
                "announcements target tenant, district or school rooms, not {}",
                room
            )));
        }
        self.emit_to("/notifications", vec![room.clone()], "announcement", payload)
            .await
    }
}

impl Drop for NamespaceManager {
    fn drop(&mut self) {
        self.stop();
    }
}
