//! The event bus behind the push channel: tracks subscribers and fans out
//! status and membership changes.
//!
//! Messages are published only after the authoritative mutation has been
//! persisted; per-subscriber sinks are unbounded channels drained by the
//! WebSocket task, so a slow client never blocks a publish or another
//! subscriber.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::{config::UpdateStage, orchestration::ServerStatus};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A subscriber id handed out at registration.
pub type SubscriberId = u64;

/// Messages clients send on the push channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Subscribe to one server, or to everything when no id is given.
    Subscribe {
        /// The server to subscribe to; absent flips the "all" flag on.
        #[serde(default)]
        server_id: Option<String>,
    },

    /// Undo a subscription, or the "all" flag when no id is given.
    Unsubscribe {
        /// The server to unsubscribe from; absent flips the "all" flag off.
        #[serde(default)]
        server_id: Option<String>,
    },

    /// Liveness ping; answered with a pong on the same channel.
    Ping,
}

/// Messages the control plane pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A status transition of one server.
    ServerStatus {
        /// The server id.
        server_id: String,

        /// The status after the transition.
        status: ServerStatus,

        /// When the server started, for running servers.
        #[serde(skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,

        /// The update stage, when an update is in progress.
        #[serde(skip_serializing_if = "Option::is_none")]
        update_stage: Option<UpdateStage>,
    },

    /// A membership change of the server set.
    ServerUpdate {
        /// The server id.
        server_id: String,

        /// What happened.
        action: ServerUpdateAction,
    },

    /// An error frame, e.g. for unparseable inbound messages.
    Error {
        /// A human-readable message.
        message: String,

        /// An optional machine-readable code.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Heartbeat response.
    Pong,
}

/// Membership change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerUpdateAction {
    /// A server was imported.
    Created,

    /// A server's configuration or files changed.
    Updated,

    /// A server was deleted.
    Deleted,
}

/// Tracks subscribers and fans out published events.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct Subscriber {
    sink: mpsc::UnboundedSender<OutboundMessage>,
    servers: HashSet<String>,
    all: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a subscriber, returning its id and the receiving half of
    /// its sink.
    pub async fn register(
        &self,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (sink, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers.write().await.insert(
            id,
            Subscriber {
                sink,
                servers: HashSet::new(),
                all: false,
            },
        );

        tracing::debug!(subscriber = id, "push subscriber connected");
        (id, rx)
    }

    /// Removes a subscriber.
    pub async fn unregister(&self, id: SubscriberId) {
        self.subscribers.write().await.remove(&id);
        tracing::debug!(subscriber = id, "push subscriber disconnected");
    }

    /// Applies an inbound message for a subscriber.
    pub async fn handle_inbound(&self, id: SubscriberId, message: InboundMessage) {
        let mut subscribers = self.subscribers.write().await;
        let Some(subscriber) = subscribers.get_mut(&id) else {
            return;
        };

        match message {
            InboundMessage::Subscribe { server_id: Some(server_id) } => {
                subscriber.servers.insert(server_id);
            }
            InboundMessage::Subscribe { server_id: None } => {
                subscriber.all = true;
            }
            InboundMessage::Unsubscribe { server_id: Some(server_id) } => {
                subscriber.servers.remove(&server_id);
            }
            InboundMessage::Unsubscribe { server_id: None } => {
                subscriber.all = false;
            }
            InboundMessage::Ping => {
                let _ = subscriber.sink.send(OutboundMessage::Pong);
            }
        }
    }

    /// Sends a message to one subscriber only, regardless of subscriptions.
    pub async fn send_to(&self, id: SubscriberId, message: OutboundMessage) {
        let subscribers = self.subscribers.read().await;
        if let Some(subscriber) = subscribers.get(&id) {
            let _ = subscriber.sink.send(message);
        }
    }

    /// Publishes a status transition for a server.
    pub async fn publish_status(
        &self,
        server_id: &str,
        status: ServerStatus,
        started_at: Option<DateTime<Utc>>,
        update_stage: Option<UpdateStage>,
    ) {
        self.publish(
            server_id,
            OutboundMessage::ServerStatus {
                server_id: server_id.to_string(),
                status,
                started_at,
                update_stage,
            },
        )
        .await;
    }

    /// Publishes a membership change for a server.
    pub async fn publish_update(&self, server_id: &str, action: ServerUpdateAction) {
        self.publish(
            server_id,
            OutboundMessage::ServerUpdate {
                server_id: server_id.to_string(),
                action,
            },
        )
        .await;
    }

    /// Delivers a message to every subscriber watching the server (or
    /// everything). A failed send is logged and the subscriber kept;
    /// reconnecting is the client's responsibility.
    async fn publish(&self, server_id: &str, message: OutboundMessage) {
        let subscribers = self.subscribers.read().await;

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.all && !subscriber.servers.contains(server_id) {
                continue;
            }

            if subscriber.sink.send(message.clone()).is_err() {
                tracing::warn!(subscriber = id, "failed to push event to subscriber");
            }
        }
    }

    /// The number of connected subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
