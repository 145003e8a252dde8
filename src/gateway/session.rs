//! Session Registry
//!
//! Node-local handle per connected session. Egress goes through an unbounded
//! outbox drained by the connection's writer task, so broadcasts never block
//! on a slow socket.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use super::messages::EgressMessage;

/// One authenticated push connection
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Reconnect hint supplied on connect, used for replay catch-up.
    pub last_event_at: Option<DateTime<Utc>>,
    sender: mpsc::UnboundedSender<EgressMessage>,
}

impl Session {
    /// Queue a message for this session; drops silently once disconnected.
    pub fn send(&self, message: EgressMessage) {
        if self.sender.send(message).is_err() {
            trace!(session_id = %self.id, "send to closed session outbox");
        }
    }
}

/// All sessions connected to this node
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        user_id: Uuid,
        last_event_at: Option<DateTime<Utc>>,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<EgressMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            id: Uuid::now_v7(),
            user_id,
            last_event_at,
            sender,
        });
        self.sessions.write().insert(session.id, session.clone());
        (session, receiver)
    }

    pub fn remove(&self, session_id: Uuid) {
        self.sessions.write().remove(&session_id);
    }

    pub fn get(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn send_to(&self, session_id: Uuid, message: EgressMessage) {
        if let Some(session) = self.get(session_id) {
            session.send(message);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
