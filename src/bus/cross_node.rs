//! Cross-Node Bus
//!
//! Redis pub/sub carrying serialized lifecycle events between nodes: one
//! channel per auction plus one global channel. Publishes are best-effort —
//! the originating transaction has already committed, so failures are logged
//! and never propagated. Two independent connections are held, because a
//! connection in subscribe mode cannot issue commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use redis::aio::{ConnectionManager, PubSubSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::settings::CrossNodeBusSettings;

/// Global channel receiving every event type.
pub const GLOBAL_CHANNEL: &str = "auction:global";

/// Upper bound on a single best-effort publish.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-auction channel name.
pub fn auction_channel(auction_id: Uuid) -> String {
    format!("auction:events:{}", auction_id)
}

/// Cross-node bus failures
#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Canonical cross-node serialization format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_type: String,
    pub auction_id: Uuid,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Originating node id; subscribers drop their own envelopes.
    pub origin: Uuid,
}

impl Envelope {
    pub fn new(origin: Uuid, event_type: &str, auction_id: Uuid, payload: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            auction_id,
            payload,
            timestamp: Utc::now(),
            origin,
        }
    }
}

/// Inbound envelope callback. Must not block; hand off long work.
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Per-channel handler table, safe against concurrent inbound dispatch.
pub(crate) struct HandlerRegistry {
    origin: Uuid,
    channels: RwLock<HashMap<String, Vec<EnvelopeHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn new(origin: Uuid) -> Self {
        Self {
            origin,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler; returns true when the channel is newly seen.
    fn register(&self, channel: &str, handler: EnvelopeHandler) -> bool {
        let mut map = self.channels.write();
        let list = map.entry(channel.to_string()).or_default();
        list.push(handler);
        list.len() == 1
    }

    fn remove_channel(&self, channel: &str) -> bool {
        self.channels.write().remove(channel).is_some()
    }

    fn is_registered(&self, channel: &str) -> bool {
        self.channels.read().contains_key(channel)
    }

    /// Route an inbound envelope to the channel's handlers, dropping
    /// envelopes this node published itself.
    pub(crate) fn dispatch(&self, channel: &str, envelope: Envelope) {
        if envelope.origin == self.origin {
            return;
        }
        let handlers: Vec<EnvelopeHandler> = self
            .channels
            .read()
            .get(channel)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        for handler in handlers {
            handler(envelope.clone());
        }
    }
}

/// Redis-backed cross-node bus
pub struct CrossNodeBus {
    origin: Uuid,
    publisher: ConnectionManager,
    sink: Mutex<PubSubSink>,
    registry: Arc<HandlerRegistry>,
}

impl CrossNodeBus {
    /// Open both connections and start the subscriber reader task.
    pub async fn connect(
        settings: &CrossNodeBusSettings,
        origin: Uuid,
    ) -> Result<(Arc<Self>, JoinHandle<()>), BusError> {
        let client = redis::Client::open(settings.url())?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let pubsub = client.get_async_pubsub().await?;
        let (mut sink, mut stream) = pubsub.split();
        sink.subscribe(GLOBAL_CHANNEL).await?;

        let registry = Arc::new(HandlerRegistry::new(origin));
        let reader_registry = registry.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "unreadable bus message");
                        continue;
                    }
                };
                match serde_json::from_str::<Envelope>(&payload) {
                    Ok(envelope) => reader_registry.dispatch(&channel, envelope),
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "malformed envelope");
                    }
                }
            }
            debug!("cross-node subscriber stream closed");
        });

        let bus = Arc::new(Self {
            origin,
            publisher,
            sink: Mutex::new(sink),
            registry,
        });
        Ok((bus, reader))
    }

    /// This node's origin id, stamped on every outgoing envelope.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Best-effort publish to the auction's channel and the global channel.
    /// Failures are logged; the caller's operation has already committed.
    pub async fn publish(&self, event_type: &str, auction_id: Uuid, payload: Value) {
        let envelope = Envelope::new(self.origin, event_type, auction_id, payload);
        let body = match serde_json::to_string(&envelope) {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "envelope serialization failed");
                return;
            }
        };

        for channel in [auction_channel(auction_id), GLOBAL_CHANNEL.to_string()] {
            let mut conn = self.publisher.clone();
            let send = async {
                redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(&body)
                    .query_async::<_, i64>(&mut conn)
                    .await
            };
            match tokio::time::timeout(PUBLISH_TIMEOUT, send).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(channel = %channel, error = %err, "cross-node publish failed");
                }
                Err(_) => {
                    warn!(channel = %channel, "cross-node publish timed out");
                }
            }
        }
    }

    /// Register a handler for an auction's channel, subscribing the node's
    /// connection on first registration. Returns true if newly subscribed.
    pub async fn subscribe_auction(
        &self,
        auction_id: Uuid,
        handler: EnvelopeHandler,
    ) -> Result<bool, BusError> {
        let channel = auction_channel(auction_id);
        let newly_seen = self.registry.register(&channel, handler);
        if newly_seen {
            self.sink.lock().await.subscribe(&channel).await?;
        }
        Ok(newly_seen)
    }

    /// Whether this node already listens on an auction's channel.
    pub fn is_subscribed(&self, auction_id: Uuid) -> bool {
        self.registry.is_registered(&auction_channel(auction_id))
    }

    /// Drop an auction's handlers and unsubscribe the channel.
    pub async fn unsubscribe_auction(&self, auction_id: Uuid) -> Result<(), BusError> {
        let channel = auction_channel(auction_id);
        if self.registry.remove_channel(&channel) {
            self.sink.lock().await.unsubscribe(&channel).await?;
        }
        Ok(())
    }

    /// Register a handler on the global channel.
    pub fn on_global(&self, handler: EnvelopeHandler) {
        self.registry.register(GLOBAL_CHANNEL, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn envelope(origin: Uuid) -> Envelope {
        Envelope::new(origin, "bid:placed", Uuid::now_v7(), json!({"amount": "110"}))
    }

    #[test]
    fn test_envelope_wire_format() {
        let origin = Uuid::now_v7();
        let env = envelope(origin);
        let raw = serde_json::to_value(&env).unwrap();

        assert_eq!(raw["eventType"], "bid:placed");
        assert!(raw["auctionId"].is_string());
        assert!(raw["timestamp"].is_string());

        let back: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(back.event_type, env.event_type);
        assert_eq!(back.origin, origin);
    }

    #[test]
    fn test_dispatch_drops_self_origin() {
        let origin = Uuid::now_v7();
        let registry = HandlerRegistry::new(origin);
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let sink = seen.clone();
        registry.register(
            "auction:events:test",
            Arc::new(move |env: Envelope| sink.lock().push(env.event_type)),
        );

        // Own envelope is ignored, a peer's is delivered.
        registry.dispatch("auction:events:test", envelope(origin));
        registry.dispatch("auction:events:test", envelope(Uuid::now_v7()));

        assert_eq!(seen.lock().as_slice(), ["bid:placed".to_string()]);
    }

    #[test]
    fn test_dispatch_routes_by_channel() {
        let registry = HandlerRegistry::new(Uuid::now_v7());
        let seen = Arc::new(PlMutex::new(0u32));

        let sink = seen.clone();
        registry.register(
            "auction:events:a",
            Arc::new(move |_| *sink.lock() += 1),
        );

        registry.dispatch("auction:events:b", envelope(Uuid::now_v7()));
        assert_eq!(*seen.lock(), 0);

        registry.dispatch("auction:events:a", envelope(Uuid::now_v7()));
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_channel_names() {
        let id = Uuid::nil();
        assert_eq!(
            auction_channel(id),
            format!("auction:events:{}", id)
        );
        assert_eq!(GLOBAL_CHANNEL, "auction:global");
    }
}
