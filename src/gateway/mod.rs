//! Session Gateway
//!
//! Bidirectional push interface over WebSocket: `join_auction`,
//! `leave_auction`, and `place_bid` come in; lifecycle broadcasts, private
//! confirmations, and typed rejections go out. One gateway instance runs per
//! node and owns the node-local session registry, presence, replay ring, and
//! state cache; cross-node fan-out rides the Redis bus.

pub mod cache;
pub mod messages;
pub mod session;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::bus::cross_node::{CrossNodeBus, Envelope, EnvelopeHandler};
use crate::bus::EventBus;
use crate::models::event::{AuctionEvent, BidPlacedEvent, Topic};
use crate::services::bid::BidService;
use crate::services::presence::PresenceTracker;
use crate::services::replay::ReplayBuffer;
use crate::settings::BidCoreSettings;
use crate::store::{AuctionStore, StoreError};

use cache::StateCache;
use messages::{
    bidder_alias, mask_user_id, AuctionStateView, BidConfirmedPayload, BidPlacedPayload,
    BidRejectedPayload, EgressMessage, EndedPayload, ErrorPayload, ExtendedPayload,
    IngressMessage, JoinedPayload, PresencePayload, TimerPayload,
};
use session::{Session, SessionRegistry};

/// Connect-time query parameters
#[derive(Debug, Default)]
struct ConnectParams {
    token: Option<String>,
    last_event_at: Option<DateTime<Utc>>,
}

fn parse_connect_params(query: Option<&str>) -> ConnectParams {
    let mut params = ConnectParams::default();
    for pair in query.unwrap_or_default().split('&') {
        let mut parts = pair.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some("token"), Some(value)) if !value.is_empty() => {
                params.token = Some(value.to_string());
            }
            (Some("last_event_at"), Some(value)) => {
                params.last_event_at = parse_event_cursor(value);
            }
            _ => {}
        }
    }
    params
}

/// Accepts RFC 3339 timestamps or unix epoch milliseconds.
fn parse_event_cursor(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    origin
        .map(|value| allowed.iter().any(|entry| entry == value))
        .unwrap_or(false)
}

fn encode(message: &EgressMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|_| {
        r#"{"type":"error","message":"serialization failure"}"#.to_string()
    })
}

/// WebSocket session gateway
pub struct SessionGateway {
    settings: BidCoreSettings,
    store: Arc<dyn AuctionStore>,
    bids: Arc<BidService>,
    bus: Arc<EventBus>,
    cross_node: Option<Arc<CrossNodeBus>>,
    sessions: Arc<SessionRegistry>,
    presence: Arc<PresenceTracker>,
    replay: Arc<ReplayBuffer>,
    cache: Arc<StateCache>,
    auth: Arc<dyn Authenticator>,
    cross_subscribed: Mutex<HashSet<Uuid>>,
}

impl SessionGateway {
    pub fn new(
        settings: BidCoreSettings,
        store: Arc<dyn AuctionStore>,
        bids: Arc<BidService>,
        bus: Arc<EventBus>,
        cross_node: Option<Arc<CrossNodeBus>>,
        presence: Arc<PresenceTracker>,
        replay: Arc<ReplayBuffer>,
        cache: Arc<StateCache>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            settings,
            store,
            bids,
            bus,
            cross_node,
            sessions: Arc::new(SessionRegistry::new()),
            presence,
            replay,
            cache,
            auth,
            cross_subscribed: Mutex::new(HashSet::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Subscribe the gateway to every internal topic and start fanning
    /// events out to sessions.
    pub fn attach(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        Topic::all()
            .into_iter()
            .map(|topic| self.spawn_pump(topic))
            .collect()
    }

    fn spawn_pump(self: &Arc<Self>, topic: Topic) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        let mut rx = self.bus.subscribe(topic);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => gateway.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "gateway event pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Serve sessions until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "session gateway listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = gateway.handle_connection(stream).await {
                    debug!(%peer, error = %err, "session terminated with error");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), WsError> {
        let allowed = self.settings.gateway.allowed_origins.clone();
        let mut params = ConnectParams::default();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| {
                params = parse_connect_params(request.uri().query());
                let origin = request
                    .headers()
                    .get("origin")
                    .and_then(|value| value.to_str().ok());
                if !origin_allowed(origin, &allowed) {
                    let mut forbidden = ErrorResponse::new(None);
                    *forbidden.status_mut() = StatusCode::FORBIDDEN;
                    return Err(forbidden);
                }
                Ok(response)
            },
        )
        .await?;
        let (mut sink, mut stream) = ws.split();

        // Authenticate or reject with a terminal error message.
        let user_id = match &params.token {
            Some(token) => match self.auth.authenticate(token).await {
                Ok(user_id) => user_id,
                Err(err) => {
                    let message = EgressMessage::Error(ErrorPayload {
                        message: err.to_string(),
                    });
                    sink.send(Message::Text(encode(&message))).await.ok();
                    sink.close().await.ok();
                    return Ok(());
                }
            },
            None => {
                let message = EgressMessage::Error(ErrorPayload {
                    message: "missing authentication token".to_string(),
                });
                sink.send(Message::Text(encode(&message))).await.ok();
                sink.close().await.ok();
                return Ok(());
            }
        };

        let (session, mut outbox) = self.sessions.register(user_id, params.last_event_at);
        debug!(session_id = %session.id, %user_id, "session connected");

        let writer = tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                if sink.send(Message::Text(encode(&message))).await.is_err() {
                    break;
                }
            }
            sink.close().await.ok();
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<IngressMessage>(&text) {
                    Ok(message) => self.handle_message(&session, message).await,
                    Err(err) => session.send(EgressMessage::Error(ErrorPayload {
                        message: format!("malformed message: {}", err),
                    })),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }

        self.disconnect_session(&session);
        writer.abort();
        Ok(())
    }

    async fn handle_message(self: &Arc<Self>, session: &Arc<Session>, message: IngressMessage) {
        self.presence.touch(session.id);
        match message {
            IngressMessage::JoinAuction { auction_id } => {
                self.handle_join(session, auction_id).await;
            }
            IngressMessage::LeaveAuction { auction_id } => {
                if self.presence.leave(auction_id, session.id) {
                    self.broadcast_presence(auction_id);
                }
            }
            IngressMessage::PlaceBid {
                auction_id,
                amount,
                client_token,
            } => {
                self.handle_place_bid(session, auction_id, amount, client_token)
                    .await;
            }
        }
    }

    async fn handle_join(self: &Arc<Self>, session: &Arc<Session>, auction_id: Uuid) {
        let state = match self.auction_state(auction_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                session.send(EgressMessage::Error(ErrorPayload {
                    message: "auction not found".to_string(),
                }));
                return;
            }
            Err(err) => {
                warn!(%auction_id, error = %err, "auction state read failed");
                session.send(EgressMessage::Error(ErrorPayload {
                    message: "auction state unavailable".to_string(),
                }));
                return;
            }
        };

        self.ensure_cross_node_subscription(auction_id).await;
        self.presence.join(auction_id, session.id, session.user_id);

        let replayed_events = self.replay.since(auction_id, session.last_event_at);
        session.send(EgressMessage::AuctionJoined(JoinedPayload {
            auction_id,
            auction: state,
            replayed_events,
        }));
        self.broadcast_presence(auction_id);
    }

    async fn handle_place_bid(
        &self,
        session: &Arc<Session>,
        auction_id: Uuid,
        amount: Decimal,
        client_token: Option<String>,
    ) {
        match self
            .bids
            .place_bid(session.user_id, auction_id, amount, client_token.clone())
            .await
        {
            // The internal event handler does the broadcasting.
            Ok(_) => {}
            Err(err) => {
                debug!(
                    session_id = %session.id,
                    %auction_id,
                    reason = err.reason_code(),
                    "bid rejected"
                );
                session.send(EgressMessage::BidRejected(BidRejectedPayload {
                    auction_id,
                    reason: err.reason_code().to_string(),
                    min_required: err.min_required(),
                    client_token,
                    retryable: err.is_retryable(),
                }));
            }
        }
    }

    fn disconnect_session(&self, session: &Session) {
        self.sessions.remove(session.id);
        for auction_id in self.presence.disconnect(session.id) {
            self.broadcast_presence(auction_id);
        }
        debug!(session_id = %session.id, "session disconnected");
    }

    /// Cached auction row merged with live presence counts.
    async fn auction_state(
        &self,
        auction_id: Uuid,
    ) -> Result<Option<AuctionStateView>, StoreError> {
        let auction = match self.cache.get(auction_id) {
            Some(auction) => auction,
            None => match self.store.get_auction(auction_id).await? {
                Some(auction) => {
                    self.cache.put(auction.clone());
                    auction
                }
                None => return Ok(None),
            },
        };
        Ok(Some(AuctionStateView::build(
            &auction,
            self.presence.counts(auction_id),
            Utc::now(),
            self.settings.timer.ending_threshold_ms,
            &self.settings.gateway.mask_prefix,
        )))
    }

    async fn handle_event(self: &Arc<Self>, event: AuctionEvent) {
        match event {
            AuctionEvent::Tick(tick) => {
                // Ticks are node-local; each node runs its own countdown.
                self.room_send(tick.auction_id, &EgressMessage::Timer(TimerPayload::from(&tick)));
            }
            AuctionEvent::Ending(ending) => {
                self.cache.invalidate(ending.auction_id);
                match self.auction_state(ending.auction_id).await {
                    Ok(Some(state)) => {
                        let message = EgressMessage::AuctionState(state);
                        self.record_and_broadcast(ending.auction_id, &message);
                        self.publish_cross(ending.auction_id, &message).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(auction_id = %ending.auction_id, error = %err, "state refresh failed");
                    }
                }
            }
            AuctionEvent::Ended(ended) => {
                let auction_id = ended.auction_id;
                self.cache.invalidate(auction_id);
                let message = EgressMessage::Ended(EndedPayload::from_event(
                    &ended,
                    &self.settings.gateway.mask_prefix,
                ));
                self.record_and_broadcast(auction_id, &message);
                self.publish_cross(auction_id, &message).await;
                self.schedule_replay_clear(auction_id);
            }
            AuctionEvent::Extended(extended) => {
                let auction_id = extended.auction_id;
                self.cache.invalidate(auction_id);
                let message = EgressMessage::Extended(ExtendedPayload::from(&extended));
                self.record_and_broadcast(auction_id, &message);
                self.publish_cross(auction_id, &message).await;
            }
            AuctionEvent::BidPlaced(event) => self.handle_bid_placed(event).await,
        }
    }

    async fn handle_bid_placed(&self, event: BidPlacedEvent) {
        let auction_id = event.auction.id;
        self.cache.put(event.auction.clone());
        self.presence.mark_bid(auction_id, event.bid.user_id);

        let placed = BidPlacedPayload {
            auction_id,
            bid_id: event.bid.id,
            user_id: mask_user_id(event.bid.user_id, &self.settings.gateway.mask_prefix),
            bidder_alias: bidder_alias(event.bid.user_id),
            amount: event.bid.amount,
            timestamp: event.bid.created_at,
            is_winning: true,
            new_min_bid: event.new_min_bid,
        };

        let public = EgressMessage::BidPlaced(placed.clone());
        self.record_and_broadcast(auction_id, &public);

        // Private confirmation to every session of the placing user.
        let confirmed = EgressMessage::BidConfirmed(BidConfirmedPayload {
            placed,
            client_token: event.client_token,
        });
        for session_id in self
            .presence
            .sessions_for_user(auction_id, event.bid.user_id)
        {
            self.sessions.send_to(session_id, confirmed.clone());
        }

        self.publish_cross(auction_id, &public).await;
        self.broadcast_presence(auction_id);
    }

    /// Re-emit an envelope from another node to this node's sessions.
    fn handle_remote(&self, envelope: Envelope) {
        let Some(message) =
            EgressMessage::from_envelope_parts(&envelope.event_type, envelope.payload)
        else {
            return;
        };
        // Keep reconnectors on this node inside catch-up range too.
        self.record_and_broadcast(envelope.auction_id, &message);
    }

    async fn ensure_cross_node_subscription(self: &Arc<Self>, auction_id: Uuid) {
        let Some(bus) = &self.cross_node else {
            return;
        };
        if !self.cross_subscribed.lock().insert(auction_id) {
            return;
        }
        let weak = Arc::downgrade(self);
        let handler: EnvelopeHandler = Arc::new(move |envelope| {
            if let Some(gateway) = weak.upgrade() {
                gateway.handle_remote(envelope);
            }
        });
        if let Err(err) = bus.subscribe_auction(auction_id, handler).await {
            warn!(%auction_id, error = %err, "cross-node subscribe failed");
            self.cross_subscribed.lock().remove(&auction_id);
        }
    }

    fn broadcast_presence(&self, auction_id: Uuid) {
        let counts = self.presence.counts(auction_id);
        self.room_send(
            auction_id,
            &EgressMessage::Presence(PresencePayload {
                auction_id,
                participant_count: counts.participants,
                active_bidder_count: counts.active_bidders,
            }),
        );
    }

    fn room_send(&self, auction_id: Uuid, message: &EgressMessage) {
        for session_id in self.presence.sessions_in(auction_id) {
            self.sessions.send_to(session_id, message.clone());
        }
    }

    fn record_and_broadcast(&self, auction_id: Uuid, message: &EgressMessage) {
        self.replay
            .record(auction_id, message.event_type(), message.payload());
        self.room_send(auction_id, message);
    }

    async fn publish_cross(&self, auction_id: Uuid, message: &EgressMessage) {
        if let Some(bus) = &self.cross_node {
            bus.publish(message.event_type(), auction_id, message.payload())
                .await;
        }
    }

    fn schedule_replay_clear(&self, auction_id: Uuid) {
        let replay = self.replay.clone();
        let delay = self.replay.retention();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            replay.clear(auction_id);
            debug!(%auction_id, "replay buffer cleared after auction end");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use crate::ledger::{MemoryLedger, ReservationLedger};
    use crate::models::auction::NewAuction;
    use crate::services::timer::AuctionTimer;
    use crate::store::MemoryAuctionStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        gateway: Arc<SessionGateway>,
        store: Arc<MemoryAuctionStore>,
        ledger: Arc<MemoryLedger>,
    }

    fn harness() -> Harness {
        let settings = BidCoreSettings::default();
        let store = Arc::new(MemoryAuctionStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let bus = Arc::new(EventBus::new());
        let timer = Arc::new(AuctionTimer::new(
            store.clone() as Arc<dyn AuctionStore>,
            bus.clone(),
            settings.timer.clone(),
        ));
        let bids = Arc::new(BidService::new(
            store.clone() as Arc<dyn AuctionStore>,
            ledger.clone() as Arc<dyn ReservationLedger>,
            timer,
            bus.clone(),
        ));
        let replay = Arc::new(ReplayBuffer::new(settings.replay.clone()));
        let cache = Arc::new(StateCache::new(&settings.state_cache));
        let gateway = Arc::new(SessionGateway::new(
            settings,
            store.clone() as Arc<dyn AuctionStore>,
            bids,
            bus.clone(),
            None,
            Arc::new(PresenceTracker::new()),
            replay,
            cache,
            Arc::new(StaticTokenAuthenticator::new()),
        ));
        Harness {
            gateway,
            store,
            ledger,
        }
    }

    async fn seeded_auction(h: &Harness) -> Uuid {
        let now = Utc::now();
        let auction = NewAuction {
            asset_id: Uuid::now_v7(),
            title: "Lot".to_string(),
            description: None,
            reserve_price: dec!(0),
            starting_price: dec!(100),
            min_bid_increment: dec!(10),
            starts_at: now - Duration::minutes(1),
            ends_at: now + Duration::hours(1),
            extension_seconds: 30,
            max_extensions: 3,
        }
        .into_auction(now);
        h.store.create_auction(&auction).await.unwrap();
        auction.id
    }

    fn connect(
        h: &Harness,
        user_id: Uuid,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<EgressMessage>) {
        h.gateway.sessions.register(user_id, None)
    }

    fn drain(outbox: &mut mpsc::UnboundedReceiver<EgressMessage>) -> Vec<EgressMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = outbox.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_connect_params_parsing() {
        let params =
            parse_connect_params(Some("token=abc&last_event_at=2026-01-01T00:00:00Z"));
        assert_eq!(params.token.as_deref(), Some("abc"));
        assert!(params.last_event_at.is_some());

        let params = parse_connect_params(Some("token=abc&last_event_at=1767225600000"));
        assert!(params.last_event_at.is_some());

        let params = parse_connect_params(Some("last_event_at=garbage"));
        assert!(params.token.is_none());
        assert!(params.last_event_at.is_none());

        let params = parse_connect_params(None);
        assert!(params.token.is_none());
    }

    #[test]
    fn test_origin_allowlist() {
        let allowed = vec!["https://app.example.com".to_string()];
        assert!(origin_allowed(Some("https://app.example.com"), &allowed));
        assert!(!origin_allowed(Some("https://evil.example.com"), &allowed));
        assert!(!origin_allowed(None, &allowed));
        // Empty allowlist admits any origin.
        assert!(origin_allowed(Some("https://anything"), &[]));
        assert!(origin_allowed(None, &[]));
    }

    #[tokio::test]
    async fn test_join_replies_privately_and_updates_presence() {
        let h = harness();
        let auction_id = seeded_auction(&h).await;
        let user = Uuid::now_v7();
        let (session, mut outbox) = connect(&h, user);

        h.gateway.handle_join(&session, auction_id).await;

        let messages = drain(&mut outbox);
        let joined = messages
            .iter()
            .find_map(|m| match m {
                EgressMessage::AuctionJoined(payload) => Some(payload),
                _ => None,
            })
            .expect("auction:joined reply");
        assert_eq!(joined.auction_id, auction_id);
        assert_eq!(joined.auction.min_next_bid, dec!(100));
        assert!(joined.replayed_events.is_empty());
        // The state snapshot predates the join; the presence broadcast that
        // follows carries the updated count.
        assert_eq!(joined.auction.participant_count, 0);
        assert!(messages
            .iter()
            .any(|m| matches!(m, EgressMessage::Presence(p) if p.participant_count == 1)));
    }

    #[tokio::test]
    async fn test_join_unknown_auction_errors() {
        let h = harness();
        let (session, mut outbox) = connect(&h, Uuid::now_v7());
        h.gateway.handle_join(&session, Uuid::now_v7()).await;

        let messages = drain(&mut outbox);
        assert!(matches!(messages.as_slice(), [EgressMessage::Error(_)]));
    }

    #[tokio::test]
    async fn test_bid_placed_broadcast_masks_and_confirms() {
        let h = harness();
        let auction_id = seeded_auction(&h).await;
        let bidder = Uuid::now_v7();
        let watcher = Uuid::now_v7();
        h.ledger.credit(bidder, dec!(1_000));

        let (bidder_session, mut bidder_outbox) = connect(&h, bidder);
        let (watcher_session, mut watcher_outbox) = connect(&h, watcher);
        h.gateway.handle_join(&bidder_session, auction_id).await;
        h.gateway.handle_join(&watcher_session, auction_id).await;
        drain(&mut bidder_outbox);
        drain(&mut watcher_outbox);

        h.gateway
            .handle_place_bid(&bidder_session, auction_id, dec!(100), Some("tok-9".into()))
            .await;
        // Drive the internal event through the handler the pump would call.
        let auction = h.store.get_auction(auction_id).await.unwrap().unwrap();
        let bids = h.store.bids_for_auction(auction_id).await.unwrap();
        h.gateway
            .handle_event(AuctionEvent::BidPlaced(BidPlacedEvent {
                bid: bids[0].clone(),
                auction,
                was_extended: false,
                new_min_bid: dec!(110),
                client_token: Some("tok-9".to_string()),
            }))
            .await;

        // The watcher sees the public, masked broadcast but no confirmation.
        let watcher_messages = drain(&mut watcher_outbox);
        let public = watcher_messages
            .iter()
            .find_map(|m| match m {
                EgressMessage::BidPlaced(p) => Some(p),
                _ => None,
            })
            .expect("bid:placed broadcast");
        assert!(public.user_id.starts_with("***-"));
        assert_eq!(public.user_id.len(), 8);
        assert!(!watcher_messages
            .iter()
            .any(|m| matches!(m, EgressMessage::BidConfirmed(_))));

        // The bidder additionally receives the private confirmation.
        let bidder_messages = drain(&mut bidder_outbox);
        let confirmed = bidder_messages
            .iter()
            .find_map(|m| match m {
                EgressMessage::BidConfirmed(p) => Some(p),
                _ => None,
            })
            .expect("bid:confirmed echo");
        assert_eq!(confirmed.client_token.as_deref(), Some("tok-9"));

        // The broadcast is also in the replay ring now.
        let replayed = h.gateway.replay.since(auction_id, None);
        assert!(replayed.iter().any(|e| e.event_type == "bid:placed"));

        // Bidder counts update with the flagged bid.
        assert!(bidder_messages.iter().any(
            |m| matches!(m, EgressMessage::Presence(p) if p.active_bidder_count == 1)
        ));
    }

    #[tokio::test]
    async fn test_rejection_goes_only_to_placing_session() {
        let h = harness();
        let auction_id = seeded_auction(&h).await;
        let bidder = Uuid::now_v7();
        let watcher = Uuid::now_v7();
        h.ledger.credit(bidder, dec!(1_000));

        let (bidder_session, mut bidder_outbox) = connect(&h, bidder);
        let (watcher_session, mut watcher_outbox) = connect(&h, watcher);
        h.gateway.handle_join(&bidder_session, auction_id).await;
        h.gateway.handle_join(&watcher_session, auction_id).await;
        drain(&mut bidder_outbox);
        drain(&mut watcher_outbox);

        // Below the starting price: INCREMENT_TOO_LOW with the echo.
        h.gateway
            .handle_place_bid(&bidder_session, auction_id, dec!(90), None)
            .await;

        let rejection = drain(&mut bidder_outbox)
            .into_iter()
            .find_map(|m| match m {
                EgressMessage::BidRejected(p) => Some(p),
                _ => None,
            })
            .expect("bid:rejected reply");
        assert_eq!(rejection.reason, "INCREMENT_TOO_LOW");
        assert_eq!(rejection.min_required, Some(dec!(100)));
        assert!(!rejection.retryable);

        assert!(drain(&mut watcher_outbox).is_empty());
    }

    #[tokio::test]
    async fn test_remote_envelope_reemitted_to_room() {
        let h = harness();
        let auction_id = seeded_auction(&h).await;
        let (session, mut outbox) = connect(&h, Uuid::now_v7());
        h.gateway.handle_join(&session, auction_id).await;
        drain(&mut outbox);

        let payload = json!({
            "auctionId": auction_id,
            "bidId": Uuid::now_v7(),
            "userId": "***-9f1c",
            "bidderAlias": "Bidder-9f1c",
            "amount": "150",
            "timestamp": Utc::now(),
            "isWinning": true,
            "newMinBid": "160"
        });
        h.gateway.handle_remote(Envelope::new(
            Uuid::now_v7(),
            "bid:placed",
            auction_id,
            payload,
        ));

        let messages = drain(&mut outbox);
        assert!(messages
            .iter()
            .any(|m| matches!(m, EgressMessage::BidPlaced(p) if p.amount == dec!(150))));

        // Confirmation-type envelopes are never forwarded.
        h.gateway.handle_remote(Envelope::new(
            Uuid::now_v7(),
            "bid:confirmed",
            auction_id,
            json!({}),
        ));
        assert!(drain(&mut outbox).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_sweeps_presence() {
        let h = harness();
        let auction_id = seeded_auction(&h).await;
        let leaver = Uuid::now_v7();
        let stayer = Uuid::now_v7();

        let (leaver_session, _leaver_outbox) = connect(&h, leaver);
        let (stayer_session, mut stayer_outbox) = connect(&h, stayer);
        h.gateway.handle_join(&leaver_session, auction_id).await;
        h.gateway.handle_join(&stayer_session, auction_id).await;
        drain(&mut stayer_outbox);

        h.gateway.disconnect_session(&leaver_session);

        assert_eq!(h.gateway.presence.participant_count(auction_id), 1);
        assert!(drain(&mut stayer_outbox).iter().any(
            |m| matches!(m, EgressMessage::Presence(p) if p.participant_count == 1)
        ));
    }
}
