//! Session Wire Protocol
//!
//! JSON messages exchanged with sessions over the push channel. Message
//! names and field casing are part of the external contract, so everything
//! here serializes camelCase regardless of the crate's internal conventions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::auction::{Auction, AuctionStatus, Phase};
use crate::models::event::{EndedEvent, ExtendedEvent, TickEvent};
use crate::services::presence::PresenceCounts;
use crate::services::replay::ReplayedEvent;

/// Mask a user id for public payloads: prefix plus the last four characters.
pub fn mask_user_id(user_id: Uuid, prefix: &str) -> String {
    let raw = user_id.to_string();
    let tail = &raw[raw.len() - 4..];
    format!("{}{}", prefix, tail)
}

/// Stable display alias derived from the same tail as the mask.
pub fn bidder_alias(user_id: Uuid) -> String {
    let raw = user_id.to_string();
    format!("Bidder-{}", &raw[raw.len() - 4..])
}

/// Messages sessions send to the gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngressMessage {
    #[serde(rename_all = "camelCase")]
    JoinAuction { auction_id: Uuid },
    #[serde(rename_all = "camelCase")]
    LeaveAuction { auction_id: Uuid },
    #[serde(rename_all = "camelCase")]
    PlaceBid {
        auction_id: Uuid,
        amount: Decimal,
        #[serde(default)]
        client_token: Option<String>,
    },
}

/// Public auction state as sessions see it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionStateView {
    pub auction_id: Uuid,
    pub asset_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: AuctionStatus,
    pub starting_price: Decimal,
    pub min_bid_increment: Decimal,
    pub current_highest_bid: Option<Decimal>,
    /// Masked; the reserve price itself is never exposed.
    pub current_highest_bidder: Option<String>,
    pub min_next_bid: Decimal,
    pub bid_count: i32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub remaining_ms: i64,
    pub phase: Phase,
    pub extension_count: i32,
    pub max_extensions: i32,
    pub reserve_met: bool,
    pub winner_id: Option<String>,
    pub winning_bid: Option<Decimal>,
    pub participant_count: usize,
    pub active_bidder_count: usize,
}

impl AuctionStateView {
    pub fn build(
        auction: &Auction,
        counts: PresenceCounts,
        now: DateTime<Utc>,
        ending_threshold_ms: i64,
        mask_prefix: &str,
    ) -> Self {
        Self {
            auction_id: auction.id,
            asset_id: auction.asset_id,
            title: auction.title.clone(),
            description: auction.description.clone(),
            status: auction.status,
            starting_price: auction.starting_price,
            min_bid_increment: auction.min_bid_increment,
            current_highest_bid: auction.current_highest_bid,
            current_highest_bidder: auction
                .current_highest_bidder_id
                .map(|id| mask_user_id(id, mask_prefix)),
            min_next_bid: auction.min_next_bid(),
            bid_count: auction.bid_count,
            starts_at: auction.starts_at,
            ends_at: auction.ends_at,
            remaining_ms: auction.remaining_ms(now).max(0),
            phase: auction.phase_at(now, ending_threshold_ms),
            extension_count: auction.extension_count,
            max_extensions: auction.max_extensions,
            reserve_met: auction.reserve_met(),
            winner_id: auction.winner_id.map(|id| mask_user_id(id, mask_prefix)),
            winning_bid: auction.winning_bid,
            participant_count: counts.participants,
            active_bidder_count: counts.active_bidders,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedPayload {
    pub auction_id: Uuid,
    pub auction: AuctionStateView,
    pub replayed_events: Vec<ReplayedEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidPlacedPayload {
    pub auction_id: Uuid,
    pub bid_id: Uuid,
    /// Masked bidder id, e.g. `***-4f2a`.
    pub user_id: String,
    pub bidder_alias: String,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub is_winning: bool,
    pub new_min_bid: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidConfirmedPayload {
    #[serde(flatten)]
    pub placed: BidPlacedPayload,
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRejectedPayload {
    pub auction_id: Uuid,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_required: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPayload {
    pub auction_id: Uuid,
    pub remaining_ms: i64,
    pub server_time: DateTime<Utc>,
    pub phase: Phase,
    pub extension_count: i32,
}

impl From<&TickEvent> for TimerPayload {
    fn from(tick: &TickEvent) -> Self {
        Self {
            auction_id: tick.auction_id,
            remaining_ms: tick.remaining_ms,
            server_time: tick.server_time,
            phase: tick.phase,
            extension_count: tick.extension_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedPayload {
    pub auction_id: Uuid,
    pub new_ends_at: DateTime<Utc>,
    pub extension_count: i32,
    pub reason: String,
}

impl From<&ExtendedEvent> for ExtendedPayload {
    fn from(event: &ExtendedEvent) -> Self {
        Self {
            auction_id: event.auction_id,
            new_ends_at: event.new_ends_at,
            extension_count: event.extension_count,
            reason: "anti_sniping".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndedPayload {
    pub auction_id: Uuid,
    /// `settled` or `no_sale`.
    pub status: String,
    pub winner_id: Option<String>,
    pub winning_bid: Option<Decimal>,
    pub total_bids: i32,
    pub ended_at: DateTime<Utc>,
}

impl EndedPayload {
    pub fn from_event(event: &EndedEvent, mask_prefix: &str) -> Self {
        Self {
            auction_id: event.auction_id,
            status: event.sale_status().to_string(),
            winner_id: event.winner_id.map(|id| mask_user_id(id, mask_prefix)),
            winning_bid: event.winning_bid,
            total_bids: event.total_bids,
            ended_at: event.ended_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub auction_id: Uuid,
    pub participant_count: usize,
    pub active_bidder_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Messages the gateway emits to sessions
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EgressMessage {
    #[serde(rename = "auction:joined")]
    AuctionJoined(JoinedPayload),
    #[serde(rename = "auction:state")]
    AuctionState(AuctionStateView),
    #[serde(rename = "bid:placed")]
    BidPlaced(BidPlacedPayload),
    #[serde(rename = "bid:confirmed")]
    BidConfirmed(BidConfirmedPayload),
    #[serde(rename = "bid:rejected")]
    BidRejected(BidRejectedPayload),
    #[serde(rename = "auction:timer")]
    Timer(TimerPayload),
    #[serde(rename = "auction:extended")]
    Extended(ExtendedPayload),
    #[serde(rename = "auction:ended")]
    Ended(EndedPayload),
    #[serde(rename = "auction:presence")]
    Presence(PresencePayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl EgressMessage {
    /// Wire name, also used as the replay and envelope event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AuctionJoined(_) => "auction:joined",
            Self::AuctionState(_) => "auction:state",
            Self::BidPlaced(_) => "bid:placed",
            Self::BidConfirmed(_) => "bid:confirmed",
            Self::BidRejected(_) => "bid:rejected",
            Self::Timer(_) => "auction:timer",
            Self::Extended(_) => "auction:extended",
            Self::Ended(_) => "auction:ended",
            Self::Presence(_) => "auction:presence",
            Self::Error(_) => "error",
        }
    }

    /// Bare payload without the type tag, for envelopes and replay rings.
    pub fn payload(&self) -> Value {
        let result = match self {
            Self::AuctionJoined(p) => serde_json::to_value(p),
            Self::AuctionState(p) => serde_json::to_value(p),
            Self::BidPlaced(p) => serde_json::to_value(p),
            Self::BidConfirmed(p) => serde_json::to_value(p),
            Self::BidRejected(p) => serde_json::to_value(p),
            Self::Timer(p) => serde_json::to_value(p),
            Self::Extended(p) => serde_json::to_value(p),
            Self::Ended(p) => serde_json::to_value(p),
            Self::Presence(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
        };
        result.unwrap_or(Value::Null)
    }

    /// Rebuild a broadcastable message from a cross-node envelope. Private
    /// and node-local message types are never forwarded.
    pub fn from_envelope_parts(event_type: &str, payload: Value) -> Option<Self> {
        match event_type {
            "bid:placed" => serde_json::from_value(payload).ok().map(Self::BidPlaced),
            "auction:state" => serde_json::from_value(payload).ok().map(Self::AuctionState),
            "auction:extended" => serde_json::from_value(payload).ok().map(Self::Extended),
            "auction:ended" => serde_json::from_value(payload).ok().map(Self::Ended),
            _ => None,
        }
    }
}
