//! Auction Models
//!
//! Time-bounded auction entity with anti-sniping extension state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Auction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Scheduled,
    Active,
    Ending,
    Ended,
    Cancelled,
    Settled,
}

impl AuctionStatus {
    /// Terminal statuses never revert.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled | Self::Settled)
    }

    /// Whether bids can be accepted in this status (the time window is
    /// checked separately).
    pub fn accepts_bids(&self) -> bool {
        matches!(self, Self::Active | Self::Ending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Cancelled => "cancelled",
            Self::Settled => "settled",
        }
    }
}

impl std::str::FromStr for AuctionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "active" => Ok(Self::Active),
            "ending" => Ok(Self::Ending),
            "ended" => Ok(Self::Ended),
            "cancelled" => Ok(Self::Cancelled),
            "settled" => Ok(Self::Settled),
            other => Err(format!("unknown auction status: {}", other)),
        }
    }
}

impl std::fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived label over an active auction's remaining time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Active,
    Ending,
    Ended,
}

/// Auction entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub title: String,
    pub description: Option<String>,

    // Pricing
    pub reserve_price: Decimal,
    pub starting_price: Decimal,
    pub min_bid_increment: Decimal,
    pub current_highest_bid: Option<Decimal>,
    pub current_highest_bidder_id: Option<Uuid>,

    // Timing
    pub status: AuctionStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,

    // Anti-sniping
    pub extension_seconds: i64,
    pub extension_count: i32,
    pub max_extensions: i32,

    // Outcome
    pub bid_count: i32,
    pub winner_id: Option<Uuid>,
    pub winning_bid: Option<Decimal>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Auction {
    /// Calculate minimum acceptable amount for the next bid.
    pub fn min_next_bid(&self) -> Decimal {
        match self.current_highest_bid {
            Some(highest) => highest + self.min_bid_increment,
            None => self.starting_price,
        }
    }

    /// Milliseconds until `ends_at`; negative once the auction is past due.
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        (self.ends_at - now).num_milliseconds()
    }

    /// Bid acceptance window: status permits bidding and the wall clock is
    /// strictly before `ends_at` (`ends_at` itself is exclusive).
    pub fn accepts_bids_at(&self, now: DateTime<Utc>) -> bool {
        self.status.accepts_bids() && now < self.ends_at
    }

    /// Phase label for timer broadcasts.
    pub fn phase_at(&self, now: DateTime<Utc>, ending_threshold_ms: i64) -> Phase {
        let remaining = self.remaining_ms(now);
        if remaining <= 0 {
            Phase::Ended
        } else if remaining <= ending_threshold_ms {
            Phase::Ending
        } else {
            Phase::Active
        }
    }

    /// Check if reserve price is met. A zero reserve always counts as met.
    pub fn reserve_met(&self) -> bool {
        if self.reserve_price.is_zero() {
            return true;
        }
        self.current_highest_bid
            .map(|bid| bid >= self.reserve_price)
            .unwrap_or(false)
    }

    /// Whether anti-snipe extensions are still available.
    pub fn can_extend(&self) -> bool {
        self.status.accepts_bids() && self.extension_count < self.max_extensions
    }
}

/// Parameters for creating an auction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuction {
    pub asset_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub reserve_price: Decimal,
    pub starting_price: Decimal,
    pub min_bid_increment: Decimal,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default = "default_extension_seconds")]
    pub extension_seconds: i64,
    #[serde(default = "default_max_extensions")]
    pub max_extensions: i32,
}

fn default_extension_seconds() -> i64 {
    30
}

fn default_max_extensions() -> i32 {
    3
}

impl NewAuction {
    /// Materialize the entity. Status depends on whether `starts_at` has passed.
    pub fn into_auction(self, now: DateTime<Utc>) -> Auction {
        let status = if self.starts_at <= now {
            AuctionStatus::Active
        } else {
            AuctionStatus::Scheduled
        };

        Auction {
            id: Uuid::now_v7(),
            asset_id: self.asset_id,
            title: self.title,
            description: self.description,
            reserve_price: self.reserve_price,
            starting_price: self.starting_price,
            min_bid_increment: self.min_bid_increment,
            current_highest_bid: None,
            current_highest_bidder_id: None,
            status,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            extension_seconds: self.extension_seconds,
            extension_count: 0,
            max_extensions: self.max_extensions,
            bid_count: 0,
            winner_id: None,
            winning_bid: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn sample_auction(now: DateTime<Utc>) -> Auction {
        NewAuction {
            asset_id: Uuid::now_v7(),
            title: "Lot 42".to_string(),
            description: None,
            reserve_price: dec!(0),
            starting_price: dec!(100),
            min_bid_increment: dec!(10),
            starts_at: now - Duration::minutes(5),
            ends_at: now + Duration::minutes(5),
            extension_seconds: 30,
            max_extensions: 3,
        }
        .into_auction(now)
    }

    #[test]
    fn test_min_next_bid_without_bids() {
        let auction = sample_auction(Utc::now());
        assert_eq!(auction.min_next_bid(), dec!(100));
    }

    #[test]
    fn test_min_next_bid_with_highest() {
        let mut auction = sample_auction(Utc::now());
        auction.current_highest_bid = Some(dec!(110));
        assert_eq!(auction.min_next_bid(), dec!(120));
    }

    #[test]
    fn test_acceptance_window_boundaries() {
        let auction = sample_auction(Utc::now());
        let ends_at = auction.ends_at;

        // One millisecond before the deadline: accepted.
        assert!(auction.accepts_bids_at(ends_at - Duration::milliseconds(1)));
        // Exactly at the deadline: rejected (ends_at is exclusive).
        assert!(!auction.accepts_bids_at(ends_at));
        // Past the deadline: rejected.
        assert!(!auction.accepts_bids_at(ends_at + Duration::milliseconds(1)));
    }

    #[test]
    fn test_terminal_status_rejects_even_before_deadline() {
        let now = Utc::now();
        let mut auction = sample_auction(now);
        auction.status = AuctionStatus::Ended;
        // Data anomaly: ENDED while the wall clock is still before ends_at.
        assert!(!auction.accepts_bids_at(now));
    }

    #[test]
    fn test_phase_labels() {
        let now = Utc::now();
        let mut auction = sample_auction(now);
        assert_eq!(auction.phase_at(now, 60_000), Phase::Active);

        auction.ends_at = now + Duration::seconds(45);
        assert_eq!(auction.phase_at(now, 60_000), Phase::Ending);

        auction.ends_at = now - Duration::seconds(1);
        assert_eq!(auction.phase_at(now, 60_000), Phase::Ended);
    }

    #[test]
    fn test_reserve_met() {
        let mut auction = sample_auction(Utc::now());
        assert!(auction.reserve_met()); // zero reserve

        auction.reserve_price = dec!(500);
        assert!(!auction.reserve_met());

        auction.current_highest_bid = Some(dec!(300));
        assert!(!auction.reserve_met());

        auction.current_highest_bid = Some(dec!(500));
        assert!(auction.reserve_met());
    }

    #[test]
    fn test_scheduled_vs_active_on_create() {
        let now = Utc::now();
        let mut new = NewAuction {
            asset_id: Uuid::now_v7(),
            title: "Lot".to_string(),
            description: None,
            reserve_price: dec!(0),
            starting_price: dec!(1),
            min_bid_increment: dec!(1),
            starts_at: now + Duration::hours(1),
            ends_at: now + Duration::hours(2),
            extension_seconds: 30,
            max_extensions: 3,
        };
        assert_eq!(
            new.clone().into_auction(now).status,
            AuctionStatus::Scheduled
        );

        new.starts_at = now - Duration::minutes(1);
        assert_eq!(new.into_auction(now).status, AuctionStatus::Active);
    }
}
