//! Bid Models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auction::Auction;

/// Bid status
///
/// A bid is superseded referentially by any later accepted bid on the same
/// auction; the row itself is written once and never updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Active,
    Superseded,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }
}

impl std::str::FromStr for BidStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "superseded" => Ok(Self::Superseded),
            other => Err(format!("unknown bid status: {}", other)),
        }
    }
}

/// Bid entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub user_id: Uuid,
    pub asset_id: Uuid,
    pub amount: Decimal,
    pub status: BidStatus,
    pub created_at: DateTime<Utc>,
}

impl Bid {
    /// New active bid against an auction; `asset_id` is copied from the auction.
    pub fn new(auction: &Auction, user_id: Uuid, amount: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            auction_id: auction.id,
            user_id,
            asset_id: auction.asset_id,
            amount,
            status: BidStatus::Active,
            created_at: now,
        }
    }
}
