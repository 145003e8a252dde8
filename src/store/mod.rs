//! Auction Store
//!
//! Durable entity store for auctions and bids. The trait pair below is the
//! crate's persistence seam: `AuctionStore` opens transactions and serves
//! plain reads, `StoreTx` carries the serialized region behind the exclusive
//! per-auction row lock. Collaborators that must commit atomically with a bid
//! (the reservation ledger) join a transaction through `as_any_mut`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::models::auction::{Auction, AuctionStatus};
use crate::models::bid::Bid;

pub use memory::MemoryAuctionStore;
pub use postgres::PgAuctionStore;

/// Store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store misuse: {0}")]
    Misuse(String),
}

/// A user's maximum committed stake on one auction, used for refunds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStake {
    pub user_id: Uuid,
    pub amount: Decimal,
}

/// An open ACID transaction.
///
/// All mutations of auction and bid rows go through a transaction holding the
/// auction's row lock (`lock_auction`). Writes are visible to other
/// transactions only after `commit`.
#[async_trait]
pub trait StoreTx: Send {
    /// Acquire the exclusive row lock on an auction (`SELECT … FOR UPDATE`
    /// semantics) and return the current row.
    async fn lock_auction(&mut self, auction_id: Uuid) -> Result<Option<Auction>, StoreError>;

    async fn insert_bid(&mut self, bid: &Bid) -> Result<(), StoreError>;

    /// Denormalize an accepted bid onto the auction row: highest bid, highest
    /// bidder, and a monotonic `bid_count + 1`.
    async fn apply_bid(
        &mut self,
        auction_id: Uuid,
        amount: Decimal,
        bidder_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_status(
        &mut self,
        auction_id: Uuid,
        status: AuctionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Anti-sniping push-out of the deadline, bumping the extension counter
    /// and (possibly) resetting the status back to ACTIVE.
    async fn extend_deadline(
        &mut self,
        auction_id: Uuid,
        new_ends_at: DateTime<Utc>,
        extension_count: i32,
        status: AuctionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Terminal settlement write; `winner` is `(user_id, winning_bid)`.
    async fn set_settled(
        &mut self,
        auction_id: Uuid,
        winner: Option<(Uuid, Decimal)>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// The user's most recent bid on this auction, if any.
    async fn latest_bid_for_user(
        &mut self,
        auction_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Bid>, StoreError>;

    /// MAX(amount) per bidder on this auction; the refund amount rule.
    async fn max_stake_per_user(&mut self, auction_id: Uuid)
        -> Result<Vec<UserStake>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;

    /// Downcast seam for collaborators joining this transaction.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Durable store for auctions and bids
#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    async fn create_auction(&self, auction: &Auction) -> Result<(), StoreError>;

    async fn get_auction(&self, auction_id: Uuid) -> Result<Option<Auction>, StoreError>;

    async fn list_by_status(&self, statuses: &[AuctionStatus])
        -> Result<Vec<Auction>, StoreError>;

    /// All bids on an auction, oldest first.
    async fn bids_for_auction(&self, auction_id: Uuid) -> Result<Vec<Bid>, StoreError>;

    /// Non-terminal auctions, for timer recovery on startup.
    async fn resumable_auctions(&self) -> Result<Vec<Auction>, StoreError>;
}
