//! Postgres Auction Store
//!
//! sqlx-backed implementation. The exclusive per-auction serialization point
//! is `SELECT … FOR UPDATE` on the auction row; every mutation happens inside
//! a transaction holding that lock. External ledger implementations join a
//! transaction through [`PgStoreTx::connection`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::auction::{Auction, AuctionStatus};
use crate::models::bid::{Bid, BidStatus};

use super::{AuctionStore, StoreError, StoreTx, UserStake};

/// Postgres store
#[derive(Clone)]
pub struct PgAuctionStore {
    pool: PgPool,
}

impl PgAuctionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }
}

/// Transaction wrapper exposing the connection to joining collaborators
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTx {
    /// The underlying connection, for collaborators that must commit
    /// atomically with this transaction (the reservation ledger).
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

const AUCTION_COLUMNS: &str = "id, asset_id, title, description, reserve_price, starting_price, \
     min_bid_increment, current_highest_bid, current_highest_bidder_id, status, starts_at, \
     ends_at, extension_seconds, extension_count, max_extensions, bid_count, winner_id, \
     winning_bid, created_at, updated_at";

const BID_COLUMNS: &str = "id, auction_id, user_id, asset_id, amount, status, created_at";

fn auction_from_row(row: &PgRow) -> Result<Auction, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Auction {
        id: row.try_get("id")?,
        asset_id: row.try_get("asset_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        reserve_price: row.try_get("reserve_price")?,
        starting_price: row.try_get("starting_price")?,
        min_bid_increment: row.try_get("min_bid_increment")?,
        current_highest_bid: row.try_get("current_highest_bid")?,
        current_highest_bidder_id: row.try_get("current_highest_bidder_id")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        extension_seconds: row.try_get("extension_seconds")?,
        extension_count: row.try_get("extension_count")?,
        max_extensions: row.try_get("max_extensions")?,
        bid_count: row.try_get("bid_count")?,
        winner_id: row.try_get("winner_id")?,
        winning_bid: row.try_get("winning_bid")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bid_from_row(row: &PgRow) -> Result<Bid, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Bid {
        id: row.try_get("id")?,
        auction_id: row.try_get("auction_id")?,
        user_id: row.try_get("user_id")?,
        asset_id: row.try_get("asset_id")?,
        amount: row.try_get("amount")?,
        status: status
            .parse::<BidStatus>()
            .map_err(StoreError::Corrupt)?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn lock_auction(&mut self, auction_id: Uuid) -> Result<Option<Auction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM auctions WHERE id = $1 FOR UPDATE",
            AUCTION_COLUMNS
        ))
        .bind(auction_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(auction_from_row).transpose()
    }

    async fn insert_bid(&mut self, bid: &Bid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO bids (id, auction_id, user_id, asset_id, amount, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(bid.id)
        .bind(bid.auction_id)
        .bind(bid.user_id)
        .bind(bid.asset_id)
        .bind(bid.amount)
        .bind(bid.status.as_str())
        .bind(bid.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn apply_bid(
        &mut self,
        auction_id: Uuid,
        amount: Decimal,
        bidder_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE auctions SET current_highest_bid = $2, current_highest_bidder_id = $3, \
             bid_count = bid_count + 1, updated_at = $4 WHERE id = $1",
        )
        .bind(auction_id)
        .bind(amount)
        .bind(bidder_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_status(
        &mut self,
        auction_id: Uuid,
        status: AuctionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE auctions SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(auction_id)
            .bind(status.as_str())
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn extend_deadline(
        &mut self,
        auction_id: Uuid,
        new_ends_at: DateTime<Utc>,
        extension_count: i32,
        status: AuctionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE auctions SET ends_at = $2, extension_count = $3, status = $4, \
             updated_at = $5 WHERE id = $1",
        )
        .bind(auction_id)
        .bind(new_ends_at)
        .bind(extension_count)
        .bind(status.as_str())
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_settled(
        &mut self,
        auction_id: Uuid,
        winner: Option<(Uuid, Decimal)>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE auctions SET status = $2, winner_id = $3, winning_bid = $4, \
             updated_at = $5 WHERE id = $1",
        )
        .bind(auction_id)
        .bind(AuctionStatus::Settled.as_str())
        .bind(winner.map(|(user_id, _)| user_id))
        .bind(winner.map(|(_, amount)| amount))
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn latest_bid_for_user(
        &mut self,
        auction_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Bid>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM bids WHERE auction_id = $1 AND user_id = $2 \
             ORDER BY created_at DESC LIMIT 1",
            BID_COLUMNS
        ))
        .bind(auction_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(bid_from_row).transpose()
    }

    async fn max_stake_per_user(
        &mut self,
        auction_id: Uuid,
    ) -> Result<Vec<UserStake>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, MAX(amount) AS amount FROM bids \
             WHERE auction_id = $1 GROUP BY user_id",
        )
        .bind(auction_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(UserStake {
                    user_id: row.try_get("user_id")?,
                    amount: row.try_get("amount")?,
                })
            })
            .collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[async_trait]
impl AuctionStore for PgAuctionStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn create_auction(&self, auction: &Auction) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auctions (id, asset_id, title, description, reserve_price, \
             starting_price, min_bid_increment, current_highest_bid, \
             current_highest_bidder_id, status, starts_at, ends_at, extension_seconds, \
             extension_count, max_extensions, bid_count, winner_id, winning_bid, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
             $16, $17, $18, $19, $20)",
        )
        .bind(auction.id)
        .bind(auction.asset_id)
        .bind(&auction.title)
        .bind(&auction.description)
        .bind(auction.reserve_price)
        .bind(auction.starting_price)
        .bind(auction.min_bid_increment)
        .bind(auction.current_highest_bid)
        .bind(auction.current_highest_bidder_id)
        .bind(auction.status.as_str())
        .bind(auction.starts_at)
        .bind(auction.ends_at)
        .bind(auction.extension_seconds)
        .bind(auction.extension_count)
        .bind(auction.max_extensions)
        .bind(auction.bid_count)
        .bind(auction.winner_id)
        .bind(auction.winning_bid)
        .bind(auction.created_at)
        .bind(auction.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_auction(&self, auction_id: Uuid) -> Result<Option<Auction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM auctions WHERE id = $1",
            AUCTION_COLUMNS
        ))
        .bind(auction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(auction_from_row).transpose()
    }

    async fn list_by_status(
        &self,
        statuses: &[AuctionStatus],
    ) -> Result<Vec<Auction>, StoreError> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM auctions WHERE status = ANY($1) ORDER BY starts_at",
            AUCTION_COLUMNS
        ))
        .bind(names)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(auction_from_row).collect()
    }

    async fn bids_for_auction(&self, auction_id: Uuid) -> Result<Vec<Bid>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM bids WHERE auction_id = $1 ORDER BY created_at",
            BID_COLUMNS
        ))
        .bind(auction_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bid_from_row).collect()
    }

    async fn resumable_auctions(&self) -> Result<Vec<Auction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM auctions WHERE status NOT IN ('ended', 'cancelled', 'settled') \
             ORDER BY ends_at",
            AUCTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(auction_from_row).collect()
    }
}
