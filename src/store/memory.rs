//! In-Memory Auction Store
//!
//! Map-backed implementation of the store contract, used by the crate's
//! tests and for single-node development. Transactions buffer their writes
//! and hold a per-auction async mutex that stands in for the database row
//! lock, so bid placement serializes exactly as it does against Postgres.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::ledger::LedgerJoin;
use crate::models::auction::{Auction, AuctionStatus};
use crate::models::bid::Bid;

use super::{AuctionStore, StoreError, StoreTx, UserStake};

#[derive(Default)]
struct Inner {
    auctions: RwLock<HashMap<Uuid, Auction>>,
    bids: RwLock<HashMap<Uuid, Vec<Bid>>>,
    row_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// In-memory store
#[derive(Clone, Default)]
pub struct MemoryAuctionStore {
    inner: Arc<Inner>,
}

impl MemoryAuctionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

enum Write {
    InsertBid(Bid),
    ApplyBid {
        auction_id: Uuid,
        amount: Decimal,
        bidder_id: Uuid,
        now: DateTime<Utc>,
    },
    SetStatus {
        auction_id: Uuid,
        status: AuctionStatus,
        now: DateTime<Utc>,
    },
    ExtendDeadline {
        auction_id: Uuid,
        new_ends_at: DateTime<Utc>,
        extension_count: i32,
        status: AuctionStatus,
        now: DateTime<Utc>,
    },
    SetSettled {
        auction_id: Uuid,
        winner: Option<(Uuid, Decimal)>,
        now: DateTime<Utc>,
    },
}

/// Write-buffered transaction over the in-memory maps
pub struct MemoryStoreTx {
    inner: Arc<Inner>,
    guards: Vec<tokio::sync::OwnedMutexGuard<()>>,
    writes: Vec<Write>,
    pub(crate) ledger: Option<LedgerJoin>,
}

impl MemoryStoreTx {
    fn auction_exists(&self, auction_id: Uuid) -> Result<(), StoreError> {
        if self.inner.auctions.read().contains_key(&auction_id) {
            Ok(())
        } else {
            Err(StoreError::Misuse(format!(
                "write against unknown auction {}",
                auction_id
            )))
        }
    }
}

#[async_trait]
impl StoreTx for MemoryStoreTx {
    async fn lock_auction(&mut self, auction_id: Uuid) -> Result<Option<Auction>, StoreError> {
        let lock = {
            let mut locks = self.inner.row_locks.lock();
            locks
                .entry(auction_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        self.guards.push(guard);
        Ok(self.inner.auctions.read().get(&auction_id).cloned())
    }

    async fn insert_bid(&mut self, bid: &Bid) -> Result<(), StoreError> {
        self.auction_exists(bid.auction_id)?;
        self.writes.push(Write::InsertBid(bid.clone()));
        Ok(())
    }

    async fn apply_bid(
        &mut self,
        auction_id: Uuid,
        amount: Decimal,
        bidder_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.auction_exists(auction_id)?;
        self.writes.push(Write::ApplyBid {
            auction_id,
            amount,
            bidder_id,
            now,
        });
        Ok(())
    }

    async fn set_status(
        &mut self,
        auction_id: Uuid,
        status: AuctionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.auction_exists(auction_id)?;
        self.writes.push(Write::SetStatus {
            auction_id,
            status,
            now,
        });
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
        self.auction_exists(auction_id)?;
        self.writes.push(Write::ExtendDeadline {
            auction_id,
            new_ends_at,
            extension_count,
            status,
            now,
        });
        Ok(())
    }

    async fn set_settled(
        &mut self,
        auction_id: Uuid,
        winner: Option<(Uuid, Decimal)>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.auction_exists(auction_id)?;
        self.writes.push(Write::SetSettled {
            auction_id,
            winner,
            now,
        });
        Ok(())
    }

    async fn latest_bid_for_user(
        &mut self,
        auction_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Bid>, StoreError> {
        let bids = self.inner.bids.read();
        Ok(bids
            .get(&auction_id)
            .and_then(|list| list.iter().rev().find(|b| b.user_id == user_id))
            .cloned())
    }

    async fn max_stake_per_user(
        &mut self,
        auction_id: Uuid,
    ) -> Result<Vec<UserStake>, StoreError> {
        let bids = self.inner.bids.read();
        let mut stakes: HashMap<Uuid, Decimal> = HashMap::new();
        for bid in bids.get(&auction_id).into_iter().flatten() {
            let entry = stakes.entry(bid.user_id).or_insert(bid.amount);
            if bid.amount > *entry {
                *entry = bid.amount;
            }
        }
        Ok(stakes
            .into_iter()
            .map(|(user_id, amount)| UserStake { user_id, amount })
            .collect())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        {
            let mut auctions = self.inner.auctions.write();
            let mut bids = self.inner.bids.write();
            for write in self.writes.drain(..) {
                apply_write(&mut auctions, &mut bids, write);
            }
        }
        if let Some(join) = self.ledger.take() {
            join.apply();
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Buffered writes and ledger deltas are simply dropped.
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn apply_write(
    auctions: &mut HashMap<Uuid, Auction>,
    bids: &mut HashMap<Uuid, Vec<Bid>>,
    write: Write,
) {
    match write {
        Write::InsertBid(bid) => {
            bids.entry(bid.auction_id).or_default().push(bid);
        }
        Write::ApplyBid {
            auction_id,
            amount,
            bidder_id,
            now,
        } => {
            if let Some(auction) = auctions.get_mut(&auction_id) {
                auction.current_highest_bid = Some(amount);
                auction.current_highest_bidder_id = Some(bidder_id);
                auction.bid_count += 1;
                auction.updated_at = now;
            }
        }
        Write::SetStatus {
            auction_id,
            status,
            now,
        } => {
            if let Some(auction) = auctions.get_mut(&auction_id) {
                auction.status = status;
                auction.updated_at = now;
            }
        }
        Write::ExtendDeadline {
            auction_id,
            new_ends_at,
            extension_count,
            status,
            now,
        } => {
            if let Some(auction) = auctions.get_mut(&auction_id) {
                auction.ends_at = new_ends_at;
                auction.extension_count = extension_count;
                auction.status = status;
                auction.updated_at = now;
            }
        }
        Write::SetSettled {
            auction_id,
            winner,
            now,
        } => {
            if let Some(auction) = auctions.get_mut(&auction_id) {
                auction.status = AuctionStatus::Settled;
                auction.winner_id = winner.map(|(user_id, _)| user_id);
                auction.winning_bid = winner.map(|(_, amount)| amount);
                auction.updated_at = now;
            }
        }
    }
}

#[async_trait]
impl AuctionStore for MemoryAuctionStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryStoreTx {
            inner: self.inner.clone(),
            guards: Vec::new(),
            writes: Vec::new(),
            ledger: None,
        }))
    }

    async fn create_auction(&self, auction: &Auction) -> Result<(), StoreError> {
        self.inner
            .auctions
            .write()
            .insert(auction.id, auction.clone());
        Ok(())
    }

    async fn get_auction(&self, auction_id: Uuid) -> Result<Option<Auction>, StoreError> {
        Ok(self.inner.auctions.read().get(&auction_id).cloned())
    }

    async fn list_by_status(
        &self,
        statuses: &[AuctionStatus],
    ) -> Result<Vec<Auction>, StoreError> {
        Ok(self
            .inner
            .auctions
            .read()
            .values()
            .filter(|a| statuses.contains(&a.status))
            .cloned()
            .collect())
    }

    async fn bids_for_auction(&self, auction_id: Uuid) -> Result<Vec<Bid>, StoreError> {
        Ok(self
            .inner
            .bids
            .read()
            .get(&auction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn resumable_auctions(&self) -> Result<Vec<Auction>, StoreError> {
        Ok(self
            .inner
            .auctions
            .read()
            .values()
            .filter(|a| !a.status.is_terminal())
            .cloned()
            .collect())
    }
}
