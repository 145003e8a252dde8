//! Bid Service
//!
//! Core bid placement: validate, reserve funds, record the bid, denormalize
//! the auction row, then (outside the transaction) run the anti-sniping
//! check and publish the internal event. All of it happens behind the
//! auction's exclusive row lock, which is the single serialization point for
//! bids on one auction.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::ledger::{self, LedgerError, ReservationLedger};
use crate::models::auction::Auction;
use crate::models::bid::Bid;
use crate::models::event::{AuctionEvent, BidPlacedEvent};
use crate::services::timer::AuctionTimer;
use crate::store::{AuctionStore, StoreError, StoreTx};

/// Bid rejection and failure taxonomy
#[derive(Debug, Error)]
pub enum BidError {
    #[error("bid amount must be greater than zero")]
    InvalidAmount,
    #[error("auction not found")]
    AuctionNotFound,
    #[error("auction is closed to bidding")]
    AuctionClosed,
    #[error("bid must be at least {min_required}")]
    IncrementTooLow { min_required: Decimal },
    #[error("insufficient available balance")]
    InsufficientBalance,
    #[error("reservation failed: {0}")]
    Reservation(#[source] LedgerError),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl From<LedgerError> for BidError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Insufficient => Self::InsufficientBalance,
            other => Self::Reservation(other),
        }
    }
}

impl BidError {
    /// Wire reason code sent back to the placing session.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::AuctionNotFound => "AUCTION_NOT_FOUND",
            Self::AuctionClosed => "AUCTION_CLOSED",
            Self::IncrementTooLow { .. } => "INCREMENT_TOO_LOW",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::Reservation(_) => "RESERVATION_FAILURE",
            Self::Store(_) => "STORE_UNAVAILABLE",
        }
    }

    /// Echoed minimum for increment rejections.
    pub fn min_required(&self) -> Option<Decimal> {
        match self {
            Self::IncrementTooLow { min_required } => Some(*min_required),
            _ => None,
        }
    }

    /// Whether the client may retry the identical bid.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Outcome of an accepted bid
#[derive(Debug, Clone)]
pub struct PlacedBid {
    pub bid: Bid,
    pub auction: Auction,
    pub was_extended: bool,
    pub new_min_bid: Decimal,
}

/// Bid placement service
pub struct BidService {
    store: Arc<dyn AuctionStore>,
    ledger: Arc<dyn ReservationLedger>,
    timer: Arc<AuctionTimer>,
    bus: Arc<EventBus>,
}

impl BidService {
    pub fn new(
        store: Arc<dyn AuctionStore>,
        ledger: Arc<dyn ReservationLedger>,
        timer: Arc<AuctionTimer>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            ledger,
            timer,
            bus,
        }
    }

    /// Place a bid. On success the auction row holds the new highest bid and
    /// the reservation committed atomically with the bid row.
    pub async fn place_bid(
        &self,
        user_id: Uuid,
        auction_id: Uuid,
        amount: Decimal,
        client_token: Option<String>,
    ) -> Result<PlacedBid, BidError> {
        if amount <= Decimal::ZERO {
            return Err(BidError::InvalidAmount);
        }

        let mut tx = self.store.begin().await?;
        let auction = match tx.lock_auction(auction_id).await? {
            Some(auction) => auction,
            None => return Err(reject(tx, BidError::AuctionNotFound).await),
        };

        let now = Utc::now();
        if !auction.accepts_bids_at(now) {
            return Err(reject(tx, BidError::AuctionClosed).await);
        }

        let min_required = auction.min_next_bid();
        if amount < min_required {
            return Err(reject(tx, BidError::IncrementTooLow { min_required }).await);
        }

        let available = match self.ledger.available_balance(tx.as_mut(), user_id).await {
            Ok(available) => available,
            Err(err) => return Err(reject(tx, err.into()).await),
        };
        if available < amount {
            return Err(reject(tx, BidError::InsufficientBalance).await);
        }

        if let Err(err) = self
            .ledger
            .reserve(
                tx.as_mut(),
                user_id,
                amount,
                &ledger::reserve_tag(auction_id),
            )
            .await
        {
            return Err(reject(tx, err.into()).await);
        }

        // The new reservation is already in place, so releasing the user's
        // previous stake can never drive the balance negative.
        if let Some(previous) = tx.latest_bid_for_user(auction_id, user_id).await? {
            if let Err(err) = self
                .ledger
                .release(
                    tx.as_mut(),
                    user_id,
                    previous.amount,
                    &ledger::superseded_tag(auction_id),
                )
                .await
            {
                return Err(reject(tx, err.into()).await);
            }
        }

        let bid = Bid::new(&auction, user_id, amount, now);
        tx.insert_bid(&bid).await?;
        tx.apply_bid(auction_id, amount, user_id, now).await?;
        tx.commit().await?;

        // Outside the committed transaction: the extension is atomic on its
        // own row and must not hold the bid lock open.
        let was_extended = match self.timer.extend_if_anti_snipe(auction_id).await {
            Ok(extended) => extended,
            Err(err) => {
                warn!(%auction_id, error = %err, "anti-snipe check failed after commit");
                false
            }
        };

        let auction = match self.store.get_auction(auction_id).await {
            Ok(Some(fresh)) => fresh,
            _ => {
                // Fall back to a locally updated copy for the event payload.
                let mut stale = auction;
                stale.current_highest_bid = Some(amount);
                stale.current_highest_bidder_id = Some(user_id);
                stale.bid_count += 1;
                stale.updated_at = now;
                stale
            }
        };
        let new_min_bid = auction.min_next_bid();

        info!(
            %auction_id,
            bid_id = %bid.id,
            %amount,
            was_extended,
            "bid accepted"
        );

        let placed = PlacedBid {
            bid,
            auction,
            was_extended,
            new_min_bid,
        };
        self.bus.publish(AuctionEvent::BidPlaced(BidPlacedEvent {
            bid: placed.bid.clone(),
            auction: placed.auction.clone(),
            was_extended,
            new_min_bid,
            client_token,
        }));
        Ok(placed)
    }
}

/// Roll the transaction back and surface the rejection.
async fn reject(tx: Box<dyn StoreTx>, err: BidError) -> BidError {
    if let Err(rollback_err) = tx.rollback().await {
        warn!(error = %rollback_err, "rollback failed after bid rejection");
    }
    err
}
