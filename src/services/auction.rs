//! Auction Service
//!
//! Lifecycle operations (create, start, cancel, settle), startup timer
//! recovery, and the settlement worker. Settlement is idempotent: once an
//! auction is SETTLED or CANCELLED, further calls return the existing state
//! without touching the ledger again.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::gateway::cache::StateCache;
use crate::ledger::{self, LedgerError, ReservationLedger};
use crate::models::auction::{Auction, AuctionStatus, NewAuction};
use crate::models::event::{AuctionEvent, EndedEvent, Topic};
use crate::services::timer::AuctionTimer;
use crate::store::{AuctionStore, StoreError};

/// Lifecycle failures
#[derive(Debug, Error)]
pub enum AuctionError {
    #[error("auction not found")]
    NotFound,
    #[error("invalid auction: {0}")]
    Invalid(String),
    #[error("cannot transition from {from} to {to}")]
    InvalidTransition {
        from: AuctionStatus,
        to: AuctionStatus,
    },
    #[error("reservation release failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Auction lifecycle service
pub struct AuctionService {
    store: Arc<dyn AuctionStore>,
    ledger: Arc<dyn ReservationLedger>,
    bus: Arc<EventBus>,
    timer: Arc<AuctionTimer>,
    cache: Arc<StateCache>,
}

impl AuctionService {
    pub fn new(
        store: Arc<dyn AuctionStore>,
        ledger: Arc<dyn ReservationLedger>,
        bus: Arc<EventBus>,
        timer: Arc<AuctionTimer>,
        cache: Arc<StateCache>,
    ) -> Self {
        Self {
            store,
            ledger,
            bus,
            timer,
            cache,
        }
    }

    fn validate(new: &NewAuction) -> Result<(), AuctionError> {
        if new.starting_price <= Decimal::ZERO {
            return Err(AuctionError::Invalid(
                "starting price must be positive".to_string(),
            ));
        }
        if new.min_bid_increment <= Decimal::ZERO {
            return Err(AuctionError::Invalid(
                "minimum bid increment must be positive".to_string(),
            ));
        }
        if new.reserve_price < Decimal::ZERO {
            return Err(AuctionError::Invalid(
                "reserve price cannot be negative".to_string(),
            ));
        }
        if new.ends_at <= new.starts_at {
            return Err(AuctionError::Invalid(
                "ends_at must be after starts_at".to_string(),
            ));
        }
        if new.extension_seconds < 0 || new.max_extensions < 0 {
            return Err(AuctionError::Invalid(
                "anti-sniping parameters cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Create an auction; it starts immediately when `starts_at` has passed.
    pub async fn create_auction(&self, new: NewAuction) -> Result<Auction, AuctionError> {
        Self::validate(&new)?;
        let auction = new.into_auction(Utc::now());
        self.store.create_auction(&auction).await?;
        if auction.status == AuctionStatus::Active {
            self.timer.start(auction.id);
        }
        info!(
            auction_id = %auction.id,
            status = %auction.status,
            ends_at = %auction.ends_at,
            "auction created"
        );
        Ok(auction)
    }

    /// SCHEDULED → ACTIVE and start the countdown.
    pub async fn start_auction(&self, auction_id: Uuid) -> Result<Auction, AuctionError> {
        let mut tx = self.store.begin().await?;
        let Some(auction) = tx.lock_auction(auction_id).await? else {
            tx.rollback().await?;
            return Err(AuctionError::NotFound);
        };
        if auction.status != AuctionStatus::Scheduled {
            tx.rollback().await?;
            return Err(AuctionError::InvalidTransition {
                from: auction.status,
                to: AuctionStatus::Active,
            });
        }
        let now = Utc::now();
        tx.set_status(auction_id, AuctionStatus::Active, now).await?;
        tx.commit().await?;

        self.timer.start(auction_id);
        info!(%auction_id, "auction started");

        let mut started = auction;
        started.status = AuctionStatus::Active;
        started.updated_at = now;
        Ok(started)
    }

    /// Cancel a non-terminal auction and refund every bidder's stake.
    pub async fn cancel_auction(&self, auction_id: Uuid) -> Result<Auction, AuctionError> {
        let mut tx = self.store.begin().await?;
        let Some(auction) = tx.lock_auction(auction_id).await? else {
            tx.rollback().await?;
            return Err(AuctionError::NotFound);
        };
        if auction.status.is_terminal() {
            tx.rollback().await?;
            return Err(AuctionError::InvalidTransition {
                from: auction.status,
                to: AuctionStatus::Cancelled,
            });
        }

        let now = Utc::now();
        let stakes = tx.max_stake_per_user(auction_id).await?;
        for stake in &stakes {
            self.ledger
                .release(
                    tx.as_mut(),
                    stake.user_id,
                    stake.amount,
                    &ledger::refund_tag(auction_id),
                )
                .await?;
        }
        tx.set_status(auction_id, AuctionStatus::Cancelled, now).await?;
        tx.commit().await?;

        self.timer.stop(auction_id);
        self.cache.invalidate(auction_id);
        info!(%auction_id, refunds = stakes.len(), "auction cancelled");

        let mut cancelled = auction;
        cancelled.status = AuctionStatus::Cancelled;
        cancelled.updated_at = now;
        Ok(cancelled)
    }

    /// ENDED → SETTLED. Picks the winner when the reserve is met, refunds all
    /// non-winning bidders at their maximum stake, and is safe to retry.
    pub async fn settle_auction(&self, auction_id: Uuid) -> Result<Auction, AuctionError> {
        let mut tx = self.store.begin().await?;
        let Some(auction) = tx.lock_auction(auction_id).await? else {
            tx.rollback().await?;
            return Err(AuctionError::NotFound);
        };
        match auction.status {
            // Idempotent: repeated settlement returns the existing state.
            AuctionStatus::Settled | AuctionStatus::Cancelled => {
                tx.rollback().await?;
                return Ok(auction);
            }
            AuctionStatus::Ended => {}
            other => {
                tx.rollback().await?;
                return Err(AuctionError::InvalidTransition {
                    from: other,
                    to: AuctionStatus::Settled,
                });
            }
        }

        let now = Utc::now();
        let winner = match (auction.current_highest_bidder_id, auction.current_highest_bid) {
            (Some(user_id), Some(amount)) if auction.reserve_met() => Some((user_id, amount)),
            _ => None,
        };

        // Refund every non-winning bidder their maximum stake. On a ledger
        // failure the transaction drops, the auction stays ENDED, and an
        // external retry re-runs the whole settlement.
        let stakes = tx.max_stake_per_user(auction_id).await?;
        for stake in &stakes {
            if winner.map(|(user_id, _)| user_id) == Some(stake.user_id) {
                continue;
            }
            self.ledger
                .release(
                    tx.as_mut(),
                    stake.user_id,
                    stake.amount,
                    &ledger::refund_tag(auction_id),
                )
                .await?;
        }
        tx.set_settled(auction_id, winner, now).await?;
        tx.commit().await?;

        self.timer.stop(auction_id);
        self.cache.invalidate(auction_id);
        match winner {
            Some((user_id, amount)) => {
                info!(%auction_id, winner_id = %user_id, winning_bid = %amount, "auction settled");
            }
            None => {
                info!(%auction_id, reserve_met = auction.reserve_met(), "auction settled with no winner");
            }
        }

        let mut settled = auction;
        settled.status = AuctionStatus::Settled;
        settled.winner_id = winner.map(|(user_id, _)| user_id);
        settled.winning_bid = winner.map(|(_, amount)| amount);
        settled.updated_at = now;
        Ok(settled)
    }

    /// Startup recovery: restart timers for live auctions, close out any that
    /// passed their deadline while the node was down.
    pub async fn resume_timers(&self) -> Result<usize, AuctionError> {
        let auctions = self.store.resumable_auctions().await?;
        let now = Utc::now();
        let mut started = 0;
        for auction in auctions {
            if auction.ends_at > now {
                self.timer.start(auction.id);
                started += 1;
                continue;
            }

            let mut tx = self.store.begin().await?;
            let Some(row) = tx.lock_auction(auction.id).await? else {
                tx.rollback().await?;
                continue;
            };
            if row.status.is_terminal() {
                tx.rollback().await?;
                continue;
            }
            tx.set_status(auction.id, AuctionStatus::Ended, now).await?;
            tx.commit().await?;
            warn!(auction_id = %auction.id, "auction passed its deadline while offline");
            self.bus
                .publish(AuctionEvent::Ended(EndedEvent::from_auction(&row, now)));
        }
        info!(started, "auction timers resumed");
        Ok(started)
    }

    /// Settle auctions as their `auction.ended` events arrive. Settlement
    /// runs here, off the timer's tick path.
    pub fn spawn_settlement_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut rx = self.bus.subscribe(Topic::Ended);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let auction_id = event.auction_id();
                        if let Err(err) = service.settle_auction(auction_id).await {
                            // Left ENDED; idempotence makes the external
                            // retry safe.
                            error!(%auction_id, error = %err, "settlement failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "settlement worker lagged behind ended events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerCallKind, MemoryLedger};
    use crate::services::bid::BidService;
    use crate::settings::{StateCacheSettings, TimerSettings};
    use crate::store::MemoryAuctionStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<MemoryAuctionStore>,
        ledger: Arc<MemoryLedger>,
        bus: Arc<EventBus>,
        timer: Arc<AuctionTimer>,
        bids: BidService,
        service: Arc<AuctionService>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryAuctionStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let bus = Arc::new(EventBus::new());
        let timer = Arc::new(AuctionTimer::new(
            store.clone() as Arc<dyn AuctionStore>,
            bus.clone(),
            TimerSettings::default(),
        ));
        let cache = Arc::new(StateCache::new(&StateCacheSettings::default()));
        let bids = BidService::new(
            store.clone() as Arc<dyn AuctionStore>,
            ledger.clone() as Arc<dyn ReservationLedger>,
            timer.clone(),
            bus.clone(),
        );
        let service = Arc::new(AuctionService::new(
            store.clone() as Arc<dyn AuctionStore>,
            ledger.clone() as Arc<dyn ReservationLedger>,
            bus.clone(),
            timer.clone(),
            cache,
        ));
        Harness {
            store,
            ledger,
            bus,
            timer,
            bids,
            service,
        }
    }

    fn new_auction(reserve: Decimal) -> NewAuction {
        let now = Utc::now();
        NewAuction {
            asset_id: Uuid::now_v7(),
            title: "Lot".to_string(),
            description: None,
            reserve_price: reserve,
            starting_price: dec!(100),
            min_bid_increment: dec!(10),
            starts_at: now - Duration::minutes(1),
            ends_at: now + Duration::hours(1),
            extension_seconds: 30,
            max_extensions: 3,
        }
    }

    async fn mark_ended(h: &Harness, auction_id: Uuid) {
        let mut tx = h.store.begin().await.unwrap();
        tx.lock_auction(auction_id).await.unwrap();
        tx.set_status(auction_id, AuctionStatus::Ended, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    fn funded_user(h: &Harness, amount: Decimal) -> Uuid {
        let user = Uuid::now_v7();
        h.ledger.credit(user, amount);
        user
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = harness();
        let mut invalid = new_auction(dec!(0));
        invalid.starting_price = dec!(0);
        assert!(matches!(
            h.service.create_auction(invalid).await,
            Err(AuctionError::Invalid(_))
        ));

        let mut invalid = new_auction(dec!(0));
        invalid.ends_at = invalid.starts_at;
        assert!(matches!(
            h.service.create_auction(invalid).await,
            Err(AuctionError::Invalid(_))
        ));

        let mut invalid = new_auction(dec!(0));
        invalid.reserve_price = dec!(-1);
        assert!(matches!(
            h.service.create_auction(invalid).await,
            Err(AuctionError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_create_active_starts_timer() {
        let h = harness();
        let auction = h.service.create_auction(new_auction(dec!(0))).await.unwrap();
        assert_eq!(auction.status, AuctionStatus::Active);
        assert!(h.timer.is_running(auction.id));
    }

    #[tokio::test]
    async fn test_start_from_scheduled_only() {
        let h = harness();
        let mut new = new_auction(dec!(0));
        new.starts_at = Utc::now() + Duration::hours(1);
        new.ends_at = Utc::now() + Duration::hours(2);
        let auction = h.service.create_auction(new).await.unwrap();
        assert_eq!(auction.status, AuctionStatus::Scheduled);
        assert!(!h.timer.is_running(auction.id));

        let started = h.service.start_auction(auction.id).await.unwrap();
        assert_eq!(started.status, AuctionStatus::Active);
        assert!(h.timer.is_running(auction.id));

        // Starting twice is an invalid transition.
        assert!(matches!(
            h.service.start_auction(auction.id).await,
            Err(AuctionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_settle_reserve_not_met_releases_everyone() {
        let h = harness();
        let auction = h
            .service
            .create_auction(new_auction(dec!(500)))
            .await
            .unwrap();
        let bidder = funded_user(&h, dec!(1_000));
        h.bids
            .place_bid(bidder, auction.id, dec!(300), None)
            .await
            .unwrap();
        mark_ended(&h, auction.id).await;

        let settled = h.service.settle_auction(auction.id).await.unwrap();
        assert_eq!(settled.status, AuctionStatus::Settled);
        assert_eq!(settled.winner_id, None);
        assert_eq!(settled.winning_bid, None);

        // Every reservation was released.
        assert_eq!(h.ledger.held(bidder), dec!(0));
        assert_eq!(h.ledger.available(bidder), dec!(1_000));
    }

    #[tokio::test]
    async fn test_settle_refunds_losers_once_at_max_stake() {
        let h = harness();
        let auction = h.service.create_auction(new_auction(dec!(0))).await.unwrap();
        let alice = funded_user(&h, dec!(1_000));
        let bob = funded_user(&h, dec!(1_000));
        let carol = funded_user(&h, dec!(1_000));

        h.bids.place_bid(alice, auction.id, dec!(100), None).await.unwrap();
        h.bids.place_bid(bob, auction.id, dec!(110), None).await.unwrap();
        h.bids.place_bid(carol, auction.id, dec!(120), None).await.unwrap();
        mark_ended(&h, auction.id).await;

        let settled = h.service.settle_auction(auction.id).await.unwrap();
        assert_eq!(settled.winner_id, Some(carol));
        assert_eq!(settled.winning_bid, Some(dec!(120)));

        // Winner's reservation stays put; losers are made whole.
        assert_eq!(h.ledger.held(carol), dec!(120));
        assert_eq!(h.ledger.held(alice), dec!(0));
        assert_eq!(h.ledger.held(bob), dec!(0));

        let refund_tag = format!("auction_{}_refund", auction.id);
        let refunds: Vec<_> = h
            .ledger
            .calls()
            .into_iter()
            .filter(|c| c.kind == LedgerCallKind::Release && c.tag == refund_tag)
            .collect();
        assert_eq!(refunds.len(), 2);
        assert!(refunds
            .iter()
            .any(|c| c.user_id == alice && c.amount == dec!(100)));
        assert!(refunds
            .iter()
            .any(|c| c.user_id == bob && c.amount == dec!(110)));
    }

    #[tokio::test]
    async fn test_settlement_is_idempotent() {
        let h = harness();
        let auction = h.service.create_auction(new_auction(dec!(0))).await.unwrap();
        let bidder = funded_user(&h, dec!(1_000));
        h.bids
            .place_bid(bidder, auction.id, dec!(100), None)
            .await
            .unwrap();
        mark_ended(&h, auction.id).await;

        let first = h.service.settle_auction(auction.id).await.unwrap();
        let calls_after_first = h.ledger.calls().len();

        let second = h.service.settle_auction(auction.id).await.unwrap();
        assert_eq!(second.status, first.status);
        assert_eq!(second.winner_id, first.winner_id);
        assert_eq!(second.winning_bid, first.winning_bid);
        // No further ledger activity on the retry.
        assert_eq!(h.ledger.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn test_settle_rejects_live_auction() {
        let h = harness();
        let auction = h.service.create_auction(new_auction(dec!(0))).await.unwrap();
        assert!(matches!(
            h.service.settle_auction(auction.id).await,
            Err(AuctionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_refunds_all_bidders() {
        let h = harness();
        let auction = h.service.create_auction(new_auction(dec!(0))).await.unwrap();
        let alice = funded_user(&h, dec!(1_000));
        let bob = funded_user(&h, dec!(1_000));
        h.bids.place_bid(alice, auction.id, dec!(100), None).await.unwrap();
        h.bids.place_bid(bob, auction.id, dec!(110), None).await.unwrap();
        h.bids.place_bid(alice, auction.id, dec!(120), None).await.unwrap();

        let cancelled = h.service.cancel_auction(auction.id).await.unwrap();
        assert_eq!(cancelled.status, AuctionStatus::Cancelled);
        assert!(!h.timer.is_running(auction.id));

        // Each user recovers their maximum stake.
        assert_eq!(h.ledger.held(alice), dec!(0));
        assert_eq!(h.ledger.held(bob), dec!(0));
        assert_eq!(h.ledger.available(alice), dec!(1_000));
        assert_eq!(h.ledger.available(bob), dec!(1_000));

        // Terminal: a second cancel is rejected.
        assert!(matches!(
            h.service.cancel_auction(auction.id).await,
            Err(AuctionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_timers_recovers_and_closes_out() {
        let h = harness();
        // Live auction: timer restarts.
        let live = h.service.create_auction(new_auction(dec!(0))).await.unwrap();
        h.timer.stop(live.id);

        // Past-due auction: closed out directly.
        let mut overdue = new_auction(dec!(0));
        overdue.starts_at = Utc::now() - Duration::hours(2);
        overdue.ends_at = Utc::now() - Duration::hours(1);
        let now = Utc::now() - Duration::hours(3);
        let overdue = {
            let mut auction = overdue.into_auction(now);
            auction.status = AuctionStatus::Active;
            h.store.create_auction(&auction).await.unwrap();
            auction
        };

        let mut ended_rx = h.bus.subscribe(Topic::Ended);
        let started = h.service.resume_timers().await.unwrap();
        assert_eq!(started, 1);
        assert!(h.timer.is_running(live.id));

        let stored = h.store.get_auction(overdue.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AuctionStatus::Ended);
        assert_eq!(ended_rx.recv().await.unwrap().auction_id(), overdue.id);
    }

    #[tokio::test]
    async fn test_settlement_worker_settles_on_ended_event() {
        let h = harness();
        let auction = h.service.create_auction(new_auction(dec!(0))).await.unwrap();
        let bidder = funded_user(&h, dec!(1_000));
        h.bids
            .place_bid(bidder, auction.id, dec!(100), None)
            .await
            .unwrap();

        let worker = h.service.spawn_settlement_worker();
        mark_ended(&h, auction.id).await;
        let stored = h.store.get_auction(auction.id).await.unwrap().unwrap();
        h.bus
            .publish(AuctionEvent::Ended(EndedEvent::from_auction(
                &stored,
                Utc::now(),
            )));

        // The worker settles asynchronously; poll briefly.
        let mut settled = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let auction = h.store.get_auction(auction.id).await.unwrap().unwrap();
            if auction.status == AuctionStatus::Settled {
                settled = true;
                break;
            }
        }
        worker.abort();
        assert!(settled, "worker did not settle the auction in time");
    }
}
