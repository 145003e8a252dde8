//! Auction Timer
//!
//! One logical timer per ACTIVE/ENDING auction, ticking at 1 Hz. Ticks drive
//! the countdown broadcast, the ENDING transition, and the ENDED write. The
//! anti-sniping extension lives here too, invoked by the bid service after
//! its transaction commits. A terminal status observed on a tick stops the
//! timer; explicit `stop` covers create/cancel races.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::models::auction::{AuctionStatus, Phase};
use crate::models::event::{AuctionEvent, EndedEvent, EndingEvent, ExtendedEvent, TickEvent};
use crate::settings::TimerSettings;
use crate::store::{AuctionStore, StoreError};

#[derive(Debug, PartialEq, Eq)]
enum TickFlow {
    Continue,
    Stop,
}

/// Per-auction countdown scheduler
pub struct AuctionTimer {
    store: Arc<dyn AuctionStore>,
    bus: Arc<EventBus>,
    settings: TimerSettings,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl AuctionTimer {
    pub fn new(store: Arc<dyn AuctionStore>, bus: Arc<EventBus>, settings: TimerSettings) -> Self {
        Self {
            store,
            bus,
            settings,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start the auction's timer task. A no-op when one is already running.
    pub fn start(self: &Arc<Self>, auction_id: Uuid) {
        let mut tasks = self.tasks.lock();
        if let Some(handle) = tasks.get(&auction_id) {
            if !handle.is_finished() {
                return;
            }
        }
        let timer = Arc::clone(self);
        let handle = tokio::spawn(async move { timer.run_loop(auction_id).await });
        tasks.insert(auction_id, handle);
        debug!(%auction_id, "auction timer started");
    }

    /// Abort the auction's timer task, if any.
    pub fn stop(&self, auction_id: Uuid) {
        if let Some(handle) = self.tasks.lock().remove(&auction_id) {
            handle.abort();
            debug!(%auction_id, "auction timer aborted");
        }
    }

    /// Abort every local timer (graceful node shutdown).
    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock();
        for (auction_id, handle) in tasks.drain() {
            handle.abort();
            debug!(%auction_id, "auction timer aborted");
        }
    }

    pub fn is_running(&self, auction_id: Uuid) -> bool {
        self.tasks
            .lock()
            .get(&auction_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    async fn run_loop(self: Arc<Self>, auction_id: Uuid) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.settings.tick_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match self.tick(auction_id).await {
                Ok(TickFlow::Continue) => {}
                Ok(TickFlow::Stop) => break,
                // The store hiccuping must not kill the countdown.
                Err(err) => {
                    warn!(%auction_id, error = %err, "timer tick failed, retrying next tick");
                }
            }
        }
        self.tasks.lock().remove(&auction_id);
        debug!(%auction_id, "auction timer stopped");
    }

    async fn tick(&self, auction_id: Uuid) -> Result<TickFlow, StoreError> {
        let Some(auction) = self.store.get_auction(auction_id).await? else {
            warn!(%auction_id, "timer running for unknown auction");
            return Ok(TickFlow::Stop);
        };
        if auction.status.is_terminal() {
            return Ok(TickFlow::Stop);
        }

        let now = Utc::now();
        let remaining_ms = auction.remaining_ms(now);
        if remaining_ms <= 0 {
            return self.finish(auction_id, now).await;
        }

        if remaining_ms <= self.settings.ending_threshold_ms
            && auction.status == AuctionStatus::Active
            && self.mark_ending(auction_id, now).await?
        {
            self.bus.publish(AuctionEvent::Ending(EndingEvent {
                auction_id,
                ends_at: auction.ends_at,
                remaining_ms,
            }));
        }

        let phase = if remaining_ms <= self.settings.ending_threshold_ms {
            Phase::Ending
        } else {
            Phase::Active
        };
        self.bus.publish(AuctionEvent::Tick(TickEvent {
            auction_id,
            remaining_ms,
            server_time: now,
            phase,
            extension_count: auction.extension_count,
        }));
        Ok(TickFlow::Continue)
    }

    /// Atomically move a past-due auction to ENDED and emit `auction.ended`.
    async fn finish(&self, auction_id: Uuid, now: DateTime<Utc>) -> Result<TickFlow, StoreError> {
        let mut tx = self.store.begin().await?;
        let Some(auction) = tx.lock_auction(auction_id).await? else {
            tx.rollback().await?;
            return Ok(TickFlow::Stop);
        };
        if auction.status.is_terminal() {
            tx.rollback().await?;
            return Ok(TickFlow::Stop);
        }
        // An anti-snipe extension may have pushed the deadline out between
        // the unlocked read and this lock.
        if auction.remaining_ms(now) > 0 {
            tx.rollback().await?;
            return Ok(TickFlow::Continue);
        }
        tx.set_status(auction_id, AuctionStatus::Ended, now).await?;
        tx.commit().await?;

        let event = EndedEvent::from_auction(&auction, now);
        info!(
            %auction_id,
            total_bids = event.total_bids,
            has_winner = event.winner_id.is_some(),
            "auction ended"
        );
        self.bus.publish(AuctionEvent::Ended(event));
        Ok(TickFlow::Stop)
    }

    /// ACTIVE → ENDING under the row lock; returns false when the window no
    /// longer applies by the time the lock is held.
    async fn mark_ending(&self, auction_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;
        let Some(auction) = tx.lock_auction(auction_id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        if auction.status != AuctionStatus::Active
            || auction.remaining_ms(now) > self.settings.ending_threshold_ms
        {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.set_status(auction_id, AuctionStatus::Ending, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Anti-sniping: a bid landed inside the extension window. Pushes
    /// `ends_at` out by the auction's extension duration, bumps the counter,
    /// and resets ENDING back to ACTIVE so a later tick can re-enter ENDING.
    /// Returns whether an extension occurred.
    pub async fn extend_if_anti_snipe(&self, auction_id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;
        let Some(auction) = tx.lock_auction(auction_id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };

        let now = Utc::now();
        let within_window = auction.remaining_ms(now) <= self.settings.anti_snipe_window_ms;
        if !auction.can_extend() || !within_window {
            tx.rollback().await?;
            return Ok(false);
        }

        let new_ends_at = auction.ends_at + chrono::Duration::seconds(auction.extension_seconds);
        let extension_count = auction.extension_count + 1;
        tx.extend_deadline(
            auction_id,
            new_ends_at,
            extension_count,
            AuctionStatus::Active,
            now,
        )
        .await?;
        tx.commit().await?;

        info!(
            %auction_id,
            extension_count,
            %new_ends_at,
            "anti-sniping extension applied"
        );
        self.bus.publish(AuctionEvent::Extended(ExtendedEvent {
            auction_id,
            new_ends_at,
            extension_count,
        }));
        Ok(true)
    }
}
