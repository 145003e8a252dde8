//! Node Wiring
//!
//! One `AuctionNode` per process: constructs the buses, timer, services, and
//! gateway over an injected store, ledger, and authenticator, then runs the
//! node's background workers. Horizontal scaling is N nodes sharing the
//! store and the cross-node bus.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::bus::cross_node::BusError;
use crate::bus::{CrossNodeBus, EventBus};
use crate::gateway::cache::StateCache;
use crate::gateway::SessionGateway;
use crate::ledger::ReservationLedger;
use crate::services::auction::{AuctionError, AuctionService};
use crate::services::bid::BidService;
use crate::services::presence::PresenceTracker;
use crate::services::replay::ReplayBuffer;
use crate::services::timer::AuctionTimer;
use crate::settings::BidCoreSettings;
use crate::store::AuctionStore;

/// Fully wired auction core for one node
pub struct AuctionNode {
    origin: Uuid,
    bus: Arc<EventBus>,
    timer: Arc<AuctionTimer>,
    bids: Arc<BidService>,
    auctions: Arc<AuctionService>,
    gateway: Arc<SessionGateway>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AuctionNode {
    /// Wire the node. Pass `None` for the cross-node bus in single-node
    /// deployments and tests.
    pub fn new(
        settings: BidCoreSettings,
        store: Arc<dyn AuctionStore>,
        ledger: Arc<dyn ReservationLedger>,
        auth: Arc<dyn Authenticator>,
        cross_node: Option<Arc<CrossNodeBus>>,
    ) -> Arc<Self> {
        let origin = cross_node
            .as_ref()
            .map(|bus| bus.origin())
            .unwrap_or_else(Uuid::now_v7);
        let bus = Arc::new(EventBus::new());
        let timer = Arc::new(AuctionTimer::new(
            store.clone(),
            bus.clone(),
            settings.timer.clone(),
        ));
        let cache = Arc::new(StateCache::new(&settings.state_cache));
        let bids = Arc::new(BidService::new(
            store.clone(),
            ledger.clone(),
            timer.clone(),
            bus.clone(),
        ));
        let auctions = Arc::new(AuctionService::new(
            store.clone(),
            ledger,
            bus.clone(),
            timer.clone(),
            cache.clone(),
        ));
        let replay = Arc::new(ReplayBuffer::new(settings.replay.clone()));
        let gateway = Arc::new(SessionGateway::new(
            settings,
            store,
            bids.clone(),
            bus.clone(),
            cross_node,
            Arc::new(PresenceTracker::new()),
            replay,
            cache,
            auth,
        ));

        Arc::new(Self {
            origin,
            bus,
            timer,
            bids,
            auctions,
            gateway,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Connect the cross-node bus described by the settings, then wire the
    /// node around it.
    pub async fn connect(
        settings: BidCoreSettings,
        store: Arc<dyn AuctionStore>,
        ledger: Arc<dyn ReservationLedger>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Arc<Self>, BusError> {
        let origin = Uuid::now_v7();
        let (cross_node, reader) =
            CrossNodeBus::connect(&settings.cross_node_bus, origin).await?;
        let node = Self::new(settings, store, ledger, auth, Some(cross_node));
        node.workers.lock().push(reader);
        Ok(node)
    }

    /// Start background workers and recover timers for live auctions.
    pub async fn start(self: &Arc<Self>) -> Result<(), AuctionError> {
        let mut workers = self.workers.lock();
        workers.extend(self.gateway.attach());
        workers.push(self.auctions.spawn_settlement_worker());
        drop(workers);

        let resumed = self.auctions.resume_timers().await?;
        info!(origin = %self.origin, resumed, "auction node started");
        Ok(())
    }

    /// Serve WebSocket sessions until the listener fails.
    pub async fn run(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        self.gateway.clone().run(listener).await
    }

    /// Stop local timers and workers. Timers are rebuilt by `start` on the
    /// next boot.
    pub fn shutdown(&self) {
        self.timer.stop_all();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        info!(origin = %self.origin, "auction node stopped");
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn bids(&self) -> &Arc<BidService> {
        &self.bids
    }

    pub fn auctions(&self) -> &Arc<AuctionService> {
        &self.auctions
    }

    pub fn timer(&self) -> &Arc<AuctionTimer> {
        &self.timer
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn gateway(&self) -> &Arc<SessionGateway> {
        &self.gateway
    }
}
