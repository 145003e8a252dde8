//! BidCore - Real-Time Auction & Bidding Core
//!
//! The auction subsystem of a trading platform:
//! - Bid placement with strict per-auction serialization and atomic fund
//!   reservations
//! - Per-auction wall-clock timers with anti-sniping extension
//! - Live fan-out to sessions with replay catch-up for reconnects
//! - At-most-once settlement with compensating reservation release
//! - Horizontal scaling over a Redis-backed cross-node bus
//!
//! # Architecture
//!
//! The crate follows a layered architecture:
//! - **Models**: Auction, bid, and lifecycle event entities
//! - **Store**: Durable persistence with exclusive row locks (Postgres, plus
//!   an in-memory backing for tests and local development)
//! - **Services**: Business logic (bids, lifecycle, timers, presence, replay)
//! - **Buses**: In-process topic bus and cross-node Redis pub/sub
//! - **Gateway**: WebSocket push interface for sessions

pub mod auth;
pub mod bus;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod node;
pub mod services;
pub mod settings;
pub mod store;

pub use node::AuctionNode;
pub use settings::BidCoreSettings;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use auth::{AuthError, Authenticator, StaticTokenAuthenticator};
pub use bus::{CrossNodeBus, Envelope, EventBus};
pub use gateway::SessionGateway;
pub use ledger::{LedgerError, MemoryLedger, ReservationLedger};
pub use models::auction::{Auction, AuctionStatus, NewAuction, Phase};
pub use models::bid::{Bid, BidStatus};
pub use models::event::{AuctionEvent, Topic};
pub use services::auction::{AuctionError, AuctionService};
pub use services::bid::{BidError, BidService, PlacedBid};
pub use services::presence::PresenceTracker;
pub use services::replay::ReplayBuffer;
pub use services::timer::AuctionTimer;
pub use store::{AuctionStore, MemoryAuctionStore, PgAuctionStore, StoreError};
