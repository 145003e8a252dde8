//! BidCore Data Models
//!
//! Domain entities for the auction core:
//! - Auctions: time-bounded competitions with anti-sniping state
//! - Bids: accepted commitments backed by ledger reservations
//! - Events: lifecycle payloads carried by the in-process bus

pub mod auction;
pub mod bid;
pub mod event;

// Re-export core types
pub use auction::*;
pub use bid::*;
pub use event::*;
