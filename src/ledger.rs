//! Reservation Ledger
//!
//! External capability contract: earmark and release user funds atomically
//! with the bid transaction. Implementations join the store transaction
//! passed to every operation, so a bid row exists iff its reservation delta
//! committed (the deployment's real ledger joins a `PgStoreTx` through its
//! `connection()`; the in-memory ledger here backs tests and local
//! development by joining `MemoryStoreTx`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::store::memory::MemoryStoreTx;
use crate::store::StoreTx;

/// Ledger failures
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("available balance below requested reservation")]
    Insufficient,
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Tag for the reservation placed when a bid is accepted.
pub fn reserve_tag(auction_id: Uuid) -> String {
    format!("bid_reserve_auction_{}", auction_id)
}

/// Tag for releasing a user's own superseded bid.
pub fn superseded_tag(auction_id: Uuid) -> String {
    format!("bid_superseded_auction_{}", auction_id)
}

/// Tag for refunds on loss, no-sale, and cancellation.
pub fn refund_tag(auction_id: Uuid) -> String {
    format!("auction_{}_refund", auction_id)
}

/// Reserve-funds capability, joinable into a store transaction.
#[async_trait]
pub trait ReservationLedger: Send + Sync {
    /// The user's available (unreserved) balance as seen by this transaction.
    async fn available_balance(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
    ) -> Result<Decimal, LedgerError>;

    /// Earmark `amount` of the user's balance. Fails with
    /// [`LedgerError::Insufficient`] when available < amount.
    async fn reserve(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        amount: Decimal,
        tag: &str,
    ) -> Result<(), LedgerError>;

    /// Return an earmarked amount to the available balance. Never fails on
    /// already-released amounts (idempotent on the tag prefix).
    async fn release(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        amount: Decimal,
        tag: &str,
    ) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Account {
    available: Decimal,
    held: Decimal,
}

/// Recorded ledger operation, kept for auditing and test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCall {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub tag: String,
    pub kind: LedgerCallKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerCallKind {
    Reserve,
    Release,
}

#[derive(Default)]
pub(crate) struct LedgerState {
    accounts: RwLock<HashMap<Uuid, Account>>,
    calls: Mutex<Vec<LedgerCall>>,
}

enum LedgerOp {
    Reserve {
        user_id: Uuid,
        amount: Decimal,
        tag: String,
    },
    Release {
        user_id: Uuid,
        amount: Decimal,
        tag: String,
    },
}

/// Ledger deltas buffered inside one store transaction; applied on commit,
/// dropped on rollback.
pub(crate) struct LedgerJoin {
    state: Arc<LedgerState>,
    ops: Vec<LedgerOp>,
}

impl LedgerJoin {
    fn new(state: Arc<LedgerState>) -> Self {
        Self {
            state,
            ops: Vec::new(),
        }
    }

    /// Net pending delta against the user's available balance in this tx.
    fn pending_available_delta(&self, user_id: Uuid) -> Decimal {
        let mut delta = Decimal::ZERO;
        for op in &self.ops {
            match op {
                LedgerOp::Reserve { user_id: u, amount, .. } if *u == user_id => {
                    delta -= *amount;
                }
                LedgerOp::Release { user_id: u, amount, .. } if *u == user_id => {
                    delta += *amount;
                }
                _ => {}
            }
        }
        delta
    }

    pub(crate) fn apply(self) {
        let mut accounts = self.state.accounts.write();
        let mut calls = self.state.calls.lock();
        for op in self.ops {
            match op {
                LedgerOp::Reserve {
                    user_id,
                    amount,
                    tag,
                } => {
                    let account = accounts.entry(user_id).or_default();
                    account.available -= amount;
                    account.held += amount;
                    calls.push(LedgerCall {
                        user_id,
                        amount,
                        tag,
                        kind: LedgerCallKind::Reserve,
                    });
                }
                LedgerOp::Release {
                    user_id,
                    amount,
                    tag,
                } => {
                    let account = accounts.entry(user_id).or_default();
                    // Releasing more than is held is a no-op past zero.
                    let returned = amount.min(account.held);
                    account.held -= returned;
                    account.available += returned;
                    calls.push(LedgerCall {
                        user_id,
                        amount,
                        tag,
                        kind: LedgerCallKind::Release,
                    });
                }
            }
        }
    }
}

/// In-memory ledger for tests and local development
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit available funds to a user (setup helper).
    pub fn credit(&self, user_id: Uuid, amount: Decimal) {
        self.state
            .accounts
            .write()
            .entry(user_id)
            .or_default()
            .available += amount;
    }

    /// Committed available balance.
    pub fn available(&self, user_id: Uuid) -> Decimal {
        self.state
            .accounts
            .read()
            .get(&user_id)
            .map(|a| a.available)
            .unwrap_or_default()
    }

    /// Committed held (reserved) total.
    pub fn held(&self, user_id: Uuid) -> Decimal {
        self.state
            .accounts
            .read()
            .get(&user_id)
            .map(|a| a.held)
            .unwrap_or_default()
    }

    /// Committed operation log, oldest first.
    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state.calls.lock().clone()
    }

    fn join<'a>(&self, tx: &'a mut dyn StoreTx) -> Result<&'a mut LedgerJoin, LedgerError> {
        let mem = tx
            .as_any_mut()
            .downcast_mut::<MemoryStoreTx>()
            .ok_or_else(|| {
                LedgerError::Unavailable(
                    "memory ledger requires an in-memory store transaction".to_string(),
                )
            })?;
        Ok(mem
            .ledger
            .get_or_insert_with(|| LedgerJoin::new(self.state.clone())))
    }
}

#[async_trait]
impl ReservationLedger for MemoryLedger {
    async fn available_balance(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
    ) -> Result<Decimal, LedgerError> {
        let committed = self.available(user_id);
        let join = self.join(tx)?;
        Ok(committed + join.pending_available_delta(user_id))
    }

    async fn reserve(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        amount: Decimal,
        tag: &str,
    ) -> Result<(), LedgerError> {
        let committed = self.available(user_id);
        let join = self.join(tx)?;
        if committed + join.pending_available_delta(user_id) < amount {
            return Err(LedgerError::Insufficient);
        }
        join.ops.push(LedgerOp::Reserve {
            user_id,
            amount,
            tag: tag.to_string(),
        });
        Ok(())
    }

    async fn release(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        amount: Decimal,
        tag: &str,
    ) -> Result<(), LedgerError> {
        let join = self.join(tx)?;
        join.ops.push(LedgerOp::Release {
            user_id,
            amount,
            tag: tag.to_string(),
        });
        Ok(())
    }
}
