//! Interfaces of the external collaborators the executor drives.
//!
//! Each call is an independent suspension point; implementations handle
//! their own transport and report failures as [`CoreError`].

use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Plan, PlanId, Portfolio, Position, TxRecord, UserId, Utxo};

/// Source of investment plans.
#[async_trait]
pub trait StrategyProvider: Send + Sync {
    /// Returns `CoreError::NotFound` for unknown plans.
    async fn get_plan(&self, plan_id: &PlanId) -> Result<Plan, CoreError>;
}

/// External UTXO ledger and portfolio view.
#[async_trait]
pub trait LedgerProvider: Send + Sync {
    async fn get_utxos(&self, user: &UserId) -> Result<Vec<Utxo>, CoreError>;

    async fn record_transaction(&self, user: &UserId, record: &TxRecord)
        -> Result<(), CoreError>;

    /// Create or replace the user's position identified by
    /// [`Position::key`]. Positions at the same venue funded by other
    /// transactions are left untouched.
    async fn update_position(&self, user: &UserId, position: &Position)
        -> Result<(), CoreError>;

    async fn mark_utxo_spent(&self, outpoint: &OutPoint, spending_txid: &Txid)
        -> Result<(), CoreError>;

    /// Compensating action for [`LedgerProvider::mark_utxo_spent`].
    async fn mark_utxo_unspent(&self, outpoint: &OutPoint) -> Result<(), CoreError>;

    async fn get_portfolio(&self, user: &UserId) -> Result<Portfolio, CoreError>;

    async fn get_transaction_history(&self, user: &UserId) -> Result<Vec<TxRecord>, CoreError>;
}

/// Reference price used to value new positions.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Value of one BTC in the reference currency.
    async fn btc_price(&self) -> Result<f64, CoreError>;
}

// ==============================================================================
// Notifications
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    ExecutionStarted { plan_id: PlanId, txid: Txid },
    ExecutionCompleted { plan_id: PlanId, txid: Txid, positions: usize },
    ExecutionFailed { plan_id: PlanId, reason: String },
    ExecutionCancelled { plan_id: PlanId, txid: Txid },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Best effort; delivery failures must not fail the execution.
    async fn notify(&self, user: &UserId, notification: Notification);
}

/// Notifier that only writes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user: &UserId, notification: Notification) {
        tracing::info!(%user, ?notification, "notification");
    }
}
