//! Domain types for Allot's execution pipeline.
//!
//! Contains the identifiers (`UserId`, `PlanId`, `BlockHeight`), the
//! collaborator-facing records (`Utxo`, `Plan`, `TxRecord`, `Position`,
//! `Portfolio`), the monitoring records (`ConfirmationStatus`,
//! `MonitoringEntry`) and the saga bookkeeping (`ExecutionRecord`,
//! `AuditEntry`).

use bitcoin::{Amount, BlockHash, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

// ==============================================================================
// Identifiers
// ==============================================================================

/// Identity of a fund owner, as issued by the external identity service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Identity of an investment plan issued by the strategy provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(UserId);
string_id!(PlanId);

/// A Bitcoin block height, wrapped for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHeight(pub u32);

impl From<u32> for BlockHeight {
    fn from(h: u32) -> Self {
        Self(h)
    }
}

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    u64::try_from(OffsetDateTime::now_utc().unix_timestamp()).unwrap_or(0)
}

// ==============================================================================
// Funds and Plans
// ==============================================================================

/// A spendable fund fragment tracked by the external ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
    /// Owning address, unchecked; validated against the active network
    /// before it is used for signing.
    pub address: String,
    pub confirmations: u32,
    pub spent: bool,
    pub spending_txid: Option<Txid>,
}

impl Utxo {
    /// A UTXO is selectable only while unspent and sufficiently confirmed.
    pub fn is_spendable(&self, min_confirmations: u32) -> bool {
        !self.spent && self.confirmations >= min_confirmations
    }
}

/// One slice of a plan: send `amount` to the deposit address of `venue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub venue: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Approved,
    Executed,
    Rejected,
}

/// An investment plan as returned by the strategy provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub owner: UserId,
    pub allocations: Vec<Allocation>,
    pub status: PlanStatus,
}

// ==============================================================================
// Ledger Records
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxRecordStatus {
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}

/// Transaction entry written to the external ledger's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub txid: Txid,
    pub plan_id: PlanId,
    /// Sum of the allocation outputs (change excluded).
    pub amount: Amount,
    pub fee: Amount,
    pub status: TxRecordStatus,
    pub recorded_at: u64,
    pub block_height: Option<BlockHeight>,
}

/// A venue holding resulting from a reconciled allocation.
///
/// Identified by `(user, venue, source_txid)`: each funding transaction owns
/// its own position, so holdings at one venue from different plans never
/// overwrite each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub user: UserId,
    pub venue: String,
    pub amount: Amount,
    /// Value at entry in the reference currency.
    pub entry_value: f64,
    pub current_value: f64,
    pub pnl: f64,
    /// Transaction that funded this position.
    pub source_txid: Txid,
}

impl Position {
    pub fn key(&self) -> (&str, Txid) {
        (&self.venue, self.source_txid)
    }

    /// The compensating form of a position: same key, zero holdings.
    /// Positions are zeroed instead of deleted so history survives.
    pub fn zeroed(&self) -> Self {
        Self {
            amount: Amount::ZERO,
            entry_value: 0.0,
            current_value: 0.0,
            pnl: 0.0,
            ..self.clone()
        }
    }
}

/// Portfolio view reported by the external ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub user: UserId,
    /// Balance the portfolio service believes the user holds on-chain.
    pub btc_balance: Amount,
    pub positions: Vec<Position>,
    pub total_value: f64,
}

// ==============================================================================
// Confirmation Monitoring
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Pending,
    Confirmed,
    Failed,
}

/// Network state of a broadcast transaction, as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationStatus {
    pub txid: Txid,
    pub confirmations: u32,
    pub block_height: Option<BlockHeight>,
    pub block_hash: Option<BlockHash>,
    pub state: TxState,
    pub last_checked: u64,
}

impl ConfirmationStatus {
    pub fn unconfirmed(txid: Txid, now: u64) -> Self {
        Self {
            txid,
            confirmations: 0,
            block_height: None,
            block_hash: None,
            state: TxState::Pending,
            last_checked: now,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TxState::Confirmed
    }

    /// Confirmed and failed statuses no longer change.
    pub fn is_final(&self) -> bool {
        self.state != TxState::Pending
    }
}

/// Links a broadcast transaction to its owner and plan while it is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringEntry {
    pub txid: Txid,
    pub user: UserId,
    pub plan_id: PlanId,
    pub broadcast_at: u64,
    pub target_confirmations: u32,
}

// ==============================================================================
// Saga Bookkeeping
// ==============================================================================

/// Per-execution state machine:
/// `Built -> Signed -> Broadcast -> {Confirmed | Failed} -> {Reconciled | RolledBack}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Built,
    Signed,
    Broadcast,
    Confirmed,
    Failed,
    Reconciled,
    RolledBack,
}

impl ExecutionStage {
    /// Broadcast but not yet settled one way or the other.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Broadcast | Self::Confirmed)
    }

    /// Blocks another execution of the same plan.
    pub fn blocks_reexecution(self) -> bool {
        matches!(self, Self::Broadcast | Self::Confirmed | Self::Reconciled)
    }
}

impl std::fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Built => "built",
            Self::Signed => "signed",
            Self::Broadcast => "broadcast",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Reconciled => "reconciled",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// Side effects applied to external state on behalf of one transaction.
/// Rollback reverses exactly these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedEffects {
    pub positions: Vec<Position>,
    pub spent_outpoints: Vec<OutPoint>,
}

impl AppliedEffects {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.spent_outpoints.is_empty()
    }
}

/// Everything needed to reconcile or compensate one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub txid: Txid,
    pub plan_id: PlanId,
    pub owner: UserId,
    pub stage: ExecutionStage,
    pub allocations: Vec<Allocation>,
    /// Outpoints consumed by the transaction, in input order.
    pub inputs: Vec<OutPoint>,
    pub total_output: Amount,
    pub fee: Amount,
    pub created_at: u64,
    pub applied: AppliedEffects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    BroadcastFailed,
    PartialReconciliation,
    ReconciliationFailed,
    RolledBack,
    Cancelled,
    BookkeepingFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339 UTC timestamp.
    pub at: String,
    pub kind: AuditKind,
    pub plan_id: PlanId,
    pub txid: Option<Txid>,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        plan_id: PlanId,
        txid: Option<Txid>,
        detail: impl Into<String>,
    ) -> Self {
        let at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| unix_now().to_string());
        Self {
            at,
            kind,
            plan_id,
            txid,
            detail: detail.into(),
        }
    }
}

// ==============================================================================
// Consistency Reports
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub is_consistent: bool,
    pub inconsistencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
}
