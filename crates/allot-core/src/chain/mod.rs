//! Network abstraction for submitting transactions and reading their
//! confirmation depth.
//!
//! Defines the [`ChainBackend`] trait and provides a Bitcoin Core JSON-RPC
//! implementation ([`RpcChainBackend`]) plus a test mock (`mock::MockChain`).

mod http_adapter;
#[cfg(test)]
pub mod mock;

pub use http_adapter::RpcChainBackend;

use async_trait::async_trait;
use bitcoin::{BlockHash, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::BlockHeight;

/// What the network currently knows about one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTxStatus {
    /// 0 while in the mempool.
    pub confirmations: u32,
    pub block_height: Option<BlockHeight>,
    pub block_hash: Option<BlockHash>,
}

#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Relay a fully signed transaction. Returns its txid on acceptance and
    /// `CoreError::BroadcastFailure` when the network rejects it.
    async fn submit(&self, tx: &Transaction) -> Result<Txid, CoreError>;

    /// Returns `CoreError::NotFound` if the network does not know `txid`.
    async fn query_status(&self, txid: &Txid) -> Result<ChainTxStatus, CoreError>;

    /// Query many transactions. Results are aligned with `txids`; one failed
    /// lookup does not fail the others. Implementations may batch.
    async fn query_statuses(&self, txids: &[Txid]) -> Vec<Result<ChainTxStatus, CoreError>> {
        let mut results = Vec::with_capacity(txids.len());
        for txid in txids {
            results.push(self.query_status(txid).await);
        }
        results
    }
}
