use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Transaction, Txid};

use crate::error::CoreError;
use crate::types::BlockHeight;

use super::{ChainBackend, ChainTxStatus};

/// In-memory network for tests. Accepts or rejects submissions and reports
/// a configurable confirmation depth for everything it accepted.
pub struct MockChain {
    reject: AtomicBool,
    queries_fail: AtomicBool,
    default_confirmations: Mutex<u32>,
    confirmations: Mutex<HashMap<Txid, u32>>,
    submitted: Mutex<Vec<Transaction>>,
    known: Mutex<HashSet<Txid>>,
    queries: AtomicUsize,
}

impl MockChain {
    pub fn builder() -> MockChainBuilder {
        MockChainBuilder {
            reject: false,
            queries_fail: false,
            confirmations: 0,
        }
    }

    /// Confirmation depth reported from now on for every accepted tx
    /// without an explicit override.
    pub fn set_confirmations(&self, confirmations: u32) {
        *self.default_confirmations.lock().unwrap() = confirmations;
    }

    pub fn set_tx_confirmations(&self, txid: Txid, confirmations: u32) {
        self.confirmations.lock().unwrap().insert(txid, confirmations);
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn set_queries_fail(&self, fail: bool) {
        self.queries_fail.store(fail, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

pub struct MockChainBuilder {
    reject: bool,
    queries_fail: bool,
    confirmations: u32,
}

impl MockChainBuilder {
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn failing_queries(mut self) -> Self {
        self.queries_fail = true;
        self
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn build(self) -> MockChain {
        MockChain {
            reject: AtomicBool::new(self.reject),
            queries_fail: AtomicBool::new(self.queries_fail),
            default_confirmations: Mutex::new(self.confirmations),
            confirmations: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            known: Mutex::new(HashSet::new()),
            queries: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChainBackend for MockChain {
    async fn submit(&self, tx: &Transaction) -> Result<Txid, CoreError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(CoreError::BroadcastFailure("mock network rejected tx".into()));
        }
        let txid = tx.compute_txid();
        self.submitted.lock().unwrap().push(tx.clone());
        self.known.lock().unwrap().insert(txid);
        Ok(txid)
    }

    async fn query_status(&self, txid: &Txid) -> Result<ChainTxStatus, CoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.queries_fail.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("mock network unreachable".into()));
        }
        if !self.known.lock().unwrap().contains(txid) {
            return Err(CoreError::not_found("transaction", txid));
        }
        let confirmations = self
            .confirmations
            .lock()
            .unwrap()
            .get(txid)
            .copied()
            .unwrap_or(*self.default_confirmations.lock().unwrap());
        Ok(ChainTxStatus {
            confirmations,
            block_height: (confirmations > 0).then(|| BlockHeight(200u32.saturating_sub(confirmations))),
            block_hash: (confirmations > 0).then(|| BlockHash::from_byte_array([confirmations as u8; 32])),
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{absolute, transaction};

    use super::*;

    fn empty_tx(lock: u32) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::from_consensus(lock),
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    #[tokio::test]
    async fn accepted_transactions_become_queryable() {
        let chain = MockChain::builder().with_confirmations(3).build();
        let txid = chain.submit(&empty_tx(1)).await.unwrap();

        let status = chain.query_status(&txid).await.unwrap();
        assert_eq!(status.confirmations, 3);
        assert!(status.block_hash.is_some());
        assert_eq!(chain.submitted().len(), 1);
    }

    #[tokio::test]
    async fn unknown_and_rejected_transactions() {
        let chain = MockChain::builder().rejecting().build();
        assert!(matches!(
            chain.submit(&empty_tx(1)).await,
            Err(CoreError::BroadcastFailure(_))
        ));
        assert!(matches!(
            chain.query_status(&empty_tx(1).compute_txid()).await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn default_batch_query_keeps_per_item_results() {
        let chain = MockChain::builder().build();
        let known = chain.submit(&empty_tx(1)).await.unwrap();
        let unknown = empty_tx(2).compute_txid();

        let results = chain.query_statuses(&[known, unknown]).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
