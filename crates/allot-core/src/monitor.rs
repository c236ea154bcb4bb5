//! Broadcast and confirmation monitoring.
//!
//! The monitor submits signed transactions and tracks their confirmation
//! depth in the [`StateStore`]. Status reads are served from the cache while
//! fresh; a failed refresh falls back to the last known status instead of
//! erroring.

use std::sync::Arc;

use bitcoin::{Transaction, Txid};

use crate::chain::{ChainBackend, ChainTxStatus};
use crate::error::CoreError;
use crate::store::StateStore;
use crate::types::{unix_now, ConfirmationStatus, MonitoringEntry, PlanId, TxState, UserId};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Depth at which a transaction counts as confirmed.
    pub required_confirmations: u32,
    /// Cached statuses younger than this are served without a network call.
    pub staleness_secs: u64,
    /// Confirmed entries older than this are dropped by [`Monitor::cleanup`].
    pub retention_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            required_confirmations: 6,
            staleness_secs: 60,
            retention_secs: 24 * 60 * 60,
        }
    }
}

pub struct Monitor {
    chain: Arc<dyn ChainBackend>,
    store: Arc<StateStore>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(chain: Arc<dyn ChainBackend>, store: Arc<StateStore>, config: MonitorConfig) -> Self {
        Self {
            chain,
            store,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Submit `tx` and start tracking it. Nothing is registered unless the
    /// network accepted it.
    pub async fn broadcast(
        &self,
        tx: &Transaction,
        owner: &UserId,
        plan_id: &PlanId,
    ) -> Result<Txid, CoreError> {
        self.broadcast_at(tx, owner, plan_id, unix_now()).await
    }

    pub(crate) async fn broadcast_at(
        &self,
        tx: &Transaction,
        owner: &UserId,
        plan_id: &PlanId,
        now: u64,
    ) -> Result<Txid, CoreError> {
        if let Some(index) = tx
            .input
            .iter()
            .position(|input| input.script_sig.is_empty() && input.witness.is_empty())
        {
            return Err(CoreError::BroadcastFailure(format!(
                "input {index} is unsigned; refusing to broadcast"
            )));
        }

        let txid = self.chain.submit(tx).await.map_err(|e| match e {
            CoreError::BroadcastFailure(_) => e,
            other => CoreError::BroadcastFailure(other.to_string()),
        })?;

        self.store
            .insert_monitoring(MonitoringEntry {
                txid,
                user: owner.clone(),
                plan_id: plan_id.clone(),
                broadcast_at: now,
                target_confirmations: self.config.required_confirmations,
            })
            .await;
        self.store
            .put_status(ConfirmationStatus::unconfirmed(txid, now))
            .await;

        tracing::info!(%txid, %owner, %plan_id, "broadcast transaction");
        Ok(txid)
    }

    /// Current status of a broadcast transaction.
    pub async fn get_status(&self, txid: &Txid) -> Result<ConfirmationStatus, CoreError> {
        self.get_status_at(txid, unix_now()).await
    }

    pub(crate) async fn get_status_at(
        &self,
        txid: &Txid,
        now: u64,
    ) -> Result<ConfirmationStatus, CoreError> {
        let cached = self
            .store
            .status(txid)
            .await
            .ok_or_else(|| CoreError::not_found("transaction", txid))?;
        if cached.is_final() || now.saturating_sub(cached.last_checked) < self.config.staleness_secs
        {
            return Ok(cached);
        }

        match self.chain.query_status(txid).await {
            Ok(chain_status) => Ok(self.record(cached, chain_status, now).await),
            Err(e) => {
                tracing::warn!(%txid, error = %e, "status refresh failed; serving cached status");
                Ok(cached)
            }
        }
    }

    /// Refresh every monitored, still pending transaction and return the
    /// status of all monitored transactions, ordered by txid.
    pub async fn poll_all(&self) -> Vec<ConfirmationStatus> {
        self.poll_all_at(unix_now()).await
    }

    pub(crate) async fn poll_all_at(&self, now: u64) -> Vec<ConfirmationStatus> {
        let mut settled = Vec::new();
        let mut pending = Vec::new();
        for entry in self.store.monitoring_entries().await {
            let cached = match self.store.status(&entry.txid).await {
                Some(status) => status,
                None => ConfirmationStatus::unconfirmed(entry.txid, entry.broadcast_at),
            };
            if cached.is_final() {
                settled.push(cached);
            } else {
                pending.push(cached);
            }
        }

        let txids: Vec<Txid> = pending.iter().map(|s| s.txid).collect();
        let results = self.chain.query_statuses(&txids).await;
        for (cached, result) in pending.into_iter().zip(results) {
            let status = match result {
                Ok(chain_status) => self.record(cached, chain_status, now).await,
                Err(e) => {
                    tracing::warn!(txid = %cached.txid, error = %e, "status refresh failed during poll");
                    cached
                }
            };
            settled.push(status);
        }

        settled.sort_by_key(|s| s.txid);
        tracing::debug!(monitored = settled.len(), "polled transaction statuses");
        settled
    }

    /// True once the transaction has the required depth.
    pub async fn is_confirmed(&self, txid: &Txid) -> bool {
        self.is_confirmed_at(txid, unix_now()).await
    }

    pub(crate) async fn is_confirmed_at(&self, txid: &Txid, now: u64) -> bool {
        self.get_status_at(txid, now)
            .await
            .map(|s| s.confirmations >= self.config.required_confirmations)
            .unwrap_or(false)
    }

    /// Drop monitoring entries older than the retention window whose
    /// transaction is confirmed. Unconfirmed entries stay until they confirm
    /// or are cancelled, and so do confirmed entries whose execution is not
    /// yet reconciled or rolled back: polling walks the monitoring entries,
    /// so dropping one would leave its execution stuck. Returns the number
    /// of entries removed.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(unix_now()).await
    }

    pub(crate) async fn cleanup_at(&self, now: u64) -> usize {
        let mut removed = 0;
        for entry in self.store.monitoring_entries().await {
            if now.saturating_sub(entry.broadcast_at) <= self.config.retention_secs {
                continue;
            }
            let confirmed = self
                .store
                .status(&entry.txid)
                .await
                .is_some_and(|s| s.is_confirmed());
            if !confirmed {
                continue;
            }
            let unsettled = self
                .store
                .execution(&entry.txid)
                .await
                .is_some_and(|r| r.stage.is_pending());
            if unsettled {
                tracing::debug!(txid = %entry.txid, "keeping confirmed entry until its execution settles");
                continue;
            }
            if self.store.remove_monitoring(&entry.txid).await.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "cleaned up confirmed monitoring entries");
        }
        removed
    }

    /// Stop tracking `txid` and mark it failed locally. Has no effect on the
    /// network. Returns whether the transaction was being monitored.
    pub async fn cancel(&self, txid: &Txid) -> bool {
        let was_monitored = self.store.remove_monitoring(txid).await.is_some();
        let now = unix_now();
        let mut status = self
            .store
            .status(txid)
            .await
            .unwrap_or_else(|| ConfirmationStatus::unconfirmed(*txid, now));
        if status.is_confirmed() {
            tracing::warn!(%txid, "cancelled a transaction that already confirmed");
        } else {
            status.state = TxState::Failed;
            status.last_checked = now;
            self.store.put_status(status).await;
        }
        tracing::info!(%txid, was_monitored, "cancelled monitoring");
        was_monitored
    }

    async fn record(
        &self,
        cached: ConfirmationStatus,
        chain_status: ChainTxStatus,
        now: u64,
    ) -> ConfirmationStatus {
        let state = if chain_status.confirmations >= self.config.required_confirmations {
            TxState::Confirmed
        } else {
            TxState::Pending
        };
        let status = ConfirmationStatus {
            txid: cached.txid,
            confirmations: chain_status.confirmations,
            block_height: chain_status.block_height,
            block_hash: chain_status.block_hash,
            state,
            last_checked: now,
        };
        if status.is_confirmed() {
            tracing::info!(
                txid = %status.txid,
                confirmations = status.confirmations,
                block_height = ?status.block_height,
                "transaction confirmed"
            );
        }
        self.store.put_status(status.clone()).await;
        status
    }
}
