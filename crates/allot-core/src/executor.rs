//! Execution orchestrator.
//!
//! Drives a plan through build → sign → broadcast, reconciles confirmed
//! transactions into the external ledger and compensates on failure. Each
//! transaction moves through
//! `Built → Signed → Broadcast → {Confirmed | Failed} → {Reconciled | RolledBack}`;
//! only the stages from `Signed` on are persisted because the txid is not
//! final before signing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use bitcoin::{Address, Amount, OutPoint, Txid};

use crate::builder::{build_transaction, BuildParams, BuiltTransaction, VenueBook};
use crate::error::CoreError;
use crate::monitor::Monitor;
use crate::services::{LedgerProvider, Notification, Notifier, PriceFeed, StrategyProvider};
use crate::signing::SigningService;
use crate::store::StateStore;
use crate::types::{
    unix_now, AppliedEffects, AuditEntry, AuditKind, BlockHeight, ConfirmationStatus,
    ConsistencyReport, ExecutionRecord, ExecutionStage, PlanId, PlanStatus, Position,
    TxRecord, TxRecordStatus, UserId, ValidationReport,
};

#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub build: BuildParams,
}

/// Everything the executor depends on, constructed once and injected.
pub struct Services {
    pub strategy: Arc<dyn StrategyProvider>,
    pub ledger: Arc<dyn LedgerProvider>,
    pub prices: Arc<dyn PriceFeed>,
    pub notifier: Arc<dyn Notifier>,
    pub signer: Arc<SigningService>,
    pub monitor: Arc<Monitor>,
    pub store: Arc<StateStore>,
    pub venues: VenueBook,
}

pub struct Executor {
    services: Services,
    config: ExecutorConfig,
    /// Plans with an `execute_plan` or `cancel_execution` call in flight.
    active: Mutex<HashSet<PlanId>>,
}

/// Holds a plan's slot in `active` until dropped.
struct PlanGuard<'a> {
    active: &'a Mutex<HashSet<PlanId>>,
    plan_id: PlanId,
}

impl Drop for PlanGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.plan_id);
    }
}

impl Executor {
    pub fn new(services: Services, config: ExecutorConfig) -> Self {
        Self {
            services,
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    fn claim(&self, plan_id: &PlanId) -> Result<PlanGuard<'_>, CoreError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(plan_id.clone()) {
            return Err(CoreError::ExecutionConflict(format!(
                "plan {plan_id} is already being processed"
            )));
        }
        Ok(PlanGuard {
            active: &self.active,
            plan_id: plan_id.clone(),
        })
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Build, sign and broadcast the transaction funding `plan_id`.
    pub async fn execute_plan(
        &self,
        caller: &UserId,
        plan_id: &PlanId,
    ) -> Result<Vec<Txid>, CoreError> {
        let _guard = self.claim(plan_id)?;

        if let Some(blocking) = self
            .services
            .store
            .executions_for_plan(plan_id)
            .await
            .into_iter()
            .find(|r| r.stage.blocks_reexecution())
        {
            return Err(CoreError::ExecutionConflict(format!(
                "plan {plan_id} already has transaction {} in stage {}",
                blocking.txid, blocking.stage
            )));
        }

        let plan = self.services.strategy.get_plan(plan_id).await?;
        match plan.status {
            PlanStatus::Approved => {}
            PlanStatus::Executed => {
                return Err(CoreError::ExecutionConflict(format!(
                    "plan {plan_id} has already been executed"
                )));
            }
            other => {
                return Err(CoreError::InputValidation(format!(
                    "plan {plan_id} is {other:?}, only approved plans execute"
                )));
            }
        }
        if caller != &plan.owner {
            return Err(CoreError::Unauthorized(format!(
                "{caller} may not execute plan {plan_id} owned by {}",
                plan.owner
            )));
        }

        let network = self.config.build.network;
        let destinations = self.services.venues.resolve(&plan.allocations, network)?;

        let reserved = self.services.store.reserved_outpoints(&plan.owner).await;
        let candidates: Vec<_> = self
            .services
            .ledger
            .get_utxos(&plan.owner)
            .await?
            .into_iter()
            .filter(|u| !reserved.contains(&u.outpoint))
            .collect();
        let change_address: Address = self.services.signer.deposit_address(&plan.owner).await?;

        let built = build_transaction(&candidates, &destinations, &change_address, &self.config.build)
            .inspect_err(|e| tracing::info!(%plan_id, error = %e, "build failed"))?;
        tracing::info!(
            %plan_id,
            stage = %ExecutionStage::Built,
            inputs = built.tx.input.len(),
            fee = %built.fee,
            "execution stage"
        );

        let signed = match self
            .services
            .signer
            .sign_transaction(caller, &plan.owner, &built)
            .await
        {
            Ok(signed) => signed,
            Err(e) => {
                self.notify_failed(&plan.owner, plan_id, &e).await;
                return Err(e);
            }
        };
        let mut record = ExecutionRecord {
            txid: signed.compute_txid(),
            plan_id: plan_id.clone(),
            owner: plan.owner.clone(),
            stage: ExecutionStage::Signed,
            allocations: plan.allocations.clone(),
            inputs: built.tx.input.iter().map(|i| i.previous_output).collect(),
            total_output: built.total_output,
            fee: built.fee,
            created_at: unix_now(),
            applied: AppliedEffects::default(),
        };
        tracing::info!(%plan_id, txid = %record.txid, stage = %record.stage, "execution stage");

        match self
            .services
            .monitor
            .broadcast(&signed, &plan.owner, plan_id)
            .await
        {
            Ok(txid) => {
                record.stage = ExecutionStage::Broadcast;
                self.services.store.insert_execution(record).await;
                self.record_in_ledger(&plan.owner, plan_id, txid, &built, TxRecordStatus::Pending)
                    .await;
                self.services
                    .notifier
                    .notify(
                        &plan.owner,
                        Notification::ExecutionStarted {
                            plan_id: plan_id.clone(),
                            txid,
                        },
                    )
                    .await;
                tracing::info!(%plan_id, %txid, stage = %ExecutionStage::Broadcast, "execution stage");
                self.checkpoint().await;
                Ok(vec![txid])
            }
            Err(e) => {
                let txid = record.txid;
                record.stage = ExecutionStage::Failed;
                self.services.store.insert_execution(record).await;
                self.record_in_ledger(&plan.owner, plan_id, txid, &built, TxRecordStatus::Failed)
                    .await;
                self.services
                    .store
                    .push_audit(AuditEntry::new(
                        AuditKind::BroadcastFailed,
                        plan_id.clone(),
                        Some(txid),
                        e.to_string(),
                    ))
                    .await;
                if let Err(rollback_err) = self.rollback(&txid).await {
                    tracing::error!(%txid, error = %rollback_err, "rollback after failed broadcast failed");
                }
                self.notify_failed(&plan.owner, plan_id, &e).await;
                self.checkpoint().await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Status, Cancel, Poll
    // ========================================================================

    pub async fn get_tx_status(&self, txid: &Txid) -> Result<ConfirmationStatus, CoreError> {
        self.services.monitor.get_status(txid).await
    }

    /// Abandon the plan's broadcast-but-unconfirmed transactions locally and
    /// compensate. The network is not affected.
    pub async fn cancel_execution(&self, plan_id: &PlanId) -> Result<bool, CoreError> {
        let _guard = self.claim(plan_id)?;

        let executions = self.services.store.executions_for_plan(plan_id).await;
        let cancellable: Vec<ExecutionRecord> = executions
            .iter()
            .filter(|r| r.stage == ExecutionStage::Broadcast)
            .cloned()
            .collect();
        if cancellable.is_empty() {
            if let Some(confirmed) = executions
                .iter()
                .find(|r| r.stage == ExecutionStage::Confirmed)
            {
                return Err(CoreError::ExecutionConflict(format!(
                    "transaction {} of plan {plan_id} already confirmed",
                    confirmed.txid
                )));
            }
            return Err(CoreError::NothingToCancel(plan_id.to_string()));
        }

        for record in cancellable {
            let txid = record.txid;
            self.services.monitor.cancel(&txid).await;
            if let Err(e) = self
                .services
                .ledger
                .record_transaction(
                    &record.owner,
                    &tx_record(&record, TxRecordStatus::Cancelled, None),
                )
                .await
            {
                self.bookkeeping_failed(plan_id, txid, "record cancelled transaction", &e)
                    .await;
            }
            self.services
                .store
                .push_audit(AuditEntry::new(
                    AuditKind::Cancelled,
                    plan_id.clone(),
                    Some(txid),
                    "execution cancelled; transaction may still confirm on the network",
                ))
                .await;
            self.rollback(&txid).await?;
            self.services
                .notifier
                .notify(
                    &record.owner,
                    Notification::ExecutionCancelled {
                        plan_id: plan_id.clone(),
                        txid,
                    },
                )
                .await;
        }

        self.checkpoint().await;
        Ok(true)
    }

    /// Refresh all monitored transactions and reconcile any that reached the
    /// required depth. Reconciliation failures are audited, not returned.
    pub async fn poll_transaction_statuses(
        &self,
    ) -> Result<Vec<(Txid, ConfirmationStatus)>, CoreError> {
        let statuses = self.services.monitor.poll_all().await;

        for status in statuses.iter().filter(|s| s.is_confirmed()) {
            let Some(record) = self.services.store.execution(&status.txid).await else {
                continue;
            };
            if !record.stage.is_pending() {
                continue;
            }
            if record.stage == ExecutionStage::Broadcast {
                self.services
                    .store
                    .update_execution(&record.txid, |r| r.stage = ExecutionStage::Confirmed)
                    .await;
                tracing::info!(
                    plan_id = %record.plan_id,
                    txid = %record.txid,
                    stage = %ExecutionStage::Confirmed,
                    "execution stage"
                );
            }
            if let Err(e) = self.reconcile(&record.txid, status.block_height).await {
                tracing::warn!(txid = %record.txid, error = %e, "reconciliation deferred");
                self.services
                    .store
                    .push_audit(AuditEntry::new(
                        AuditKind::ReconciliationFailed,
                        record.plan_id.clone(),
                        Some(record.txid),
                        format!("will retry on next poll: {e}"),
                    ))
                    .await;
            }
        }

        self.checkpoint().await;
        Ok(statuses.into_iter().map(|s| (s.txid, s)).collect())
    }

    /// Drop old confirmed monitoring entries.
    pub async fn cleanup(&self) -> usize {
        let removed = self.services.monitor.cleanup().await;
        if removed > 0 {
            self.checkpoint().await;
        }
        removed
    }

    // ========================================================================
    // Reconciliation and Compensation
    // ========================================================================

    /// Write a confirmed transaction into the ledger: history entry, one
    /// position per allocation, spent UTXOs.
    ///
    /// Returns `Err` only when reconciliation could not start (no price);
    /// the caller retries on the next poll.
    async fn reconcile(&self, txid: &Txid, block_height: Option<BlockHeight>) -> Result<(), CoreError> {
        let record = self
            .services
            .store
            .execution(txid)
            .await
            .ok_or_else(|| CoreError::not_found("execution", txid))?;
        let price = self.services.prices.btc_price().await?;
        let ledger = &self.services.ledger;
        let plan_id = &record.plan_id;

        if let Err(e) = ledger
            .record_transaction(
                &record.owner,
                &tx_record(&record, TxRecordStatus::Confirmed, block_height),
            )
            .await
        {
            self.bookkeeping_failed(plan_id, *txid, "record confirmed transaction", &e)
                .await;
        }

        // Positions applied by an interrupted earlier attempt are kept.
        let mut created = record.applied.positions.clone();
        let mut failed = Vec::new();
        for allocation in &record.allocations {
            if created.iter().any(|p| p.venue == allocation.venue) {
                continue;
            }
            let value = allocation.amount.to_btc() * price;
            let position = Position {
                user: record.owner.clone(),
                venue: allocation.venue.clone(),
                amount: allocation.amount,
                entry_value: value,
                current_value: value,
                pnl: 0.0,
                source_txid: *txid,
            };
            match ledger.update_position(&record.owner, &position).await {
                Ok(()) => {
                    self.services
                        .store
                        .update_execution(txid, |r| r.applied.positions.push(position.clone()))
                        .await;
                    created.push(position);
                }
                Err(e) => failed.push(format!("{}: {e}", allocation.venue)),
            }
        }

        if created.is_empty() {
            tracing::warn!(%plan_id, %txid, "no position could be created; rolling back");
            self.services
                .store
                .push_audit(AuditEntry::new(
                    AuditKind::ReconciliationFailed,
                    plan_id.clone(),
                    Some(*txid),
                    failed.join("; "),
                ))
                .await;
            self.services
                .store
                .update_execution(txid, |r| r.stage = ExecutionStage::Failed)
                .await;
            self.rollback(txid).await?;
            self.services
                .notifier
                .notify(
                    &record.owner,
                    Notification::ExecutionFailed {
                        plan_id: plan_id.clone(),
                        reason: "reconciliation failed for every allocation".into(),
                    },
                )
                .await;
            return Ok(());
        }

        for outpoint in &record.inputs {
            match ledger.mark_utxo_spent(outpoint, txid).await {
                Ok(()) => {
                    self.services
                        .store
                        .update_execution(txid, |r| r.applied.spent_outpoints.push(*outpoint))
                        .await;
                }
                Err(e) => {
                    self.bookkeeping_failed(plan_id, *txid, &format!("mark {outpoint} spent"), &e)
                        .await;
                }
            }
        }

        if !failed.is_empty() {
            tracing::warn!(
                %plan_id,
                %txid,
                created = created.len(),
                failed = failed.len(),
                "partial reconciliation"
            );
            self.services
                .store
                .push_audit(AuditEntry::new(
                    AuditKind::PartialReconciliation,
                    plan_id.clone(),
                    Some(*txid),
                    failed.join("; "),
                ))
                .await;
        }

        self.services
            .store
            .update_execution(txid, |r| r.stage = ExecutionStage::Reconciled)
            .await;
        tracing::info!(
            %plan_id,
            %txid,
            positions = created.len(),
            stage = %ExecutionStage::Reconciled,
            "execution stage"
        );
        self.services
            .notifier
            .notify(
                &record.owner,
                Notification::ExecutionCompleted {
                    plan_id: plan_id.clone(),
                    txid: *txid,
                    positions: created.len(),
                },
            )
            .await;
        Ok(())
    }

    /// Reverse the side effects recorded for `txid`: zero its positions and
    /// unmark its UTXOs. Steps that fail stay recorded for a later retry.
    pub async fn rollback(&self, txid: &Txid) -> Result<(), CoreError> {
        let record = self
            .services
            .store
            .execution(txid)
            .await
            .ok_or_else(|| CoreError::not_found("execution", txid))?;
        let ledger = &self.services.ledger;

        let mut remaining = AppliedEffects::default();
        let mut reverted_positions = 0usize;
        for position in &record.applied.positions {
            match ledger.update_position(&record.owner, &position.zeroed()).await {
                Ok(()) => reverted_positions += 1,
                Err(e) => {
                    self.bookkeeping_failed(
                        &record.plan_id,
                        *txid,
                        &format!("zero position at {}", position.venue),
                        &e,
                    )
                    .await;
                    remaining.positions.push(position.clone());
                }
            }
        }
        let mut reverted_outpoints = 0usize;
        for outpoint in &record.applied.spent_outpoints {
            match ledger.mark_utxo_unspent(outpoint).await {
                Ok(()) => reverted_outpoints += 1,
                Err(e) => {
                    self.bookkeeping_failed(&record.plan_id, *txid, &format!("unmark {outpoint}"), &e)
                        .await;
                    remaining.spent_outpoints.push(*outpoint);
                }
            }
        }

        let complete = remaining.is_empty();
        self.services
            .store
            .update_execution(txid, |r| {
                r.applied = remaining;
                r.stage = ExecutionStage::RolledBack;
            })
            .await;
        self.services
            .store
            .push_audit(AuditEntry::new(
                AuditKind::RolledBack,
                record.plan_id.clone(),
                Some(*txid),
                format!(
                    "zeroed {reverted_positions} positions, unmarked {reverted_outpoints} utxos{}",
                    if complete { "" } else { "; some steps failed" }
                ),
            ))
            .await;
        tracing::info!(
            plan_id = %record.plan_id,
            %txid,
            reverted_positions,
            reverted_outpoints,
            complete,
            stage = %ExecutionStage::RolledBack,
            "execution stage"
        );
        Ok(())
    }

    // ========================================================================
    // Consistency Checks
    // ========================================================================

    /// Compare the ledger's confirmed UTXO balance with the portfolio's
    /// reported balance and look for positions or spent marks left behind by
    /// rolled-back executions. Read-only.
    pub async fn check_portfolio_state_consistency(
        &self,
        user: &UserId,
    ) -> Result<ConsistencyReport, CoreError> {
        let min_confirmations = self.config.build.min_confirmations;
        let utxos = self.services.ledger.get_utxos(user).await?;
        let portfolio = self.services.ledger.get_portfolio(user).await?;

        let mut inconsistencies = Vec::new();
        let utxo_balance = utxos
            .iter()
            .filter(|u| u.is_spendable(min_confirmations))
            .try_fold(Amount::ZERO, |acc, u| acc.checked_add(u.amount));
        match utxo_balance {
            Some(balance) if balance != portfolio.btc_balance => inconsistencies.push(format!(
                "ledger holds {balance} in confirmed utxos but portfolio reports {}",
                portfolio.btc_balance
            )),
            Some(_) => {}
            None => inconsistencies.push("utxo balance overflows".into()),
        }

        let executions: HashMap<Txid, ExecutionStage> = self
            .services
            .store
            .executions_for_user(user)
            .await
            .into_iter()
            .map(|r| (r.txid, r.stage))
            .collect();
        let rolled_back = |txid: &Txid| executions.get(txid) == Some(&ExecutionStage::RolledBack);

        for position in &portfolio.positions {
            if position.amount > Amount::ZERO && rolled_back(&position.source_txid) {
                inconsistencies.push(format!(
                    "position at {} is still funded by rolled-back transaction {}",
                    position.venue, position.source_txid
                ));
            }
        }
        for utxo in &utxos {
            if let Some(spender) = utxo.spending_txid.filter(|_| utxo.spent) {
                if rolled_back(&spender) {
                    inconsistencies.push(format!(
                        "utxo {} is marked spent by rolled-back transaction {spender}",
                        utxo.outpoint
                    ));
                }
            }
        }

        if !inconsistencies.is_empty() {
            tracing::warn!(%user, count = inconsistencies.len(), "portfolio state inconsistent");
        }
        Ok(ConsistencyReport {
            is_consistent: inconsistencies.is_empty(),
            inconsistencies,
        })
    }

    /// Check that `txid` is recorded as confirmed, funds exactly
    /// `expected_positions` positions and has its inputs marked spent.
    pub async fn validate_post_execution_state(
        &self,
        user: &UserId,
        txid: &Txid,
        expected_positions: usize,
    ) -> Result<ValidationReport, CoreError> {
        let ledger = &self.services.ledger;
        let mut errors = Vec::new();

        let history = ledger.get_transaction_history(user).await?;
        match history.iter().find(|r| &r.txid == txid) {
            None => errors.push(format!("transaction {txid} is not in the ledger history")),
            Some(r) if r.status != TxRecordStatus::Confirmed => {
                errors.push(format!("transaction {txid} is recorded as {:?}", r.status));
            }
            Some(_) => {}
        }

        let portfolio = ledger.get_portfolio(user).await?;
        let funded = portfolio
            .positions
            .iter()
            .filter(|p| &p.source_txid == txid && p.amount > Amount::ZERO)
            .count();
        if funded != expected_positions {
            errors.push(format!(
                "expected {expected_positions} positions from {txid}, found {funded}"
            ));
        }

        match self.services.store.execution(txid).await {
            None => errors.push(format!("no execution record for {txid}")),
            Some(record) => {
                let utxos = ledger.get_utxos(user).await?;
                let spent_by: HashMap<OutPoint, Option<Txid>> = utxos
                    .iter()
                    .map(|u| (u.outpoint, u.spending_txid.filter(|_| u.spent)))
                    .collect();
                for outpoint in &record.inputs {
                    match spent_by.get(outpoint) {
                        Some(Some(spender)) if spender == txid => {}
                        Some(_) => errors.push(format!("input {outpoint} is not marked spent by {txid}")),
                        None => errors.push(format!("input {outpoint} is unknown to the ledger")),
                    }
                }
            }
        }

        Ok(ValidationReport {
            is_valid: errors.is_empty(),
            errors,
        })
    }

    // ========================================================================
    // Keys and Audit
    // ========================================================================

    pub async fn deposit_address(&self, user: &UserId) -> Result<Address, CoreError> {
        self.services.signer.deposit_address(user).await
    }

    pub async fn rotate_key(&self, user: &UserId) -> Result<Address, CoreError> {
        let address = self.services.signer.rotate_key(user).await?;
        self.checkpoint().await;
        Ok(address)
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.services.store.audit_log().await
    }

    /// Persist state. Failures are logged; the in-memory state stays
    /// authoritative until the next successful flush.
    pub async fn checkpoint(&self) {
        if let Err(e) = self.services.store.flush().await {
            tracing::error!(error = %e, "failed to persist execution state");
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn record_in_ledger(
        &self,
        owner: &UserId,
        plan_id: &PlanId,
        txid: Txid,
        built: &BuiltTransaction,
        status: TxRecordStatus,
    ) {
        let entry = TxRecord {
            txid,
            plan_id: plan_id.clone(),
            amount: built.allocated(),
            fee: built.fee,
            status,
            recorded_at: unix_now(),
            block_height: None,
        };
        if let Err(e) = self.services.ledger.record_transaction(owner, &entry).await {
            self.bookkeeping_failed(plan_id, txid, "record transaction", &e)
                .await;
        }
    }

    async fn bookkeeping_failed(&self, plan_id: &PlanId, txid: Txid, step: &str, error: &CoreError) {
        self.services
            .store
            .push_audit(AuditEntry::new(
                AuditKind::BookkeepingFailed,
                plan_id.clone(),
                Some(txid),
                format!("{step}: {error}"),
            ))
            .await;
    }

    async fn notify_failed(&self, owner: &UserId, plan_id: &PlanId, error: &CoreError) {
        self.services
            .notifier
            .notify(
                owner,
                Notification::ExecutionFailed {
                    plan_id: plan_id.clone(),
                    reason: error.to_string(),
                },
            )
            .await;
    }
}

fn tx_record(
    record: &ExecutionRecord,
    status: TxRecordStatus,
    block_height: Option<BlockHeight>,
) -> TxRecord {
    TxRecord {
        txid: record.txid,
        plan_id: record.plan_id.clone(),
        amount: record.allocations.iter().map(|a| a.amount).sum(),
        fee: record.fee,
        status,
        recorded_at: unix_now(),
        block_height,
    }
}
