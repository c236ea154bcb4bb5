//! Durable execution state.
//!
//! Holds every map that must survive a restart: plan → txids, txid →
//! execution record, monitoring entries, the confirmation cache, signing key
//! epochs and the audit log. State lives in memory behind
//! `tokio::sync::RwLock`s and is written as one JSON snapshot on
//! [`StateStore::flush`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::CoreError;
use crate::types::{
    AuditEntry, ConfirmationStatus, ExecutionRecord, MonitoringEntry, PlanId, UserId,
};

/// On-disk shape. Txid-keyed maps are stored as lists to keep the JSON
/// independent of map-key encoding.
#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    plan_txids: HashMap<PlanId, Vec<Txid>>,
    #[serde(default)]
    executions: Vec<ExecutionRecord>,
    #[serde(default)]
    monitoring: Vec<MonitoringEntry>,
    #[serde(default)]
    statuses: Vec<ConfirmationStatus>,
    #[serde(default)]
    key_epochs: HashMap<UserId, u32>,
    #[serde(default)]
    audit: Vec<AuditEntry>,
}

pub struct StateStore {
    path: Option<PathBuf>,
    plan_txids: RwLock<HashMap<PlanId, Vec<Txid>>>,
    executions: RwLock<HashMap<Txid, ExecutionRecord>>,
    monitoring: RwLock<HashMap<Txid, MonitoringEntry>>,
    statuses: RwLock<HashMap<Txid, ConfirmationStatus>>,
    key_epochs: RwLock<HashMap<UserId, u32>>,
    audit: RwLock<Vec<AuditEntry>>,
    flush_lock: Mutex<()>,
}

impl StateStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::from_snapshot(None, Snapshot::default())
    }

    /// Load the snapshot at `path`, or start empty if it does not exist yet.
    pub async fn open(path: &Path) -> Result<Self, CoreError> {
        let snapshot = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes).map_err(|e| {
                CoreError::Internal(format!("corrupt state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(CoreError::Io(e)),
        };
        tracing::info!(
            path = %path.display(),
            executions = snapshot.executions.len(),
            monitored = snapshot.monitoring.len(),
            "loaded execution state"
        );
        Ok(Self::from_snapshot(Some(path.to_path_buf()), snapshot))
    }

    fn from_snapshot(path: Option<PathBuf>, snapshot: Snapshot) -> Self {
        Self {
            path,
            plan_txids: RwLock::new(snapshot.plan_txids),
            executions: RwLock::new(
                snapshot
                    .executions
                    .into_iter()
                    .map(|r| (r.txid, r))
                    .collect(),
            ),
            monitoring: RwLock::new(
                snapshot
                    .monitoring
                    .into_iter()
                    .map(|m| (m.txid, m))
                    .collect(),
            ),
            statuses: RwLock::new(
                snapshot
                    .statuses
                    .into_iter()
                    .map(|s| (s.txid, s))
                    .collect(),
            ),
            key_epochs: RwLock::new(snapshot.key_epochs),
            audit: RwLock::new(snapshot.audit),
            flush_lock: Mutex::new(()),
        }
    }

    /// Write the current state to disk. No-op for in-memory stores.
    ///
    /// The snapshot goes to a sibling temp file first and is renamed over
    /// the previous one, so a crash mid-write keeps the last checkpoint.
    pub async fn flush(&self) -> Result<(), CoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().await;

        let snapshot = Snapshot {
            plan_txids: self.plan_txids.read().await.clone(),
            executions: self.executions.read().await.values().cloned().collect(),
            monitoring: self.monitoring.read().await.values().cloned().collect(),
            statuses: self.statuses.read().await.values().cloned().collect(),
            key_epochs: self.key_epochs.read().await.clone(),
            audit: self.audit.read().await.clone(),
        };
        let content = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| CoreError::Internal(format!("serialize state: {e}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), "flushed execution state");
        Ok(())
    }

    // ========================================================================
    // Executions
    // ========================================================================

    pub async fn insert_execution(&self, record: ExecutionRecord) {
        let mut plan_txids = self.plan_txids.write().await;
        let txids = plan_txids.entry(record.plan_id.clone()).or_default();
        if !txids.contains(&record.txid) {
            txids.push(record.txid);
        }
        self.executions.write().await.insert(record.txid, record);
    }

    pub async fn execution(&self, txid: &Txid) -> Option<ExecutionRecord> {
        self.executions.read().await.get(txid).cloned()
    }

    /// Apply `f` to the record for `txid`, returning its result.
    pub async fn update_execution<R>(
        &self,
        txid: &Txid,
        f: impl FnOnce(&mut ExecutionRecord) -> R,
    ) -> Option<R> {
        self.executions.write().await.get_mut(txid).map(f)
    }

    pub async fn plan_txids(&self, plan_id: &PlanId) -> Vec<Txid> {
        self.plan_txids
            .read()
            .await
            .get(plan_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Records of every transaction issued for `plan_id`, oldest first.
    pub async fn executions_for_plan(&self, plan_id: &PlanId) -> Vec<ExecutionRecord> {
        let txids = self.plan_txids(plan_id).await;
        let executions = self.executions.read().await;
        txids
            .iter()
            .filter_map(|txid| executions.get(txid).cloned())
            .collect()
    }

    pub async fn executions_for_user(&self, user: &UserId) -> Vec<ExecutionRecord> {
        self.executions
            .read()
            .await
            .values()
            .filter(|r| &r.owner == user)
            .cloned()
            .collect()
    }

    /// Outpoints consumed by the user's broadcast-but-unreconciled
    /// transactions. The ledger only learns about them at reconciliation.
    pub async fn reserved_outpoints(&self, user: &UserId) -> HashSet<OutPoint> {
        self.executions
            .read()
            .await
            .values()
            .filter(|r| &r.owner == user && r.stage.is_pending())
            .flat_map(|r| r.inputs.iter().copied())
            .collect()
    }

    // ========================================================================
    // Monitoring and confirmation cache
    // ========================================================================

    pub async fn insert_monitoring(&self, entry: MonitoringEntry) {
        self.monitoring.write().await.insert(entry.txid, entry);
    }

    pub async fn remove_monitoring(&self, txid: &Txid) -> Option<MonitoringEntry> {
        self.monitoring.write().await.remove(txid)
    }

    pub async fn monitoring_entry(&self, txid: &Txid) -> Option<MonitoringEntry> {
        self.monitoring.read().await.get(txid).cloned()
    }

    pub async fn monitoring_entries(&self) -> Vec<MonitoringEntry> {
        self.monitoring.read().await.values().cloned().collect()
    }

    pub async fn status(&self, txid: &Txid) -> Option<ConfirmationStatus> {
        self.statuses.read().await.get(txid).cloned()
    }

    pub async fn put_status(&self, status: ConfirmationStatus) {
        self.statuses.write().await.insert(status.txid, status);
    }

    // ========================================================================
    // Signing key epochs
    // ========================================================================

    pub async fn key_epoch(&self, user: &UserId) -> u32 {
        self.key_epochs.read().await.get(user).copied().unwrap_or(0)
    }

    /// Advance the user's key epoch and return the new value.
    pub async fn bump_key_epoch(&self, user: &UserId) -> u32 {
        let mut epochs = self.key_epochs.write().await;
        let epoch = epochs.entry(user.clone()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    pub async fn push_audit(&self, entry: AuditEntry) {
        tracing::warn!(
            kind = ?entry.kind,
            plan_id = %entry.plan_id,
            txid = ?entry.txid,
            detail = %entry.detail,
            "audit"
        );
        self.audit.write().await.push(entry);
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use bitcoin::Amount;

    use super::*;
    use crate::test_util::txid_from_byte;
    use crate::types::{AppliedEffects, AuditKind, ExecutionStage};

    fn record(byte: u8, plan: &str, stage: ExecutionStage) -> ExecutionRecord {
        ExecutionRecord {
            txid: txid_from_byte(byte),
            plan_id: plan.into(),
            owner: "alice".into(),
            stage,
            allocations: Vec::new(),
            inputs: vec![OutPoint::new(txid_from_byte(byte + 100), 0)],
            total_output: Amount::from_sat(10_000),
            fee: Amount::from_sat(500),
            created_at: 1,
            applied: AppliedEffects::default(),
        }
    }

    fn temp_state_path() -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time must be after unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("allot-core-state-{unique}"))
            .join("state.json")
    }

    #[tokio::test]
    async fn plan_txids_track_inserted_executions() {
        let store = StateStore::in_memory();
        store
            .insert_execution(record(1, "plan-a", ExecutionStage::Broadcast))
            .await;
        store
            .insert_execution(record(2, "plan-a", ExecutionStage::RolledBack))
            .await;

        let txids = store.plan_txids(&"plan-a".into()).await;
        assert_eq!(txids, vec![txid_from_byte(1), txid_from_byte(2)]);
        assert_eq!(store.executions_for_plan(&"plan-a".into()).await.len(), 2);
        assert!(store.plan_txids(&"plan-b".into()).await.is_empty());
    }

    #[tokio::test]
    async fn only_pending_executions_reserve_outpoints() {
        let store = StateStore::in_memory();
        store
            .insert_execution(record(1, "plan-a", ExecutionStage::Broadcast))
            .await;
        store
            .insert_execution(record(2, "plan-b", ExecutionStage::Reconciled))
            .await;

        let reserved = store.reserved_outpoints(&"alice".into()).await;
        assert_eq!(reserved.len(), 1);
        assert!(reserved.contains(&OutPoint::new(txid_from_byte(101), 0)));
        assert!(store.reserved_outpoints(&"bob".into()).await.is_empty());
    }

    #[tokio::test]
    async fn key_epochs_start_at_zero_and_increase() {
        let store = StateStore::in_memory();
        let user: UserId = "alice".into();
        assert_eq!(store.key_epoch(&user).await, 0);
        assert_eq!(store.bump_key_epoch(&user).await, 1);
        assert_eq!(store.bump_key_epoch(&user).await, 2);
        assert_eq!(store.key_epoch(&user).await, 2);
    }

    #[tokio::test]
    async fn flush_and_reopen_restores_state() {
        let path = temp_state_path();
        let store = StateStore::open(&path).await.expect("missing file opens empty");

        let txid = txid_from_byte(7);
        store
            .insert_execution(record(7, "plan-z", ExecutionStage::Broadcast))
            .await;
        store
            .insert_monitoring(MonitoringEntry {
                txid,
                user: "alice".into(),
                plan_id: "plan-z".into(),
                broadcast_at: 10,
                target_confirmations: 6,
            })
            .await;
        store
            .put_status(ConfirmationStatus::unconfirmed(txid, 10))
            .await;
        store.bump_key_epoch(&"alice".into()).await;
        store
            .push_audit(AuditEntry::new(
                AuditKind::RolledBack,
                "plan-z".into(),
                Some(txid),
                "test",
            ))
            .await;
        store.flush().await.expect("flush succeeds");

        let reopened = StateStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.plan_txids(&"plan-z".into()).await, vec![txid]);
        assert_eq!(
            reopened.execution(&txid).await.map(|r| r.stage),
            Some(ExecutionStage::Broadcast)
        );
        assert!(reopened.monitoring_entry(&txid).await.is_some());
        assert_eq!(reopened.status(&txid).await.map(|s| s.last_checked), Some(10));
        assert_eq!(reopened.key_epoch(&"alice".into()).await, 1);
        assert_eq!(reopened.audit_log().await.len(), 1);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn corrupt_state_file_is_rejected() {
        let path = temp_state_path();
        std::fs::create_dir_all(path.parent().expect("has parent")).expect("mkdir");
        std::fs::write(&path, b"{not json").expect("write");

        let result = StateStore::open(&path).await;
        assert!(matches!(result, Err(CoreError::Internal(_))));

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
