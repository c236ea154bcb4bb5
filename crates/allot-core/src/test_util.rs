//! Shared test helpers for `allot-core` unit tests.
//!
//! Deterministic txids and addresses, UTXO builders, and in-memory doubles
//! for every collaborator the executor talks to.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::{
    absolute, transaction, Address, Amount, Network, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::error::CoreError;
use crate::services::{LedgerProvider, Notification, Notifier, PriceFeed, StrategyProvider};
use crate::signing::{KeyRef, OracleSignature, SigningOracle};
use crate::types::{
    Allocation, Plan, PlanId, PlanStatus, Portfolio, Position, TxRecord, UserId, Utxo,
};

// ==============================================================================
// Txid, Key and Address Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

/// `seed` must be non-zero.
pub fn test_secret_key(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).expect("non-zero seed is a valid secret key")
}

/// Regtest P2PKH address of [`test_secret_key`]`(seed)`.
pub fn test_address(seed: u8) -> Address {
    let secp = Secp256k1::signing_only();
    let pk = PublicKey::new(test_secret_key(seed).public_key(&secp));
    Address::p2pkh(pk.pubkey_hash(), Network::Regtest)
}

// ==============================================================================
// Funds and Transactions
// ==============================================================================

/// An unspent UTXO at `test_address(200)`.
pub fn utxo(byte: u8, sats: u64, confirmations: u32) -> Utxo {
    utxo_at(byte, sats, confirmations, &test_address(200))
}

pub fn utxo_at(byte: u8, sats: u64, confirmations: u32, address: &Address) -> Utxo {
    Utxo {
        outpoint: OutPoint::new(txid_from_byte(byte), 0),
        amount: Amount::from_sat(sats),
        address: address.to_string(),
        confirmations,
        spent: false,
        spending_txid: None,
    }
}

/// A one-in one-out transaction whose input carries a placeholder script.
pub fn signed_tx(byte: u8) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(txid_from_byte(byte), 0),
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: test_address(10).script_pubkey(),
        }],
    }
}

pub fn approved_plan(id: &str, owner: &str, allocations: &[(&str, u64)]) -> Plan {
    Plan {
        id: id.into(),
        owner: owner.into(),
        allocations: allocations
            .iter()
            .map(|(venue, sats)| Allocation {
                venue: (*venue).to_owned(),
                amount: Amount::from_sat(*sats),
            })
            .collect(),
        status: PlanStatus::Approved,
    }
}

// ==============================================================================
// Collaborator Doubles
// ==============================================================================

#[derive(Default)]
pub struct MockStrategy {
    plans: Mutex<HashMap<PlanId, Plan>>,
}

impl MockStrategy {
    pub fn with_plan(self, plan: Plan) -> Self {
        self.plans.lock().unwrap().insert(plan.id.clone(), plan);
        self
    }
}

#[async_trait]
impl StrategyProvider for MockStrategy {
    async fn get_plan(&self, plan_id: &PlanId) -> Result<Plan, CoreError> {
        self.plans
            .lock()
            .unwrap()
            .get(plan_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("plan", plan_id))
    }
}

/// Ledger and portfolio service kept in memory, with failure injection.
#[derive(Default)]
pub struct MockLedger {
    utxos: Mutex<Vec<(UserId, Utxo)>>,
    history: Mutex<HashMap<UserId, Vec<TxRecord>>>,
    positions: Mutex<HashMap<(UserId, String, Txid), Position>>,
    reported_balance: Mutex<HashMap<UserId, Amount>>,
    failing_venues: Mutex<HashSet<String>>,
    fail_records: Mutex<bool>,
}

impl MockLedger {
    pub fn add_utxo(&self, user: &str, utxo: Utxo) {
        self.utxos.lock().unwrap().push((user.into(), utxo));
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos
            .lock()
            .unwrap()
            .iter()
            .find(|(_, u)| &u.outpoint == outpoint)
            .map(|(_, u)| u.clone())
    }

    pub fn positions(&self, user: &str) -> Vec<Position> {
        let user: UserId = user.into();
        let mut positions: Vec<Position> = self
            .positions
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.user == user)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.key().cmp(&b.key()));
        positions
    }

    pub fn history(&self, user: &str) -> Vec<TxRecord> {
        self.history
            .lock()
            .unwrap()
            .get(&UserId::from(user))
            .cloned()
            .unwrap_or_default()
    }

    /// Make the portfolio report `balance` instead of the UTXO total.
    pub fn set_reported_balance(&self, user: &str, balance: Amount) {
        self.reported_balance
            .lock()
            .unwrap()
            .insert(user.into(), balance);
    }

    pub fn fail_position_updates_for(&self, venue: &str) {
        self.failing_venues.lock().unwrap().insert(venue.to_owned());
    }

    pub fn fail_transaction_records(&self) {
        *self.fail_records.lock().unwrap() = true;
    }

    fn confirmed_balance(&self, user: &UserId) -> Amount {
        self.utxos
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, u)| owner == user && u.is_spendable(1))
            .map(|(_, u)| u.amount)
            .sum()
    }
}

#[async_trait]
impl LedgerProvider for MockLedger {
    async fn get_utxos(&self, user: &UserId) -> Result<Vec<Utxo>, CoreError> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, _)| owner == user)
            .map(|(_, u)| u.clone())
            .collect())
    }

    async fn record_transaction(&self, user: &UserId, record: &TxRecord) -> Result<(), CoreError> {
        if *self.fail_records.lock().unwrap() {
            return Err(CoreError::Internal("ledger unavailable".into()));
        }
        let mut history = self.history.lock().unwrap();
        let records = history.entry(user.clone()).or_default();
        records.retain(|r| r.txid != record.txid);
        records.push(record.clone());
        Ok(())
    }

    async fn update_position(&self, user: &UserId, position: &Position) -> Result<(), CoreError> {
        if self.failing_venues.lock().unwrap().contains(&position.venue) {
            return Err(CoreError::Internal(format!(
                "venue {} unavailable",
                position.venue
            )));
        }
        self.positions
            .lock()
            .unwrap()
            .insert(
                (user.clone(), position.venue.clone(), position.source_txid),
                position.clone(),
            );
        Ok(())
    }

    async fn mark_utxo_spent(&self, outpoint: &OutPoint, spending_txid: &Txid) -> Result<(), CoreError> {
        let mut utxos = self.utxos.lock().unwrap();
        let (_, utxo) = utxos
            .iter_mut()
            .find(|(_, u)| &u.outpoint == outpoint)
            .ok_or_else(|| CoreError::not_found("utxo", outpoint))?;
        utxo.spent = true;
        utxo.spending_txid = Some(*spending_txid);
        Ok(())
    }

    async fn mark_utxo_unspent(&self, outpoint: &OutPoint) -> Result<(), CoreError> {
        let mut utxos = self.utxos.lock().unwrap();
        let (_, utxo) = utxos
            .iter_mut()
            .find(|(_, u)| &u.outpoint == outpoint)
            .ok_or_else(|| CoreError::not_found("utxo", outpoint))?;
        utxo.spent = false;
        utxo.spending_txid = None;
        Ok(())
    }

    async fn get_portfolio(&self, user: &UserId) -> Result<Portfolio, CoreError> {
        let btc_balance = self
            .reported_balance
            .lock()
            .unwrap()
            .get(user)
            .copied()
            .unwrap_or_else(|| self.confirmed_balance(user));
        let positions = self.positions(user.as_str());
        let total_value = positions.iter().map(|p| p.current_value).sum();
        Ok(Portfolio {
            user: user.clone(),
            btc_balance,
            positions,
            total_value,
        })
    }

    async fn get_transaction_history(&self, user: &UserId) -> Result<Vec<TxRecord>, CoreError> {
        Ok(self.history(user.as_str()))
    }
}

/// Price feed returning a constant until switched off.
pub struct StubPrice {
    price: f64,
    down: AtomicBool,
}

impl StubPrice {
    pub fn new(price: f64) -> Self {
        Self {
            price,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl PriceFeed for StubPrice {
    async fn btc_price(&self) -> Result<f64, CoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("price feed unavailable".into()));
        }
        Ok(self.price)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(UserId, Notification)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user: &UserId, notification: Notification) {
        self.events
            .lock()
            .unwrap()
            .push((user.clone(), notification));
    }
}

/// Signing oracle that derives a secret key per `(key_id, path)` locally
/// and produces real recoverable secp256k1 signatures.
pub struct LocalKeyOracle {
    secp: Secp256k1<All>,
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
    wrong_key: bool,
}

impl LocalKeyOracle {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            calls: AtomicUsize::new(0),
            fail_on_call: None,
            wrong_key: false,
        }
    }

    /// Fail the `n`th (0-based) signing request.
    pub fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    /// Sign with a key that does not match the reported public key.
    pub fn signing_with_wrong_key(mut self) -> Self {
        self.wrong_key = true;
        self
    }

    pub fn sign_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn secret_for(key: &KeyRef) -> SecretKey {
        let seed = format!("{}/{}/{}", key.curve, key.key_id, key.derivation_path);
        let digest = sha256::Hash::hash(seed.as_bytes()).to_byte_array();
        SecretKey::from_slice(&digest).expect("sha256 output is a valid secret key")
    }
}

impl Default for LocalKeyOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SigningOracle for LocalKeyOracle {
    async fn sign(&self, message_hash: [u8; 32], key: &KeyRef) -> Result<OracleSignature, CoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_call == Some(call) {
            return Err(CoreError::Internal("oracle refused to sign".into()));
        }
        let secret = if self.wrong_key {
            test_secret_key(7)
        } else {
            Self::secret_for(key)
        };
        let recoverable = self
            .secp
            .sign_ecdsa_recoverable(&Message::from_digest(message_hash), &secret);
        let (recovery_id, compact) = recoverable.serialize_compact();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&compact[..32]);
        s.copy_from_slice(&compact[32..]);
        Ok(OracleSignature {
            r,
            s,
            recovery_id: recovery_id.to_i32() as u8,
        })
    }

    async fn public_key(&self, key: &KeyRef) -> Result<PublicKey, CoreError> {
        Ok(PublicKey::new(Self::secret_for(key).public_key(&self.secp)))
    }
}
