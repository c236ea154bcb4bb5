//! Signing service adapter.
//!
//! Turns a built transaction into a fully signed one by asking the external
//! [`SigningOracle`] for one ECDSA signature per input. No private key is
//! ever held here. Every input is signed into a scratch list first and the
//! scripts are only written once all of them succeeded, so a failure never
//! leaves a partially signed transaction behind.

pub mod derivation;
pub mod oracle;

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{self, Message, Secp256k1, VerifyOnly};
use bitcoin::sighash::SighashCache;
use bitcoin::{Address, Amount, EcdsaSighashType, Network, PublicKey, ScriptBuf, Transaction};
use tokio::sync::RwLock;

use crate::builder::{parse_address, BuiltTransaction};
use crate::error::CoreError;
use crate::store::StateStore;
use crate::types::{UserId, Utxo};

pub use derivation::derivation_path;
pub use oracle::{KeyRef, OracleSignature, SigningOracle, CURVE};

#[derive(Debug, Clone)]
pub struct SigningPolicy {
    pub network: Network,
    /// Oracle key name all user paths derive from.
    pub key_id: String,
    /// Upper bound on the allocated amount of a single transaction.
    pub max_transaction_amount: Amount,
    pub sighash_type: EcdsaSighashType,
}

impl Default for SigningPolicy {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            key_id: "allot-key-1".into(),
            max_transaction_amount: Amount::from_sat(1_000_000_000),
            sighash_type: EcdsaSighashType::All,
        }
    }
}

/// A user's key at one rotation epoch.
#[derive(Debug, Clone)]
struct EpochKey {
    key: KeyRef,
    public_key: PublicKey,
    address: Address,
}

/// One input's signing task.
struct SigningContext<'a> {
    tx: &'a Transaction,
    input_index: usize,
    utxo: &'a Utxo,
    sighash_type: EcdsaSighashType,
}

impl SigningContext<'_> {
    fn fail(&self, message: impl Into<String>) -> CoreError {
        CoreError::SigningFailure {
            input: self.input_index,
            message: message.into(),
        }
    }

    /// Legacy sighash of this input against the P2PKH script it spends.
    fn sighash(&self, script_pubkey: &ScriptBuf) -> Result<[u8; 32], CoreError> {
        SighashCache::new(self.tx)
            .legacy_signature_hash(
                self.input_index,
                script_pubkey,
                self.sighash_type.to_u32(),
            )
            .map(|hash| hash.to_byte_array())
            .map_err(|e| self.fail(format!("sighash: {e}")))
    }
}

pub struct SigningService {
    oracle: Arc<dyn SigningOracle>,
    store: Arc<StateStore>,
    policy: SigningPolicy,
    secp: Secp256k1<VerifyOnly>,
    public_keys: RwLock<HashMap<(UserId, u32), PublicKey>>,
}

impl SigningService {
    pub fn new(oracle: Arc<dyn SigningOracle>, store: Arc<StateStore>, policy: SigningPolicy) -> Self {
        Self {
            oracle,
            store,
            policy,
            secp: Secp256k1::verification_only(),
            public_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &SigningPolicy {
        &self.policy
    }

    /// Deposit address for the user's current key epoch.
    pub async fn deposit_address(&self, user: &UserId) -> Result<Address, CoreError> {
        let epoch = self.store.key_epoch(user).await;
        Ok(self.epoch_key(user, epoch).await?.address)
    }

    /// Move the user to a fresh derivation path and return its address.
    ///
    /// Earlier epochs stay known: funds already at their addresses can
    /// still be spent, only new deposits go to the new address.
    pub async fn rotate_key(&self, user: &UserId) -> Result<Address, CoreError> {
        let epoch = self.store.bump_key_epoch(user).await;
        let key = self.epoch_key(user, epoch).await?;
        tracing::warn!(%user, epoch, address = %key.address, "rotated signing key");
        Ok(key.address)
    }

    /// Caller and amount checks. Runs before any oracle call.
    pub fn authorize(
        &self,
        caller: &UserId,
        owner: &UserId,
        built: &BuiltTransaction,
    ) -> Result<(), CoreError> {
        if caller != owner {
            return Err(CoreError::Unauthorized(format!(
                "{caller} may not spend funds owned by {owner}"
            )));
        }
        let amount = built.allocated();
        if amount == Amount::ZERO {
            return Err(CoreError::InputValidation(
                "transaction amount is zero".into(),
            ));
        }
        if amount > self.policy.max_transaction_amount {
            return Err(CoreError::Unauthorized(format!(
                "transaction amount {amount} exceeds the per-transaction limit {}",
                self.policy.max_transaction_amount
            )));
        }
        Ok(())
    }

    /// Sign every input of `built` on behalf of `owner`.
    pub async fn sign_transaction(
        &self,
        caller: &UserId,
        owner: &UserId,
        built: &BuiltTransaction,
    ) -> Result<Transaction, CoreError> {
        self.authorize(caller, owner, built)?;

        let keys = self.owned_keys(owner).await?;
        let tx = &built.tx;
        let mut scripts = Vec::with_capacity(tx.input.len());

        for (input_index, input) in tx.input.iter().enumerate() {
            let utxo = built
                .spent
                .iter()
                .find(|u| u.outpoint == input.previous_output)
                .ok_or_else(|| CoreError::SigningFailure {
                    input: input_index,
                    message: format!("source utxo {} not found", input.previous_output),
                })?;
            let ctx = SigningContext {
                tx,
                input_index,
                utxo,
                sighash_type: self.policy.sighash_type,
            };
            scripts.push(self.sign_input(&ctx, &keys).await?);
        }

        let mut signed = tx.clone();
        for (input, script_sig) in signed.input.iter_mut().zip(scripts) {
            input.script_sig = script_sig;
        }
        let unsigned = signed
            .input
            .iter()
            .filter(|input| input.script_sig.is_empty())
            .count();
        if unsigned > 0 {
            return Err(CoreError::Internal(format!(
                "{unsigned} inputs left unsigned"
            )));
        }

        tracing::info!(
            %owner,
            txid = %signed.compute_txid(),
            inputs = signed.input.len(),
            "signed transaction"
        );
        Ok(signed)
    }

    async fn sign_input(
        &self,
        ctx: &SigningContext<'_>,
        keys: &[EpochKey],
    ) -> Result<ScriptBuf, CoreError> {
        let address = parse_address(&ctx.utxo.address, self.policy.network)
            .map_err(|e| ctx.fail(e.to_string()))?;
        let key = keys
            .iter()
            .find(|k| k.address == address)
            .ok_or_else(|| ctx.fail(format!("address {address} is not controlled by the owner")))?;

        let digest = ctx.sighash(&address.script_pubkey())?;
        let raw = self
            .oracle
            .sign(digest, &key.key)
            .await
            .map_err(|e| ctx.fail(format!("oracle: {e}")))?;

        let mut signature = secp256k1::ecdsa::Signature::from_compact(&raw.compact())
            .map_err(|e| ctx.fail(format!("malformed signature: {e}")))?;
        signature.normalize_s();
        self.secp
            .verify_ecdsa(&Message::from_digest(digest), &signature, &key.public_key.inner)
            .map_err(|e| ctx.fail(format!("signature does not verify: {e}")))?;

        let encoded = bitcoin::ecdsa::Signature {
            signature,
            sighash_type: ctx.sighash_type,
        };
        let push = PushBytesBuf::try_from(encoded.to_vec())
            .map_err(|e| ctx.fail(format!("signature push: {e}")))?;

        tracing::debug!(input = ctx.input_index, outpoint = %ctx.utxo.outpoint, "signed input");
        Ok(Builder::new()
            .push_slice(push)
            .push_key(&key.public_key)
            .into_script())
    }

    /// Keys of every epoch the user has had, newest first.
    async fn owned_keys(&self, user: &UserId) -> Result<Vec<EpochKey>, CoreError> {
        let current = self.store.key_epoch(user).await;
        let mut keys = Vec::with_capacity(current as usize + 1);
        for epoch in (0..=current).rev() {
            keys.push(self.epoch_key(user, epoch).await?);
        }
        Ok(keys)
    }

    async fn epoch_key(&self, user: &UserId, epoch: u32) -> Result<EpochKey, CoreError> {
        let key = KeyRef::new(&self.policy.key_id, derivation_path(user, epoch));

        let cached = self
            .public_keys
            .read()
            .await
            .get(&(user.clone(), epoch))
            .copied();
        let public_key = match cached {
            Some(pk) => pk,
            None => {
                let pk = self.oracle.public_key(&key).await?;
                if !pk.compressed {
                    return Err(CoreError::Internal(format!(
                        "oracle returned an uncompressed key for {user}"
                    )));
                }
                self.public_keys
                    .write()
                    .await
                    .insert((user.clone(), epoch), pk);
                pk
            }
        };

        Ok(EpochKey {
            address: Address::p2pkh(public_key.pubkey_hash(), self.policy.network),
            key,
            public_key,
        })
    }
}
