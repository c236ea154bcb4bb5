//! Interface to the external threshold-signing oracle.

use async_trait::async_trait;
use bitcoin::bip32::DerivationPath;
use bitcoin::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The only curve this pipeline signs with.
pub const CURVE: &str = "secp256k1";

/// Addresses one key held by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub curve: String,
    pub key_id: String,
    pub derivation_path: DerivationPath,
}

impl KeyRef {
    pub fn new(key_id: &str, derivation_path: DerivationPath) -> Self {
        Self {
            curve: CURVE.to_owned(),
            key_id: key_id.to_owned(),
            derivation_path,
        }
    }
}

/// Raw ECDSA signature as returned by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl OracleSignature {
    /// `r || s`, the compact form secp256k1 parses.
    pub fn compact(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        out
    }
}

/// Signs 32-byte digests with keys it never reveals.
#[async_trait]
pub trait SigningOracle: Send + Sync {
    async fn sign(&self, message_hash: [u8; 32], key: &KeyRef)
        -> Result<OracleSignature, CoreError>;

    async fn public_key(&self, key: &KeyRef) -> Result<PublicKey, CoreError>;
}
