use bitcoin::{BlockHash, Txid};

use crate::error::{CoreError, RpcError};

/// Fields of a verbose `getrawtransaction` result relevant to confirmation
/// tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct RawTxStatus {
    pub(super) confirmations: u32,
    pub(super) block_hash: Option<BlockHash>,
    /// Only present on newer nodes; otherwise resolved via `getblockheader`.
    pub(super) block_height: Option<u32>,
}

fn invalid(message: String) -> CoreError {
    RpcError::InvalidResponse(message).into()
}

pub(super) fn parse_txid(value: &serde_json::Value, field: &str) -> Result<Txid, CoreError> {
    value
        .as_str()
        .ok_or_else(|| invalid(format!("missing {field}")))?
        .parse()
        .map_err(|e| invalid(format!("invalid {field}: {e}")))
}

pub(super) fn parse_opt_block_hash(
    value: Option<&serde_json::Value>,
) -> Result<Option<BlockHash>, CoreError> {
    match value.and_then(serde_json::Value::as_str) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| invalid(format!("invalid blockhash: {e}"))),
    }
}

/// Missing, null or non-integer values read as `None`.
pub(super) fn parse_u32_optional(value: Option<&serde_json::Value>) -> Option<u32> {
    value
        .and_then(serde_json::Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

pub(super) fn parse_raw_tx_status(raw: &serde_json::Value) -> Result<RawTxStatus, CoreError> {
    if !raw.is_object() {
        return Err(invalid(format!("getrawtransaction result is not an object: {raw}")));
    }
    Ok(RawTxStatus {
        confirmations: parse_u32_optional(raw.get("confirmations")).unwrap_or(0),
        block_hash: parse_opt_block_hash(raw.get("blockhash"))?,
        block_height: parse_u32_optional(raw.get("blockheight")),
    })
}
