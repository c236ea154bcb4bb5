use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{BlockHash, Transaction, Txid};
use futures::future::{join_all, try_join_all};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use lru::LruCache;
use reqwest::header;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::error::{CoreError, RpcError};
use crate::types::BlockHeight;

use super::super::{ChainBackend, ChainTxStatus};
use super::connection::{parse_connection, resolve_auth};
use super::parsing::{parse_raw_tx_status, parse_txid, parse_u32_optional, RawTxStatus};
use super::protocol::{parse_batch_id, JsonRpcRequest, JsonRpcResponse};

/// Maximum number of block-hash → height entries cached in memory.
const BLOCK_HEIGHT_CACHE_CAP: usize = 10_000;

/// Bitcoin Core's "invalid address or key" code, also used for unknown
/// transactions.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Bitcoin Core JSON-RPC backend over HTTP(S).
///
/// Status lookups use verbose `getrawtransaction`, so confirmed transactions
/// outside the node's wallet are only found when the node runs with
/// `-txindex`.
pub struct RpcChainBackend {
    client: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
    limiter: Option<DirectRateLimiter>,
    batch_chunk_size: usize,
    next_id: AtomicU64,
    /// Heights of confirmed blocks never change, so entries are only evicted.
    block_height_cache: RwLock<LruCache<BlockHash, BlockHeight>>,
}

impl RpcChainBackend {
    /// Authentication precedence: explicit `user` + `pass`, then the cookie
    /// file, then none. With `requests_per_second` set, every outbound HTTP
    /// request (a batch counts as one) waits for the limiter.
    pub fn new(
        connection: &str,
        user: Option<&str>,
        pass: Option<&str>,
        cookie_file: Option<&Path>,
        requests_per_second: Option<u32>,
        batch_chunk_size: usize,
    ) -> Result<Self, CoreError> {
        if batch_chunk_size == 0 {
            return Err(CoreError::InputValidation(
                "rpc batch chunk size must be at least 1".to_owned(),
            ));
        }
        let auth = resolve_auth(user, pass, cookie_file)?;
        let url = parse_connection(connection)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(8)
            .tcp_nodelay(true)
            .build()
            .map_err(RpcError::Transport)?;

        let limiter = match requests_per_second {
            None => None,
            Some(limit) => {
                let limit = NonZeroU32::new(limit).ok_or_else(|| {
                    CoreError::InputValidation("requests_per_second must be at least 1".to_owned())
                })?;
                Some(RateLimiter::direct(Quota::per_second(limit)))
            }
        };

        let cache_cap = NonZeroUsize::new(BLOCK_HEIGHT_CACHE_CAP)
            .ok_or_else(|| CoreError::Internal("block height cache capacity is zero".into()))?;

        Ok(Self {
            client,
            url,
            auth,
            limiter,
            batch_chunk_size,
            next_id: AtomicU64::new(initial_request_id()),
            block_height_cache: RwLock::new(LruCache::new(cache_cap)),
        })
    }

    fn reserve_request_ids(&self, count: u64) -> u64 {
        self.next_id.fetch_add(count, Ordering::Relaxed)
    }

    async fn wait_for_rate_limit(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, body: &T) -> Result<String, CoreError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some((ref user, ref pass)) = self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        let response = builder.send().await.map_err(RpcError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(RpcError::Transport)?;
        debug!(%status, body_len = text.len(), "rpc response");
        trace!(body = %text, "rpc response body");
        Ok(text)
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError> {
        self.wait_for_rate_limit().await;
        let id = self.reserve_request_ids(1);
        debug!(rpc.id = id, rpc.method = method, "rpc call");
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let body = self.post(&req).await?;
        let decoded: JsonRpcResponse = serde_json::from_str(&body).map_err(|e| {
            RpcError::InvalidResponse(format!("decode JSON-RPC response: {e}; body={body}"))
        })?;
        decoded.into_result()
    }

    /// One HTTP request carrying `calls` of the same method. Per-item server
    /// errors stay per item.
    async fn rpc_batch(
        &self,
        method: &str,
        calls: &[Vec<serde_json::Value>],
    ) -> Result<Vec<Result<serde_json::Value, CoreError>>, CoreError> {
        self.wait_for_rate_limit().await;
        let start_id = self.reserve_request_ids(calls.len() as u64);
        debug!(
            rpc.batch_start_id = start_id,
            rpc.batch_size = calls.len(),
            rpc.method = method,
            "rpc batch call"
        );
        let requests: Vec<JsonRpcRequest<'_>> = calls
            .iter()
            .enumerate()
            .map(|(offset, params)| JsonRpcRequest {
                jsonrpc: "2.0",
                id: start_id + offset as u64,
                method,
                params: params.clone(),
            })
            .collect();

        let body = self.post(&requests).await?;
        let decoded: Vec<JsonRpcResponse> = serde_json::from_str(&body).map_err(|e| {
            RpcError::InvalidResponse(format!("decode JSON-RPC batch response: {e}; body={body}"))
        })?;

        let mut by_id: HashMap<u64, JsonRpcResponse> = HashMap::with_capacity(decoded.len());
        for item in decoded {
            by_id.insert(parse_batch_id(&item.id)?, item);
        }

        (start_id..start_id + calls.len() as u64)
            .map(|id| {
                by_id
                    .remove(&id)
                    .map(JsonRpcResponse::into_result)
                    .ok_or_else(|| RpcError::MissingBatchItem { id }.into())
            })
            .collect()
    }

    async fn rpc_batch_chunked(
        &self,
        method: &str,
        calls: &[Vec<serde_json::Value>],
    ) -> Result<Vec<Result<serde_json::Value, CoreError>>, CoreError> {
        let chunk_futures: Vec<_> = calls
            .chunks(self.batch_chunk_size)
            .map(|chunk| self.rpc_batch(method, chunk))
            .collect();
        let chunked = try_join_all(chunk_futures).await?;
        Ok(chunked.into_iter().flatten().collect())
    }

    async fn get_block_height(&self, block_hash: BlockHash) -> Result<Option<BlockHeight>, CoreError> {
        // `LruCache::get` updates recency, hence the write lock.
        if let Some(height) = self
            .block_height_cache
            .write()
            .await
            .get(&block_hash)
            .copied()
        {
            return Ok(Some(height));
        }

        let raw = self
            .rpc_call(
                "getblockheader",
                vec![
                    serde_json::json!(block_hash.to_string()),
                    serde_json::json!(true),
                ],
            )
            .await?;
        let height = parse_u32_optional(raw.get("height")).map(BlockHeight);
        if let Some(height) = height {
            self.block_height_cache.write().await.put(block_hash, height);
        }
        Ok(height)
    }

    async fn to_chain_status(
        &self,
        txid: &Txid,
        raw: Result<serde_json::Value, CoreError>,
    ) -> Result<ChainTxStatus, CoreError> {
        let raw = raw.map_err(|err| normalize_getrawtransaction_error(txid, err))?;
        let RawTxStatus {
            confirmations,
            block_hash,
            block_height,
        } = parse_raw_tx_status(&raw)?;

        let block_height = match (block_height, block_hash) {
            (Some(height), _) => Some(BlockHeight(height)),
            (None, Some(hash)) if confirmations > 0 => self.get_block_height(hash).await?,
            _ => None,
        };
        Ok(ChainTxStatus {
            confirmations,
            block_height,
            block_hash,
        })
    }
}

fn getrawtransaction_params(txid: &Txid) -> Vec<serde_json::Value> {
    vec![serde_json::json!(txid.to_string()), serde_json::json!(true)]
}

#[async_trait]
impl ChainBackend for RpcChainBackend {
    async fn submit(&self, tx: &Transaction) -> Result<Txid, CoreError> {
        let expected = tx.compute_txid();
        let raw = self
            .rpc_call("sendrawtransaction", vec![serde_json::json!(serialize_hex(tx))])
            .await
            .map_err(|err| match err {
                CoreError::Rpc(RpcError::ServerError { code, message }) => {
                    CoreError::BroadcastFailure(format!("node rejected {expected} ({code}): {message}"))
                }
                other => other,
            })?;

        let txid = parse_txid(&raw, "sendrawtransaction result")?;
        if txid != expected {
            return Err(RpcError::InvalidResponse(format!(
                "node returned txid {txid}, expected {expected}"
            ))
            .into());
        }
        Ok(txid)
    }

    async fn query_status(&self, txid: &Txid) -> Result<ChainTxStatus, CoreError> {
        let raw = self
            .rpc_call("getrawtransaction", getrawtransaction_params(txid))
            .await;
        self.to_chain_status(txid, raw).await
    }

    async fn query_statuses(&self, txids: &[Txid]) -> Vec<Result<ChainTxStatus, CoreError>> {
        if txids.is_empty() {
            return Vec::new();
        }

        let calls: Vec<Vec<serde_json::Value>> =
            txids.iter().map(getrawtransaction_params).collect();
        let raw_results = match self.rpc_batch_chunked("getrawtransaction", &calls).await {
            Ok(results) => results,
            Err(batch_error) => {
                warn!(
                    tx_count = txids.len(),
                    error = %batch_error,
                    "batch getrawtransaction failed; falling back to sequential requests"
                );
                let mut sequential = Vec::with_capacity(txids.len());
                for txid in txids {
                    sequential.push(self.query_status(txid).await);
                }
                return sequential;
            }
        };

        join_all(
            txids
                .iter()
                .zip(raw_results)
                .map(|(txid, raw)| self.to_chain_status(txid, raw)),
        )
        .await
    }
}

fn initial_request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

// ==============================================================================
// RPC Error Normalization
// ==============================================================================

/// Bitcoin Core reports unknown transactions as a `-5` server error; map
/// those to a typed `NotFound` and keep every other failure as-is.
fn normalize_getrawtransaction_error(txid: &Txid, err: CoreError) -> CoreError {
    match err {
        CoreError::Rpc(RpcError::ServerError { code, ref message })
            if is_tx_not_found_server_error(code, message) =>
        {
            CoreError::not_found("transaction", txid)
        }
        other => other,
    }
}

fn is_tx_not_found_server_error(code: i64, message: &str) -> bool {
    if code != RPC_INVALID_ADDRESS_OR_KEY {
        return false;
    }
    let msg = message.to_ascii_lowercase();
    msg.contains("not found") || msg.contains("no such mempool or blockchain transaction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::txid_from_byte;

    #[test]
    fn unknown_transaction_maps_to_not_found() {
        let txid = txid_from_byte(1);
        let err = CoreError::Rpc(RpcError::ServerError {
            code: -5,
            message: "No such mempool or blockchain transaction".to_string(),
        });
        assert!(matches!(
            normalize_getrawtransaction_error(&txid, err),
            CoreError::NotFound { kind: "transaction", .. }
        ));
    }

    #[test]
    fn other_server_errors_are_preserved() {
        let txid = txid_from_byte(1);
        let err = CoreError::Rpc(RpcError::ServerError {
            code: -32603,
            message: "Internal error".to_string(),
        });
        assert!(matches!(
            normalize_getrawtransaction_error(&txid, err),
            CoreError::Rpc(RpcError::ServerError { code: -32603, .. })
        ));
    }

    #[test]
    fn zero_batch_chunk_size_is_rejected() {
        let result = RpcChainBackend::new("http://127.0.0.1:18443", None, None, None, None, 0);
        assert!(matches!(result, Err(CoreError::InputValidation(_))));
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let result = RpcChainBackend::new("http://127.0.0.1:18443", None, None, None, Some(0), 10);
        assert!(matches!(result, Err(CoreError::InputValidation(_))));
    }
}
