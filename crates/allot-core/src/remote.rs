//! REST clients for the remote collaborators.
//!
//! Each collaborator runs as its own HTTP service. [`ServiceClient`] speaks
//! the JSON protocol of all of them; one instance is created per base URL
//! and used through the matching trait.
//!
//! | Trait | Method | Path |
//! |---|---|---|
//! | strategy | GET | `plans/{plan_id}` |
//! | ledger | GET | `users/{user}/utxos` |
//! | ledger | POST | `users/{user}/transactions` |
//! | ledger | GET | `users/{user}/transactions` |
//! | ledger | PUT | `users/{user}/positions/{venue}/{source_txid}` |
//! | ledger | POST / DELETE | `utxos/{txid}:{vout}/spend` |
//! | ledger | GET | `users/{user}/portfolio` |
//! | price | GET | `price/btc` |
//! | signer | POST | `keys/sign` |
//! | signer | POST | `keys/public` |

use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::{OutPoint, PublicKey, Txid};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{CoreError, RpcError};
use crate::services::{LedgerProvider, PriceFeed, StrategyProvider};
use crate::signing::{KeyRef, OracleSignature, SigningOracle};
use crate::types::{Plan, PlanId, Portfolio, Position, TxRecord, UserId, Utxo};

/// JSON client for one collaborator service.
pub struct ServiceClient {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ServiceClient {
    /// `token` is sent as a bearer token on every request.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, CoreError> {
        let base = Url::parse(base_url)
            .map_err(|e| CoreError::InputValidation(format!("invalid service url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(CoreError::InputValidation(format!(
                "service url {base_url} cannot carry a path"
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(RpcError::Transport)?;

        Ok(Self {
            client,
            base,
            token,
        })
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, CoreError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| CoreError::Internal(format!("service url {} has no path", self.base)))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        resource: Resource<'_>,
    ) -> Result<String, CoreError> {
        debug!(%method, %url, "service request");
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(RpcError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(RpcError::Transport)?;
        trace!(%status, body = %text, "service response");
        if status.is_success() {
            Ok(text)
        } else {
            Err(status_error(status, &text, resource))
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        resource: Resource<'_>,
    ) -> Result<T, CoreError> {
        let url = self.endpoint(segments)?;
        let text = self
            .send::<()>(Method::GET, url, None, resource)
            .await?;
        decode(&text)
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
        resource: Resource<'_>,
    ) -> Result<String, CoreError> {
        let url = self.endpoint(segments)?;
        self.send(method, url, Some(body), resource).await
    }
}

/// What a request addresses, for `NotFound` reporting.
#[derive(Clone, Copy)]
struct Resource<'a> {
    kind: &'static str,
    id: &'a str,
}

fn resource<'a>(kind: &'static str, id: &'a str) -> Resource<'a> {
    Resource { kind, id }
}

fn status_error(status: StatusCode, body: &str, resource: Resource<'_>) -> CoreError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    match status {
        StatusCode::NOT_FOUND => CoreError::not_found(resource.kind, resource.id),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CoreError::Unauthorized(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            CoreError::InputValidation(detail)
        }
        _ => CoreError::Internal(detail),
    }
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CoreError> {
    serde_json::from_str(text)
        .map_err(|e| RpcError::InvalidResponse(format!("undecodable service response: {e}")).into())
}

fn outpoint_segment(outpoint: &OutPoint) -> String {
    format!("{}:{}", outpoint.txid, outpoint.vout)
}

// ==============================================================================
// Wire Types
// ==============================================================================

#[derive(Serialize)]
struct SpendRequest<'a> {
    spending_txid: &'a Txid,
}

#[derive(Deserialize)]
struct PriceResponse {
    price: f64,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    /// Lowercase hex of the 32-byte digest.
    message_hash: String,
    key: &'a KeyRef,
}

#[derive(Deserialize)]
struct SignResponse {
    r: String,
    s: String,
    recovery_id: u8,
}

impl SignResponse {
    fn into_signature(self) -> Result<OracleSignature, CoreError> {
        let scalar = |name: &str, hex: &str| {
            <[u8; 32]>::from_hex(hex).map_err(|e| {
                CoreError::from(RpcError::InvalidResponse(format!(
                    "signature component {name} is not 32 hex bytes: {e}"
                )))
            })
        };
        if self.recovery_id > 3 {
            return Err(RpcError::InvalidResponse(format!(
                "recovery id {} out of range",
                self.recovery_id
            ))
            .into());
        }
        Ok(OracleSignature {
            r: scalar("r", &self.r)?,
            s: scalar("s", &self.s)?,
            recovery_id: self.recovery_id,
        })
    }
}

#[derive(Deserialize)]
struct PublicKeyResponse {
    public_key: PublicKey,
}

// ==============================================================================
// Collaborator Implementations
// ==============================================================================

#[async_trait]
impl StrategyProvider for ServiceClient {
    async fn get_plan(&self, plan_id: &PlanId) -> Result<Plan, CoreError> {
        self.get_json(&["plans", plan_id.as_str()], resource("plan", plan_id.as_str()))
            .await
    }
}

#[async_trait]
impl LedgerProvider for ServiceClient {
    async fn get_utxos(&self, user: &UserId) -> Result<Vec<Utxo>, CoreError> {
        self.get_json(&["users", user.as_str(), "utxos"], resource("user", user.as_str()))
            .await
    }

    async fn record_transaction(&self, user: &UserId, record: &TxRecord) -> Result<(), CoreError> {
        self.send_json(
            Method::POST,
            &["users", user.as_str(), "transactions"],
            record,
            resource("user", user.as_str()),
        )
        .await
        .map(drop)
    }

    async fn update_position(&self, user: &UserId, position: &Position) -> Result<(), CoreError> {
        let source = position.source_txid.to_string();
        self.send_json(
            Method::PUT,
            &["users", user.as_str(), "positions", &position.venue, &source],
            position,
            resource("user", user.as_str()),
        )
        .await
        .map(drop)
    }

    async fn mark_utxo_spent(&self, outpoint: &OutPoint, spending_txid: &Txid) -> Result<(), CoreError> {
        let id = outpoint_segment(outpoint);
        self.send_json(
            Method::POST,
            &["utxos", &id, "spend"],
            &SpendRequest { spending_txid },
            resource("utxo", &id),
        )
        .await
        .map(drop)
    }

    async fn mark_utxo_unspent(&self, outpoint: &OutPoint) -> Result<(), CoreError> {
        let id = outpoint_segment(outpoint);
        let url = self.endpoint(&["utxos", &id, "spend"])?;
        self.send::<()>(Method::DELETE, url, None, resource("utxo", &id))
            .await
            .map(drop)
    }

    async fn get_portfolio(&self, user: &UserId) -> Result<Portfolio, CoreError> {
        self.get_json(&["users", user.as_str(), "portfolio"], resource("user", user.as_str()))
            .await
    }

    async fn get_transaction_history(&self, user: &UserId) -> Result<Vec<TxRecord>, CoreError> {
        self.get_json(
            &["users", user.as_str(), "transactions"],
            resource("user", user.as_str()),
        )
        .await
    }
}

#[async_trait]
impl PriceFeed for ServiceClient {
    async fn btc_price(&self) -> Result<f64, CoreError> {
        let response: PriceResponse = self
            .get_json(&["price", "btc"], resource("price", "btc"))
            .await?;
        if !response.price.is_finite() || response.price <= 0.0 {
            return Err(RpcError::InvalidResponse(format!(
                "price feed returned {}",
                response.price
            ))
            .into());
        }
        Ok(response.price)
    }
}

#[async_trait]
impl SigningOracle for ServiceClient {
    async fn sign(&self, message_hash: [u8; 32], key: &KeyRef) -> Result<OracleSignature, CoreError> {
        let id = key.key_id.clone();
        let text = self
            .send_json(
                Method::POST,
                &["keys", "sign"],
                &SignRequest {
                    message_hash: message_hash.as_slice().to_lower_hex_string(),
                    key,
                },
                resource("key", &id),
            )
            .await?;
        decode::<SignResponse>(&text)?.into_signature()
    }

    async fn public_key(&self, key: &KeyRef) -> Result<PublicKey, CoreError> {
        let text = self
            .send_json(Method::POST, &["keys", "public"], key, resource("key", &key.key_id))
            .await?;
        Ok(decode::<PublicKeyResponse>(&text)?.public_key)
    }
}
