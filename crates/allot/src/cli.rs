use std::path::PathBuf;

use allot_core::builder::SelectionStrategy;
use bitcoin::Network;
use clap::Parser;

/// Allot: executes approved Bitcoin allocation plans through a remote signing
/// oracle and reconciles them into the portfolio ledger.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Bitcoin network the plans execute on (bitcoin, testnet, signet, regtest).
    #[arg(long, default_value = "bitcoin", env = "ALLOT_NETWORK")]
    pub network: Network,

    /// Bitcoin Core RPC URL.
    #[arg(long, default_value = "http://127.0.0.1:8332", env = "ALLOT_RPC_URL")]
    pub rpc_url: String,

    /// RPC username.
    #[arg(long, env = "ALLOT_RPC_USER")]
    pub rpc_user: Option<String>,

    /// RPC password.
    #[arg(long, env = "ALLOT_RPC_PASS")]
    pub rpc_pass: Option<String>,

    /// Bitcoin Core cookie file, used when no user/password is given.
    #[arg(long, env = "ALLOT_RPC_COOKIE_FILE")]
    pub rpc_cookie_file: Option<PathBuf>,

    /// Maximum outbound RPC requests per second. Unlimited when omitted.
    #[arg(long, env = "ALLOT_RPC_REQUESTS_PER_SECOND")]
    pub rpc_requests_per_second: Option<u32>,

    /// Maximum number of calls per JSON-RPC batch.
    #[arg(long, default_value = "100", env = "ALLOT_RPC_BATCH_CHUNK_SIZE")]
    pub rpc_batch_chunk_size: usize,

    /// Base URL of the strategy service.
    #[arg(long, env = "ALLOT_STRATEGY_URL")]
    pub strategy_url: String,

    /// Base URL of the ledger and portfolio service.
    #[arg(long, env = "ALLOT_LEDGER_URL")]
    pub ledger_url: String,

    /// Base URL of the price feed.
    #[arg(long, env = "ALLOT_PRICE_URL")]
    pub price_url: String,

    /// Base URL of the threshold-signing oracle.
    #[arg(long, env = "ALLOT_SIGNER_URL")]
    pub signer_url: String,

    /// Bearer token sent to the collaborator services.
    #[arg(long, env = "ALLOT_SERVICE_TOKEN")]
    pub service_token: Option<String>,

    /// Oracle key id all user keys are derived from.
    #[arg(long, default_value = "allot-key-1", env = "ALLOT_KEY_ID")]
    pub key_id: String,

    /// Venue deposit address as `name=address` (repeatable).
    #[arg(long = "venue", value_parser = parse_venue, env = "ALLOT_VENUES", value_delimiter = ',')]
    pub venues: Vec<(String, String)>,

    /// Fee rate in sat/byte.
    #[arg(long, default_value = "10", env = "ALLOT_FEE_RATE")]
    pub fee_rate: u64,

    /// UTXO selection strategy (largest-first, smallest-first, optimal).
    #[arg(long, default_value = "optimal", env = "ALLOT_SELECTION")]
    pub selection: SelectionStrategy,

    /// Minimum confirmations for a UTXO to be spendable.
    #[arg(long, default_value = "1", env = "ALLOT_MIN_UTXO_CONFIRMATIONS")]
    pub min_utxo_confirmations: u32,

    /// Confirmations after which a transaction is reconciled.
    #[arg(long, default_value = "6", env = "ALLOT_REQUIRED_CONFIRMATIONS")]
    pub required_confirmations: u32,

    /// Largest transaction the signer will authorize, in satoshis.
    #[arg(long, default_value = "1000000000", env = "ALLOT_MAX_TX_SATS")]
    pub max_tx_sats: u64,

    /// Seconds a cached confirmation status is served without a refresh.
    #[arg(long, default_value = "60", env = "ALLOT_STALENESS_SECS")]
    pub staleness_secs: u64,

    /// Seconds a confirmed transaction stays monitored.
    #[arg(long, default_value = "86400", env = "ALLOT_RETENTION_SECS")]
    pub retention_secs: u64,

    /// Seconds between confirmation polls.
    #[arg(long, default_value = "30", env = "ALLOT_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: u64,

    /// JSON file execution state is persisted to. In-memory only if omitted.
    #[arg(long, env = "ALLOT_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Address to bind the HTTP API to.
    #[arg(long, default_value = "127.0.0.1", env = "ALLOT_BIND")]
    pub bind: String,

    /// Port to listen on.
    #[arg(long, default_value = "3080", env = "ALLOT_PORT")]
    pub port: u16,

    /// Token required in `X-API-Token`. A random one is generated if omitted.
    #[arg(long, env = "ALLOT_API_TOKEN")]
    pub api_token: Option<String>,
}

fn parse_venue(s: &str) -> Result<(String, String), String> {
    let (name, address) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=address, got `{s}`"))?;
    let (name, address) = (name.trim(), address.trim());
    if name.is_empty() || address.is_empty() {
        return Err(format!("venue name and address must not be empty in `{s}`"));
    }
    Ok((name.to_owned(), address.to_owned()))
}
