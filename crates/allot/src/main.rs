mod cli;
mod server;

use std::sync::Arc;
use std::time::Duration;

use bitcoin::hex::DisplayHex;
use bitcoin::Amount;
use clap::Parser;
use eyre::{eyre, WrapErr};

use allot_core::builder::{BuildParams, VenueBook};
use allot_core::chain::{ChainBackend, RpcChainBackend};
use allot_core::monitor::{Monitor, MonitorConfig};
use allot_core::remote::ServiceClient;
use allot_core::services::LogNotifier;
use allot_core::signing::{SigningPolicy, SigningService};
use allot_core::store::StateStore;
use allot_core::{Executor, ExecutorConfig, Services};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let api_token = match &args.api_token {
        Some(token) => token.clone(),
        None => {
            use rand::Rng;
            let bytes: [u8; 16] = rand::thread_rng().r#gen();
            bytes.as_slice().to_lower_hex_string()
        }
    };

    let chain: Arc<dyn ChainBackend> = Arc::new(
        RpcChainBackend::new(
            &args.rpc_url,
            args.rpc_user.as_deref(),
            args.rpc_pass.as_deref(),
            args.rpc_cookie_file.as_deref(),
            args.rpc_requests_per_second,
            args.rpc_batch_chunk_size,
        )
        .wrap_err("configure Bitcoin Core RPC backend")?,
    );

    let store = Arc::new(match &args.state_file {
        Some(path) => {
            let store = StateStore::open(path)
                .await
                .wrap_err_with(|| format!("load execution state from {}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded execution state");
            store
        }
        None => {
            tracing::warn!("no --state-file given; execution state is kept in memory only");
            StateStore::in_memory()
        }
    });

    let token = args.service_token.clone();
    let client = |url: &str, what: &str| {
        ServiceClient::new(url, token.clone())
            .map(Arc::new)
            .wrap_err_with(|| format!("configure {what} client"))
    };
    let strategy = client(&args.strategy_url, "strategy service")?;
    let ledger = client(&args.ledger_url, "ledger service")?;
    let prices = client(&args.price_url, "price feed")?;
    let oracle = client(&args.signer_url, "signing oracle")?;

    let mut venues = VenueBook::new();
    for (name, address) in &args.venues {
        venues
            .insert(name, address)
            .wrap_err_with(|| format!("register venue {name}"))?;
    }
    if venues.is_empty() {
        tracing::warn!("no venues configured; every plan will fail to resolve");
    }

    let signer = Arc::new(SigningService::new(
        oracle,
        store.clone(),
        SigningPolicy {
            network: args.network,
            key_id: args.key_id.clone(),
            max_transaction_amount: Amount::from_sat(args.max_tx_sats),
            ..SigningPolicy::default()
        },
    ));
    let monitor = Arc::new(Monitor::new(
        chain,
        store.clone(),
        MonitorConfig {
            required_confirmations: args.required_confirmations,
            staleness_secs: args.staleness_secs,
            retention_secs: args.retention_secs,
        },
    ));

    let executor = Arc::new(Executor::new(
        Services {
            strategy,
            ledger,
            prices,
            notifier: Arc::new(LogNotifier),
            signer,
            monitor,
            store,
            venues,
        },
        ExecutorConfig {
            build: BuildParams {
                network: args.network,
                sat_per_byte: args.fee_rate,
                strategy: args.selection,
                min_confirmations: args.min_utxo_confirmations,
            },
        },
    ));

    if args.poll_interval_secs == 0 {
        return Err(eyre!("--poll-interval-secs must be at least 1"));
    }
    let poller = tokio::spawn(poll_loop(
        executor.clone(),
        Duration::from_secs(args.poll_interval_secs),
    ));

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let origin = format!("http://{}:{}", args.bind, args.port);
    let router = server::build_router(
        server::AppState {
            executor: executor.clone(),
            api_token: api_token.clone(),
        },
        &origin,
    );

    if args.bind == "0.0.0.0" {
        tracing::warn!("server is bound to 0.0.0.0 and reachable from the network");
    }

    println!();
    println!("  Allot is running:");
    println!("    API:       http://{bind_addr}/api/v1");
    if args.api_token.is_none() {
        println!("    Token:     {api_token}");
    }
    println!();

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context("bind TCP listener")?;

    tracing::info!(network = %args.network, "listening on {bind_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("run HTTP server")?;

    poller.abort();
    executor.checkpoint().await;
    tracing::info!("execution state flushed; shutting down");

    Ok(())
}

/// Drive confirmation polling and monitoring cleanup until aborted.
async fn poll_loop(executor: Arc<Executor>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match executor.poll_transaction_statuses().await {
            Ok(statuses) => {
                tracing::debug!(monitored = statuses.len(), "poll complete");
            }
            Err(e) => tracing::warn!(error = %e, "poll failed"),
        }
        executor.cleanup().await;
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
