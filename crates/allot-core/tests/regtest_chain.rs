use std::sync::Once;
use std::{env, fs};

use allot_core::chain::{ChainBackend, RpcChainBackend};
use allot_core::CoreError;
use bitcoin::hashes::Hash;
use bitcoin::{absolute, transaction, Transaction, Txid};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("allot_core=debug")),
            )
            .with_target(true)
            .try_init();
    });
}

fn backend() -> RpcChainBackend {
    let rpc_url = env::var("ALLOT_TEST_RPC_URL").expect("ALLOT_TEST_RPC_URL must be set");
    let rpc_user = env::var("ALLOT_TEST_RPC_USER").expect("ALLOT_TEST_RPC_USER must be set");
    let rpc_pass = env::var("ALLOT_TEST_RPC_PASS").expect("ALLOT_TEST_RPC_PASS must be set");
    RpcChainBackend::new(&rpc_url, Some(&rpc_user), Some(&rpc_pass), None, None, 10)
        .expect("rpc backend must construct")
}

fn fixture_txids() -> Vec<Txid> {
    let txids_file = env::var("ALLOT_TEST_TXIDS_FILE").expect("ALLOT_TEST_TXIDS_FILE must be set");
    let raw = fs::read_to_string(&txids_file).expect("txid fixture file must be readable");
    let txids: Vec<Txid> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.parse().expect("fixture txid must parse"))
        .collect();
    assert!(!txids.is_empty(), "fixture txid list must not be empty");
    txids
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires local regtest bitcoind with -txindex and confirmed fixture transactions"]
async fn regtest_confirmed_transactions_report_depth_and_height() {
    init_tracing();
    let chain = backend();
    let txids = fixture_txids();

    eprintln!("[itest] querying {} fixture transactions", txids.len());
    let mut sequential = Vec::new();
    for txid in &txids {
        let status = chain
            .query_status(txid)
            .await
            .expect("fixture transaction must be found");
        assert!(status.confirmations >= 1, "fixture {txid} must be confirmed");
        assert!(status.block_hash.is_some());
        assert!(status.block_height.is_some());
        sequential.push(status);
    }

    let batched = chain.query_statuses(&txids).await;
    assert_eq!(batched.len(), txids.len());
    for (batch, single) in batched.into_iter().zip(&sequential) {
        let batch = batch.expect("batched lookup must succeed");
        assert_eq!(batch.block_hash, single.block_hash);
        assert_eq!(batch.block_height, single.block_height);
        assert!(batch.confirmations >= single.confirmations);
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires local regtest bitcoind"]
async fn regtest_unknown_and_invalid_transactions() {
    init_tracing();
    let chain = backend();

    let unknown = Txid::from_byte_array([0x5a; 32]);
    assert!(matches!(
        chain.query_status(&unknown).await,
        Err(CoreError::NotFound { .. })
    ));

    let empty = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: Vec::new(),
        output: Vec::new(),
    };
    assert!(matches!(
        chain.submit(&empty).await,
        Err(CoreError::BroadcastFailure(_))
    ));
}
