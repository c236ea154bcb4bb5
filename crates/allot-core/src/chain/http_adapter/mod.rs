//! Bitcoin Core JSON-RPC chain backend.
//!
//! Implements [`ChainBackend`](super::ChainBackend) over JSON-RPC using
//! `reqwest`, with basic or cookie auth, optional request rate limiting,
//! batched status queries and an LRU block-height cache.

mod client;
mod connection;
mod parsing;
mod protocol;

pub use client::RpcChainBackend;
