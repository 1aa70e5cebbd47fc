//! JSON-RPC access to a `bitcoind` node.

pub mod client;
pub mod error;
pub mod types;

pub use client::BitcoinClient;
