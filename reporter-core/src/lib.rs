//! Rivine Reporter Core
//!
//! Follows a Rivine chain through its explorer and maintains derived
//! views: per-address balances and per-transaction statistics.
//!
//! # Architecture
//!
//! - **Scanner**: One producer walks block heights in order, backing off
//!   while the next block is not produced yet
//! - **Recorders**: Consumers invoked sequentially for every block
//! - **Single Writer**: The ledger merges one block at a time
//! - **Atomic Blocks**: A block is applied in full or not at all
//!
//! # Invariants
//!
//! - Blocks reach every recorder in increasing height order, none skipped
//! - A failing block leaves the ledger untouched and halts ingestion
//! - The resume height always points past the last fully applied block

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod condition;
pub mod config;
pub mod error;
pub mod explorer;
pub mod ledger;
pub mod metrics;
pub mod recorder;
pub mod runner;
pub mod scanner;
pub mod stats;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use condition::resolve;
pub use config::Config;
pub use error::{Error, Position, Result};
pub use explorer::{ExplorerClient, HttpExplorer};
pub use ledger::{LedgerAggregator, LedgerRecorder};
pub use metrics::Metrics;
pub use recorder::Recorder;
pub use runner::{RunSummary, Runner};
pub use scanner::{BlockStream, ChainScanner, Timer, TokioTimer};
pub use stats::{JsonLinesSink, MemorySink, Period, StatsRecorder, StatsSink};
pub use storage::RocksStore;
pub use store::{BalanceBatch, BalanceStore, MemoryStore};
pub use types::{Address, Amount, Block, Output, SpendingCondition, Transaction};
