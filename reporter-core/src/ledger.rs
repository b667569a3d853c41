//! Balance ledger aggregation
//!
//! Applies blocks to a [`BalanceStore`]: every miner payout and coin output
//! credits its beneficiaries, every coin input debits them. A block's deltas
//! are computed in full before anything is written, then merged in a single
//! [`BalanceStore::commit`], so a failing block leaves the ledger untouched.
//!
//! # Example
//!
//! ```no_run
//! use reporter_core::{Block, LedgerAggregator, MemoryStore};
//! use std::sync::Arc;
//!
//! fn main() -> reporter_core::Result<()> {
//!     let ledger = LedgerAggregator::new(Arc::new(MemoryStore::new()));
//!     ledger.apply_block(&Block::new(0, 0))?;
//!     Ok(())
//! }
//! ```

use crate::{
    condition,
    error::Position,
    metrics::Metrics,
    recorder::Recorder,
    store::{BalanceBatch, BalanceStore},
    types::{Address, Block, Output},
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Signed balance changes of one block
pub type Deltas = BTreeMap<Address, Decimal>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Credit,
    Debit,
}

/// Merges blocks into a balance store
pub struct LedgerAggregator {
    store: Arc<dyn BalanceStore>,

    /// Single writer: one block's merge completes before the next starts
    writer: Mutex<()>,

    metrics: Option<Metrics>,
}

impl LedgerAggregator {
    /// Create aggregator over `store`
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        Self {
            store,
            writer: Mutex::new(()),
            metrics: None,
        }
    }

    /// Report applied blocks to `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn BalanceStore> {
        &self.store
    }

    /// Compute the balance changes of `block` without touching the store
    pub fn deltas(block: &Block) -> Result<Deltas> {
        let mut deltas = Deltas::new();

        for (index, payout) in block.miner_payouts.iter().enumerate() {
            accumulate(&mut deltas, payout, Direction::Credit)
                .map_err(|e| e.at(block.height, Position::MinerPayout { index }))?;
        }

        for (transaction, tx) in block.transactions.iter().enumerate() {
            for (index, output) in tx.coin_outputs.iter().enumerate() {
                accumulate(&mut deltas, output, Direction::Credit).map_err(|e| {
                    e.at(block.height, Position::CoinOutput { transaction, index })
                })?;
            }
            for (index, input) in tx.coin_inputs.iter().enumerate() {
                accumulate(&mut deltas, input, Direction::Debit).map_err(|e| {
                    e.at(block.height, Position::CoinInput { transaction, index })
                })?;
            }
        }

        Ok(deltas)
    }

    /// Apply `block` to the store.
    ///
    /// Not idempotent: applying the same block twice applies its deltas
    /// twice. Callers track the resume height.
    pub fn apply_block(&self, block: &Block) -> Result<()> {
        let start = Instant::now();
        let deltas = Self::deltas(block)?;

        let _guard = self.writer.lock();

        let mut batch = BalanceBatch {
            height: block.height,
            balances: Vec::with_capacity(deltas.len()),
        };
        for (address, delta) in deltas {
            let current = self.store.get(&address)?;
            let value = current.checked_add(delta).ok_or_else(|| Error::Overflow {
                address: address.to_string(),
            })?;
            batch.balances.push((address, value));
        }

        self.store.commit(&batch)?;

        let elapsed = start.elapsed().as_secs_f64();
        if let Some(metrics) = &self.metrics {
            metrics.record_block_applied(batch.balances.len(), elapsed);
        }

        tracing::debug!(
            height = block.height,
            addresses = batch.balances.len(),
            transactions = block.transactions.len(),
            "Block applied"
        );

        Ok(())
    }

    /// Next height to apply, as persisted by the store
    pub fn next_height(&self) -> Result<Option<u64>> {
        self.store.next_height()
    }
}

fn accumulate(deltas: &mut Deltas, output: &Output, direction: Direction) -> Result<()> {
    // Parse and resolve fully before the map is touched
    let value = output.value.parse()?;
    let beneficiaries = condition::resolve(&output.condition)?;

    let amount = match direction {
        Direction::Credit => value,
        Direction::Debit => -value,
    };

    for address in beneficiaries {
        let current = deltas.get(&address).copied().unwrap_or(Decimal::ZERO);
        let next = current.checked_add(amount).ok_or_else(|| Error::Overflow {
            address: address.to_string(),
        })?;
        deltas.insert(address, next);
    }

    Ok(())
}

/// [`Recorder`] feeding a [`LedgerAggregator`]
pub struct LedgerRecorder {
    ledger: Arc<LedgerAggregator>,
}

impl LedgerRecorder {
    /// Wrap `ledger`
    pub fn new(ledger: Arc<LedgerAggregator>) -> Self {
        Self { ledger }
    }

    /// Wrapped aggregator
    pub fn ledger(&self) -> &Arc<LedgerAggregator> {
        &self.ledger
    }
}

#[async_trait]
impl Recorder for LedgerRecorder {
    fn name(&self) -> &str {
        "ledger"
    }

    async fn record(&self, block: &Block) -> Result<()> {
        let ledger = self.ledger.clone();
        let block = block.clone();
        // Store access is synchronous
        tokio::task::spawn_blocking(move || ledger.apply_block(&block))
            .await
            .map_err(|e| Error::Concurrency(format!("Ledger task failed: {}", e)))?
    }

    async fn next_height(&self) -> Result<Option<u64>> {
        let ledger = self.ledger.clone();
        tokio::task::spawn_blocking(move || ledger.next_height())
            .await
            .map_err(|e| Error::Concurrency(format!("Ledger task failed: {}", e)))?
    }
}
