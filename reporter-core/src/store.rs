//! Balance store contract and the in-process implementation
//!
//! A balance store is a durable `address -> balance` mapping. Besides point
//! reads and writes it answers value-ordered range queries (richest first)
//! and keeps the resume height, i.e. the next block height that has not
//! been merged yet.

use crate::{types::Address, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

/// Absolute balances produced by one block, written as a unit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BalanceBatch {
    /// Height of the block the balances settle
    pub height: u64,
    /// New balances, one entry per address
    pub balances: Vec<(Address, Decimal)>,
}

/// Durable address -> balance mapping
pub trait BalanceStore: Send + Sync {
    /// Balance of `address`, zero when unknown
    fn get(&self, address: &Address) -> Result<Decimal>;

    /// Overwrite the balance of `address`
    fn set(&self, address: &Address, value: Decimal) -> Result<()>;

    /// Addresses holding at least `min_value`, ordered by balance
    /// descending (ties by address), skipping `offset` and returning at
    /// most `limit` entries
    fn range(&self, min_value: Decimal, offset: usize, limit: usize)
        -> Result<Vec<(Address, Decimal)>>;

    /// Next height to merge, if any block was committed
    fn next_height(&self) -> Result<Option<u64>>;

    /// Record the next height to merge
    fn set_next_height(&self, height: u64) -> Result<()>;

    /// Write all balances of `batch` and advance the resume height past it.
    ///
    /// The default writes entry by entry; callers relying on it must keep
    /// a single writer and must not expose the store to readers mid-batch.
    fn commit(&self, batch: &BalanceBatch) -> Result<()> {
        for (address, value) in &batch.balances {
            self.set(address, *value)?;
        }
        self.set_next_height(batch.height + 1)
    }
}

#[derive(Default)]
struct MemoryState {
    balances: HashMap<Address, Decimal>,
    by_value: BTreeSet<(Reverse<Decimal>, Address)>,
    next_height: Option<u64>,
}

impl MemoryState {
    fn put(&mut self, address: &Address, value: Decimal) {
        if let Some(old) = self.balances.insert(address.clone(), value) {
            self.by_value.remove(&(Reverse(old), address.clone()));
        }
        self.by_value.insert((Reverse(value), address.clone()));
    }
}

/// Mutex-guarded in-memory balance store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known addresses
    pub fn len(&self) -> usize {
        self.state.read().balances.len()
    }

    /// True when no address is known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of all balances
    pub fn total(&self) -> Decimal {
        self.state.read().balances.values().copied().sum()
    }
}

impl BalanceStore for MemoryStore {
    fn get(&self, address: &Address) -> Result<Decimal> {
        Ok(self
            .state
            .read()
            .balances
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    fn set(&self, address: &Address, value: Decimal) -> Result<()> {
        self.state.write().put(address, value);
        Ok(())
    }

    fn range(
        &self,
        min_value: Decimal,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Address, Decimal)>> {
        let state = self.state.read();
        Ok(state
            .by_value
            .iter()
            .take_while(|(Reverse(value), _)| *value >= min_value)
            .skip(offset)
            .take(limit)
            .map(|(Reverse(value), address)| (address.clone(), *value))
            .collect())
    }

    fn next_height(&self) -> Result<Option<u64>> {
        Ok(self.state.read().next_height)
    }

    fn set_next_height(&self, height: u64) -> Result<()> {
        self.state.write().next_height = Some(height);
        Ok(())
    }

    fn commit(&self, batch: &BalanceBatch) -> Result<()> {
        let mut state = self.state.write();
        for (address, value) in &batch.balances {
            state.put(address, *value);
        }
        state.next_height = Some(batch.height + 1);
        Ok(())
    }
}
