//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Value conservation: Σ(deltas) == Σ(credits) - Σ(debits)
//! - Time locks never change attribution
//! - Multi-signature sets are resolved as listed
//! - Range queries are ordered by value

use proptest::prelude::*;
use reporter_core::{
    resolve, Address, BalanceStore, Block, LedgerAggregator, MemoryStore, Output,
    SpendingCondition, Transaction,
};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Strategy for generating amounts (non-negative, two decimals)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..1_000_000_00i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Strategy for generating addresses from a small pool so entries collide
fn address_strategy() -> impl Strategy<Value = Address> {
    "0[1-6]".prop_map(Address::new)
}

/// Strategy for generating direct-address outputs
fn output_strategy() -> impl Strategy<Value = (Address, Decimal)> {
    (address_strategy(), amount_strategy())
}

fn to_output((address, value): &(Address, Decimal)) -> Output {
    Output::to_address(value.to_string(), address.as_str())
}

/// Strategy for generating blocks made of direct-address outputs only
fn block_strategy() -> impl Strategy<Value = Block> {
    (
        prop::collection::vec(output_strategy(), 0..4),
        prop::collection::vec(
            (
                prop::collection::vec(output_strategy(), 0..5),
                prop::collection::vec(output_strategy(), 0..5),
            ),
            0..6,
        ),
    )
        .prop_map(|(payouts, transactions)| {
            let mut block = Block::new(1, 0);
            block.miner_payouts = payouts.iter().map(to_output).collect();
            block.transactions = transactions
                .iter()
                .map(|(inputs, outputs)| Transaction {
                    coin_inputs: inputs.iter().map(to_output).collect(),
                    coin_outputs: outputs.iter().map(to_output).collect(),
                    ..Default::default()
                })
                .collect();
            block
        })
}

fn total(outputs: &[Output]) -> Decimal {
    outputs.iter().map(|o| o.value.parse().unwrap()).sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: deltas of a direct-address block conserve value exactly
    #[test]
    fn prop_deltas_conserve_value(block in block_strategy()) {
        let deltas = LedgerAggregator::deltas(&block).unwrap();

        let credits = total(&block.miner_payouts)
            + block.transactions.iter().map(|tx| total(&tx.coin_outputs)).sum::<Decimal>();
        let debits: Decimal = block.transactions.iter().map(|tx| total(&tx.coin_inputs)).sum();

        prop_assert_eq!(deltas.values().copied().sum::<Decimal>(), credits - debits);
    }

    /// Property: a fresh store ends up holding exactly the block deltas
    #[test]
    fn prop_apply_matches_deltas(block in block_strategy()) {
        let store = Arc::new(MemoryStore::new());
        let ledger = LedgerAggregator::new(store.clone());
        let deltas = LedgerAggregator::deltas(&block).unwrap();

        ledger.apply_block(&block).unwrap();

        for (address, delta) in &deltas {
            prop_assert_eq!(store.get(address).unwrap(), *delta);
        }
        prop_assert_eq!(store.len(), deltas.len());
        prop_assert_eq!(store.next_height().unwrap(), Some(2));
    }

    /// Property: a time lock resolves to its inner address for any lock time
    #[test]
    fn prop_timelock_resolves_inner(lock_time in any::<i64>(), address in address_strategy()) {
        let condition = SpendingCondition::TimeLocked {
            lock_time,
            inner: Box::new(SpendingCondition::DirectAddress(address.clone())),
        };
        prop_assert_eq!(resolve(&condition).unwrap(), vec![address]);
    }

    /// Property: multi-signature resolution preserves order and duplicates
    #[test]
    fn prop_multisig_resolves_all(
        addresses in prop::collection::vec(address_strategy(), 1..8),
        threshold in 1u64..8,
    ) {
        let condition = SpendingCondition::MultiSignature {
            addresses: addresses.clone(),
            threshold,
        };
        prop_assert_eq!(resolve(&condition).unwrap(), addresses);
    }

    /// Property: range results are sorted by value descending
    #[test]
    fn prop_range_is_ordered(entries in prop::collection::vec(output_strategy(), 0..30)) {
        let store = MemoryStore::new();
        for (address, value) in &entries {
            store.set(address, *value).unwrap();
        }

        let all = store.range(Decimal::MIN, 0, usize::MAX).unwrap();
        prop_assert_eq!(all.len(), store.len());
        for pair in all.windows(2) {
            prop_assert!(
                pair[0].1 > pair[1].1 || (pair[0].1 == pair[1].1 && pair[0].0 < pair[1].0)
            );
        }
    }
}
