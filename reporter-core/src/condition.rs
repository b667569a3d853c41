//! Spending condition resolution
//!
//! Maps a [`SpendingCondition`] to the addresses credited (or debited) with
//! the value it guards. Resolution is used for attribution only, never to
//! decide whether an output can be spent.
//!
//! | Condition        | Beneficiaries                          |
//! |------------------|----------------------------------------|
//! | `DirectAddress`  | the address                            |
//! | `TimeLocked`     | beneficiaries of the wrapped condition |
//! | `MultiSignature` | every listed address, full value each  |
//! | `AtomicSwap`     | none, the redeeming transaction counts |
//! | `Bearer`         | none, the claiming transaction counts  |
//! | `Unrecognized`   | error                                  |

use crate::{types::Address, types::SpendingCondition, Error, Result};

/// Maximum condition nesting accepted by [`resolve`]
pub const MAX_CONDITION_DEPTH: usize = 16;

/// Resolve a condition into its beneficiaries, in source order.
///
/// An empty result is a deliberate no-op (bearer and atomic swap outputs),
/// not a failure. Duplicates in a multi-signature set are kept.
pub fn resolve(condition: &SpendingCondition) -> Result<Vec<Address>> {
    let mut addresses = Vec::new();
    resolve_into(condition, 0, &mut addresses)?;
    Ok(addresses)
}

fn resolve_into(
    condition: &SpendingCondition,
    depth: usize,
    addresses: &mut Vec<Address>,
) -> Result<()> {
    if depth >= MAX_CONDITION_DEPTH {
        return Err(Error::MalformedCondition {
            depth: MAX_CONDITION_DEPTH,
        });
    }

    match condition {
        SpendingCondition::DirectAddress(address) => addresses.push(address.clone()),
        SpendingCondition::TimeLocked { inner, .. } => resolve_into(inner, depth + 1, addresses)?,
        SpendingCondition::MultiSignature { addresses: set, .. } => {
            addresses.extend(set.iter().cloned())
        }
        SpendingCondition::AtomicSwap(_) | SpendingCondition::Bearer => {}
        SpendingCondition::Unrecognized(tag) => {
            return Err(Error::UnsupportedCondition { tag: *tag })
        }
    }

    Ok(())
}
