//! Core types for the reporter
//!
//! Blocks are decoded from the explorer JSON into immutable values. Wire
//! structs stay private; the public types are what the ledger and the
//! statistics recorders consume.
//!
//! Monetary values keep their decimal text until the ledger parses them,
//! so a malformed value is reported with its block position instead of
//! failing the whole fetch.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger key (an unlock hash). Compared as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Create new address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Monetary value as transmitted by the explorer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amount(String);

impl Amount {
    /// Wrap raw decimal text
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Raw text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse into an exact decimal. Negative values are rejected.
    pub fn parse(&self) -> Result<Decimal> {
        let value = Decimal::from_str_exact(self.0.trim()).map_err(|e| Error::ValueParse {
            value: self.0.clone(),
            reason: e.to_string(),
        })?;
        if value.is_sign_negative() && !value.is_zero() {
            return Err(Error::ValueParse {
                value: self.0.clone(),
                reason: "value must not be negative".to_string(),
            });
        }
        Ok(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Text {
            Str(String),
            Num(serde_json::Number),
        }

        Ok(match Text::deserialize(deserializer)? {
            Text::Str(s) => Amount(s),
            Text::Num(n) => Amount(n.to_string()),
        })
    }
}

/// Atomic swap contract parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AtomicSwap {
    /// Party funding the swap
    pub sender: Address,
    /// Party that can redeem with the secret
    pub receiver: Address,
    /// Hash of the redeem secret
    #[serde(rename = "hashedsecret")]
    pub hashed_secret: String,
    /// Refund time lock
    #[serde(rename = "timelock")]
    pub time_lock: u64,
}

/// Rule describing who may claim an output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawCondition")]
pub enum SpendingCondition {
    /// Nil condition, anyone can claim it
    Bearer,
    /// Sole beneficiary
    DirectAddress(Address),
    /// Atomic swap placeholder
    AtomicSwap(AtomicSwap),
    /// Wrapper that delays spending of `inner`
    TimeLocked {
        /// Lock time (height or unix timestamp, irrelevant for attribution)
        lock_time: i64,
        /// Wrapped condition
        inner: Box<SpendingCondition>,
    },
    /// M-of-N multi-signature
    MultiSignature {
        /// Co-signers, in source order
        addresses: Vec<Address>,
        /// Minimum number of signatures
        threshold: u64,
    },
    /// Tag this build does not understand
    Unrecognized(u64),
}

impl SpendingCondition {
    /// Wire tag of the condition
    pub fn tag(&self) -> u64 {
        match self {
            SpendingCondition::Bearer => CONDITION_NIL,
            SpendingCondition::DirectAddress(_) => CONDITION_UNLOCK_HASH,
            SpendingCondition::AtomicSwap(_) => CONDITION_ATOMIC_SWAP,
            SpendingCondition::TimeLocked { .. } => CONDITION_TIME_LOCK,
            SpendingCondition::MultiSignature { .. } => CONDITION_MULTI_SIGNATURE,
            SpendingCondition::Unrecognized(tag) => *tag,
        }
    }
}

const CONDITION_NIL: u64 = 0;
const CONDITION_UNLOCK_HASH: u64 = 1;
const CONDITION_ATOMIC_SWAP: u64 = 2;
const CONDITION_TIME_LOCK: u64 = 3;
const CONDITION_MULTI_SIGNATURE: u64 = 4;

#[derive(Deserialize)]
struct RawCondition {
    // An omitted type is the nil condition
    #[serde(rename = "type", default)]
    kind: u64,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct UnlockHashData {
    unlockhash: Address,
}

#[derive(Deserialize)]
struct TimeLockData {
    locktime: i64,
    condition: SpendingCondition,
}

#[derive(Deserialize)]
struct MultiSignatureData {
    unlockhashes: Vec<Address>,
    minimumsignaturecount: u64,
}

impl TryFrom<RawCondition> for SpendingCondition {
    type Error = serde_json::Error;

    fn try_from(raw: RawCondition) -> std::result::Result<Self, Self::Error> {
        let condition = match raw.kind {
            CONDITION_NIL => SpendingCondition::Bearer,
            CONDITION_UNLOCK_HASH => {
                let data: UnlockHashData = serde_json::from_value(raw.data)?;
                SpendingCondition::DirectAddress(data.unlockhash)
            }
            CONDITION_ATOMIC_SWAP => SpendingCondition::AtomicSwap(serde_json::from_value(raw.data)?),
            CONDITION_TIME_LOCK => {
                let data: TimeLockData = serde_json::from_value(raw.data)?;
                SpendingCondition::TimeLocked {
                    lock_time: data.locktime,
                    inner: Box::new(data.condition),
                }
            }
            CONDITION_MULTI_SIGNATURE => {
                let data: MultiSignatureData = serde_json::from_value(raw.data)?;
                SpendingCondition::MultiSignature {
                    addresses: data.unlockhashes,
                    threshold: data.minimumsignaturecount,
                }
            }
            tag => SpendingCondition::Unrecognized(tag),
        };
        Ok(condition)
    }
}

/// Value paired with the condition controlling it.
///
/// Used both for created outputs and for the resolved source side of
/// consumed inputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawOutput")]
pub struct Output {
    /// Value
    pub value: Amount,
    /// Destination condition
    pub condition: SpendingCondition,
}

impl Output {
    /// Create new output
    pub fn new(value: impl Into<String>, condition: SpendingCondition) -> Self {
        Self {
            value: Amount::new(value),
            condition,
        }
    }

    /// Output paying `value` straight to `address`
    pub fn to_address(value: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(value, SpendingCondition::DirectAddress(Address::new(address)))
    }
}

#[derive(Deserialize)]
struct RawOutput {
    value: Amount,
    #[serde(default)]
    condition: Option<SpendingCondition>,
    #[serde(default)]
    unlockhash: Option<String>,
}

impl From<RawOutput> for Output {
    fn from(raw: RawOutput) -> Self {
        let condition = match (raw.condition, raw.unlockhash) {
            (Some(condition), _) => condition,
            // The nil unlock hash is all zeroes
            (None, Some(hash)) if hash.is_empty() || hash.bytes().all(|b| b == b'0') => {
                SpendingCondition::Bearer
            }
            (None, Some(hash)) => SpendingCondition::DirectAddress(Address::new(hash)),
            (None, None) => SpendingCondition::Bearer,
        };
        Output {
            value: raw.value,
            condition,
        }
    }
}

/// Transaction as exposed by the explorer
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "RawTransaction")]
pub struct Transaction {
    /// Transaction ID
    pub id: String,
    /// Transaction version
    pub version: u8,
    /// Funds created
    pub coin_outputs: Vec<Output>,
    /// Funds consumed, resolved to the outputs they spend
    pub coin_inputs: Vec<Output>,
    /// Miner fees
    pub miner_fees: Vec<Amount>,
}

#[derive(Deserialize)]
struct RawTransaction {
    #[serde(default)]
    id: String,
    #[serde(rename = "rawtransaction")]
    raw: RawTransactionBody,
    #[serde(rename = "coininputoutputs", default)]
    coin_inputs: Option<Vec<Output>>,
}

#[derive(Deserialize)]
struct RawTransactionBody {
    #[serde(default)]
    version: u8,
    #[serde(default)]
    data: RawTransactionData,
}

#[derive(Deserialize, Default)]
struct RawTransactionData {
    #[serde(rename = "coinoutputs", default)]
    coin_outputs: Option<Vec<Output>>,
    #[serde(rename = "minerfees", default)]
    miner_fees: Option<Vec<Amount>>,
}

impl From<RawTransaction> for Transaction {
    fn from(raw: RawTransaction) -> Self {
        Transaction {
            id: raw.id,
            version: raw.raw.version,
            coin_outputs: raw.raw.data.coin_outputs.unwrap_or_default(),
            coin_inputs: raw.coin_inputs.unwrap_or_default(),
            miner_fees: raw.raw.data.miner_fees.unwrap_or_default(),
        }
    }
}

/// Block as exposed by the explorer
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "RawBlock")]
pub struct Block {
    /// Block height
    pub height: u64,
    /// Block timestamp (seconds since Unix epoch)
    pub timestamp: i64,
    /// Transactions in block order
    pub transactions: Vec<Transaction>,
    /// Miner payouts in block order
    pub miner_payouts: Vec<Output>,
}

impl Block {
    /// Empty block at `height`
    pub fn new(height: u64, timestamp: i64) -> Self {
        Self {
            height,
            timestamp,
            ..Default::default()
        }
    }

    /// Block time as UTC
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp, 0).unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct RawBlock {
    height: u64,
    #[serde(rename = "rawblock")]
    raw: RawBlockBody,
    #[serde(default)]
    transactions: Option<Vec<Transaction>>,
}

#[derive(Deserialize)]
struct RawBlockBody {
    #[serde(default)]
    timestamp: i64,
    #[serde(rename = "minerpayouts", default)]
    miner_payouts: Option<Vec<Output>>,
}

impl From<RawBlock> for Block {
    fn from(raw: RawBlock) -> Self {
        Block {
            height: raw.height,
            timestamp: raw.raw.timestamp,
            transactions: raw.transactions.unwrap_or_default(),
            miner_payouts: raw.raw.miner_payouts.unwrap_or_default(),
        }
    }
}

impl FromStr for Block {
    type Err = Error;

    /// Decode a bare block JSON document
    fn from_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
