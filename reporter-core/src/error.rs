//! Error types for the reporter

use std::fmt;
use thiserror::Error;

/// Result type for reporter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Where inside a block an error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Miner payout at `index`
    MinerPayout {
        /// Payout index
        index: usize,
    },
    /// Coin output `index` of transaction `transaction`
    CoinOutput {
        /// Transaction index within the block
        transaction: usize,
        /// Output index within the transaction
        index: usize,
    },
    /// Coin input `index` of transaction `transaction`
    CoinInput {
        /// Transaction index within the block
        transaction: usize,
        /// Input index within the transaction
        index: usize,
    },
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::MinerPayout { index } => write!(f, "miner payouts, item {}", index),
            Position::CoinOutput { transaction, index } => {
                write!(f, "transaction {}, coin output {}", transaction, index)
            }
            Position::CoinInput { transaction, index } => {
                write!(f, "transaction {}, coin input {}", transaction, index)
            }
        }
    }
}

/// Reporter errors
#[derive(Error, Debug)]
pub enum Error {
    /// The explorer has not produced a block at this height yet
    #[error("No block at height {height} yet: {message}")]
    NotYetProduced {
        /// Requested height
        height: u64,
        /// Message returned by the explorer
        message: String,
    },

    /// Explorer returned a non-success status
    #[error("Explorer error {status}: {message}")]
    Explorer {
        /// HTTP status code
        status: u16,
        /// Error message
        message: String,
    },

    /// Explorer answered with a different block than requested
    #[error("Explorer returned block {actual} for height {expected}")]
    UnexpectedHeight {
        /// Requested height
        expected: u64,
        /// Height in the payload
        actual: u64,
    },

    /// HTTP transport error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Condition nesting exceeds the resolver limit
    #[error("Malformed condition: nesting deeper than {depth} levels")]
    MalformedCondition {
        /// Depth limit that was exceeded
        depth: usize,
    },

    /// Condition tag the resolver does not know
    #[error("Unsupported condition type {tag}")]
    UnsupportedCondition {
        /// Raw condition tag
        tag: u64,
    },

    /// Monetary value could not be parsed
    #[error("Invalid value '{value}': {reason}")]
    ValueParse {
        /// Raw text
        value: String,
        /// Parser message
        reason: String,
    },

    /// Balance arithmetic left the representable range
    #[error("Balance overflow for {address}")]
    Overflow {
        /// Address whose balance overflowed
        address: String,
    },

    /// Look-back period could not be parsed
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    /// Failure while applying a block, with its position
    #[error("Block {height} ({position}): {source}")]
    Block {
        /// Block height
        height: u64,
        /// Item that failed
        position: Position,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Scan or run was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Concurrency error (task panicked, channel closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an error with its position inside block `height`
    pub fn at(self, height: u64, position: Position) -> Self {
        Error::Block {
            height,
            position,
            source: Box::new(self),
        }
    }

    /// True for the recoverable "block not produced yet" condition
    pub fn is_not_yet_produced(&self) -> bool {
        matches!(self, Error::NotYetProduced { .. })
    }

    /// True when the error is a graceful cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
