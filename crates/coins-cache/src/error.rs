//! Error types for the coins cache.

use bitcoin::{OutPoint, Txid};

/// Errors that can occur while reading, mutating or flushing coins.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Attempted to persist or re-add a coin that has already been spent.
    #[error("Coin already spent")]
    AlreadySpent,

    /// The coin record ended before all of its fields were read.
    #[error("Truncated coin record")]
    TruncatedInput,

    /// The coin record is complete but its content is invalid.
    #[error("Malformed coin record: {0}")]
    MalformedRecord(String),

    /// An unspent coin already occupies the outpoint and overwriting was not permitted.
    #[error("Attempted to overwrite unspent coin {0}")]
    InvalidOverwrite(OutPoint),

    /// The backing view failed to read or write.
    #[error("Backing store error: {0}")]
    BackingStore(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A coin created by an unconfirmed transaction was about to be flushed.
    #[error("Mempool coin {0} cannot be persisted")]
    MempoolCoinNotPersistable(OutPoint),

    /// A fresh change was merged on top of a live coin in the parent cache.
    #[error("Fresh flag misapplied to coin {0}")]
    FreshMisapplied(OutPoint),

    /// A transaction input refers to a coin that is absent or spent.
    #[error("Missing input {0}")]
    MissingInput(OutPoint),

    /// Undo data does not belong to the block being reverted.
    #[error("Undo data mismatch: expected {expected} transaction entries, got {got}")]
    UndoMismatch { expected: usize, got: usize },

    /// Undo data of a transaction does not cover each of its inputs.
    #[error("Undo data mismatch for transaction {txid}: expected {expected} spent coins, got {got}")]
    TxUndoMismatch {
        txid: Txid,
        expected: usize,
        got: usize,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps an error raised by a [`CoinsView`](crate::CoinsView) implementation.
    pub fn backing_store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::BackingStore(Box::new(err))
    }
}
