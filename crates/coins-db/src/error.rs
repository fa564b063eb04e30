//! Error types for the coins database.

/// Errors that can occur during coins database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// Coin record or undo data error.
    #[error(transparent)]
    Coins(#[from] coins_cache::Error),

    /// A key in the coins column family is not an outpoint key.
    #[error("Invalid coin key of {0} bytes")]
    InvalidKey(usize),

    /// Storage not initialized.
    #[error("Storage not initialized")]
    NotInitialized,
}

impl From<Error> for coins_cache::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Coins(err) => err,
            err => coins_cache::Error::backing_store(err),
        }
    }
}
