//! Persistent coins ledger on RocksDB.
//!
//! [`CoinsDb`] is the durable [`CoinsView`](coins_cache::CoinsView) at the bottom of the cache
//! stack. A flush lands in a single RocksDB write batch together with the best block marker, so
//! the database always describes the UTXO set at exactly one block.
//!
//! Block undo data is kept alongside, keyed by height, for disconnecting blocks after a restart.

mod error;
mod storage;

pub use error::Error;
pub use storage::{CoinsDb, CoinsIterator, TxOutSetInfo};

/// Result type for coins database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Column family names for RocksDB.
mod cf {
    /// Column family for coin records.
    /// Key: OutPoint (txid || vout) = 36 bytes
    /// Value: Coin (serialized)
    pub const COINS: &str = "coins";

    /// Column family for block undo data.
    /// Key: block height (u32, big-endian)
    /// Value: BlockUndo (serialized)
    pub const UNDO: &str = "undo";

    /// Column family for metadata.
    pub const META: &str = "meta";
}

/// Metadata keys.
mod meta_keys {
    pub const BEST_BLOCK: &[u8] = b"best_block";
}
