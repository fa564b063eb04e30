//! UTXO coin ledger and copy-on-write coins cache.
//!
//! This crate holds the unspent transaction outputs of a Bitcoin-family node in memory while a
//! block or transaction is validated, and writes them back to a persistent ledger atomically.
//!
//! ## Architecture
//!
//! - **Coin**: one unspent output with its creation height, coinbase and mempool status
//! - **CoinsView**: lookups and batch writes against a ledger (database, parent cache, memory)
//! - **CoinsCache**: overlay recording added and spent coins until it is flushed or dropped
//! - **Undo Data**: coins spent by a block, for disconnecting it during reorgs
//! - **ChainState**: the persistent view, the long-lived tip cache and the flush coordinator
//!
//! Caches stack: a cache behind a `parking_lot::Mutex` is itself a [`CoinsView`], so a
//! short-lived validation cache can flush into the tip cache, which in turn flushes into the
//! database.

mod cache;
mod coin;
mod context;
mod error;
mod flush;
mod options;
pub mod serialize;
mod undo;
mod view;

#[cfg(test)]
mod test_utils;

pub use cache::{CacheStats, CoinsCache, EntryState};
pub use coin::{Coin, OUTPOINT_KEY_LEN, key_to_outpoint, outpoint_to_key};
pub use context::{ChainState, TipCache};
pub use error::Error;
pub use flush::{FlushCoordinator, FlushStats};
pub use options::{CacheOptions, CacheOptionsBuilder, DEFAULT_MAX_MEMORY_BYTES};
pub use undo::{BlockUndo, DisconnectResult, MAX_SCRIPT_SIZE, TxUndo, is_unspendable};
pub use view::{CoinWrite, CoinsView, EmptyCoinsView, MemoryCoinsView, ReadOnlyView};

/// Result type for coins cache operations.
pub type Result<T> = std::result::Result<T, Error>;
