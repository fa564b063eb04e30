//! Read and batch-write access to a ledger of coins.

use crate::coin::{OUTPOINT_KEY_LEN, key_to_outpoint, outpoint_to_key};
use crate::{Coin, Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One change handed to [`CoinsView::batch_write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinWrite {
    pub outpoint: OutPoint,
    /// New state of the output, a spent coin deletes it.
    pub coin: Coin,
    /// The writer never saw this outpoint in the view it is writing to.
    pub fresh: bool,
}

impl CoinWrite {
    pub fn is_deletion(&self) -> bool {
        self.coin.is_spent()
    }
}

/// A view of the UTXO set that a [`CoinsCache`](crate::CoinsCache) resolves misses against and
/// flushes into.
///
/// Lookups take `&self` so that one view can back many caches at once. `batch_write` must be
/// all-or-nothing.
pub trait CoinsView {
    /// Point lookup, `None` means the output never existed or is already pruned.
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>>;

    /// Returns `true` if an unspent coin exists at `outpoint`.
    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self
            .get_coin(outpoint)?
            .is_some_and(|coin| !coin.is_spent()))
    }

    /// Block hash the view is consistent with, all zeros when unset.
    fn best_block(&self) -> Result<BlockHash>;

    /// Atomically applies `changes` and records `best_block` as the new chain tip.
    fn batch_write(&self, changes: Vec<CoinWrite>, best_block: BlockHash) -> Result<()>;
}

impl<T: CoinsView + ?Sized> CoinsView for Arc<T> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        (**self).get_coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        (**self).have_coin(outpoint)
    }

    fn best_block(&self) -> Result<BlockHash> {
        (**self).best_block()
    }

    fn batch_write(&self, changes: Vec<CoinWrite>, best_block: BlockHash) -> Result<()> {
        (**self).batch_write(changes, best_block)
    }
}

impl<T: CoinsView + ?Sized> CoinsView for &T {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        (**self).get_coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        (**self).have_coin(outpoint)
    }

    fn best_block(&self) -> Result<BlockHash> {
        (**self).best_block()
    }

    fn batch_write(&self, changes: Vec<CoinWrite>, best_block: BlockHash) -> Result<()> {
        (**self).batch_write(changes, best_block)
    }
}

/// Returned when writing into a view that cannot store anything.
#[derive(Debug, thiserror::Error)]
#[error("View does not accept writes")]
pub struct ReadOnlyView;

/// A view without any coins.
///
/// Backs detached overlays such as a mempool-only cache that is never written back.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCoinsView;

impl CoinsView for EmptyCoinsView {
    fn get_coin(&self, _outpoint: &OutPoint) -> Result<Option<Coin>> {
        Ok(None)
    }

    fn best_block(&self) -> Result<BlockHash> {
        Ok(BlockHash::all_zeros())
    }

    fn batch_write(&self, _changes: Vec<CoinWrite>, _best_block: BlockHash) -> Result<()> {
        Err(Error::backing_store(ReadOnlyView))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    coins: BTreeMap<[u8; OUTPOINT_KEY_LEN], Vec<u8>>,
    best_block: Option<BlockHash>,
}

/// In-memory ledger storing serialized coin records, ordered by storage key.
#[derive(Debug, Default)]
pub struct MemoryCoinsView {
    state: RwLock<MemoryState>,
}

impl MemoryCoinsView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of coins stored.
    pub fn len(&self) -> usize {
        self.state.read().coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().coins.is_empty()
    }

    /// Raw records and best block, for byte-exact comparisons.
    pub fn raw_snapshot(&self) -> (Vec<(OutPoint, Vec<u8>)>, Option<BlockHash>) {
        let state = self.state.read();
        let coins = state
            .coins
            .iter()
            .map(|(key, record)| (key_to_outpoint(key), record.clone()))
            .collect();
        (coins, state.best_block)
    }

    /// Decoded coins in storage key order.
    pub fn coins(&self) -> Result<Vec<(OutPoint, Coin)>> {
        self.state
            .read()
            .coins
            .iter()
            .map(|(key, record)| Ok((key_to_outpoint(key), Coin::decode(record)?)))
            .collect()
    }
}

impl CoinsView for MemoryCoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let state = self.state.read();
        state
            .coins
            .get(&outpoint_to_key(outpoint))
            .map(|record| Coin::decode(record))
            .transpose()
    }

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self
            .state
            .read()
            .coins
            .contains_key(&outpoint_to_key(outpoint)))
    }

    fn best_block(&self) -> Result<BlockHash> {
        Ok(self
            .state
            .read()
            .best_block
            .unwrap_or_else(BlockHash::all_zeros))
    }

    fn batch_write(&self, changes: Vec<CoinWrite>, best_block: BlockHash) -> Result<()> {
        // Encode everything before taking the lock so that a bad record leaves the view untouched.
        let mut staged = Vec::with_capacity(changes.len());
        for change in &changes {
            let key = outpoint_to_key(&change.outpoint);
            if change.coin.is_mempool_coin() {
                return Err(Error::MempoolCoinNotPersistable(change.outpoint));
            }
            if change.is_deletion() {
                staged.push((key, None));
            } else {
                staged.push((key, Some(change.coin.encode()?)));
            }
        }

        let mut state = self.state.write();
        for (key, record) in staged {
            match record {
                Some(record) => {
                    state.coins.insert(key, record);
                }
                None => {
                    state.coins.remove(&key);
                }
            }
        }
        state.best_block = Some(best_block);

        Ok(())
    }
}
