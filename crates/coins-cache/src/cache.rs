//! Copy-on-write coins cache.
//!
//! A [`CoinsCache`] overlays a [`CoinsView`] and records every mutation in memory:
//!
//! - Misses are resolved against the backing view and memoized as clean entries.
//! - Added and spent coins are tracked per entry as [`EntryState::Modified`] or
//!   [`EntryState::Inserted`] until the cache is flushed.
//! - Dropping the cache discards all mutations without touching the backing view.

use crate::options::CacheOptions;
use crate::view::CoinsView;
use crate::{Coin, Error, Result};
use bitcoin::{BlockHash, OutPoint};
use std::collections::HashMap;

/// Bookkeeping overhead of one map slot on top of the coin itself.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<OutPoint>() + std::mem::size_of::<EntryState>();

/// Relationship between a cached coin and the backing view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Same as in the backing view.
    Clean,
    /// Differs from the backing view, which knows the outpoint.
    Modified,
    /// Differs from the backing view, which has never seen the outpoint.
    Inserted,
}

impl EntryState {
    /// The entry must be written back on flush.
    pub fn is_dirty(self) -> bool {
        !matches!(self, Self::Clean)
    }

    /// The backing view does not know the outpoint, a spend can simply forget the entry.
    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Inserted)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) coin: Coin,
    pub(crate) state: EntryState,
}

/// Statistics about the coins cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached entries, tombstones included.
    pub entries: usize,
    /// Number of entries waiting to be flushed.
    pub dirty_entries: usize,
    /// Number of entries unknown to the backing view.
    pub fresh_entries: usize,
    /// Estimated memory usage in bytes.
    pub memory_usage: usize,
}

/// In-memory overlay of coin mutations on top of a backing view.
///
/// One validation unit owns a cache exclusively. The backing view `V` is a handle (typically an
/// `Arc`), the cache never owns the ledger it overlays.
pub struct CoinsCache<V> {
    base: V,
    pub(crate) entries: HashMap<OutPoint, CacheEntry>,
    /// Tip the cached changes are consistent with.
    pub(crate) best_block: Option<BlockHash>,
    /// `best_block` has not been written to the backing view yet.
    pub(crate) best_block_dirty: bool,
    /// Sum of [`Coin::dynamic_memory_usage`] over all entries.
    pub(crate) cached_coins_usage: usize,
    pub(crate) options: CacheOptions,
}

impl<V> std::fmt::Debug for CoinsCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinsCache")
            .field("entries", &self.entries.len())
            .field("best_block", &self.best_block)
            .field("cached_coins_usage", &self.cached_coins_usage)
            .finish()
    }
}

impl<V: CoinsView> CoinsCache<V> {
    /// Create a cache over `base` with default options.
    pub fn new(base: V) -> Self {
        Self::with_options(base, CacheOptions::default())
    }

    pub fn with_options(base: V, options: CacheOptions) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best_block: None,
            best_block_dirty: false,
            cached_coins_usage: 0,
            options,
        }
    }

    /// Backing view of this cache.
    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Looks up the entry of `outpoint`, memoizing a backing hit as a clean entry.
    ///
    /// A spent coin reported by the backing view (a tombstone of a parent cache) counts as a miss.
    fn fetch_entry(&mut self, outpoint: &OutPoint) -> Result<Option<&mut CacheEntry>> {
        if !self.entries.contains_key(outpoint) {
            let Some(coin) = self.base.get_coin(outpoint)? else {
                return Ok(None);
            };

            if coin.is_spent() {
                return Ok(None);
            }

            tracing::trace!("Memoized coin {outpoint} from backing view");

            self.cached_coins_usage += coin.dynamic_memory_usage();
            self.entries.insert(
                *outpoint,
                CacheEntry {
                    coin,
                    state: EntryState::Clean,
                },
            );
        }

        Ok(self.entries.get_mut(outpoint))
    }

    /// Returns the coin of `outpoint`.
    ///
    /// Cached entries win over the backing view, so a coin spent in this cache is returned as a
    /// spent coin even if the backing view still holds it. The returned reference is the canonical
    /// instance, use [`Coin::snapshot`] to obtain a copy.
    pub fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<&Coin>> {
        Ok(self.fetch_entry(outpoint)?.map(|entry| &entry.coin))
    }

    /// Returns `true` if an unspent coin exists at `outpoint`.
    ///
    /// A miss is answered by [`CoinsView::have_coin`] of the backing view and is not memoized.
    pub fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(!entry.coin.is_spent()),
            None => self.base.have_coin(outpoint),
        }
    }

    /// Like [`CoinsCache::have_coin`] but without consulting the backing view.
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.entries
            .get(outpoint)
            .is_some_and(|entry| !entry.coin.is_spent())
    }

    /// Bookkeeping state of a cached entry.
    pub fn entry_state(&self, outpoint: &OutPoint) -> Option<EntryState> {
        self.entries.get(outpoint).map(|entry| entry.state)
    }

    /// Adds `coin` at `outpoint`.
    ///
    /// Fails with [`Error::InvalidOverwrite`] if an unspent coin already exists there and
    /// `possible_overwrite` is false, leaving the cache unchanged.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        possible_overwrite: bool,
    ) -> Result<()> {
        if coin.is_spent() {
            return Err(Error::AlreadySpent);
        }

        let new_usage = coin.dynamic_memory_usage();

        let replaced_usage = match self.fetch_entry(&outpoint)? {
            Some(entry) => {
                if !entry.coin.is_spent() {
                    if !possible_overwrite {
                        return Err(Error::InvalidOverwrite(outpoint));
                    }
                    tracing::warn!("Overwriting unspent coin {outpoint}");
                }

                let old_usage = entry.coin.dynamic_memory_usage();
                entry.coin = coin;
                entry.state = match entry.state {
                    EntryState::Inserted => EntryState::Inserted,
                    EntryState::Clean | EntryState::Modified => EntryState::Modified,
                };
                Some(old_usage)
            }
            None => {
                self.entries.insert(
                    outpoint,
                    CacheEntry {
                        coin,
                        state: EntryState::Inserted,
                    },
                );
                None
            }
        };

        self.cached_coins_usage = self.cached_coins_usage - replaced_usage.unwrap_or(0) + new_usage;

        Ok(())
    }

    /// Spends the coin at `outpoint` and returns it as it was before the spend.
    ///
    /// Returns `None` without any change if there is no unspent coin. A fresh entry is forgotten
    /// entirely, any other entry becomes a dirty tombstone so that the deletion reaches the
    /// backing view on flush.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let Some(entry) = self.fetch_entry(outpoint)? else {
            return Ok(None);
        };

        if entry.coin.is_spent() {
            return Ok(None);
        }

        let spent = std::mem::replace(&mut entry.coin, Coin::empty());
        let fresh = entry.state.is_fresh();

        if fresh {
            self.entries.remove(outpoint);
        } else {
            entry.state = EntryState::Modified;
            self.cached_coins_usage += Coin::empty().dynamic_memory_usage();
        }

        self.cached_coins_usage -= spent.dynamic_memory_usage();

        tracing::trace!("Spent coin {outpoint} (fresh: {fresh})");

        Ok(Some(spent))
    }

    /// Evicts a clean entry. Dirty entries are kept, dropping them would lose their changes.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        let is_clean = self
            .entries
            .get(outpoint)
            .is_some_and(|entry| !entry.state.is_dirty());

        if is_clean {
            if let Some(entry) = self.entries.remove(outpoint) {
                self.cached_coins_usage -= entry.coin.dynamic_memory_usage();
            }
        }
    }

    /// Tip the cache is consistent with, falling back to the backing view.
    pub fn best_block(&self) -> Result<BlockHash> {
        match self.best_block {
            Some(hash) => Ok(hash),
            None => self.base.best_block(),
        }
    }

    /// Records the tip that the next flush persists together with the coin changes.
    pub fn set_best_block(&mut self, hash: BlockHash) {
        self.best_block = Some(hash);
        self.best_block_dirty = true;
    }

    /// Number of cached entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries waiting to be flushed.
    pub fn dirty_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state.is_dirty())
            .count()
    }

    /// Estimated memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.cached_coins_usage + self.entries.len() * ENTRY_OVERHEAD
    }

    /// The cache has grown past its memory budget.
    pub fn should_flush(&self) -> bool {
        self.memory_usage() > self.options.max_memory_bytes
    }

    /// Evicts clean entries until the cache fits its memory budget.
    ///
    /// Returns the number of evicted entries. Dirty entries are never evicted, a cache that is
    /// still over budget afterwards needs a flush.
    pub fn trim(&mut self) -> usize {
        if !self.should_flush() {
            return 0;
        }

        let clean: Vec<OutPoint> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.state.is_dirty())
            .map(|(outpoint, _)| *outpoint)
            .collect();

        let mut evicted = 0;
        for outpoint in clean {
            if !self.should_flush() {
                break;
            }
            self.uncache(&outpoint);
            evicted += 1;
        }

        tracing::debug!(
            "Trimmed {evicted} clean coins, memory usage: {} bytes",
            self.memory_usage()
        );

        evicted
    }

    /// Get statistics about the cache.
    pub fn cache_stats(&self) -> CacheStats {
        let (dirty_entries, fresh_entries) =
            self.entries
                .values()
                .fold((0, 0), |(dirty, fresh), entry| {
                    (
                        dirty + usize::from(entry.state.is_dirty()),
                        fresh + usize::from(entry.state.is_fresh()),
                    )
                });

        CacheStats {
            entries: self.entries.len(),
            dirty_entries,
            fresh_entries,
            memory_usage: self.memory_usage(),
        }
    }
}

impl<V: CoinsView + Clone> CoinsCache<V> {
    /// Returns an independent cache with the same logical content.
    ///
    /// Every coin is snapshotted, so mutating either cache never affects the other. The backing
    /// handle is cloned, both caches keep resolving misses against the same view.
    pub fn deep_copy(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|(outpoint, entry)| {
                (
                    *outpoint,
                    CacheEntry {
                        coin: entry.coin.snapshot(),
                        state: entry.state,
                    },
                )
            })
            .collect();

        Self {
            base: self.base.clone(),
            entries,
            best_block: self.best_block,
            best_block_dirty: self.best_block_dirty,
            cached_coins_usage: self.cached_coins_usage,
            options: self.options.clone(),
        }
    }
}
