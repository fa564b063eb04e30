//! Writing cached changes back to the backing view.

use crate::cache::{CacheEntry, CoinsCache, EntryState};
use crate::view::{CoinWrite, CoinsView};
use crate::{Coin, Error, Result};
use bitcoin::{BlockHash, OutPoint};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Outcome of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Coins created or replaced in the backing view.
    pub coins_written: usize,
    /// Coins deleted from the backing view.
    pub coins_deleted: usize,
}

impl FlushStats {
    pub fn is_empty(&self) -> bool {
        self.coins_written == 0 && self.coins_deleted == 0
    }
}

impl<V: CoinsView> CoinsCache<V> {
    /// Writes all dirty entries and the best block to the backing view in one batch.
    ///
    /// The cache is only updated once the backing view accepted the batch. On error nothing has
    /// been written and the cache keeps every change, so the flush can be retried.
    pub fn flush(&mut self) -> Result<FlushStats> {
        let mut changes = Vec::new();

        for (outpoint, entry) in &self.entries {
            if !entry.state.is_dirty() {
                continue;
            }

            if entry.coin.is_mempool_coin() {
                return Err(Error::MempoolCoinNotPersistable(*outpoint));
            }

            changes.push(CoinWrite {
                outpoint: *outpoint,
                coin: entry.coin.snapshot(),
                fresh: entry.state.is_fresh(),
            });
        }

        if changes.is_empty() && !self.best_block_dirty {
            return Ok(FlushStats::default());
        }

        let best_block = self.best_block()?;

        let coins_deleted = changes.iter().filter(|change| change.is_deletion()).count();
        let stats = FlushStats {
            coins_written: changes.len() - coins_deleted,
            coins_deleted,
        };

        self.base().batch_write(changes, best_block)?;

        let evict = self.options.evict_on_flush;
        let mut released = 0;
        self.entries.retain(|_, entry| {
            if !entry.state.is_dirty() {
                return true;
            }
            if evict || entry.coin.is_spent() {
                released += entry.coin.dynamic_memory_usage();
                return false;
            }
            entry.state = EntryState::Clean;
            true
        });
        self.cached_coins_usage -= released;

        self.best_block = Some(best_block);
        self.best_block_dirty = false;

        Ok(stats)
    }

    /// Merges changes flushed by a child cache.
    ///
    /// Validated up front, an error leaves this cache untouched.
    pub(crate) fn merge_changes(
        &mut self,
        changes: Vec<CoinWrite>,
        best_block: BlockHash,
    ) -> Result<()> {
        for change in &changes {
            if change.coin.is_mempool_coin() {
                return Err(Error::MempoolCoinNotPersistable(change.outpoint));
            }

            // The child claims we never had this coin, but we hold it unspent.
            if change.fresh
                && self
                    .entries
                    .get(&change.outpoint)
                    .is_some_and(|entry| !entry.coin.is_spent())
            {
                return Err(Error::FreshMisapplied(change.outpoint));
            }
        }

        for CoinWrite {
            outpoint,
            coin,
            fresh,
        } in changes
        {
            match self.entries.entry(outpoint) {
                Entry::Vacant(slot) => {
                    // Created and spent below us, our base never needs to hear about it.
                    if fresh && coin.is_spent() {
                        continue;
                    }
                    let state = if fresh {
                        EntryState::Inserted
                    } else {
                        EntryState::Modified
                    };
                    self.cached_coins_usage += coin.dynamic_memory_usage();
                    slot.insert(CacheEntry { coin, state });
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().state.is_fresh() && coin.is_spent() {
                        let removed = slot.remove();
                        self.cached_coins_usage -= removed.coin.dynamic_memory_usage();
                        continue;
                    }

                    let entry = slot.get_mut();
                    self.cached_coins_usage -= entry.coin.dynamic_memory_usage();
                    self.cached_coins_usage += coin.dynamic_memory_usage();
                    entry.coin = coin;
                    if !entry.state.is_fresh() {
                        entry.state = EntryState::Modified;
                    }
                }
            }
        }

        self.set_best_block(best_block);

        Ok(())
    }
}

/// A cache shared behind a mutex can back further caches, which flush into it.
impl<V: CoinsView> CoinsView for Mutex<CoinsCache<V>> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let mut cache = self.lock();
        Ok(cache
            .fetch_coin(outpoint)?
            .filter(|coin| !coin.is_spent())
            .map(Coin::snapshot))
    }

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        self.lock().have_coin(outpoint)
    }

    fn best_block(&self) -> Result<BlockHash> {
        self.lock().best_block()
    }

    fn batch_write(&self, changes: Vec<CoinWrite>, best_block: BlockHash) -> Result<()> {
        self.lock().merge_changes(changes, best_block)
    }
}

/// Serializes flushes of the tip cache into persistent storage.
#[derive(Debug, Default)]
pub struct FlushCoordinator {
    lock: Mutex<()>,
    flushes: AtomicU64,
}

impl FlushCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flushes `cache`, waiting for any flush in progress to finish first.
    pub fn flush<V: CoinsView>(&self, cache: &mut CoinsCache<V>) -> Result<FlushStats> {
        let _guard = self.lock.lock();

        let now = Instant::now();

        let stats = cache.flush().inspect_err(|err| {
            tracing::error!("Failed to flush coins cache: {err}");
        })?;

        self.flushes.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            "Flushed coins cache: {} written, {} deleted, best block {} in {}ms",
            stats.coins_written,
            stats.coins_deleted,
            cache.best_block()?,
            now.elapsed().as_millis()
        );

        Ok(stats)
    }

    /// Flushes `cache` only when it has outgrown its memory budget.
    pub fn flush_if_needed<V: CoinsView>(
        &self,
        cache: &mut CoinsCache<V>,
    ) -> Result<Option<FlushStats>> {
        if !cache.should_flush() {
            return Ok(None);
        }

        tracing::info!(
            "Coins cache reached {} bytes, flushing",
            cache.memory_usage()
        );

        self.flush(cache).map(Some)
    }

    /// Number of successful flushes.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CacheOptions;
    use crate::test_utils::{
        CountingView, FailingView, block_hash, coin, outpoint, populated_view,
    };
    use crate::view::MemoryCoinsView;
    use bitcoin::TxOut;
    use std::sync::Arc;

    #[test]
    fn test_flush_writes_and_deletes() {
        let view = populated_view(&[(outpoint(1, 0), coin(100, 1)), (outpoint(1, 1), coin(200, 1))]);
        let mut cache = CoinsCache::new(&view);

        cache.spend_coin(&outpoint(1, 0)).unwrap();
        cache.add_coin(outpoint(2, 0), coin(300, 2), false).unwrap();
        cache.set_best_block(block_hash(2));

        let stats = cache.flush().unwrap();
        assert_eq!(
            stats,
            FlushStats {
                coins_written: 1,
                coins_deleted: 1
            }
        );

        assert_eq!(view.get_coin(&outpoint(1, 0)).unwrap(), None);
        assert_eq!(view.get_coin(&outpoint(1, 1)).unwrap(), Some(coin(200, 1)));
        assert_eq!(view.get_coin(&outpoint(2, 0)).unwrap(), Some(coin(300, 2)));
        assert_eq!(view.best_block().unwrap(), block_hash(2));

        // Tombstones are gone, the new coin stays as a clean entry.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entry_state(&outpoint(2, 0)), Some(EntryState::Clean));
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn test_flushed_coin_visible_to_new_cache() {
        let view = MemoryCoinsView::new();
        let key = outpoint(0xaa, 0);

        {
            let mut cache = CoinsCache::new(&view);
            cache.add_coin(key, coin(5000, 100), false).unwrap();
            cache.set_best_block(block_hash(100));
            cache.flush().unwrap();
        }

        let mut cache = CoinsCache::new(&view);
        let fetched = cache.fetch_coin(&key).unwrap().unwrap();
        assert_eq!(fetched.amount(), bitcoin::Amount::from_sat(5000));
        assert_eq!(fetched.height(), 100);
        assert!(!fetched.is_spent());
    }

    #[test]
    fn test_fresh_spend_never_reaches_view() {
        let view = MemoryCoinsView::new();
        let mut cache = CoinsCache::new(&view);

        cache.add_coin(outpoint(3, 0), coin(1, 1), false).unwrap();
        cache.spend_coin(&outpoint(3, 0)).unwrap();
        cache.set_best_block(block_hash(3));

        assert_eq!(cache.flush().unwrap(), FlushStats::default());
        assert!(view.is_empty());
        assert_eq!(view.best_block().unwrap(), block_hash(3));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let view = MemoryCoinsView::new();
        let mut cache = CoinsCache::new(&view);

        cache.add_coin(outpoint(4, 0), coin(10, 1), false).unwrap();
        cache.set_best_block(block_hash(4));
        cache.flush().unwrap();

        let before = view.raw_snapshot();
        let stats = cache.flush().unwrap();
        assert!(stats.is_empty());
        assert_eq!(view.raw_snapshot(), before);
    }

    #[test]
    fn test_dropped_cache_leaves_view_untouched() {
        let view = populated_view(&[(outpoint(5, 0), coin(100, 1))]);
        let before = view.raw_snapshot();

        {
            let mut cache = CoinsCache::new(&view);
            cache.spend_coin(&outpoint(5, 0)).unwrap();
            cache.add_coin(outpoint(6, 0), coin(5, 2), false).unwrap();
            cache.set_best_block(block_hash(6));
        }

        assert_eq!(view.raw_snapshot(), before);
    }

    #[test]
    fn test_failed_flush_can_be_retried() {
        let view = FailingView::default();
        let mut cache = CoinsCache::new(&view);

        cache.add_coin(outpoint(7, 0), coin(70, 7), false).unwrap();
        cache.set_best_block(block_hash(7));
        let stats_before = cache.cache_stats();

        view.set_fail_writes(true);
        assert!(matches!(cache.flush(), Err(Error::BackingStore(_))));
        assert_eq!(cache.cache_stats(), stats_before);
        assert!(view.inner.is_empty());

        view.set_fail_writes(false);
        let stats = cache.flush().unwrap();
        assert_eq!(stats.coins_written, 1);
        assert_eq!(view.get_coin(&outpoint(7, 0)).unwrap(), Some(coin(70, 7)));
        assert_eq!(view.best_block().unwrap(), block_hash(7));
    }

    #[test]
    fn test_mempool_coin_is_not_persistable() {
        let view = MemoryCoinsView::new();
        let mut cache = CoinsCache::new(&view);

        cache.add_coin(outpoint(8, 0), coin(1, 1), false).unwrap();
        cache
            .add_coin(
                outpoint(8, 1),
                Coin::new_mempool(TxOut {
                    value: bitcoin::Amount::from_sat(2),
                    script_pubkey: bitcoin::ScriptBuf::new(),
                }),
                false,
            )
            .unwrap();

        assert!(matches!(
            cache.flush(),
            Err(Error::MempoolCoinNotPersistable(op)) if op == outpoint(8, 1)
        ));
        assert!(view.is_empty());

        // Spending the mempool coin makes the cache flushable again.
        cache.spend_coin(&outpoint(8, 1)).unwrap();
        cache.flush().unwrap();
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_evict_on_flush() {
        let view = MemoryCoinsView::new();
        let options = CacheOptions::builder().evict_on_flush(true).build();
        let mut cache = CoinsCache::with_options(&view, options);

        cache.add_coin(outpoint(9, 0), coin(1, 1), false).unwrap();
        cache.flush().unwrap();

        assert!(cache.is_empty());
        assert_eq!(cache.memory_usage(), 0);
        assert!(cache.have_coin(&outpoint(9, 0)).unwrap());
    }

    #[test]
    fn test_child_have_coin_reaches_database_without_decoding() {
        let db = Arc::new(CountingView::new(populated_view(&[(
            outpoint(13, 0),
            coin(100, 1),
        )])));
        let parent = Arc::new(Mutex::new(CoinsCache::new(db.clone())));
        let child = CoinsCache::new(parent.clone());

        assert!(child.have_coin(&outpoint(13, 0)).unwrap());
        assert!(!child.have_coin(&outpoint(13, 1)).unwrap());

        assert_eq!(db.get_coin_calls(), 0);
        assert_eq!(db.have_coin_calls(), 2);
        assert!(parent.lock().is_empty());
        assert!(child.is_empty());
    }

    #[test]
    fn test_child_cache_merges_into_parent() {
        let db = Arc::new(populated_view(&[
            (outpoint(10, 0), coin(100, 1)),
            (outpoint(10, 1), coin(200, 1)),
        ]));
        let parent = Arc::new(Mutex::new(CoinsCache::new(db.clone())));

        let mut child = CoinsCache::new(parent.clone());
        child.spend_coin(&outpoint(10, 0)).unwrap();
        child.add_coin(outpoint(11, 0), coin(300, 2), false).unwrap();
        child.add_coin(outpoint(12, 0), coin(400, 2), false).unwrap();
        child.spend_coin(&outpoint(12, 0)).unwrap();
        child.set_best_block(block_hash(2));
        child.flush().unwrap();

        {
            let parent = parent.lock();
            assert_eq!(parent.entry_state(&outpoint(10, 0)), Some(EntryState::Modified));
            assert_eq!(parent.entry_state(&outpoint(11, 0)), Some(EntryState::Inserted));
            assert_eq!(parent.entry_state(&outpoint(12, 0)), None);
            assert_eq!(parent.best_block().unwrap(), block_hash(2));
        }

        // Nothing reaches the database before the parent itself flushes.
        assert!(db.have_coin(&outpoint(10, 0)).unwrap());
        assert!(!db.have_coin(&outpoint(11, 0)).unwrap());

        parent.lock().flush().unwrap();
        assert!(!db.have_coin(&outpoint(10, 0)).unwrap());
        assert_eq!(db.get_coin(&outpoint(11, 0)).unwrap(), Some(coin(300, 2)));
        assert_eq!(db.best_block().unwrap(), block_hash(2));
    }

    #[test]
    fn test_child_spends_parent_fresh_coin() {
        let db = Arc::new(MemoryCoinsView::new());
        let parent = Arc::new(Mutex::new(CoinsCache::new(db.clone())));
        parent
            .lock()
            .add_coin(outpoint(13, 0), coin(5, 1), false)
            .unwrap();

        let mut child = CoinsCache::new(parent.clone());
        assert_eq!(child.spend_coin(&outpoint(13, 0)).unwrap(), Some(coin(5, 1)));
        assert_eq!(child.entry_state(&outpoint(13, 0)), Some(EntryState::Modified));
        child.flush().unwrap();

        // The parent knew the coin was fresh, so the pair simply vanishes.
        assert!(parent.lock().is_empty());
        parent.lock().flush().unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn test_fresh_misapplied_is_rejected() {
        let db = MemoryCoinsView::new();
        let parent = Mutex::new(CoinsCache::new(&db));
        parent
            .lock()
            .add_coin(outpoint(14, 0), coin(5, 1), false)
            .unwrap();

        let result = parent.batch_write(
            vec![
                CoinWrite {
                    outpoint: outpoint(15, 0),
                    coin: coin(6, 1),
                    fresh: true,
                },
                CoinWrite {
                    outpoint: outpoint(14, 0),
                    coin: coin(7, 1),
                    fresh: true,
                },
            ],
            block_hash(1),
        );

        assert!(matches!(result, Err(Error::FreshMisapplied(op)) if op == outpoint(14, 0)));
        let parent = parent.lock();
        assert_eq!(parent.len(), 1);
        assert!(!parent.have_coin_in_cache(&outpoint(15, 0)));
    }

    #[test]
    fn test_coordinator_flush_if_needed() {
        let view = MemoryCoinsView::new();
        let coordinator = FlushCoordinator::new();

        let mut cache = CoinsCache::new(&view);
        cache.add_coin(outpoint(16, 0), coin(1, 1), false).unwrap();
        assert_eq!(coordinator.flush_if_needed(&mut cache).unwrap(), None);
        assert_eq!(coordinator.flush_count(), 0);

        let options = CacheOptions::builder().max_memory_bytes(0).build();
        let mut cache = CoinsCache::with_options(&view, options);
        cache.add_coin(outpoint(16, 1), coin(1, 1), false).unwrap();
        let stats = coordinator.flush_if_needed(&mut cache).unwrap();
        assert_eq!(stats.map(|s| s.coins_written), Some(1));
        assert_eq!(coordinator.flush_count(), 1);
        assert!(view.have_coin(&outpoint(16, 1)).unwrap());
    }
}
