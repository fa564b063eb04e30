//! Chain state shared by validation passes.

use crate::cache::CoinsCache;
use crate::flush::{FlushCoordinator, FlushStats};
use crate::options::CacheOptions;
use crate::view::CoinsView;
use crate::{Coin, Result};
use bitcoin::{BlockHash, OutPoint};
use parking_lot::Mutex;
use std::sync::Arc;

/// Long-lived cache sitting between the validation overlays and persistent storage.
pub type TipCache<V> = Arc<Mutex<CoinsCache<Arc<V>>>>;

/// Ties together the persistent view, the tip cache and the flush coordinator.
///
/// Every validation pass (connecting a block, checking a mempool transaction, assembling a block
/// template) works on its own overlay from [`ChainState::new_cache`]. Overlays that are dropped
/// leave no trace, overlays passed to [`ChainState::commit`] are merged into the tip cache.
pub struct ChainState<V> {
    db: Arc<V>,
    tip: TipCache<V>,
    flusher: FlushCoordinator,
}

impl<V: CoinsView> ChainState<V> {
    pub fn new(db: Arc<V>, options: CacheOptions) -> Self {
        let tip = CoinsCache::with_options(db.clone(), options);
        Self {
            db,
            tip: Arc::new(Mutex::new(tip)),
            flusher: FlushCoordinator::new(),
        }
    }

    /// Persistent view.
    pub fn db(&self) -> &Arc<V> {
        &self.db
    }

    pub fn tip(&self) -> &TipCache<V> {
        &self.tip
    }

    /// Creates an overlay on top of the tip cache.
    pub fn new_cache(&self) -> CoinsCache<TipCache<V>> {
        CoinsCache::new(self.tip.clone())
    }

    /// Merges `cache` into the tip cache and persists the tip once it outgrows its budget.
    pub fn commit(&self, mut cache: CoinsCache<TipCache<V>>) -> Result<Option<FlushStats>> {
        cache.flush()?;

        let mut tip = self.tip.lock();
        self.flusher.flush_if_needed(&mut *tip)
    }

    /// Persists the tip cache regardless of its size.
    pub fn flush(&self) -> Result<FlushStats> {
        let mut tip = self.tip.lock();
        self.flusher.flush(&mut *tip)
    }

    pub fn best_block(&self) -> Result<BlockHash> {
        self.tip.lock().best_block()
    }

    /// Unspent coin at `outpoint` as seen by the tip cache.
    pub fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.tip.get_coin(outpoint)
    }

    /// Number of times the tip cache was persisted.
    pub fn flush_count(&self) -> u64 {
        self.flusher.flush_count()
    }
}
