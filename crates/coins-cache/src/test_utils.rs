use crate::view::{CoinWrite, CoinsView, MemoryCoinsView};
use crate::{Coin, Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Amount, BlockHash, OutPoint, PubkeyHash, ScriptBuf, TxOut, Txid};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) fn outpoint(byte: u8, vout: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([byte; 32]),
        vout,
    }
}

pub(crate) fn p2pkh_output(value: u64) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: ScriptBuf::new_p2pkh(&PubkeyHash::all_zeros()),
    }
}

pub(crate) fn coin(value: u64, height: u32) -> Coin {
    Coin::new(p2pkh_output(value), height, false)
}

pub(crate) fn block_hash(byte: u8) -> BlockHash {
    BlockHash::from_byte_array([byte; 32])
}

pub(crate) fn populated_view(coins: &[(OutPoint, Coin)]) -> MemoryCoinsView {
    let view = MemoryCoinsView::new();
    let changes = coins
        .iter()
        .map(|(outpoint, coin)| CoinWrite {
            outpoint: *outpoint,
            coin: coin.clone(),
            fresh: true,
        })
        .collect();
    view.batch_write(changes, BlockHash::all_zeros())
        .expect("Failed to populate view");
    view
}

#[derive(Debug, thiserror::Error)]
#[error("Injected write failure")]
pub(crate) struct InjectedFailure;

/// Memory view whose writes can be switched to fail.
#[derive(Debug, Default)]
pub(crate) struct FailingView {
    pub(crate) inner: MemoryCoinsView,
    pub(crate) fail_writes: AtomicBool,
}

impl FailingView {
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl CoinsView for FailingView {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.inner.get_coin(outpoint)
    }

    fn best_block(&self) -> Result<BlockHash> {
        self.inner.best_block()
    }

    fn batch_write(&self, changes: Vec<CoinWrite>, best_block: BlockHash) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::backing_store(InjectedFailure));
        }
        self.inner.batch_write(changes, best_block)
    }
}

/// Memory view that counts the point lookups decoding a full coin.
#[derive(Debug, Default)]
pub(crate) struct CountingView {
    pub(crate) inner: MemoryCoinsView,
    pub(crate) get_coin_calls: AtomicUsize,
    pub(crate) have_coin_calls: AtomicUsize,
}

impl CountingView {
    pub(crate) fn new(inner: MemoryCoinsView) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub(crate) fn get_coin_calls(&self) -> usize {
        self.get_coin_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn have_coin_calls(&self) -> usize {
        self.have_coin_calls.load(Ordering::SeqCst)
    }
}

impl CoinsView for CountingView {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.get_coin_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        self.have_coin_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.have_coin(outpoint)
    }

    fn best_block(&self) -> Result<BlockHash> {
        self.inner.best_block()
    }

    fn batch_write(&self, changes: Vec<CoinWrite>, best_block: BlockHash) -> Result<()> {
        self.inner.batch_write(changes, best_block)
    }
}
