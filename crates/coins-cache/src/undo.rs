//! Connecting blocks to a coins cache and disconnecting them again.
//!
//! Connecting a block records every coin its transactions spend in a [`BlockUndo`]. Reverting the
//! block with that undo data removes the outputs it created and restores the spent coins.

use crate::cache::CoinsCache;
use crate::serialize::{read_compact_size, write_compact_size};
use crate::view::CoinsView;
use crate::{Coin, Error, Result};
use bitcoin::{Block, OutPoint, Script, Transaction};
use std::io::{Read, Write};

/// Maximum size of a spendable script.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Outputs that can never be spent are not added to the UTXO set.
pub fn is_unspendable(script: &Script) -> bool {
    script.is_op_return() || script.len() > MAX_SCRIPT_SIZE
}

/// Coins spent by the inputs of one transaction, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

impl TxUndo {
    pub fn serialize_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_compact_size(writer, self.spent.len() as u64)?;
        for coin in &self.spent {
            coin.serialize_to(writer)?;
        }
        Ok(())
    }

    pub fn deserialize_from<R: Read>(reader: &mut R) -> Result<Self> {
        let count = read_compact_size(reader)?;
        // Do not trust the count for preallocation.
        let mut spent = Vec::new();
        for _ in 0..count {
            spent.push(Coin::deserialize_from(reader)?);
        }
        Ok(Self { spent })
    }
}

/// Undo data of a block, one [`TxUndo`] per non-coinbase transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of coins spent by the block.
    pub fn spent_count(&self) -> usize {
        self.txs.iter().map(|tx_undo| tx_undo.spent.len()).sum()
    }

    pub fn serialize_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_compact_size(writer, self.txs.len() as u64)?;
        for tx_undo in &self.txs {
            tx_undo.serialize_to(writer)?;
        }
        Ok(())
    }

    pub fn deserialize_from<R: Read>(reader: &mut R) -> Result<Self> {
        let count = read_compact_size(reader)?;
        let mut txs = Vec::new();
        for _ in 0..count {
            txs.push(TxUndo::deserialize_from(reader)?);
        }
        Ok(Self { txs })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize_to(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let undo = Self::deserialize_from(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(Error::MalformedRecord(format!(
                "{} trailing bytes after block undo",
                bytes.len()
            )));
        }
        Ok(undo)
    }
}

/// Outcome of reverting a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    /// Every created output was found and every spent coin restored into a vacant slot.
    Clean,
    /// The UTXO set was not exactly in the state the block left it in, it has been repaired.
    Unclean,
}

impl<V: CoinsView> CoinsCache<V> {
    /// Adds the spendable outputs of `tx`.
    ///
    /// With `check_for_overwrite` an existing unspent coin is replaced, otherwise only coinbase
    /// outputs may replace one (the pre-BIP30 duplicate coinbases).
    pub fn add_tx_outputs(
        &mut self,
        tx: &Transaction,
        height: u32,
        check_for_overwrite: bool,
    ) -> Result<()> {
        let txid = tx.compute_txid();
        let is_coinbase = tx.is_coinbase();

        for (vout, output) in tx.output.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }

            let outpoint = OutPoint {
                txid,
                vout: vout as u32,
            };

            let possible_overwrite = if check_for_overwrite {
                self.have_coin(&outpoint)?
            } else {
                is_coinbase
            };

            self.add_coin(
                outpoint,
                Coin::from_txout(output, height, is_coinbase),
                possible_overwrite,
            )?;
        }

        Ok(())
    }

    /// Spends every input of `tx`, returning the spent coins in input order.
    ///
    /// Fails on the first missing input. Inputs spent before the failure stay spent, callers
    /// discard the cache in that case.
    pub fn spend_tx_inputs(&mut self, tx: &Transaction) -> Result<TxUndo> {
        let mut spent = Vec::with_capacity(tx.input.len());

        for input in &tx.input {
            let coin = self
                .spend_coin(&input.previous_output)?
                .ok_or(Error::MissingInput(input.previous_output))?;
            spent.push(coin);
        }

        Ok(TxUndo { spent })
    }

    /// Connects `block` at `height` and returns its undo data.
    pub fn apply_block(&mut self, block: &Block, height: u32) -> Result<BlockUndo> {
        let mut undo = BlockUndo::new();

        for tx in &block.txdata {
            if !tx.is_coinbase() {
                undo.txs.push(self.spend_tx_inputs(tx)?);
            }
            self.add_tx_outputs(tx, height, false)?;
        }

        let block_hash = block.block_hash();
        self.set_best_block(block_hash);

        tracing::debug!(
            "Connected block #{height},{block_hash}: {} txs, {} coins spent",
            block.txdata.len(),
            undo.spent_count()
        );

        Ok(undo)
    }

    /// Disconnects `block`, previously connected at `height`, using its undo data.
    ///
    /// The shape of `undo` is checked before anything is touched. Discrepancies in the coins
    /// themselves are repaired and reported as [`DisconnectResult::Unclean`].
    pub fn revert_block(
        &mut self,
        block: &Block,
        height: u32,
        undo: &BlockUndo,
    ) -> Result<DisconnectResult> {
        let expected = block.txdata.len().saturating_sub(1);
        if undo.txs.len() != expected {
            return Err(Error::UndoMismatch {
                expected,
                got: undo.txs.len(),
            });
        }

        for (tx, tx_undo) in block.txdata.iter().skip(1).zip(&undo.txs) {
            if tx.input.len() != tx_undo.spent.len() {
                return Err(Error::TxUndoMismatch {
                    txid: tx.compute_txid(),
                    expected: tx.input.len(),
                    got: tx_undo.spent.len(),
                });
            }
        }

        let mut clean = true;

        for (index, tx) in block.txdata.iter().enumerate().rev() {
            let txid = tx.compute_txid();
            let is_coinbase = tx.is_coinbase();

            for (vout, output) in tx.output.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }

                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };

                let matches = self.spend_coin(&outpoint)?.is_some_and(|coin| {
                    coin.output() == output
                        && coin.height() == height
                        && coin.is_coinbase() == is_coinbase
                });

                if !matches {
                    tracing::warn!("Output {outpoint} missing or altered while disconnecting");
                    clean = false;
                }
            }

            if index == 0 {
                continue;
            }

            let tx_undo = &undo.txs[index - 1];
            for (input, coin) in tx.input.iter().zip(&tx_undo.spent).rev() {
                if !self.restore_coin(input.previous_output, coin.snapshot())? {
                    clean = false;
                }
            }
        }

        self.set_best_block(block.header.prev_blockhash);

        tracing::debug!(
            "Disconnected block #{height},{}, clean: {clean}",
            block.block_hash()
        );

        Ok(if clean {
            DisconnectResult::Clean
        } else {
            DisconnectResult::Unclean
        })
    }

    /// Puts a spent coin back, returns `false` if the slot was already occupied.
    fn restore_coin(&mut self, outpoint: OutPoint, coin: Coin) -> Result<bool> {
        let occupied = self.have_coin(&outpoint)?;
        if occupied {
            tracing::warn!("Restoring coin {outpoint} over an unspent coin");
        }
        self.add_coin(outpoint, coin, occupied)?;
        Ok(!occupied)
    }
}
