//! Coins ledger storage implementation using RocksDB.

use crate::{Error, Result, cf, meta_keys};
use bitcoin::hashes::Hash;
use bitcoin::{Amount, BlockHash, OutPoint};
use coins_cache::{
    BlockUndo, Coin, CoinWrite, CoinsView, OUTPOINT_KEY_LEN, key_to_outpoint, outpoint_to_key,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, DBRawIterator, Options, WriteBatch};
use std::path::Path;

/// Decodes one entry of the coins column family.
fn decode_entry(key: &[u8], value: &[u8]) -> Result<(OutPoint, Coin)> {
    let key: &[u8; OUTPOINT_KEY_LEN] = key
        .try_into()
        .map_err(|_| Error::InvalidKey(key.len()))?;
    Ok((key_to_outpoint(key), Coin::decode(value)?))
}

/// Summary of the coins stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutSetInfo {
    /// Block the coins are consistent with.
    pub best_block: BlockHash,
    /// Number of decodable coins.
    pub coins: u64,
    /// Sum of the values of all decodable coins.
    pub total_amount: Amount,
    /// Bytes of keys and records in the coins column family.
    pub serialized_size: u64,
    /// Entries that failed to decode.
    pub invalid_records: u64,
}

/// Durable coins ledger.
pub struct CoinsDb {
    db: DB,
}

impl CoinsDb {
    /// Open or create the coins database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Optimize for UTXO workload
        db_opts.set_write_buffer_size(256 * 1024 * 1024);
        db_opts.set_max_write_buffer_number(4);
        db_opts.set_target_file_size_base(256 * 1024 * 1024);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        // Point lookups dominate, a bloom filter avoids most disk reads on a miss.
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        db_opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(cf::COINS, Options::default()),
            ColumnFamilyDescriptor::new(cf::UNDO, Options::default()),
            ColumnFamilyDescriptor::new(cf::META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        let coins_db = Self { db };

        let best_block = coins_db.read_best_block()?;
        tracing::info!(
            "Opened coins database at {}, best block: {best_block}",
            path.display()
        );

        Ok(coins_db)
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or(Error::NotInitialized)
    }

    /// Get a coin by outpoint.
    pub fn read_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let cf = self.cf_handle(cf::COINS)?;
        self.db
            .get_cf(cf, outpoint_to_key(outpoint))?
            .map(|bytes| Coin::decode(&bytes).map_err(Error::from))
            .transpose()
    }

    /// Block the stored coins are consistent with, all zeros for a new database.
    pub fn read_best_block(&self) -> Result<BlockHash> {
        let cf = self.cf_handle(cf::META)?;
        match self.db.get_cf(cf, meta_keys::BEST_BLOCK)? {
            Some(bytes) => {
                let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    coins_cache::Error::MalformedRecord(format!(
                        "best block marker of {} bytes",
                        bytes.len()
                    ))
                })?;
                Ok(BlockHash::from_byte_array(bytes))
            }
            None => Ok(BlockHash::all_zeros()),
        }
    }

    /// Writes coin changes and the best block marker in one atomic batch.
    pub fn write_coins(&self, changes: &[CoinWrite], best_block: BlockHash) -> Result<()> {
        let cf_coins = self.cf_handle(cf::COINS)?;
        let cf_meta = self.cf_handle(cf::META)?;

        let mut batch = WriteBatch::default();
        let mut written = 0usize;
        let mut deleted = 0usize;

        for change in changes {
            let key = outpoint_to_key(&change.outpoint);
            if change.is_deletion() {
                batch.delete_cf(cf_coins, key);
                deleted += 1;
            } else {
                if change.coin.is_mempool_coin() {
                    let err = coins_cache::Error::MempoolCoinNotPersistable(change.outpoint);
                    return Err(err.into());
                }
                batch.put_cf(cf_coins, key, change.coin.encode()?);
                written += 1;
            }
        }

        batch.put_cf(cf_meta, meta_keys::BEST_BLOCK, best_block.to_byte_array());

        self.db.write(batch)?;

        tracing::debug!("Wrote {written} coins, deleted {deleted} coins, best block: {best_block}");

        Ok(())
    }

    /// Stores the undo data of the block at `height`.
    pub fn write_block_undo(&self, height: u32, undo: &BlockUndo) -> Result<()> {
        let cf = self.cf_handle(cf::UNDO)?;
        self.db.put_cf(cf, height.to_be_bytes(), undo.encode()?)?;
        Ok(())
    }

    /// Undo data of the block at `height`, if stored.
    pub fn read_block_undo(&self, height: u32) -> Result<Option<BlockUndo>> {
        let cf = self.cf_handle(cf::UNDO)?;
        self.db
            .get_cf(cf, height.to_be_bytes())?
            .map(|bytes| BlockUndo::decode(&bytes).map_err(Error::from))
            .transpose()
    }

    /// Drops the undo data of the block at `height`, once it can no longer be disconnected.
    pub fn remove_block_undo(&self, height: u32) -> Result<()> {
        let cf = self.cf_handle(cf::UNDO)?;
        self.db.delete_cf(cf, height.to_be_bytes())?;
        Ok(())
    }

    /// Iterates over all coins in storage key order.
    pub fn iter_coins(&self) -> Result<CoinsIterator<'_>> {
        let cf = self.cf_handle(cf::COINS)?;
        let mut iter = self.db.raw_iterator_cf(cf);
        iter.seek_to_first();
        Ok(CoinsIterator { iter, done: false })
    }

    /// Scans the whole coins column family.
    pub fn txout_set_info(&self) -> Result<TxOutSetInfo> {
        let cf = self.cf_handle(cf::COINS)?;

        let mut coins = 0u64;
        let mut total_amount = 0u64;
        let mut serialized_size = 0u64;
        let mut invalid_records = 0u64;

        let mut iter = self.db.raw_iterator_cf(cf);
        iter.seek_to_first();

        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                serialized_size += (key.len() + value.len()) as u64;
                match decode_entry(key, value) {
                    Ok((_, coin)) => {
                        coins += 1;
                        total_amount = total_amount.saturating_add(coin.amount().to_sat());
                    }
                    Err(err) => {
                        tracing::warn!("Invalid coin entry {}: {err}", hex::encode(key));
                        invalid_records += 1;
                    }
                }
            }
            iter.next();
        }

        iter.status()?;

        Ok(TxOutSetInfo {
            best_block: self.read_best_block()?,
            coins,
            total_amount: Amount::from_sat(total_amount),
            serialized_size,
            invalid_records,
        })
    }

    /// Remove all coins, undo data and metadata.
    pub fn clear(&self) -> Result<()> {
        let mut batch = WriteBatch::default();

        for name in [cf::COINS, cf::UNDO, cf::META] {
            let cf = self.cf_handle(name)?;
            let mut iter = self.db.raw_iterator_cf(cf);
            iter.seek_to_first();
            while iter.valid() {
                if let Some(key) = iter.key() {
                    batch.delete_cf(cf, key);
                }
                iter.next();
            }
            iter.status()?;
        }

        self.db.write(batch)?;

        tracing::info!("Cleared coins database");

        Ok(())
    }
}

impl CoinsView for CoinsDb {
    fn get_coin(&self, outpoint: &OutPoint) -> coins_cache::Result<Option<Coin>> {
        Ok(self.read_coin(outpoint)?)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> coins_cache::Result<bool> {
        let cf = self.cf_handle(cf::COINS)?;
        let found = self
            .db
            .get_pinned_cf(cf, outpoint_to_key(outpoint))
            .map_err(Error::from)?
            .is_some();
        Ok(found)
    }

    fn best_block(&self) -> coins_cache::Result<BlockHash> {
        Ok(self.read_best_block()?)
    }

    fn batch_write(
        &self,
        changes: Vec<CoinWrite>,
        best_block: BlockHash,
    ) -> coins_cache::Result<()> {
        Ok(self.write_coins(&changes, best_block)?)
    }
}

/// Iterator over all coins in the storage.
///
/// Yields `(OutPoint, Coin)` pairs in lexicographic order by outpoint key. An entry that fails to
/// decode is yielded as an error and iteration continues with the next one.
pub struct CoinsIterator<'a> {
    iter: DBRawIterator<'a>,
    done: bool,
}

impl Iterator for CoinsIterator<'_> {
    type Item = Result<(OutPoint, Coin)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if !self.iter.valid() {
            self.done = true;
            return self.iter.status().err().map(|err| Err(err.into()));
        }

        let item = match (self.iter.key(), self.iter.value()) {
            (Some(key), Some(value)) => decode_entry(key, value),
            _ => {
                self.done = true;
                return None;
            }
        };
        self.iter.next();

        Some(item)
    }
}
