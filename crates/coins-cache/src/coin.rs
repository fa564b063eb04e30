//! Unspent transaction output record.

use crate::serialize::{VarInt, read_bytes, read_compact_size, write_compact_size};
use crate::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, TxOut, Txid};
use std::io::{Read, Write};

/// Length of the storage key of an outpoint.
pub const OUTPOINT_KEY_LEN: usize = 36;

/// Convert OutPoint to storage key (36 bytes).
///
/// Format: txid (32 bytes, raw) || vout (4 bytes, little-endian)
pub fn outpoint_to_key(outpoint: &OutPoint) -> [u8; OUTPOINT_KEY_LEN] {
    let mut key = [0u8; OUTPOINT_KEY_LEN];
    key[..32].copy_from_slice(&outpoint.txid.to_byte_array());
    key[32..].copy_from_slice(&outpoint.vout.to_le_bytes());
    key
}

/// Parse storage key back to OutPoint.
pub fn key_to_outpoint(key: &[u8; OUTPOINT_KEY_LEN]) -> OutPoint {
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&key[..32]);
    let mut vout = [0u8; 4];
    vout.copy_from_slice(&key[32..]);
    OutPoint {
        txid: Txid::from_byte_array(txid),
        vout: u32::from_le_bytes(vout),
    }
}

/// A single transaction output together with the context it was created in.
///
/// A coin is either fully populated or fully null (spent). The fields are private so that the
/// only way to reach the null state is [`Coin::clear`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    output: TxOut,
    /// Block height at which the containing transaction was included.
    height: u32,
    is_coinbase: bool,
    /// Created by a transaction that only lives in the memory pool.
    is_mempool_coin: bool,
}

impl Coin {
    /// Creates a confirmed coin.
    pub fn new(output: TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
            is_mempool_coin: false,
        }
    }

    /// Creates an unconfirmed coin for a mempool overlay.
    pub fn new_mempool(output: TxOut) -> Self {
        Self {
            output,
            height: 0,
            is_coinbase: false,
            is_mempool_coin: true,
        }
    }

    /// Creates a spent coin.
    pub fn empty() -> Self {
        Self {
            output: TxOut::NULL,
            height: 0,
            is_coinbase: false,
            is_mempool_coin: false,
        }
    }

    /// Creates a confirmed coin from a borrowed output.
    pub fn from_txout(output: &TxOut, height: u32, is_coinbase: bool) -> Self {
        Self::new(output.clone(), height, is_coinbase)
    }

    pub fn output(&self) -> &TxOut {
        &self.output
    }

    pub fn script_pubkey(&self) -> &Script {
        &self.output.script_pubkey
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    pub fn is_mempool_coin(&self) -> bool {
        self.is_mempool_coin
    }

    /// Returns `true` if the output has been cleared to the null sentinel.
    pub fn is_spent(&self) -> bool {
        self.output == TxOut::NULL
    }

    /// Value of the output.
    ///
    /// Meaningless on a spent coin, check [`Coin::is_spent`] first.
    pub fn amount(&self) -> Amount {
        self.output.value
    }

    /// Marks the coin as spent.
    pub fn clear(&mut self) {
        self.output = TxOut::NULL;
        self.height = 0;
        self.is_coinbase = false;
        self.is_mempool_coin = false;
    }

    /// Returns a copy that owns its own script bytes.
    pub fn snapshot(&self) -> Self {
        Self {
            output: TxOut {
                value: self.output.value,
                script_pubkey: ScriptBuf::from_bytes(self.output.script_pubkey.to_bytes()),
            },
            height: self.height,
            is_coinbase: self.is_coinbase,
            is_mempool_coin: self.is_mempool_coin,
        }
    }

    /// Estimated resident size in bytes.
    pub fn dynamic_memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.output.script_pubkey.len()
    }

    /// Writes the database record of this coin.
    ///
    /// Layout: `VARINT((height << 1) | coinbase)`, `VARINT(amount)`, `CompactSize(script_len)`,
    /// script bytes.
    pub fn serialize_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.is_spent() {
            return Err(Error::AlreadySpent);
        }

        // https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/coins.h#L62
        let code = (u64::from(self.height) << 1) | u64::from(self.is_coinbase);
        VarInt(code).serialize(writer)?;

        VarInt(self.output.value.to_sat()).serialize(writer)?;
        let script = self.output.script_pubkey.as_bytes();
        write_compact_size(writer, script.len() as u64)?;
        writer.write_all(script)?;

        Ok(())
    }

    /// Reads a database record written by [`Coin::serialize_to`].
    pub fn deserialize_from<R: Read>(reader: &mut R) -> Result<Self> {
        let VarInt(code) = VarInt::deserialize(reader)?;
        let height = u32::try_from(code >> 1)
            .map_err(|_| Error::MalformedRecord(format!("height code {code} out of range")))?;
        let is_coinbase = code & 1 == 1;

        let VarInt(amount) = VarInt::deserialize(reader)?;
        let script_len = read_compact_size(reader)?;
        let script = read_bytes(reader, script_len)?;

        let coin = Self::new(
            TxOut {
                value: Amount::from_sat(amount),
                script_pubkey: ScriptBuf::from_bytes(script),
            },
            height,
            is_coinbase,
        );

        if coin.is_spent() {
            return Err(Error::MalformedRecord("persisted coin is spent".into()));
        }

        Ok(coin)
    }

    /// Serialize to bytes for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + self.output.script_pubkey.len());
        self.serialize_to(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize a complete record, trailing bytes are rejected.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let coin = Self::deserialize_from(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(Error::MalformedRecord(format!(
                "{} trailing bytes after coin record",
                bytes.len()
            )));
        }
        Ok(coin)
    }
}
