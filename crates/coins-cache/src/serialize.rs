//! Integer encodings used by the persisted coin records.

use crate::{Error, Result};
use std::io::{self, Read, Write};

/// Largest number of bytes a [`VarInt`] of a `u64` can occupy.
const MAX_VARINT_LEN: usize = 10;

/// MSB base-128 integer encoding used for database records.
///
/// Every continuation byte subtracts one from the accumulated value, which makes the encoding
/// bijective (there is exactly one byte sequence per value).
///
/// https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/serialize.h#L390
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInt(pub u64);

impl From<u64> for VarInt {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl VarInt {
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut tmp = [0u8; MAX_VARINT_LEN];
        let mut n = self.0;
        let mut len = 0;
        loop {
            tmp[len] = (n & 0x7F) as u8 | if len > 0 { 0x80 } else { 0x00 };
            if n <= 0x7F {
                break;
            }
            n = (n >> 7) - 1;
            len += 1;
        }
        tmp[..=len].reverse();
        writer.write_all(&tmp[..=len])
    }

    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let mut n: u64 = 0;
        loop {
            let byte = read_u8(reader)?;
            if n > (u64::MAX >> 7) {
                return Err(Error::MalformedRecord("varint exceeds 64 bits".into()));
            }
            n = (n << 7) | u64::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                return Ok(Self(n));
            }
            n = n
                .checked_add(1)
                .ok_or_else(|| Error::MalformedRecord("varint exceeds 64 bits".into()))?;
        }
    }
}

// https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/serialize.h#L305
pub fn write_compact_size<W: Write>(writer: &mut W, size: u64) -> io::Result<()> {
    if size < 253 {
        writer.write_all(&[size as u8])?;
    } else if size <= 0xFFFF {
        writer.write_all(&[253])?;
        writer.write_all(&(size as u16).to_le_bytes())?;
    } else if size <= 0xFFFF_FFFF {
        writer.write_all(&[254])?;
        writer.write_all(&(size as u32).to_le_bytes())?;
    } else {
        writer.write_all(&[255])?;
        writer.write_all(&size.to_le_bytes())?;
    }
    Ok(())
}

/// Reads a canonically encoded compact size.
pub fn read_compact_size<R: Read>(reader: &mut R) -> Result<u64> {
    let (size, min) = match read_u8(reader)? {
        253 => {
            let mut buf = [0u8; 2];
            read_exact(reader, &mut buf)?;
            (u64::from(u16::from_le_bytes(buf)), 253)
        }
        254 => {
            let mut buf = [0u8; 4];
            read_exact(reader, &mut buf)?;
            (u64::from(u32::from_le_bytes(buf)), 0x1_0000)
        }
        255 => {
            let mut buf = [0u8; 8];
            read_exact(reader, &mut buf)?;
            (u64::from_le_bytes(buf), 0x1_0000_0000)
        }
        small => return Ok(u64::from(small)),
    };

    if size < min {
        return Err(Error::MalformedRecord(format!(
            "non-canonical compact size {size}"
        )));
    }

    Ok(size)
}

/// Reads exactly `len` bytes without trusting `len` for the allocation size.
pub fn read_bytes<R: Read>(reader: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(len)
        .read_to_end(&mut bytes)
        .map_err(map_read_error)?;
    if (bytes.len() as u64) < len {
        return Err(Error::TruncatedInput);
    }
    Ok(bytes)
}

pub(crate) fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(reader, &mut buf)?;
    Ok(buf[0])
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(map_read_error)
}

fn map_read_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::TruncatedInput
    } else {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_varint(n: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        VarInt(n).serialize(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_varint_bit_patterns() {
        let cases: &[(u64, &str)] = &[
            (0, "00"),
            (0x7f, "7f"),
            (0x80, "8000"),
            (0x1234, "a334"),
            (0xffff, "82fe7f"),
            (0x123456, "c7e756"),
            (0x80123456, "86ffc7e756"),
            (0xffffffff, "8efefefe7f"),
            (0x7fffffffffffffff, "fefefefefefefefe7f"),
            (0xffffffffffffffff, "80fefefefefefefefe7f"),
        ];

        for (value, expected) in cases {
            let encoded = encode_varint(*value);
            assert_eq!(hex::encode(&encoded), *expected, "encoding {value:#x}");

            let decoded = VarInt::deserialize(&mut encoded.as_slice()).unwrap();
            assert_eq!(decoded.0, *value);
        }
    }

    #[test]
    fn test_varint_overflow_is_malformed() {
        let bytes = [0xff; 11];
        assert!(matches!(
            VarInt::deserialize(&mut bytes.as_slice()),
            Err(Error::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_varint_truncated() {
        // Continuation bit set on the last available byte.
        let bytes = [0x86, 0xff];
        assert!(matches!(
            VarInt::deserialize(&mut bytes.as_slice()),
            Err(Error::TruncatedInput)
        ));
    }

    #[test]
    fn test_compact_size_canonical() {
        for size in [0u64, 252, 253, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, size).unwrap();
            assert_eq!(read_compact_size(&mut buf.as_slice()).unwrap(), size);
        }

        // 5 encoded with the 3-byte form.
        let non_canonical = [253, 5, 0];
        assert!(matches!(
            read_compact_size(&mut non_canonical.as_slice()),
            Err(Error::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_read_bytes_short_source() {
        let data = [1u8, 2, 3];
        assert_eq!(read_bytes(&mut data.as_slice(), 3).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            read_bytes(&mut data.as_slice(), 4),
            Err(Error::TruncatedInput)
        ));
        // A huge length must not be preallocated.
        assert!(matches!(
            read_bytes(&mut data.as_slice(), u64::MAX),
            Err(Error::TruncatedInput)
        ));
    }
}
