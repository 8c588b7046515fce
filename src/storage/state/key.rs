//! Order-preserving key encoding.
//!
//! Byte-wise comparison of encoded keys gives the same order as comparing the
//! values themselves, and a tuple encodes as the concatenation of its components,
//! so the encoding of `(a, b)` starts with the encoding of `a`. That is what makes
//! prefix iteration over composite keys work.

use crate::error::StorageError;
use crate::traits::StorageResult;

pub trait DbKey: Sized {
    fn write_key(&self, out: &mut Vec<u8>);

    /// Decode one key from the front of `data`, returning it and the bytes consumed.
    fn read_key(data: &[u8]) -> StorageResult<(Self, usize)>;

    fn encode_key(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_key(&mut out);
        out
    }

    fn decode_key(data: &[u8]) -> StorageResult<Self> {
        let (key, read) = Self::read_key(data)?;
        if read != data.len() {
            return Err(StorageError::DataCorruption(format!(
                "{} trailing bytes after key",
                data.len() - read
            )));
        }
        Ok(key)
    }
}

fn take<const N: usize>(data: &[u8]) -> StorageResult<[u8; N]> {
    if data.len() < N {
        return Err(StorageError::DataCorruption(format!(
            "key needs {} bytes, {} left",
            N,
            data.len()
        )));
    }
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&data[..N]);
    Ok(bytes)
}

impl DbKey for i64 {
    fn write_key(&self, out: &mut Vec<u8>) {
        // flipping the sign bit orders negatives before positives
        out.extend_from_slice(&((*self as u64) ^ (1 << 63)).to_be_bytes());
    }

    fn read_key(data: &[u8]) -> StorageResult<(Self, usize)> {
        let raw = u64::from_be_bytes(take::<8>(data)?);
        Ok(((raw ^ (1 << 63)) as i64, 8))
    }
}

impl DbKey for u64 {
    fn write_key(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn read_key(data: &[u8]) -> StorageResult<(Self, usize)> {
        Ok((u64::from_be_bytes(take::<8>(data)?), 8))
    }
}

impl DbKey for u16 {
    fn write_key(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn read_key(data: &[u8]) -> StorageResult<(Self, usize)> {
        Ok((u16::from_be_bytes(take::<2>(data)?), 2))
    }
}

impl DbKey for u8 {
    fn write_key(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }

    fn read_key(data: &[u8]) -> StorageResult<(Self, usize)> {
        Ok((take::<1>(data)?[0], 1))
    }
}

/// Strings: `0x00` is escaped as `0x00 0xFF` and the value ends with `0x00 0x01`.
impl DbKey for String {
    fn write_key(&self, out: &mut Vec<u8>) {
        for &b in self.as_bytes() {
            out.push(b);
            if b == 0 {
                out.push(0xFF);
            }
        }
        out.extend_from_slice(&[0x00, 0x01]);
    }

    fn read_key(data: &[u8]) -> StorageResult<(Self, usize)> {
        let mut bytes = Vec::new();
        let mut i = 0;
        loop {
            match (data.get(i).copied(), data.get(i + 1).copied()) {
                (Some(0), Some(0x01)) => {
                    i += 2;
                    break;
                }
                (Some(0), Some(0xFF)) => {
                    bytes.push(0);
                    i += 2;
                }
                (Some(0), _) | (None, _) => {
                    return Err(StorageError::DataCorruption(
                        "unterminated string key".to_string(),
                    ));
                }
                (Some(b), _) => {
                    bytes.push(b);
                    i += 1;
                }
            }
        }
        let value = String::from_utf8(bytes)
            .map_err(|e| StorageError::DataCorruption(format!("string key: {}", e)))?;
        Ok((value, i))
    }
}

/// Empty key, for families holding a single value
impl DbKey for () {
    fn write_key(&self, _out: &mut Vec<u8>) {}

    fn read_key(_data: &[u8]) -> StorageResult<(Self, usize)> {
        Ok(((), 0))
    }
}

impl<A: DbKey, B: DbKey> DbKey for (A, B) {
    fn write_key(&self, out: &mut Vec<u8>) {
        self.0.write_key(out);
        self.1.write_key(out);
    }

    fn read_key(data: &[u8]) -> StorageResult<(Self, usize)> {
        let (a, read_a) = A::read_key(data)?;
        let (b, read_b) = B::read_key(&data[read_a..])?;
        Ok(((a, b), read_a + read_b))
    }
}

impl<A: DbKey, B: DbKey, C: DbKey> DbKey for (A, B, C) {
    fn write_key(&self, out: &mut Vec<u8>) {
        self.0.write_key(out);
        self.1.write_key(out);
        self.2.write_key(out);
    }

    fn read_key(data: &[u8]) -> StorageResult<(Self, usize)> {
        let (a, read_a) = A::read_key(data)?;
        let (b, read_b) = B::read_key(&data[read_a..])?;
        let (c, read_c) = C::read_key(&data[read_a + read_b..])?;
        Ok(((a, b, c), read_a + read_b + read_c))
    }
}
