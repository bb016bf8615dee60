//! WAL record encoding
//!
//! Three record kinds cover everything the cache replays: writes keyed by
//! series, full key deletes, and ranged deletes. Payloads are little-endian
//! with length-prefixed keys and a one-byte type tag per value. The CRC32
//! in the header covers the kind byte plus the payload.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::types::{FieldValue, Timestamp, Value};

/// Record header size in bytes (length + kind + crc)
pub const HEADER_SIZE: usize = 9;

/// Upper bound on a single record's payload, rejected as corruption beyond it
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

const KIND_WRITE: u8 = 1;
const KIND_DELETE: u8 = 2;
const KIND_DELETE_RANGE: u8 = 3;

const TAG_FLOAT: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_UNSIGNED: u8 = 2;
const TAG_BOOLEAN: u8 = 3;
const TAG_STRING: u8 = 4;

/// Batched values per series key
#[derive(Debug, Clone, PartialEq)]
pub struct WriteWalEntry {
    /// Values to append, keyed by series key
    pub values: HashMap<Vec<u8>, Vec<Value>>,
}

/// Full removal of a set of series keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteWalEntry {
    /// Keys to remove
    pub keys: Vec<Vec<u8>>,
}

/// Ranged removal over a set of series keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRangeWalEntry {
    /// Keys to remove values from
    pub keys: Vec<Vec<u8>>,
    /// Inclusive lower timestamp bound
    pub min: Timestamp,
    /// Inclusive upper timestamp bound
    pub max: Timestamp,
}

/// One decoded WAL record
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    /// Append values to the cache
    Write(WriteWalEntry),
    /// Remove keys entirely
    Delete(DeleteWalEntry),
    /// Remove a timestamp range from keys
    DeleteRange(DeleteRangeWalEntry),
}

impl WalEntry {
    fn kind(&self) -> u8 {
        match self {
            WalEntry::Write(_) => KIND_WRITE,
            WalEntry::Delete(_) => KIND_DELETE,
            WalEntry::DeleteRange(_) => KIND_DELETE_RANGE,
        }
    }

    /// Compute the CRC32 a record header carries for a kind + payload pair
    pub fn compute_checksum(kind: u8, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind]);
        hasher.update(payload);
        hasher.finalize()
    }

    /// Encode the record body
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            WalEntry::Write(w) => {
                buf.extend_from_slice(&(w.values.len() as u32).to_le_bytes());
                for (key, values) in &w.values {
                    encode_key(&mut buf, key);
                    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
                    for value in values {
                        encode_value(&mut buf, value);
                    }
                }
            }
            WalEntry::Delete(d) => {
                encode_keys(&mut buf, &d.keys);
            }
            WalEntry::DeleteRange(d) => {
                buf.extend_from_slice(&d.min.to_le_bytes());
                buf.extend_from_slice(&d.max.to_le_bytes());
                encode_keys(&mut buf, &d.keys);
            }
        }
        buf
    }

    /// Decode a record body for the given kind byte
    pub fn decode_payload(kind: u8, data: &[u8]) -> io::Result<WalEntry> {
        let mut cursor = Cursor { data, pos: 0 };
        let entry = match kind {
            KIND_WRITE => {
                let series = cursor.read_u32()? as usize;
                let mut values = HashMap::with_capacity(series);
                for _ in 0..series {
                    let key = cursor.read_key()?;
                    let count = cursor.read_u32()? as usize;
                    let mut vals = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        vals.push(cursor.read_value()?);
                    }
                    values.insert(key, vals);
                }
                WalEntry::Write(WriteWalEntry { values })
            }
            KIND_DELETE => WalEntry::Delete(DeleteWalEntry {
                keys: cursor.read_keys()?,
            }),
            KIND_DELETE_RANGE => {
                let min = cursor.read_i64()?;
                let max = cursor.read_i64()?;
                WalEntry::DeleteRange(DeleteRangeWalEntry {
                    keys: cursor.read_keys()?,
                    min,
                    max,
                })
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown record kind {}", other),
                ))
            }
        };

        if cursor.pos != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes after record payload",
            ));
        }
        Ok(entry)
    }

    /// Write the framed record to a writer
    ///
    /// Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<usize> {
        let payload = self.encode_payload();
        let kind = self.kind();
        let checksum = Self::compute_checksum(kind, &payload);

        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&[kind])?;
        writer.write_all(&checksum.to_le_bytes())?;
        writer.write_all(&payload)?;

        Ok(HEADER_SIZE + payload.len())
    }

    /// Size of the framed record on disk
    pub fn disk_size(&self) -> usize {
        HEADER_SIZE + self.encode_payload().len()
    }
}

fn encode_key(buf: &mut Vec<u8>, key: &[u8]) {
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
}

fn encode_keys(buf: &mut Vec<u8>, keys: &[Vec<u8>]) {
    buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
    for key in keys {
        encode_key(buf, key);
    }
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    buf.extend_from_slice(&value.timestamp.to_le_bytes());
    match &value.value {
        FieldValue::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::Integer(v) => {
            buf.push(TAG_INTEGER);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::Unsigned(v) => {
            buf.push(TAG_UNSIGNED);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        FieldValue::Boolean(v) => {
            buf.push(TAG_BOOLEAN);
            buf.push(u8::from(*v));
        }
        FieldValue::String(v) => {
            buf.push(TAG_STRING);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
    }
}

/// Bounds-checked reader over a payload slice
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "record payload too short",
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i64(&mut self) -> io::Result<i64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(arr))
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    fn read_f64(&mut self) -> io::Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_key(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_keys(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let count = self.read_u32()? as usize;
        let mut keys = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            keys.push(self.read_key()?);
        }
        Ok(keys)
    }

    fn read_value(&mut self) -> io::Result<Value> {
        let timestamp = self.read_i64()?;
        let tag = self.read_u8()?;
        let value = match tag {
            TAG_FLOAT => FieldValue::Float(self.read_f64()?),
            TAG_INTEGER => FieldValue::Integer(self.read_i64()?),
            TAG_UNSIGNED => FieldValue::Unsigned(self.read_u64()?),
            TAG_BOOLEAN => FieldValue::Boolean(self.read_u8()? != 0),
            TAG_STRING => {
                let len = self.read_u32()? as usize;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                FieldValue::String(s.to_string())
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown value tag {}", other),
                ))
            }
        };
        Ok(Value { timestamp, value })
    }
}
