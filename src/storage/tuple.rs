//! Tuple layout for SnapDB
//!
//! A stored tuple is a version header followed by its encoded values:
//!
//! ```text
//! | xmin (8) | xmax (8) | flags (1) | count (2) | tag + payload ... |
//! ```
//!
//! `xmax` sits at a fixed offset so a delete can stamp it in place.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

use super::value::{Decimal, Value};
use crate::error::{Error, Result};

/// Transaction identifier; 0 is reserved for "none"
pub type TxnId = u64;

/// Marker for an absent deleter
pub const INVALID_TXN: TxnId = 0;

/// Byte offset of `xmax` inside an encoded tuple
pub const XMAX_OFFSET: usize = 8;

/// Size of the version header
pub const TUPLE_HEADER_SIZE: usize = 17;

/// The version was produced by an UPDATE (it has a predecessor)
pub const FLAG_UPDATED: u8 = 0b0000_0001;

/// Multi-version header carried by every stored tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleHeader {
    /// Creating transaction
    pub xmin: TxnId,
    /// Deleting transaction, `INVALID_TXN` while live
    pub xmax: TxnId,
    pub flags: u8,
}

impl TupleHeader {
    pub fn new(xmin: TxnId) -> Self {
        Self {
            xmin,
            xmax: INVALID_TXN,
            flags: 0,
        }
    }

    pub fn has_deleter(&self) -> bool {
        self.xmax != INVALID_TXN
    }

    pub fn is_update_successor(&self) -> bool {
        self.flags & FLAG_UPDATED != 0
    }
}

/// A tuple (row version) in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub header: TupleHeader,
    /// Values in this tuple
    values: Vec<Value>,
}

impl Tuple {
    /// Create a new live version owned by `xmin`
    pub fn new(xmin: TxnId, values: Vec<Value>) -> Self {
        Self {
            header: TupleHeader::new(xmin),
            values,
        }
    }

    /// Mark this version as the successor of an updated row
    pub fn as_update(mut self) -> Self {
        self.header.flags |= FLAG_UPDATED;
        self
    }

    /// Get a value by index
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get all values
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consume the tuple and return the values
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Project specific columns
    pub fn project(&self, indices: &[usize]) -> Vec<Value> {
        indices
            .iter()
            .filter_map(|&i| self.values.get(i).cloned())
            .collect()
    }

    /// Serialize header and values to the on-page format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TUPLE_HEADER_SIZE + 2 + self.values.len() * 9);
        // Writes into a Vec cannot fail.
        let _ = self.write_to(&mut buf);
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u64::<LittleEndian>(self.header.xmin)?;
        buf.write_u64::<LittleEndian>(self.header.xmax)?;
        buf.write_u8(self.header.flags)?;
        buf.write_u16::<LittleEndian>(self.values.len() as u16)?;

        for value in &self.values {
            match value {
                Value::Null => buf.write_u8(0)?,
                Value::Boolean(b) => {
                    buf.write_u8(1)?;
                    buf.write_u8(*b as u8)?;
                }
                Value::Integer(i) => {
                    buf.write_u8(2)?;
                    buf.write_i64::<LittleEndian>(*i)?;
                }
                Value::Decimal(d) => {
                    buf.write_u8(3)?;
                    buf.write_i64::<LittleEndian>(d.units())?;
                    buf.write_u8(d.scale())?;
                }
                Value::Text(s) => {
                    buf.write_u8(4)?;
                    buf.write_u32::<LittleEndian>(s.len() as u32)?;
                    buf.extend_from_slice(s.as_bytes());
                }
                Value::Date(d) => {
                    buf.write_u8(5)?;
                    buf.write_i32::<LittleEndian>(*d)?;
                }
                Value::Timestamp(t) => {
                    buf.write_u8(6)?;
                    buf.write_i64::<LittleEndian>(*t)?;
                }
            }
        }
        Ok(())
    }

    /// Deserialize a tuple from the on-page format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes).map_err(|e| Error::StorageError(format!("malformed tuple: {}", e)))
    }

    fn decode(bytes: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let header = TupleHeader {
            xmin: cursor.read_u64::<LittleEndian>()?,
            xmax: cursor.read_u64::<LittleEndian>()?,
            flags: cursor.read_u8()?,
        };
        let count = cursor.read_u16::<LittleEndian>()? as usize;

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let value = match cursor.read_u8()? {
                0 => Value::Null,
                1 => Value::Boolean(cursor.read_u8()? != 0),
                2 => Value::Integer(cursor.read_i64::<LittleEndian>()?),
                3 => {
                    let units = cursor.read_i64::<LittleEndian>()?;
                    Value::Decimal(Decimal::new(units, cursor.read_u8()?))
                }
                4 => {
                    let len = cursor.read_u32::<LittleEndian>()? as usize;
                    let mut raw = vec![0u8; len];
                    cursor.read_exact(&mut raw)?;
                    let s = String::from_utf8(raw).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                    })?;
                    Value::Text(s)
                }
                5 => Value::Date(cursor.read_i32::<LittleEndian>()?),
                6 => Value::Timestamp(cursor.read_i64::<LittleEndian>()?),
                tag => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unknown type tag {}", tag),
                    ))
                }
            };
            values.push(value);
        }

        Ok(Tuple { header, values })
    }

    /// Read only the version header
    pub fn header_from_bytes(bytes: &[u8]) -> Result<TupleHeader> {
        let mut cursor = Cursor::new(bytes);
        let read = |c: &mut Cursor<&[u8]>| -> std::io::Result<TupleHeader> {
            Ok(TupleHeader {
                xmin: c.read_u64::<LittleEndian>()?,
                xmax: c.read_u64::<LittleEndian>()?,
                flags: c.read_u8()?,
            })
        };
        read(&mut cursor).map_err(|e| Error::StorageError(format!("malformed tuple header: {}", e)))
    }
}
