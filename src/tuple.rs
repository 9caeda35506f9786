//! Order-preserving tuple encoding for composite keys.
//!
//! Keys in the bucket keyspace are tuples of byte strings and signed
//! integers packed so that unsigned byte-wise comparison of the packed
//! form matches element-wise comparison of the tuples. Byte strings are
//! tagged `0x01`, escaped (`0x00` becomes `0x00 0xFF`) and terminated
//! with `0x00`; integers are tagged `0x14 + n` for a positive `n`-byte
//! big-endian value, `0x14 - n` for negative, and `0x14` alone for zero.

use thiserror::Error;

const BYTES_CODE: u8 = 0x01;
const INT_ZERO_CODE: u8 = 0x14;

#[derive(Debug, Error)]
pub enum TupleError {
    #[error("packed tuple ends inside an element")]
    Truncated,
    #[error("unsupported tuple type code {0:#04x}")]
    UnsupportedCode(u8),
    #[error("integer element does not fit in 64 bits")]
    IntOutOfRange,
    #[error("element {index} is not a {expected}")]
    WrongType {
        index: usize,
        expected: &'static str,
    },
    #[error("expected element {0} is missing")]
    MissingElement(usize),
}

/// One element of a tuple key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Element {
    Bytes(Vec<u8>),
    Int(i64),
}

impl Element {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Element::Bytes(b.into())
    }

    pub fn int(i: i64) -> Self {
        Element::Int(i)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Element::Bytes(b) => Some(b),
            Element::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Element::Int(i) => Some(*i),
            Element::Bytes(_) => None,
        }
    }
}

/// Append the packed form of `element` to `out`.
fn pack_element(element: &Element, out: &mut Vec<u8>) {
    match element {
        Element::Bytes(b) => {
            out.push(BYTES_CODE);
            for &byte in b.iter() {
                out.push(byte);
                if byte == 0x00 {
                    out.push(0xFF);
                }
            }
            out.push(0x00);
        }
        Element::Int(0) => out.push(INT_ZERO_CODE),
        Element::Int(v) if *v > 0 => {
            let n = byte_len(*v as u64);
            out.push(INT_ZERO_CODE + n as u8);
            out.extend_from_slice(&v.to_be_bytes()[8 - n..]);
        }
        Element::Int(v) => {
            // Negative: offset encoding so byte order matches numeric order.
            let magnitude = (*v as i128).unsigned_abs() as u64;
            let n = byte_len(magnitude);
            let encoded = ((1i128 << (8 * n)) - 1 + *v as i128) as u64;
            out.push(INT_ZERO_CODE - n as u8);
            out.extend_from_slice(&encoded.to_be_bytes()[8 - n..]);
        }
    }
}

/// Minimal number of big-endian bytes needed for a non-zero magnitude.
fn byte_len(v: u64) -> usize {
    ((64 - v.leading_zeros() as usize) + 7) / 8
}

/// Pack a tuple of elements into a key.
pub fn pack(elements: &[Element]) -> Vec<u8> {
    let mut out = Vec::new();
    for element in elements {
        pack_element(element, &mut out);
    }
    out
}

/// Unpack a packed tuple back into its elements.
pub fn unpack(mut bytes: &[u8]) -> Result<Vec<Element>, TupleError> {
    let mut elements = Vec::new();
    while let Some((&code, rest)) = bytes.split_first() {
        match code {
            BYTES_CODE => {
                let (value, remaining) = unescape(rest)?;
                elements.push(Element::Bytes(value));
                bytes = remaining;
            }
            INT_ZERO_CODE => {
                elements.push(Element::Int(0));
                bytes = rest;
            }
            c if c > INT_ZERO_CODE && c <= INT_ZERO_CODE + 8 => {
                let n = (c - INT_ZERO_CODE) as usize;
                if rest.len() < n {
                    return Err(TupleError::Truncated);
                }
                let mut buf = [0u8; 8];
                buf[8 - n..].copy_from_slice(&rest[..n]);
                let value = u64::from_be_bytes(buf);
                let value = i64::try_from(value).map_err(|_| TupleError::IntOutOfRange)?;
                elements.push(Element::Int(value));
                bytes = &rest[n..];
            }
            c if c < INT_ZERO_CODE && c >= INT_ZERO_CODE - 8 => {
                let n = (INT_ZERO_CODE - c) as usize;
                if rest.len() < n {
                    return Err(TupleError::Truncated);
                }
                let mut buf = [0u8; 8];
                buf[8 - n..].copy_from_slice(&rest[..n]);
                let encoded = u64::from_be_bytes(buf) as i128;
                let value = encoded - ((1i128 << (8 * n)) - 1);
                let value = i64::try_from(value).map_err(|_| TupleError::IntOutOfRange)?;
                elements.push(Element::Int(value));
                bytes = &rest[n..];
            }
            c => return Err(TupleError::UnsupportedCode(c)),
        }
    }
    Ok(elements)
}

/// Decode an escaped byte-string element, returning the value and the
/// remainder of the input past the terminator.
fn unescape(bytes: &[u8]) -> Result<(Vec<u8>, &[u8]), TupleError> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x00 {
            if bytes.get(i + 1) == Some(&0xFF) {
                out.push(0x00);
                i += 2;
            } else {
                return Ok((out, &bytes[i + 1..]));
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Err(TupleError::Truncated)
}

/// Typed accessors over an unpacked tuple.
pub trait TupleAccess {
    fn bytes_at(&self, index: usize) -> Result<&[u8], TupleError>;
    fn int_at(&self, index: usize) -> Result<i64, TupleError>;
}

impl TupleAccess for [Element] {
    fn bytes_at(&self, index: usize) -> Result<&[u8], TupleError> {
        let element = self.get(index).ok_or(TupleError::MissingElement(index))?;
        element.as_bytes().ok_or(TupleError::WrongType {
            index,
            expected: "byte string",
        })
    }

    fn int_at(&self, index: usize) -> Result<i64, TupleError> {
        let element = self.get(index).ok_or(TupleError::MissingElement(index))?;
        element.as_int().ok_or(TupleError::WrongType {
            index,
            expected: "integer",
        })
    }
}
