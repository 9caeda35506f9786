//! Subspace algebra for the bucket keyspace.
//!
//! A [`Subspace`] owns a raw key prefix and packs tuple elements under it.
//! All persistent state of a bucket lives under the caller-supplied
//! prefix; see the layout constants at the bottom of this module.

use crate::tuple::{self, Element, TupleError};

/// A half-open key range `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

/// A raw key prefix under which tuple-encoded keys are packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The raw prefix itself.
    pub fn key(&self) -> &[u8] {
        &self.prefix
    }

    /// A child subspace whose prefix is this prefix plus the packed elements.
    pub fn subspace(&self, elements: &[Element]) -> Subspace {
        Subspace {
            prefix: self.pack(elements),
        }
    }

    /// Pack `elements` under this prefix.
    pub fn pack(&self, elements: &[Element]) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(&tuple::pack(elements));
        out
    }

    /// Strip the prefix and unpack the remaining tuple.
    pub fn unpack(&self, key: &[u8]) -> Result<Vec<Element>, TupleError> {
        match key.strip_prefix(self.prefix.as_slice()) {
            Some(rest) => tuple::unpack(rest),
            None => Err(TupleError::Truncated),
        }
    }

    /// True if `key` encodes a tuple under this prefix.
    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// The range of all tuple-encoded keys under this prefix.
    pub fn range(&self) -> KeyRange {
        let mut begin = self.prefix.clone();
        begin.push(0x00);
        let mut end = self.prefix.clone();
        end.push(0xFF);
        KeyRange { begin, end }
    }

    /// The range of all keys under the child subspace for `elements`.
    pub fn range_of(&self, elements: &[Element]) -> KeyRange {
        self.subspace(elements).range()
    }
}

/// Upper bound for random task-uid probes: compares greater than any
/// generated uid (uids are 32 lowercase hex characters).
pub const MAX_UID: [u8; 32] = [0xFF; 32];

/// Sub-prefix names under a bucket's root subspace.
pub const ACTIVE_KEY: &[u8] = b"ac";
pub const AVAILABLE_PRIORITIZED_KEY: &[u8] = b"avp";
pub const TIMEOUTS_KEY: &[u8] = b"to";
pub const TASK_COUNT_KEY: &[u8] = b"task_count";

/// Sub-prefix names under a single future's subspace.
pub const BLOCKS_KEY: &[u8] = b"bl";
pub const CALLBACKS_KEY: &[u8] = b"cb";
