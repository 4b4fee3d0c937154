//! Cursor and alignment helpers shared by the codecs.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::mem::size_of;

// Netlink aligns everything to 4 bytes.
const ALIGN_TO: usize = 4;

/// Round `len` up to the next 4-byte boundary.
pub const fn align4(len: usize) -> usize {
    (len + ALIGN_TO - 1) & !(ALIGN_TO - 1)
}

/// Number of padding bytes needed to reach the next 4-byte boundary.
pub const fn pad4(len: usize) -> usize {
    align4(len) - len
}

/// A cursor over a byte slice. Errors carry the absolute offset at which
/// decoding failed, so a parse failure deep inside a packet points at the
/// offending byte.
#[derive(Debug)]
pub struct SliceReader<'a> {
    slice: &'a [u8],
    cursor: usize,
    base: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(slice: &'a [u8]) -> Self {
        Self {
            slice,
            cursor: 0,
            base: 0,
        }
    }

    /// A reader whose error offsets are reported relative to a larger
    /// enclosing buffer.
    pub fn with_base(slice: &'a [u8], base: usize) -> Self {
        Self {
            slice,
            cursor: 0,
            base,
        }
    }

    /// Absolute offset of the cursor (including the base).
    pub fn offset(&self) -> usize {
        self.base + self.cursor
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.cursor + len > self.slice.len() {
            return Err(Error::too_short(self.offset()));
        }
        let slice = &self.slice[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    /// Deserialize a fixed-width struct. The struct must carry explicit
    /// padding fields so that its serialized form matches the wire layout.
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T> {
        let offset = self.offset();
        let bytes = self.take(size_of::<T>())?;
        bincode::deserialize(bytes).map_err(|_| Error::too_short(offset))
    }

    /// Advance the cursor to the next 4-byte boundary, clamped to the end
    /// of the slice.
    pub fn align(&mut self) {
        self.cursor = align4(self.cursor).min(self.slice.len());
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.slice[self.cursor..]
    }

    pub fn len_remaining(&self) -> usize {
        self.slice.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.slice.len()
    }
}
