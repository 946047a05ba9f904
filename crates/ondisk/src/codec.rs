// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Little-endian primitives and a bounds-checked byte cursor
//!
//! Fixed layouts are expressed as zerocopy structs made of the aliases below.
//! Variable layouts (names, inline references, repeated records) are walked
//! with [`Reader`], which refuses to read past the end of its slice.

use zerocopy::{FromBytes, LittleEndian, U16, U32, U64};

use crate::Error;

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type Le64 = U64<LittleEndian>;

/// Forward-only cursor over a byte slice
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to consume
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unconsumed tail, without advancing
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Take exactly `len` bytes
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.remaining() {
            return Err(Error::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Take the rest of the slice
    pub fn take_rest(&mut self) -> &'a [u8] {
        let out = self.rest();
        self.pos = self.data.len();
        out
    }

    /// Read a fixed-layout structure
    pub fn read<T: FromBytes>(&mut self) -> Result<T, Error> {
        let needed = std::mem::size_of::<T>();
        let available = self.remaining();
        let bytes = self.bytes(needed)?;
        T::read_from_bytes(bytes).map_err(|_| Error::Truncated { needed, available })
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
