// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Chunk records
//!
//! A chunk maps a contiguous range of logical addresses onto one or more
//! physical stripes. Chunks appear both in the superblock's bootstrap array
//! and as `CHUNK_ITEM`s in the chunk tree; the layout is the same in both.

use std::fmt;

use bitflags::bitflags;
use serde::Serialize;
use uuid::Uuid;
use zerocopy::*;

use crate::{
    codec::{Le16, Le32, Le64, Reader},
    Error,
};

/// Upper bound on stripes per chunk
pub const MAX_STRIPES: usize = 256;

/// On-disk chunk header, followed by `num_stripes` [`DiskStripe`]s
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct DiskChunk {
    pub length: Le64,
    pub owner: Le64,
    pub stripe_len: Le64,
    pub flags: Le64,
    pub io_align: Le32,
    pub io_width: Le32,
    pub sector_size: Le32,
    pub num_stripes: Le16,
    pub sub_stripes: Le16,
}

/// On-disk stripe
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct DiskStripe {
    pub devid: Le64,
    pub offset: Le64,
    pub dev_uuid: [u8; 16],
}

pub const CHUNK_HEADER_SIZE: usize = 48;
pub const STRIPE_SIZE: usize = 32;

const _: () = assert!(std::mem::size_of::<DiskChunk>() == CHUNK_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<DiskStripe>() == STRIPE_SIZE);

bitflags! {
    /// Block group / chunk type and profile bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct BlockGroupFlags: u64 {
        const DATA = 1 << 0;
        const SYSTEM = 1 << 1;
        const METADATA = 1 << 2;
        const RAID0 = 1 << 3;
        const RAID1 = 1 << 4;
        const DUP = 1 << 5;
        const RAID10 = 1 << 6;
        const RAID5 = 1 << 7;
        const RAID6 = 1 << 8;
        const RAID1C3 = 1 << 9;
        const RAID1C4 = 1 << 10;
        const REMAPPED = 1 << 11;
        const REMAP = 1 << 12;
        const _ = !0;
    }
}

/// Striping profile of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RaidProfile {
    Single,
    Raid0,
    Raid1,
    Dup,
    Raid10,
    Raid5,
    Raid6,
    Raid1C3,
    Raid1C4,
}

impl RaidProfile {
    /// Select the profile from chunk flags
    ///
    /// Some filesystems have more than one profile bit set, so the order of
    /// these checks is significant: the first match wins.
    pub fn from_flags(flags: BlockGroupFlags) -> Self {
        if flags.contains(BlockGroupFlags::RAID0) {
            Self::Raid0
        } else if flags.contains(BlockGroupFlags::RAID1) {
            Self::Raid1
        } else if flags.contains(BlockGroupFlags::DUP) {
            Self::Dup
        } else if flags.contains(BlockGroupFlags::RAID10) {
            Self::Raid10
        } else if flags.contains(BlockGroupFlags::RAID5) {
            Self::Raid5
        } else if flags.contains(BlockGroupFlags::RAID6) {
            Self::Raid6
        } else if flags.contains(BlockGroupFlags::RAID1C3) {
            Self::Raid1C3
        } else if flags.contains(BlockGroupFlags::RAID1C4) {
            Self::Raid1C4
        } else {
            Self::Single
        }
    }

    /// Fewest stripes a chunk of this profile can be read from
    pub fn min_stripes(&self) -> usize {
        match self {
            Self::Single | Self::Raid0 | Self::Raid1 | Self::Dup | Self::Raid1C3 | Self::Raid1C4 => 1,
            Self::Raid10 | Self::Raid5 => 2,
            Self::Raid6 => 3,
        }
    }

    /// Number of parity stripes per stripe row
    pub fn parity_stripes(&self) -> usize {
        match self {
            Self::Raid5 => 1,
            Self::Raid6 => 2,
            _ => 0,
        }
    }
}

impl fmt::Display for RaidProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "SINGLE",
            Self::Raid0 => "RAID0",
            Self::Raid1 => "RAID1",
            Self::Dup => "DUP",
            Self::Raid10 => "RAID10",
            Self::Raid5 => "RAID5",
            Self::Raid6 => "RAID6",
            Self::Raid1C3 => "RAID1C3",
            Self::Raid1C4 => "RAID1C4",
        })
    }
}

/// One physical component of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: Uuid,
}

impl From<&DiskStripe> for Stripe {
    fn from(stripe: &DiskStripe) -> Self {
        Self {
            devid: stripe.devid.get(),
            offset: stripe.offset.get(),
            dev_uuid: Uuid::from_bytes(stripe.dev_uuid),
        }
    }
}

/// A decoded chunk; its logical start address is the key offset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub flags: BlockGroupFlags,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl Chunk {
    /// Decode one chunk from the front of `bytes`
    ///
    /// Returns the chunk and the number of bytes it occupied.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), Error> {
        let mut reader = Reader::new(bytes);
        let chunk = Self::read(&mut reader)?;
        Ok((chunk, reader.position()))
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let header: DiskChunk = reader.read()?;
        let num_stripes = header.num_stripes.get();
        if num_stripes == 0 {
            return Err(Error::InvalidChunk("chunk has no stripes"));
        }
        if usize::from(num_stripes) > MAX_STRIPES {
            return Err(Error::UnsupportedStripeCount(num_stripes));
        }

        let stripes = (0..num_stripes)
            .map(|_| reader.read::<DiskStripe>().map(|s| Stripe::from(&s)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            length: header.length.get(),
            owner: header.owner.get(),
            stripe_len: header.stripe_len.get(),
            flags: BlockGroupFlags::from_bits_retain(header.flags.get()),
            io_align: header.io_align.get(),
            io_width: header.io_width.get(),
            sector_size: header.sector_size.get(),
            sub_stripes: header.sub_stripes.get(),
            stripes,
        })
    }

    pub fn num_stripes(&self) -> usize {
        self.stripes.len()
    }

    pub fn profile(&self) -> RaidProfile {
        RaidProfile::from_flags(self.flags)
    }

    /// Size of this chunk's on-disk encoding
    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_SIZE + self.stripes.len() * STRIPE_SIZE
    }
}
