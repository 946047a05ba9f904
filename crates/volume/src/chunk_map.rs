// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Logical to physical address translation
//!
//! The [`ChunkMap`] holds every known chunk keyed by its logical start address.
//! [`ChunkMap::resolve`] finds the chunk covering an address and applies the
//! chunk's striping profile to locate the bytes on a device.

use std::collections::BTreeMap;

use btrfs_ondisk::{Chunk, RaidProfile};
use log::{trace, warn};

use crate::Error;

/// Where a logical range lives on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub devid: u64,
    pub physical: u64,
    /// Bytes readable contiguously from `physical`, at most the size requested
    pub len: u64,
}

/// Chunks keyed by logical start address
#[derive(Debug, Default, Clone)]
pub struct ChunkMap {
    chunks: BTreeMap<u64, Chunk>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk, replacing any chunk previously known at `start`
    pub fn insert(&mut self, start: u64, chunk: Chunk) -> Option<Chunk> {
        trace!(
            "chunk {start:#x}+{:#x} {} over {} stripes",
            chunk.length,
            chunk.profile(),
            chunk.num_stripes()
        );
        self.chunks.insert(start, chunk)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Chunk)> {
        self.chunks.iter().map(|(start, chunk)| (*start, chunk))
    }

    /// The chunk covering `addr` and its start address
    pub fn get(&self, addr: u64) -> Option<(u64, &Chunk)> {
        let (start, chunk) = self.chunks.range(..=addr).next_back()?;
        (addr - start < chunk.length).then_some((*start, chunk))
    }

    /// Locate `addr` on disk
    ///
    /// The returned mapping never extends past the end of the stripe element
    /// holding `addr`, so reads of `size` bytes may need to be split.
    pub fn resolve(&self, addr: u64, size: u64) -> Result<Mapping, Error> {
        let (start, chunk) = self.get(addr).ok_or(Error::AddressNotMapped(addr))?;
        let profile = chunk.profile();
        let num_stripes = chunk.num_stripes();
        if num_stripes < profile.min_stripes() {
            warn!("chunk {start:#x} has {num_stripes} stripes, {profile} needs {}", profile.min_stripes());
            return Err(Error::AddressNotMapped(addr));
        }

        let offset = addr - start;
        let chunk_left = chunk.length - offset;
        let stripe_len = chunk.stripe_len;
        let n = num_stripes as u64;
        let unmapped = || Error::AddressNotMapped(addr);

        let (index, within, run) = match profile {
            // Every stripe holds a full copy; read the first
            RaidProfile::Single
            | RaidProfile::Dup
            | RaidProfile::Raid1
            | RaidProfile::Raid1C3
            | RaidProfile::Raid1C4 => (0, offset, chunk_left),
            RaidProfile::Raid0 => {
                if stripe_len == 0 {
                    return Err(unmapped());
                }
                let stripe_nr = offset / stripe_len;
                let stripe_offset = offset % stripe_len;
                let index = (stripe_nr % n) as usize;
                let within = (stripe_nr / n)
                    .checked_mul(stripe_len)
                    .and_then(|row| row.checked_add(stripe_offset))
                    .ok_or_else(unmapped)?;
                (index, within, stripe_len - stripe_offset)
            }
            RaidProfile::Raid10 => {
                let sub_stripes = u64::from(chunk.sub_stripes);
                let groups = if sub_stripes == 0 { 0 } else { n / sub_stripes };
                if stripe_len == 0 || groups == 0 {
                    return Err(unmapped());
                }
                let stripe_nr = offset / stripe_len;
                let stripe_offset = offset % stripe_len;
                let index = ((stripe_nr % groups) * sub_stripes) as usize;
                let within = (stripe_nr / groups)
                    .checked_mul(stripe_len)
                    .and_then(|row| row.checked_add(stripe_offset))
                    .ok_or_else(unmapped)?;
                (index, within, stripe_len - stripe_offset)
            }
            RaidProfile::Raid5 | RaidProfile::Raid6 => {
                if stripe_len == 0 {
                    return Err(unmapped());
                }
                let data_stripes = n - profile.parity_stripes() as u64;
                let full_stripe = data_stripes.checked_mul(stripe_len).ok_or_else(unmapped)?;
                let row = offset / full_stripe;
                let row_offset = offset % full_stripe;
                let parity = (row % n + n - 1) % n;
                let index = ((parity + row_offset / stripe_len + 1) % n) as usize;
                let stripe_offset = row_offset % stripe_len;
                let within = row
                    .checked_mul(stripe_len)
                    .and_then(|base| base.checked_add(stripe_offset))
                    .ok_or_else(unmapped)?;
                (index, within, stripe_len - stripe_offset)
            }
        };
        let physical = chunk.stripes[index].offset.checked_add(within).ok_or_else(unmapped)?;

        let mapping = Mapping {
            devid: chunk.stripes[index].devid,
            physical,
            len: run.min(chunk_left).min(size),
        };
        trace!("{addr:#x} -> devid {} @ {:#x} ({profile})", mapping.devid, mapping.physical);
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use btrfs_ondisk::{BlockGroupFlags, Stripe};
    use uuid::Uuid;

    use super::*;

    const START: u64 = 0x1000000;
    const STRIPE_LEN: u64 = 0x10000;

    fn chunk(flags: BlockGroupFlags, sub_stripes: u16, stripes: &[(u64, u64)]) -> Chunk {
        Chunk {
            length: 0x400000,
            owner: 2,
            stripe_len: STRIPE_LEN,
            flags,
            io_align: 0x10000,
            io_width: 0x10000,
            sector_size: 0x1000,
            sub_stripes,
            stripes: stripes
                .iter()
                .map(|&(devid, offset)| Stripe {
                    devid,
                    offset,
                    dev_uuid: Uuid::nil(),
                })
                .collect(),
        }
    }

    fn map_of(chunk: Chunk) -> ChunkMap {
        let mut map = ChunkMap::new();
        map.insert(START, chunk);
        map
    }

    fn four_stripes() -> Vec<(u64, u64)> {
        vec![(1, 0x100000), (2, 0x200000), (3, 0x300000), (4, 0x400000)]
    }

    #[test_log::test]
    fn test_mapped_range() {
        let map = map_of(chunk(BlockGroupFlags::DATA, 0, &[(1, 0x100000)]));
        for addr in [START, START + 1, START + 0x3fffff] {
            assert!(map.resolve(addr, 1).is_ok());
        }
        for addr in [0, START - 1, START + 0x400000, u64::MAX] {
            assert!(matches!(map.resolve(addr, 1), Err(Error::AddressNotMapped(a)) if a == addr));
        }
    }

    #[test_log::test]
    fn test_raid0_rotates_stripes() {
        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID0, 0, &four_stripes()));
        for k in 0..4u64 {
            let mapping = map.resolve(START + k * STRIPE_LEN, 1).unwrap();
            assert_eq!(mapping.devid, k + 1);
            assert_eq!(mapping.physical, (k + 1) * 0x100000);
        }
        // Second row lands one stripe length further into the first device
        let mapping = map.resolve(START + 4 * STRIPE_LEN + 0x10, 1).unwrap();
        assert_eq!((mapping.devid, mapping.physical), (1, 0x100000 + STRIPE_LEN + 0x10));
    }

    #[test_log::test]
    fn test_raid10_alternates_groups() {
        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID10, 2, &four_stripes()));
        let devids: Vec<_> = (0..6u64)
            .map(|k| map.resolve(START + k * STRIPE_LEN, 1).unwrap().devid)
            .collect();
        assert_eq!(devids, [1, 3, 1, 3, 1, 3]);

        let mapping = map.resolve(START + 3 * STRIPE_LEN + 5, 1).unwrap();
        assert_eq!(mapping.physical, 0x300000 + STRIPE_LEN + 5);
    }

    #[test_log::test]
    fn test_mirrors_use_first_stripe() {
        for flags in [
            BlockGroupFlags::METADATA,
            BlockGroupFlags::METADATA | BlockGroupFlags::DUP,
            BlockGroupFlags::METADATA | BlockGroupFlags::RAID1,
            BlockGroupFlags::METADATA | BlockGroupFlags::RAID1C3,
        ] {
            let map = map_of(chunk(flags, 0, &[(7, 0x500000), (8, 0x600000), (9, 0x700000)]));
            for delta in [0u64, 0x100, 0x12345, 0x3fffff] {
                let mapping = map.resolve(START + delta, 1).unwrap();
                assert_eq!((mapping.devid, mapping.physical), (7, 0x500000 + delta));
            }
        }
    }

    #[test_log::test]
    fn test_raid1_three_stripes() {
        let stripes = [(1, 0x100000), (2, 0x200000), (3, 0x300000)];
        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID1, 0, &stripes));
        let mapping = map.resolve(0x1000100, 0x1000).unwrap();
        assert_eq!((mapping.devid, mapping.physical), (1, 0x100100));
        assert_eq!(mapping.len, 0x1000);
    }

    #[test_log::test]
    fn test_raid5_skips_parity() {
        let stripes = [(1, 0x100000), (2, 0x200000), (3, 0x300000)];
        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID5, 0, &stripes));

        // Row 0: parity on stripe 2, data on 0 and 1
        assert_eq!(map.resolve(START, 1).unwrap().devid, 1);
        assert_eq!(map.resolve(START + STRIPE_LEN, 1).unwrap().devid, 2);
        // Row 1: parity on stripe 0, data on 1 and 2
        let mapping = map.resolve(START + 2 * STRIPE_LEN + 7, 1).unwrap();
        assert_eq!((mapping.devid, mapping.physical), (2, 0x200000 + STRIPE_LEN + 7));
        assert_eq!(map.resolve(START + 3 * STRIPE_LEN, 1).unwrap().devid, 3);
    }

    #[test_log::test]
    fn test_raid6_skips_both_parities() {
        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID6, 0, &four_stripes()));
        // Row 0: parity index 3, data starts at stripe 0
        assert_eq!(map.resolve(START, 1).unwrap().devid, 1);
        assert_eq!(map.resolve(START + STRIPE_LEN, 1).unwrap().devid, 2);
        // Row 1: parity index 0, data starts at stripe 1
        assert_eq!(map.resolve(START + 2 * STRIPE_LEN, 1).unwrap().devid, 2);
    }

    #[test_log::test]
    fn test_too_few_stripes() {
        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID6, 0, &[(1, 0), (2, 0)]));
        assert!(matches!(map.resolve(START, 1), Err(Error::AddressNotMapped(_))));

        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID10, 0, &four_stripes()));
        assert!(matches!(map.resolve(START, 1), Err(Error::AddressNotMapped(_))));
    }

    #[test_log::test]
    fn test_corrupt_geometry_is_unmapped() {
        let mut wide = chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID5, 0, &[(1, 0), (2, 0), (3, 0)]);
        wide.stripe_len = u64::MAX / 2 + 1;
        let map = map_of(wide);
        assert!(matches!(map.resolve(START + 0x100, 1), Err(Error::AddressNotMapped(_))));

        let map = map_of(chunk(BlockGroupFlags::DATA, 0, &[(1, u64::MAX - 0x10)]));
        assert!(matches!(
            map.resolve(START + 0x100, 1),
            Err(Error::AddressNotMapped(addr)) if addr == START + 0x100
        ));
        // Still resolvable while the stripe offset fits
        assert_eq!(map.resolve(START + 0x10, 1).unwrap().physical, u64::MAX);

        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID0, 0, &[(1, u64::MAX), (2, 0)]));
        assert!(matches!(map.resolve(START + 1, 1), Err(Error::AddressNotMapped(_))));
        assert_eq!(map.resolve(START + STRIPE_LEN + 1, 1).unwrap().physical, 1);
    }

    #[test_log::test]
    fn test_mapping_stops_at_stripe_boundary() {
        let map = map_of(chunk(BlockGroupFlags::DATA | BlockGroupFlags::RAID0, 0, &four_stripes()));
        let mapping = map.resolve(START + STRIPE_LEN - 0x100, 0x1000).unwrap();
        assert_eq!(mapping.len, 0x100);

        let single = map_of(chunk(BlockGroupFlags::DATA, 0, &[(1, 0)]));
        assert_eq!(single.resolve(START + 0x3fff00, 0x1000).unwrap().len, 0x100);
    }
}
