// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! BTRFS superblock handling
//!
//! This module provides functionality for reading and parsing BTRFS filesystem superblocks,
//! which contain the roots of every tree, the device's own device item and the
//! bootstrap chunk array needed to locate the chunk tree.

use std::io::{self, Read, Seek};

use bitflags::bitflags;
use serde::Serialize;
use uuid::Uuid;
use zerocopy::*;

use crate::{
    checksum::{ChecksumOutcome, CsumType, CSUM_SIZE},
    chunk::Chunk,
    codec::{Le16, Le32, Le64, Reader},
    items::Device,
    key::{DiskKey, Key, KeyType},
    Error,
};

/// Byte offsets of the superblock copies on each device
pub const SUPERBLOCK_OFFSETS: [u64; 4] = [0x10000, 0x4000000, 0x4000000000, 0x4000000000000];

/// Size of the superblock in bytes
pub const SUPERBLOCK_SIZE: usize = 4096;

/// Offset of the magic field within the superblock
pub const MAGIC_OFFSET: usize = 0x40;

/// Magic number identifying a BTRFS superblock ("_BHRfS_M")
pub const MAGIC: U64<LittleEndian> = U64::new(0x4D5F53665248425F);

/// Size of the bootstrap chunk array
pub const SYS_CHUNK_ARRAY_SIZE: usize = 2048;

/// Per-device information, embedded in the superblock and stored as `DEV_ITEM`s
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct DevItem {
    /// Internal btrfs device id
    pub devid: Le64,
    /// Size of the device
    pub total_bytes: Le64,
    /// Bytes allocated on the device
    pub bytes_used: Le64,
    /// Optimal I/O alignment
    pub io_align: Le32,
    /// Optimal I/O width
    pub io_width: Le32,
    /// Minimal I/O size
    pub sector_size: Le32,
    /// Type and info about this device
    pub dev_type: Le64,
    /// Expected generation for this device
    pub generation: Le64,
    /// Start of the usable area on the device
    pub start_offset: Le64,
    /// Grouping information for allocation decisions
    pub dev_group: Le32,
    /// Seek speed, 0-100
    pub seek_speed: u8,
    /// Bandwidth, 0-100
    pub bandwidth: u8,
    /// Device UUID
    pub uuid: [u8; 16],
    /// UUID of the filesystem owning this device
    pub fsid: [u8; 16],
}

/// Snapshot of the important tree roots, four of which rotate in the superblock
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct RootBackup {
    pub tree_root: Le64,
    pub tree_root_gen: Le64,
    pub chunk_root: Le64,
    pub chunk_root_gen: Le64,
    pub extent_root: Le64,
    pub extent_root_gen: Le64,
    pub fs_root: Le64,
    pub fs_root_gen: Le64,
    pub dev_root: Le64,
    pub dev_root_gen: Le64,
    pub csum_root: Le64,
    pub csum_root_gen: Le64,
    pub total_bytes: Le64,
    pub bytes_used: Le64,
    pub num_devices: Le64,
    pub unused_64: [Le64; 4],
    pub tree_root_level: u8,
    pub chunk_root_level: u8,
    pub extent_root_level: u8,
    pub fs_root_level: u8,
    pub dev_root_level: u8,
    pub csum_root_level: u8,
    pub unused_8: [u8; 10],
}

/// BTRFS superblock definition that matches the on-disk format used by the Linux kernel.
///
/// The superblock contains critical filesystem metadata including:
/// - Filesystem UUID and label
/// - Size and usage information
/// - Root tree locations
/// - Compatibility flags
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone)]
#[repr(C)]
pub struct Superblock {
    /// Checksum of the superblock data
    pub csum: [u8; CSUM_SIZE],
    /// Filesystem UUID
    pub fsid: [u8; 16],
    /// Physical byte number where this copy of the superblock is located
    pub bytenr: Le64,
    /// Superblock flags
    pub flags: Le64,
    /// Magic number identifying this as a BTRFS superblock
    pub magic: Le64,
    /// Transaction ID of the filesystem
    pub generation: Le64,
    /// Logical address of the root tree root
    pub root: Le64,
    /// Logical address of the chunk tree root
    pub chunk_root: Le64,
    /// Logical address of the log tree root
    pub log_root: Le64,
    /// Transaction ID of the log tree (unused by current kernels)
    pub log_root_transid: Le64,
    /// Total size of the filesystem in bytes
    pub total_bytes: Le64,
    /// Number of bytes used
    pub bytes_used: Le64,
    /// Object ID of the root directory
    pub root_dir_objectid: Le64,
    /// Number of devices making up the filesystem
    pub num_devices: Le64,
    /// Size of a sector in bytes
    pub sectorsize: Le32,
    /// Size of nodes in the filesystem trees
    pub nodesize: Le32,
    /// Size of leaf nodes (always equal to nodesize)
    pub leafsize: Le32,
    /// Stripe size for the filesystem
    pub stripesize: Le32,
    /// Size of the system chunk array
    pub sys_chunk_array_size: Le32,
    /// Generation of the chunk tree
    pub chunk_root_generation: Le64,
    /// Compatible feature flags
    pub compat_flags: Le64,
    /// Compatible read-only feature flags
    pub compat_ro_flags: Le64,
    /// Incompatible feature flags
    pub incompat_flags: Le64,
    /// Checksum algorithm type
    pub csum_type: Le16,
    /// Level of the root tree
    pub root_level: u8,
    /// Level of the chunk tree
    pub chunk_root_level: u8,
    /// Level of the log tree
    pub log_root_level: u8,
    /// Device information
    pub dev_item: DevItem,
    /// Volume label
    pub label: [u8; 256],
    /// Cache generation number
    pub cache_generation: Le64,
    /// UUID tree generation
    pub uuid_tree_generation: Le64,
    /// Metadata UUID for the filesystem
    pub metadata_uuid: [u8; 16],
    /// Number of global root entries
    pub nr_global_roots: Le64,
    /// Logical address of the remap tree root
    pub remap_root: Le64,
    /// Generation of the remap tree
    pub remap_root_generation: Le64,
    /// Level of the remap tree
    pub remap_root_level: u8,
    /// Reserved for future use
    pub reserved: [u8; 199],
    /// System chunk array data
    pub sys_chunk_array: [u8; SYS_CHUNK_ARRAY_SIZE],
    /// Backup copies of the tree roots
    pub root_backups: [RootBackup; 4],
    /// Padding to 4096 bytes
    pub padding: [u8; 565],
}

const _: () = assert!(std::mem::size_of::<DevItem>() == 98);
const _: () = assert!(std::mem::size_of::<RootBackup>() == 168);
const _: () = assert!(std::mem::size_of::<Superblock>() == SUPERBLOCK_SIZE);

bitflags! {
    /// Incompatible feature flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct IncompatFlags: u64 {
        const MIXED_BACKREF = 1 << 0;
        const DEFAULT_SUBVOL = 1 << 1;
        const MIXED_GROUPS = 1 << 2;
        const COMPRESS_LZO = 1 << 3;
        const COMPRESS_ZSTD = 1 << 4;
        const BIG_METADATA = 1 << 5;
        const EXTENDED_IREF = 1 << 6;
        const RAID56 = 1 << 7;
        const SKINNY_METADATA = 1 << 8;
        const NO_HOLES = 1 << 9;
        const METADATA_UUID = 1 << 10;
        const RAID1C34 = 1 << 11;
        const ZONED = 1 << 12;
        const EXTENT_TREE_V2 = 1 << 13;
        const RAID_STRIPE_TREE = 1 << 14;
        const SIMPLE_QUOTA = 1 << 16;
        const REMAP_TREE = 1 << 17;
        const _ = !0;
    }

    /// Compatible read-only feature flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct CompatRoFlags: u64 {
        const FREE_SPACE_TREE = 1 << 0;
        const FREE_SPACE_TREE_VALID = 1 << 1;
        const VERITY = 1 << 2;
        const BLOCK_GROUP_TREE = 1 << 3;
        const _ = !0;
    }

    /// Superblock flags (shares the low bits with node header flags)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct SuperFlags: u64 {
        const WRITTEN = 1 << 0;
        const RELOC = 1 << 1;
        const ERROR = 1 << 2;
        const SEEDING = 1 << 32;
        const METADUMP = 1 << 33;
        const METADUMP_V2 = 1 << 34;
        const CHANGING_FSID = 1 << 35;
        const CHANGING_FSID_V2 = 1 << 36;
        const CHANGING_BG_TREE = 1 << 38;
        const CHANGING_DATA_CSUM = 1 << 39;
        const CHANGING_META_CSUM = 1 << 40;
        const _ = !0;
    }
}

impl Superblock {
    /// Decode a superblock from exactly [`SUPERBLOCK_SIZE`] bytes, checking the magic
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let block = Reader::new(bytes).read::<Superblock>()?;
        if block.magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        log::trace!(
            "valid magic field: UUID={} [volume label: \"{}\"]",
            block.uuid(),
            block.label().unwrap_or_else(|_| "[invalid utf8]".into())
        );
        Ok(block)
    }

    /// Read the superblock copy `mirror` (0..4) from a seekable reader
    pub fn from_reader<R: Read + Seek>(reader: &mut R, mirror: usize) -> Result<Self, Error> {
        let offset = *SUPERBLOCK_OFFSETS.get(mirror).ok_or(Error::NoSuchMirror(mirror))?;
        reader.seek(io::SeekFrom::Start(offset))?;
        let mut bytes = vec![0u8; SUPERBLOCK_SIZE];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Filesystem UUID
    pub fn fsid(&self) -> Uuid {
        Uuid::from_bytes(self.fsid)
    }

    /// Return the encoded UUID for this superblock as a string
    pub fn uuid(&self) -> String {
        self.fsid().hyphenated().to_string()
    }

    /// UUID stamped into metadata blocks; differs from the fsid with `METADATA_UUID`
    pub fn metadata_uuid(&self) -> Uuid {
        if self.incompat().contains(IncompatFlags::METADATA_UUID) {
            Uuid::from_bytes(self.metadata_uuid)
        } else {
            self.fsid()
        }
    }

    /// Return the volume label as a string
    pub fn label(&self) -> Result<String, Error> {
        let end = self.label.iter().position(|b| *b == 0).unwrap_or(self.label.len());
        Ok(std::str::from_utf8(&self.label[..end])?.to_owned())
    }

    pub fn csum_type(&self) -> CsumType {
        CsumType::from(self.csum_type.get())
    }

    pub fn nodesize(&self) -> u32 {
        self.nodesize.get()
    }

    pub fn num_devices(&self) -> u64 {
        self.num_devices.get()
    }

    pub fn incompat(&self) -> IncompatFlags {
        IncompatFlags::from_bits_retain(self.incompat_flags.get())
    }

    pub fn compat_ro(&self) -> CompatRoFlags {
        CompatRoFlags::from_bits_retain(self.compat_ro_flags.get())
    }

    pub fn flags(&self) -> SuperFlags {
        SuperFlags::from_bits_retain(self.flags.get())
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Logical address of the root tree
    pub fn root(&self) -> u64 {
        self.root.get()
    }

    /// Logical address of the chunk tree
    pub fn chunk_root(&self) -> u64 {
        self.chunk_root.get()
    }

    /// Logical address of the log tree, 0 when there is none
    pub fn log_root(&self) -> u64 {
        self.log_root.get()
    }

    /// The device item of the device this copy was read from
    pub fn dev_item(&self) -> Device {
        Device::from(&self.dev_item)
    }

    /// Backup root snapshots, in on-disk order
    pub fn backups(&self) -> &[RootBackup; 4] {
        &self.root_backups
    }

    /// Verify the checksum over everything after the checksum field
    pub fn checksum(&self) -> ChecksumOutcome {
        self.csum_type().verify(&self.csum, &self.as_bytes()[CSUM_SIZE..])
    }

    /// Decode the bootstrap chunk array
    ///
    /// Each entry is a `CHUNK_ITEM` key immediately followed by its chunk.
    /// The key offset is the chunk's logical start address.
    pub fn bootstrap_chunks(&self) -> Result<Vec<(Key, Chunk)>, Error> {
        let size = self.sys_chunk_array_size.get() as usize;
        if size > SYS_CHUNK_ARRAY_SIZE {
            return Err(Error::InvalidBootstrap("array size exceeds superblock"));
        }

        let mut reader = Reader::new(&self.sys_chunk_array[..size]);
        let mut chunks = Vec::new();
        while !reader.is_empty() {
            let key = Key::from(reader.read::<DiskKey>()?);
            if !key.is(KeyType::ChunkItem) {
                return Err(Error::InvalidBootstrap("entry is not a CHUNK_ITEM"));
            }
            let chunk = Chunk::read(&mut reader)?;
            chunks.push((key, chunk));
        }

        Ok(chunks)
    }
}
