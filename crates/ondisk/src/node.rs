// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Tree nodes
//!
//! Every tree block starts with a 101-byte [`Header`]. Leaves (level 0) follow it
//! with `nritems` 25-byte item descriptors whose payloads live in a data area
//! addressed relative to the end of the header. Internal nodes follow it with
//! `nritems` 33-byte key pointers.

use bitflags::bitflags;
use serde::Serialize;
use uuid::Uuid;
use zerocopy::*;

use crate::{
    checksum::{ChecksumOutcome, CsumType, CSUM_SIZE},
    codec::{Le32, Le64, Reader},
    key::{DiskKey, Key},
    Error,
};

/// Tree block header
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct Header {
    pub csum: [u8; CSUM_SIZE],
    pub fsid: [u8; 16],
    /// Logical address this block claims to live at
    pub bytenr: Le64,
    pub flags: Le64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: Le64,
    /// Object id of the tree owning this block
    pub owner: Le64,
    pub nritems: Le32,
    /// 0 for leaves
    pub level: u8,
}

/// Leaf item descriptor
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct ItemDescriptor {
    pub key: DiskKey,
    /// Payload offset, relative to the end of the header
    pub offset: Le32,
    pub size: Le32,
}

/// Internal node entry
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct DiskKeyPtr {
    pub key: DiskKey,
    pub blockptr: Le64,
    pub generation: Le64,
}

pub const HEADER_SIZE: usize = 101;
pub const ITEM_SIZE: usize = 25;
pub const KEY_PTR_SIZE: usize = 33;

/// Deepest level a btrfs tree may have
pub const MAX_LEVEL: u8 = 7;

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<ItemDescriptor>() == ITEM_SIZE);
const _: () = assert!(std::mem::size_of::<DiskKeyPtr>() == KEY_PTR_SIZE);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct HeaderFlags: u64 {
        const WRITTEN = 1 << 0;
        const RELOC = 1 << 1;
        const MIXED_BACKREF = 1 << 56;
        const _ = !0;
    }
}

impl Header {
    pub fn bytenr(&self) -> u64 {
        self.bytenr.get()
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn nritems(&self) -> u32 {
        self.nritems.get()
    }

    pub fn owner(&self) -> u64 {
        self.owner.get()
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    pub fn fsid(&self) -> Uuid {
        Uuid::from_bytes(self.fsid)
    }

    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_retain(self.flags.get())
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// Location of one leaf item's payload within the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeafItem {
    pub key: Key,
    pub offset: u32,
    pub size: u32,
}

/// Internal node entry, decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

/// A parsed tree block
#[derive(Debug, Clone)]
pub struct Node {
    header: Header,
    bytes: Vec<u8>,
    items: Vec<LeafItem>,
    pointers: Vec<KeyPtr>,
}

impl Node {
    /// Parse a whole tree block
    ///
    /// The item or pointer table and every payload span are checked against the
    /// block size; a self-description that points outside the block is refused.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, Error> {
        let mut reader = Reader::new(&bytes);
        let header: Header = reader.read()?;
        let count = header.nritems() as usize;
        let data_len = bytes.len() - HEADER_SIZE;

        let mut items = Vec::new();
        let mut pointers = Vec::new();

        if header.is_leaf() {
            let table = count.saturating_mul(ITEM_SIZE);
            if table > data_len {
                return Err(Error::Truncated {
                    needed: table,
                    available: data_len,
                });
            }
            items.reserve(count);
            for _ in 0..count {
                let item: ItemDescriptor = reader.read()?;
                let end = item.offset.get() as usize + item.size.get() as usize;
                if end > data_len {
                    return Err(Error::Truncated {
                        needed: end,
                        available: data_len,
                    });
                }
                items.push(LeafItem {
                    key: Key::from(&item.key),
                    offset: item.offset.get(),
                    size: item.size.get(),
                });
            }
        } else {
            let table = count.saturating_mul(KEY_PTR_SIZE);
            if table > data_len {
                return Err(Error::Truncated {
                    needed: table,
                    available: data_len,
                });
            }
            pointers.reserve(count);
            for _ in 0..count {
                let ptr: DiskKeyPtr = reader.read()?;
                pointers.push(KeyPtr {
                    key: Key::from(&ptr.key),
                    blockptr: ptr.blockptr.get(),
                    generation: ptr.generation.get(),
                });
            }
        }

        Ok(Self {
            header,
            bytes,
            items,
            pointers,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn level(&self) -> u8 {
        self.header.level
    }

    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }

    /// Leaf item table, in on-disk order (empty for internal nodes)
    pub fn leaf_items(&self) -> &[LeafItem] {
        &self.items
    }

    /// Key pointers, in on-disk order (empty for leaves)
    pub fn pointers(&self) -> &[KeyPtr] {
        &self.pointers
    }

    /// Payload bytes of a leaf item
    pub fn payload(&self, item: &LeafItem) -> &[u8] {
        let start = HEADER_SIZE + item.offset as usize;
        &self.bytes[start..start + item.size as usize]
    }

    /// Keys and payloads of every leaf item
    pub fn items(&self) -> impl Iterator<Item = (Key, &[u8])> + '_ {
        self.items.iter().map(|item| (item.key, self.payload(item)))
    }

    /// Verify the block checksum
    pub fn checksum(&self, csum_type: CsumType) -> ChecksumOutcome {
        csum_type.verify(&self.header.csum, &self.bytes[CSUM_SIZE..])
    }

    /// Raw bytes of the block
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
