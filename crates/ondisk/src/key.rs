// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Tree keys and item type tags
//!
//! Every item in every btrfs tree is addressed by a `(objectid, type, offset)`
//! triple. The type tag also selects how the item payload is laid out.

use std::fmt;

use serde::Serialize;
use zerocopy::*;

use crate::codec::Le64;

/// On-disk key layout (17 bytes, packed)
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct DiskKey {
    pub objectid: Le64,
    pub item_type: u8,
    pub offset: Le64,
}

pub const KEY_SIZE: usize = 17;

const _: () = assert!(std::mem::size_of::<DiskKey>() == KEY_SIZE);

/// A decoded key, ordered by objectid, then type, then offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// The item type tag, if it is one we know
    pub fn key_type(&self) -> Option<KeyType> {
        KeyType::from_u8(self.item_type)
    }

    /// True if this key carries the given tag
    pub fn is(&self, key_type: KeyType) -> bool {
        self.item_type == key_type as u8
    }
}

impl From<&DiskKey> for Key {
    fn from(key: &DiskKey) -> Self {
        Self::new(key.objectid.get(), key.item_type, key.offset.get())
    }
}

impl From<DiskKey> for Key {
    fn from(key: DiskKey) -> Self {
        Self::from(&key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_type() {
            Some(kind) => write!(f, "{:x},{},{:x}", self.objectid, kind, self.offset),
            None => write!(f, "{:x},{:x},{:x}", self.objectid, self.item_type, self.offset),
        }
    }
}

macro_rules! key_types {
    ($($name:ident = $value:literal => $text:literal,)+) => {
        /// Known item type tags
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[repr(u8)]
        pub enum KeyType {
            $($name = $value,)+
        }

        impl KeyType {
            /// Map a raw tag to a known type
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$name),)+
                    _ => None,
                }
            }

            /// Canonical kernel name of the tag
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$name => $text,)+
                }
            }
        }
    };
}

key_types! {
    InodeItem = 0x01 => "INODE_ITEM",
    InodeRef = 0x0c => "INODE_REF",
    InodeExtref = 0x0d => "INODE_EXTREF",
    XattrItem = 0x18 => "XATTR_ITEM",
    VerityDescItem = 0x24 => "VERITY_DESC_ITEM",
    VerityMerkleItem = 0x25 => "VERITY_MERKLE_ITEM",
    OrphanItem = 0x30 => "ORPHAN_ITEM",
    DirLogItem = 0x3c => "DIR_LOG_ITEM",
    DirLogIndex = 0x48 => "DIR_LOG_INDEX",
    DirItem = 0x54 => "DIR_ITEM",
    DirIndex = 0x60 => "DIR_INDEX",
    ExtentData = 0x6c => "EXTENT_DATA",
    ExtentCsum = 0x80 => "EXTENT_CSUM",
    RootItem = 0x84 => "ROOT_ITEM",
    RootBackref = 0x90 => "ROOT_BACKREF",
    RootRef = 0x9c => "ROOT_REF",
    ExtentItem = 0xa8 => "EXTENT_ITEM",
    MetadataItem = 0xa9 => "METADATA_ITEM",
    ExtentOwnerRef = 0xac => "EXTENT_OWNER_REF",
    TreeBlockRef = 0xb0 => "TREE_BLOCK_REF",
    ExtentDataRef = 0xb2 => "EXTENT_DATA_REF",
    SharedBlockRef = 0xb6 => "SHARED_BLOCK_REF",
    SharedDataRef = 0xb8 => "SHARED_DATA_REF",
    BlockGroupItem = 0xc0 => "BLOCK_GROUP_ITEM",
    FreeSpaceInfo = 0xc6 => "FREE_SPACE_INFO",
    FreeSpaceExtent = 0xc7 => "FREE_SPACE_EXTENT",
    FreeSpaceBitmap = 0xc8 => "FREE_SPACE_BITMAP",
    DevExtent = 0xcc => "DEV_EXTENT",
    DevItem = 0xd8 => "DEV_ITEM",
    ChunkItem = 0xe4 => "CHUNK_ITEM",
    RaidStripe = 0xe6 => "RAID_STRIPE",
    IdentityRemap = 0xea => "IDENTITY_REMAP",
    Remap = 0xeb => "REMAP",
    RemapBackref = 0xec => "REMAP_BACKREF",
    QgroupStatus = 0xf0 => "QGROUP_STATUS",
    QgroupInfo = 0xf2 => "QGROUP_INFO",
    QgroupLimit = 0xf4 => "QGROUP_LIMIT",
    QgroupRelation = 0xf6 => "QGROUP_RELATION",
    TemporaryItem = 0xf8 => "TEMPORARY_ITEM",
    PersistentItem = 0xf9 => "PERSISTENT_ITEM",
    DevReplace = 0xfa => "DEV_REPLACE",
    UuidSubvol = 0xfb => "UUID_SUBVOL",
    UuidReceivedSubvol = 0xfc => "UUID_RECEIVED_SUBVOL",
    StringItem = 0xfd => "STRING_ITEM",
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Well-known object ids
pub mod objectid {
    pub const DEV_STATS: u64 = 0x0;
    pub const ROOT_TREE: u64 = 0x1;
    pub const EXTENT_TREE: u64 = 0x2;
    pub const CHUNK_TREE: u64 = 0x3;
    pub const DEV_TREE: u64 = 0x4;
    pub const FS_TREE: u64 = 0x5;
    pub const ROOT_TREE_DIR: u64 = 0x6;
    pub const CSUM_TREE: u64 = 0x7;
    pub const QUOTA_TREE: u64 = 0x8;
    pub const UUID_TREE: u64 = 0x9;
    pub const FREE_SPACE_TREE: u64 = 0xa;
    pub const BLOCK_GROUP_TREE: u64 = 0xb;
    pub const RAID_STRIPE_TREE: u64 = 0xc;
    pub const REMAP_TREE: u64 = 0xd;
    pub const FIRST_CHUNK_TREE: u64 = 0x100;
    pub const FIRST_FREE: u64 = 0x100;
    pub const LAST_FREE: u64 = 0xffff_ffff_ffff_ff00;
    pub const FREE_INO: u64 = 0xffff_ffff_ffff_fff4;
    pub const FREE_SPACE: u64 = 0xffff_ffff_ffff_fff5;
    pub const EXTENT_CSUM: u64 = 0xffff_ffff_ffff_fff6;
    pub const DATA_RELOC_TREE: u64 = 0xffff_ffff_ffff_fff7;
    pub const TREE_RELOC: u64 = 0xffff_ffff_ffff_fff8;
    pub const TREE_LOG_FIXUP: u64 = 0xffff_ffff_ffff_fff9;
    pub const TREE_LOG: u64 = 0xffff_ffff_ffff_fffa;
    pub const ORPHAN: u64 = 0xffff_ffff_ffff_fffb;
    pub const BALANCE: u64 = 0xffff_ffff_ffff_fffc;
    pub const DEV_ITEMS: u64 = 0x1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_key_ordering() {
        let mut keys = vec![
            Key::new(5, KeyType::DirItem as u8, 1),
            Key::new(5, KeyType::InodeItem as u8, 0),
            Key::new(4, 0xff, u64::MAX),
            Key::new(5, KeyType::DirItem as u8, 0),
        ];
        keys.sort();
        assert_eq!(keys[0], Key::new(4, 0xff, u64::MAX));
        assert_eq!(keys[1], Key::new(5, 0x01, 0));
        assert_eq!(keys[2], Key::new(5, 0x54, 0));
        assert_eq!(keys[3], Key::new(5, 0x54, 1));
    }

    #[test_log::test]
    fn test_key_from_disk() {
        let mut raw = [0u8; KEY_SIZE];
        raw[..8].copy_from_slice(&0x100u64.to_le_bytes());
        raw[8] = KeyType::ChunkItem as u8;
        raw[9..].copy_from_slice(&0x1000000u64.to_le_bytes());
        let key = Key::from(DiskKey::read_from_bytes(&raw).unwrap());
        assert_eq!(key, Key::new(0x100, 0xe4, 0x1000000));
        assert!(key.is(KeyType::ChunkItem));
        assert_eq!(key.to_string(), "100,CHUNK_ITEM,1000000");
        assert_eq!(Key::new(1, 0xee, 2).to_string(), "1,ee,2");
    }

    #[test_log::test]
    fn test_key_type_names() {
        assert_eq!(KeyType::from_u8(0x84), Some(KeyType::RootItem));
        assert_eq!(KeyType::from_u8(0xee), None);
        assert_eq!(KeyType::QgroupRelation.to_string(), "QGROUP_RELATION");
    }
}
