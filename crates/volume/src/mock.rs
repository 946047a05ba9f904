// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Mock filesystem images for testing.
//!
//! [`Image`] assembles a small single-profile btrfs image in memory: a
//! superblock whose bootstrap array maps the system chunk, a chunk tree leaf
//! describing a DUP metadata chunk, a two-level root tree, an extent tree and
//! an FS tree leaf, and optionally a log tree. Every node is checksummed with
//! CRC32C.

use std::io::Cursor;

use btrfs_ondisk::{
    key::objectid,
    node::{HEADER_SIZE, ITEM_SIZE, KEY_PTR_SIZE},
    superblock::{MAGIC_OFFSET, SUPERBLOCK_OFFSETS, SUPERBLOCK_SIZE},
    BlockGroupFlags, Key, KeyType,
};

use crate::device::ByteSource;

pub(crate) const NODESIZE: usize = 4096;
pub(crate) const FSID: [u8; 16] = [0x5a; 16];
pub(crate) const IMAGE_SIZE: usize = 0x500000;

pub(crate) const SYS_START: u64 = 0x100000;
pub(crate) const SYS_LEN: u64 = 0x100000;
pub(crate) const META_START: u64 = 0x2000000;
pub(crate) const META_LEN: u64 = 0x100000;
pub(crate) const META_PHYSICAL: [u64; 2] = [0x200000, 0x300000];

pub(crate) const CHUNK_ROOT: u64 = SYS_START;
pub(crate) const FS_LEAF: u64 = META_START;
pub(crate) const ROOT_NODE: u64 = META_START + 0x1000;
pub(crate) const ROOT_LEAF_A: u64 = META_START + 0x2000;
pub(crate) const ROOT_LEAF_B: u64 = META_START + 0x3000;
pub(crate) const EXTENT_LEAF: u64 = META_START + 0x4000;
pub(crate) const LOG_ROOT: u64 = META_START + 0x5000;
pub(crate) const LOG_LEAF: u64 = META_START + 0x6000;
/// Holds a copy of the FS leaf, header and all
pub(crate) const STRAY_NODE: u64 = META_START + 0x7000;

/// Physical offset of a logical address on device 1
pub(crate) fn physical(logical: u64) -> usize {
    if logical >= META_START {
        (META_PHYSICAL[0] + logical - META_START) as usize
    } else {
        logical as usize
    }
}

/// A named in-memory byte source
pub(crate) fn source(name: &str, image: Vec<u8>) -> (String, Box<dyn ByteSource>) {
    (name.to_owned(), Box::new(Cursor::new(image)))
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

fn key_bytes(key: Key) -> Vec<u8> {
    let mut out = key.objectid.to_le_bytes().to_vec();
    out.push(key.item_type);
    out.extend_from_slice(&key.offset.to_le_bytes());
    out
}

fn seal(block: &mut [u8]) {
    let crc = crc32c::crc32c(&block[32..]);
    put(block, 0, &crc.to_le_bytes());
}

/// Encode a chunk with its stripes
pub(crate) fn chunk_bytes(length: u64, flags: BlockGroupFlags, stripes: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&objectid::EXTENT_TREE.to_le_bytes());
    out.extend_from_slice(&0x10000u64.to_le_bytes());
    out.extend_from_slice(&flags.bits().to_le_bytes());
    out.extend_from_slice(&(NODESIZE as u32).to_le_bytes());
    out.extend_from_slice(&(NODESIZE as u32).to_le_bytes());
    out.extend_from_slice(&(NODESIZE as u32).to_le_bytes());
    out.extend_from_slice(&(stripes.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    for (devid, offset) in stripes {
        out.extend_from_slice(&devid.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&[devid.to_le_bytes()[0]; 16]);
    }
    out
}

fn dev_item(devid: u64, fsid: [u8; 16]) -> Vec<u8> {
    let mut out = vec![0u8; 98];
    put(&mut out, 0, &devid.to_le_bytes());
    put(&mut out, 8, &(IMAGE_SIZE as u64).to_le_bytes());
    put(&mut out, 32, &(NODESIZE as u32).to_le_bytes());
    put(&mut out, 66, &[devid as u8; 16]);
    put(&mut out, 82, &fsid);
    out
}

fn inode_item(mode: u32) -> Vec<u8> {
    let mut out = vec![0u8; 160];
    put(&mut out, 0, &1u64.to_le_bytes());
    put(&mut out, 40, &1u32.to_le_bytes());
    put(&mut out, 52, &mode.to_le_bytes());
    out
}

/// A root item pointing at a tree whose root node is at `bytenr`
pub(crate) fn root_item(bytenr: u64, level: u8) -> Vec<u8> {
    let mut out = inode_item(0o40755);
    out.resize(439, 0);
    put(&mut out, 160, &1u64.to_le_bytes());
    put(&mut out, 168, &256u64.to_le_bytes());
    put(&mut out, 176, &bytenr.to_le_bytes());
    put(&mut out, 216, &1u32.to_le_bytes());
    out[238] = level;
    put(&mut out, 239, &1u64.to_le_bytes());
    out
}

fn dir_item(location: Key, name: &[u8], name_len: u16) -> Vec<u8> {
    let mut out = key_bytes(location);
    out.extend_from_slice(&1u64.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&name_len.to_le_bytes());
    out.push(1);
    out.extend_from_slice(name);
    out
}

fn header(block: &mut [u8], bytenr: u64, owner: u64, nritems: usize, level: u8, fsid: [u8; 16]) {
    put(block, 32, &fsid);
    put(block, 48, &bytenr.to_le_bytes());
    put(block, 56, &1u64.to_le_bytes());
    put(block, 80, &1u64.to_le_bytes());
    put(block, 88, &owner.to_le_bytes());
    put(block, 96, &(nritems as u32).to_le_bytes());
    block[100] = level;
}

/// A leaf holding `items` in order, payloads packed from the end of the block
pub(crate) fn leaf(bytenr: u64, owner: u64, fsid: [u8; 16], items: &[(Key, Vec<u8>)]) -> Vec<u8> {
    let mut block = vec![0u8; NODESIZE];
    header(&mut block, bytenr, owner, items.len(), 0, fsid);
    let mut data_end = NODESIZE - HEADER_SIZE;
    for (i, (key, payload)) in items.iter().enumerate() {
        data_end -= payload.len();
        let at = HEADER_SIZE + i * ITEM_SIZE;
        put(&mut block, at, &key_bytes(*key));
        put(&mut block, at + 17, &(data_end as u32).to_le_bytes());
        put(&mut block, at + 21, &(payload.len() as u32).to_le_bytes());
        put(&mut block, HEADER_SIZE + data_end, payload);
    }
    seal(&mut block);
    block
}

/// An internal node pointing at `children`
pub(crate) fn internal(bytenr: u64, owner: u64, level: u8, fsid: [u8; 16], children: &[(Key, u64)]) -> Vec<u8> {
    let mut block = vec![0u8; NODESIZE];
    header(&mut block, bytenr, owner, children.len(), level, fsid);
    for (i, (key, child)) in children.iter().enumerate() {
        let at = HEADER_SIZE + i * KEY_PTR_SIZE;
        put(&mut block, at, &key_bytes(*key));
        put(&mut block, at + 17, &child.to_le_bytes());
        put(&mut block, at + 25, &1u64.to_le_bytes());
    }
    seal(&mut block);
    block
}

/// Builder for a mock device image
#[derive(Debug, Clone)]
pub(crate) struct Image {
    pub(crate) devid: u64,
    pub(crate) num_devices: u64,
    pub(crate) fsid: [u8; 16],
    log: bool,
    broken_dir_item: bool,
}

impl Image {
    pub(crate) fn new() -> Self {
        Self {
            devid: 1,
            num_devices: 1,
            fsid: FSID,
            log: false,
            broken_dir_item: false,
        }
    }

    pub(crate) fn with_devid(self, devid: u64) -> Self {
        Self { devid, ..self }
    }

    pub(crate) fn with_num_devices(self, num_devices: u64) -> Self {
        Self { num_devices, ..self }
    }

    pub(crate) fn with_fsid(self, fsid: [u8; 16]) -> Self {
        Self { fsid, ..self }
    }

    /// Include a log tree with one log root
    pub(crate) fn with_log(self) -> Self {
        Self { log: true, ..self }
    }

    /// Give the FS tree's dir item a name running past its payload
    pub(crate) fn with_broken_dir_item(self) -> Self {
        Self {
            broken_dir_item: true,
            ..self
        }
    }

    pub(crate) fn source(&self) -> (String, Box<dyn ByteSource>) {
        source(&format!("mock{}", self.devid), self.build())
    }

    fn superblock(&self) -> Vec<u8> {
        let mut sb = vec![0u8; SUPERBLOCK_SIZE];
        put(&mut sb, 32, &self.fsid);
        put(&mut sb, 48, &SUPERBLOCK_OFFSETS[0].to_le_bytes());
        put(&mut sb, MAGIC_OFFSET, b"_BHRfS_M");
        put(&mut sb, 72, &1u64.to_le_bytes());
        put(&mut sb, 80, &ROOT_NODE.to_le_bytes());
        put(&mut sb, 88, &CHUNK_ROOT.to_le_bytes());
        if self.log {
            put(&mut sb, 96, &LOG_ROOT.to_le_bytes());
        }
        put(&mut sb, 112, &(IMAGE_SIZE as u64 * self.num_devices).to_le_bytes());
        put(&mut sb, 128, &6u64.to_le_bytes());
        put(&mut sb, 136, &self.num_devices.to_le_bytes());
        for field in [144, 148, 152, 156] {
            put(&mut sb, field, &(NODESIZE as u32).to_le_bytes());
        }
        put(&mut sb, 164, &1u64.to_le_bytes());
        // root level 1, chunk root level 0, log root level 0
        sb[198] = 1;
        put(&mut sb, 201, &dev_item(self.devid, self.fsid));
        put(&mut sb, 299, b"mock");

        let mut array = key_bytes(Key::new(objectid::FIRST_CHUNK_TREE, KeyType::ChunkItem as u8, SYS_START));
        array.extend(self.system_chunk());
        put(&mut sb, 160, &(array.len() as u32).to_le_bytes());
        put(&mut sb, 811, &array);

        seal(&mut sb);
        sb
    }

    fn system_chunk(&self) -> Vec<u8> {
        chunk_bytes(SYS_LEN, BlockGroupFlags::SYSTEM, &[(1, SYS_START)])
    }

    fn metadata_chunk(&self) -> Vec<u8> {
        chunk_bytes(
            META_LEN,
            BlockGroupFlags::METADATA | BlockGroupFlags::DUP,
            &[(1, META_PHYSICAL[0]), (1, META_PHYSICAL[1])],
        )
    }

    fn nodes(&self) -> Vec<(u64, Vec<u8>)> {
        let fsid = self.fsid;
        let root_key = |id| Key::new(id, KeyType::RootItem as u8, 0);
        let mut nodes = Vec::new();

        nodes.push((
            CHUNK_ROOT,
            leaf(
                CHUNK_ROOT,
                objectid::CHUNK_TREE,
                fsid,
                &[
                    (
                        Key::new(objectid::DEV_ITEMS, KeyType::DevItem as u8, 1),
                        dev_item(1, fsid),
                    ),
                    (
                        Key::new(objectid::FIRST_CHUNK_TREE, KeyType::ChunkItem as u8, SYS_START),
                        self.system_chunk(),
                    ),
                    (
                        Key::new(objectid::FIRST_CHUNK_TREE, KeyType::ChunkItem as u8, META_START),
                        self.metadata_chunk(),
                    ),
                ],
            ),
        ));

        nodes.push((
            ROOT_NODE,
            internal(
                ROOT_NODE,
                objectid::ROOT_TREE,
                1,
                fsid,
                &[
                    (root_key(objectid::EXTENT_TREE), ROOT_LEAF_A),
                    (root_key(objectid::FS_TREE), ROOT_LEAF_B),
                ],
            ),
        ));
        nodes.push((
            ROOT_LEAF_A,
            leaf(
                ROOT_LEAF_A,
                objectid::ROOT_TREE,
                fsid,
                &[(root_key(objectid::EXTENT_TREE), root_item(EXTENT_LEAF, 0))],
            ),
        ));
        nodes.push((
            ROOT_LEAF_B,
            leaf(
                ROOT_LEAF_B,
                objectid::ROOT_TREE,
                fsid,
                &[
                    (root_key(objectid::FS_TREE), root_item(FS_LEAF, 0)),
                    (Key::new(objectid::FS_TREE, 0xee, 0), vec![0xee; 12]),
                ],
            ),
        ));

        let mut extent_item = Vec::new();
        for value in [1u64, 1, 2] {
            extent_item.extend_from_slice(&value.to_le_bytes());
        }
        extent_item.push(KeyType::TreeBlockRef as u8);
        extent_item.extend_from_slice(&objectid::FS_TREE.to_le_bytes());
        nodes.push((
            EXTENT_LEAF,
            leaf(
                EXTENT_LEAF,
                objectid::EXTENT_TREE,
                fsid,
                &[(Key::new(FS_LEAF, KeyType::MetadataItem as u8, 0), extent_item)],
            ),
        ));

        let name_len = if self.broken_dir_item { 200 } else { 4 };
        let fs_leaf = leaf(
            FS_LEAF,
            objectid::FS_TREE,
            fsid,
            &[
                (Key::new(256, KeyType::InodeItem as u8, 0), inode_item(0o40755)),
                (
                    Key::new(256, KeyType::DirItem as u8, 0x1234),
                    dir_item(Key::new(257, KeyType::InodeItem as u8, 0), b"file", name_len),
                ),
                (Key::new(257, KeyType::InodeItem as u8, 0), inode_item(0o100644)),
            ],
        );
        nodes.push((STRAY_NODE, fs_leaf.clone()));
        nodes.push((FS_LEAF, fs_leaf));

        if self.log {
            nodes.push((
                LOG_ROOT,
                leaf(
                    LOG_ROOT,
                    objectid::TREE_LOG,
                    fsid,
                    &[(
                        Key::new(objectid::TREE_LOG, KeyType::RootItem as u8, objectid::FS_TREE),
                        root_item(LOG_LEAF, 0),
                    )],
                ),
            ));
            nodes.push((
                LOG_LEAF,
                leaf(
                    LOG_LEAF,
                    objectid::FS_TREE,
                    fsid,
                    &[(Key::new(257, KeyType::InodeItem as u8, 0), inode_item(0o100644))],
                ),
            ));
        }

        nodes
    }

    /// Assemble the device image
    pub(crate) fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; IMAGE_SIZE];
        put(&mut image, SUPERBLOCK_OFFSETS[0] as usize, &self.superblock());
        for (logical, node) in self.nodes() {
            if logical >= META_START {
                // Both DUP copies
                for base in META_PHYSICAL {
                    put(&mut image, (base + logical - META_START) as usize, &node);
                }
            } else {
                put(&mut image, physical(logical), &node);
            }
        }
        image
    }
}
