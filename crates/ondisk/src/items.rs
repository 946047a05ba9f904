// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Leaf item payload decoding
//!
//! [`decode`] interprets the payload of a leaf item according to its key. Payloads
//! come in three shapes:
//!
//! - a single fixed record (inode items, block groups, qgroup records, ...)
//! - a fixed record followed by a run of tagged inline references (extent items)
//! - a run of self-sized records packed back to back (inode refs, dir items)
//!
//! Every read goes through a bounds-checked [`Reader`]. Bytes left over once a
//! record has been decoded are reported in [`Decoded::leftover`] rather than
//! treated as an error, and tags we do not know decode to [`Item::Unknown`].

use std::fmt;

use bitflags::bitflags;
use serde::{Serialize, Serializer};
use serde_with::{hex::Hex, serde_as};
use uuid::Uuid;

use crate::{
    checksum::CsumType,
    chunk::{BlockGroupFlags, Chunk},
    codec::Reader,
    key::{objectid, DiskKey, Key, KeyType},
    superblock::DevItem,
    Error,
};

/// A decoded payload and the number of trailing bytes nothing claimed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decoded {
    pub item: Item,
    pub leftover: usize,
}

/// Every payload layout we know how to decode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Item {
    Inode(InodeItem),
    InodeRefs(Vec<InodeRef>),
    InodeExtrefs(Vec<InodeExtref>),
    /// `DIR_ITEM`, `DIR_INDEX` and `XATTR_ITEM`
    DirItems(Vec<DirItem>),
    DirLog(DirLogItem),
    VerityDescriptor(VerityDescriptorItem),
    FsverityDescriptor(FsverityDescriptor),
    VerityData(Blob),
    VerityMerkle(Blob),
    Orphan,
    FileExtent(FileExtent),
    ExtentCsum(Checksums),
    Root(RootItem),
    /// `ROOT_REF` and `ROOT_BACKREF`
    RootRef(RootRef),
    Extent(ExtentItem),
    ExtentV0 { refs: u32 },
    TreeBlockRef,
    SharedBlockRef,
    ExtentDataRef(ExtentDataRef),
    SharedDataRef { count: u32 },
    BlockGroup(BlockGroupItem),
    FreeSpaceInfo(FreeSpaceInfo),
    FreeSpaceExtent,
    FreeSpaceBitmap(Blob),
    FreeSpaceHeader(FreeSpaceHeader),
    DevExtent(DevExtent),
    Dev(Device),
    Chunk(Chunk),
    RaidStripe(Vec<RaidStride>),
    IdentityRemap,
    Remap { address: u64 },
    RemapBackref { address: u64 },
    QgroupStatus(QgroupStatus),
    QgroupInfo(QgroupInfo),
    QgroupLimit(QgroupLimit),
    QgroupRelation,
    Balance(BalanceItem),
    DevStats(Vec<u64>),
    DevReplace(DevReplace),
    /// `UUID_SUBVOL` and `UUID_RECEIVED_SUBVOL`
    UuidSubvol(Vec<u64>),
    String(Name),
    /// A tag we do not know, with the payload size
    Unknown(usize),
}

/// Raw name bytes; btrfs does not mandate an encoding
#[derive(Clone, PartialEq, Eq)]
pub struct Name(pub Vec<u8>);

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Opaque bytes, serialized as hex
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blob(#[serde_as(as = "Hex")] pub Vec<u8>);

/// Data checksums, one per sector
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checksums(#[serde_as(as = "Vec<Hex>")] pub Vec<Vec<u8>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

bitflags! {
    /// Inode flags; the upper 32 bits hold the read-only compat flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct InodeFlags: u64 {
        const NODATASUM = 1 << 0;
        const NODATACOW = 1 << 1;
        const READONLY = 1 << 2;
        const NOCOMPRESS = 1 << 3;
        const PREALLOC = 1 << 4;
        const SYNC = 1 << 5;
        const IMMUTABLE = 1 << 6;
        const APPEND = 1 << 7;
        const NODUMP = 1 << 8;
        const NOATIME = 1 << 9;
        const DIRSYNC = 1 << 10;
        const COMPRESS = 1 << 11;
        const ROOT_ITEM_INIT = 1 << 31;
        const RO_VERITY = 1 << 32;
        const _ = !0;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct ExtentFlags: u64 {
        const DATA = 1 << 0;
        const TREE_BLOCK = 1 << 1;
        const FULL_BACKREF = 1 << 8;
        const _ = !0;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct RootFlags: u64 {
        const SUBVOL_RDONLY = 1 << 0;
        const SUBVOL_DEAD = 1 << 48;
        const _ = !0;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct FreeSpaceFlags: u32 {
        const USING_BITMAPS = 1 << 0;
        const _ = !0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: InodeFlags,
    pub sequence: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub otime: Timespec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeRef {
    pub index: u64,
    pub name: Name,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeExtref {
    pub parent_objectid: u64,
    pub index: u64,
    pub name: Name,
}

/// Directory entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    Unknown,
    RegFile,
    Dir,
    Chrdev,
    Blkdev,
    Fifo,
    Sock,
    Symlink,
    Xattr,
    Other(u8),
}

impl From<u8> for FileType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Unknown,
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            8 => Self::Xattr,
            other => Self::Other(other),
        }
    }
}

/// One directory entry or extended attribute
///
/// For xattrs `name` is the attribute name and `data` its value; directory
/// entries carry no data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirItem {
    pub location: Key,
    pub transid: u64,
    pub file_type: FileType,
    pub name: Name,
    pub data: Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirLogItem {
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerityDescriptorItem {
    pub size: u64,
    pub encryption: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerityHash {
    Sha256,
    Sha512,
    Other(u8),
}

impl VerityHash {
    fn digest_size(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 | Self::Other(_) => 64,
        }
    }
}

/// The fs-verity descriptor stored after the verity descriptor item
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsverityDescriptor {
    pub version: u8,
    pub hash_algorithm: VerityHash,
    pub log_blocksize: u8,
    pub data_size: u64,
    #[serde_as(as = "Hex")]
    pub root_hash: Vec<u8>,
    #[serde_as(as = "Hex")]
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Compression {
    None,
    Zlib,
    Lzo,
    Zstd,
    Other(u8),
}

impl From<u8> for Compression {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Zlib,
            2 => Self::Lzo,
            3 => Self::Zstd,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FileExtentBody {
    /// Data stored in the leaf itself, possibly compressed
    Inline(Blob),
    Regular(ExtentLocation),
    Prealloc(ExtentLocation),
    Other { extent_type: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentLocation {
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub offset: u64,
    pub num_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileExtent {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: Compression,
    pub encryption: u8,
    pub other_encoding: u16,
    pub body: FileExtentBody,
}

/// Fields added to root items by the v2 layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootItemV2 {
    pub generation_v2: u64,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub received_uuid: Uuid,
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
    pub ctime: Timespec,
    pub otime: Timespec,
    pub stime: Timespec,
    pub rtime: Timespec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootItem {
    pub inode: InodeItem,
    pub generation: u64,
    pub root_dirid: u64,
    /// Logical address of the tree's root node
    pub bytenr: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: RootFlags,
    pub refs: u32,
    pub drop_progress: Key,
    pub drop_level: u8,
    pub level: u8,
    /// Absent on filesystems created before the v2 layout
    pub v2: Option<RootItemV2>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name: Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeBlockInfo {
    pub key: Key,
    pub level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentDataRef {
    pub root: u64,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

/// Back reference embedded in an extent item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InlineRef {
    TreeBlock { root: u64 },
    SharedBlock { parent: u64 },
    ExtentData(ExtentDataRef),
    SharedData { parent: u64, count: u32 },
    ExtentOwner { root: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: u64,
    pub flags: ExtentFlags,
    /// Present for non-skinny tree block extents
    pub tree_block: Option<TreeBlockInfo>,
    pub inline_refs: Vec<InlineRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockGroupItem {
    pub used: u64,
    pub chunk_objectid: u64,
    pub flags: BlockGroupFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeSpaceInfo {
    pub extent_count: u32,
    pub flags: FreeSpaceFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeSpaceHeader {
    pub location: Key,
    pub generation: u64,
    pub num_entries: u64,
    pub num_bitmaps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DevExtent {
    pub chunk_tree: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
    pub chunk_tree_uuid: Uuid,
}

/// A device item, decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Device {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: Uuid,
    pub fsid: Uuid,
}

impl From<&DevItem> for Device {
    fn from(item: &DevItem) -> Self {
        Self {
            devid: item.devid.get(),
            total_bytes: item.total_bytes.get(),
            bytes_used: item.bytes_used.get(),
            io_align: item.io_align.get(),
            io_width: item.io_width.get(),
            sector_size: item.sector_size.get(),
            dev_type: item.dev_type.get(),
            generation: item.generation.get(),
            start_offset: item.start_offset.get(),
            dev_group: item.dev_group.get(),
            seek_speed: item.seek_speed,
            bandwidth: item.bandwidth,
            uuid: Uuid::from_bytes(item.uuid),
            fsid: Uuid::from_bytes(item.fsid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RaidStride {
    pub devid: u64,
    pub physical: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QgroupStatus {
    pub version: u64,
    pub generation: u64,
    pub flags: u64,
    pub rescan: u64,
    /// Only present with simple quotas
    pub enable_gen: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QgroupInfo {
    pub generation: u64,
    pub rfer: u64,
    pub rfer_cmpr: u64,
    pub excl: u64,
    pub excl_cmpr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QgroupLimit {
    pub flags: u64,
    pub max_rfer: u64,
    pub max_excl: u64,
    pub rsv_rfer: u64,
    pub rsv_excl: u64,
}

/// Filter arguments of a balance for one block group type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceArgs {
    pub profiles: u64,
    /// Either a single usage percentage or a min/max pair packed in two u32s
    pub usage: u64,
    pub devid: u64,
    pub pstart: u64,
    pub pend: u64,
    pub vstart: u64,
    pub vend: u64,
    pub target: u64,
    pub flags: u64,
    /// Either a single limit or a min/max pair packed in two u32s
    pub limit: u64,
    pub stripes_min: u32,
    pub stripes_max: u32,
}

impl BalanceArgs {
    pub fn usage_range(&self) -> (u32, u32) {
        (self.usage as u32, (self.usage >> 32) as u32)
    }

    pub fn limit_range(&self) -> (u32, u32) {
        (self.limit as u32, (self.limit >> 32) as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceItem {
    pub flags: u64,
    pub data: BalanceArgs,
    pub meta: BalanceArgs,
    pub sys: BalanceArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DevReplace {
    pub src_devid: u64,
    pub cursor_left: u64,
    pub cursor_right: u64,
    pub cont_reading_from_srcdev_mode: u64,
    pub replace_state: u64,
    pub time_started: u64,
    pub time_stopped: u64,
    pub num_write_errors: u64,
    pub num_uncorrectable_read_errors: u64,
}

/// Decode a leaf item payload
///
/// `csum_type` is the filesystem's checksum algorithm; it sets the element
/// width of `EXTENT_CSUM` items.
pub fn decode(key: &Key, payload: &[u8], csum_type: CsumType) -> Result<Decoded, Error> {
    let mut reader = Reader::new(payload);
    let item = decode_item(key, &mut reader, csum_type).map_err(|e| match e {
        Error::Truncated { needed, available } => Error::TruncatedItem {
            key: *key,
            needed,
            available,
        },
        other => other,
    })?;

    Ok(Decoded {
        item,
        leftover: reader.remaining(),
    })
}

fn decode_item(key: &Key, r: &mut Reader<'_>, csum_type: CsumType) -> Result<Item, Error> {
    // These object ids reuse tags that mean something else elsewhere
    if key.item_type == 0 && key.objectid == objectid::FREE_SPACE {
        return Ok(Item::FreeSpaceHeader(free_space_header(r)?));
    }
    if key.objectid == objectid::BALANCE && key.is(KeyType::TemporaryItem) {
        return Ok(Item::Balance(balance_item(r)?));
    }

    let Some(key_type) = key.key_type() else {
        log::trace!("unknown item type {:#x} at {key}", key.item_type);
        return Ok(unknown(r));
    };

    let item = match key_type {
        KeyType::InodeItem => Item::Inode(inode_item(r)?),
        KeyType::InodeRef => Item::InodeRefs(repeated(r, inode_ref)?),
        KeyType::InodeExtref => Item::InodeExtrefs(repeated(r, inode_extref)?),
        KeyType::XattrItem | KeyType::DirItem | KeyType::DirIndex => Item::DirItems(repeated(r, dir_item)?),
        KeyType::DirLogItem | KeyType::DirLogIndex => Item::DirLog(DirLogItem { end: r.u64()? }),
        KeyType::VerityDescItem => verity_desc(key, r)?,
        KeyType::VerityMerkleItem => Item::VerityMerkle(Blob(r.take_rest().to_vec())),
        KeyType::OrphanItem => Item::Orphan,
        KeyType::ExtentData => Item::FileExtent(file_extent(r)?),
        KeyType::ExtentCsum => Item::ExtentCsum(extent_csum(r, csum_type)?),
        KeyType::RootItem => Item::Root(root_item(r)?),
        KeyType::RootRef | KeyType::RootBackref => Item::RootRef(root_ref(r)?),
        KeyType::ExtentItem if r.remaining() < EXTENT_ITEM_SIZE => Item::ExtentV0 { refs: r.u32()? },
        KeyType::ExtentItem | KeyType::MetadataItem => Item::Extent(extent_item(key, r)?),
        KeyType::TreeBlockRef => Item::TreeBlockRef,
        KeyType::SharedBlockRef => Item::SharedBlockRef,
        KeyType::ExtentDataRef => Item::ExtentDataRef(extent_data_ref(r)?),
        KeyType::SharedDataRef => Item::SharedDataRef { count: r.u32()? },
        KeyType::BlockGroupItem => Item::BlockGroup(BlockGroupItem {
            used: r.u64()?,
            chunk_objectid: r.u64()?,
            flags: BlockGroupFlags::from_bits_retain(r.u64()?),
        }),
        KeyType::FreeSpaceInfo => Item::FreeSpaceInfo(FreeSpaceInfo {
            extent_count: r.u32()?,
            flags: FreeSpaceFlags::from_bits_retain(r.u32()?),
        }),
        KeyType::FreeSpaceExtent => Item::FreeSpaceExtent,
        KeyType::FreeSpaceBitmap => Item::FreeSpaceBitmap(Blob(r.take_rest().to_vec())),
        KeyType::DevExtent => Item::DevExtent(DevExtent {
            chunk_tree: r.u64()?,
            chunk_objectid: r.u64()?,
            chunk_offset: r.u64()?,
            length: r.u64()?,
            chunk_tree_uuid: uuid(r)?,
        }),
        KeyType::DevItem => Item::Dev(Device::from(&r.read::<DevItem>()?)),
        KeyType::ChunkItem => Item::Chunk(Chunk::read(r)?),
        KeyType::RaidStripe => Item::RaidStripe(raid_stripe(r)?),
        KeyType::IdentityRemap => Item::IdentityRemap,
        KeyType::Remap => Item::Remap { address: r.u64()? },
        KeyType::RemapBackref => Item::RemapBackref { address: r.u64()? },
        KeyType::QgroupStatus => Item::QgroupStatus(qgroup_status(r)?),
        KeyType::QgroupInfo => Item::QgroupInfo(QgroupInfo {
            generation: r.u64()?,
            rfer: r.u64()?,
            rfer_cmpr: r.u64()?,
            excl: r.u64()?,
            excl_cmpr: r.u64()?,
        }),
        KeyType::QgroupLimit => Item::QgroupLimit(QgroupLimit {
            flags: r.u64()?,
            max_rfer: r.u64()?,
            max_excl: r.u64()?,
            rsv_rfer: r.u64()?,
            rsv_excl: r.u64()?,
        }),
        KeyType::QgroupRelation => Item::QgroupRelation,
        KeyType::PersistentItem if key.objectid == objectid::DEV_STATS => Item::DevStats(u64_list(r)),
        KeyType::DevReplace => Item::DevReplace(dev_replace(r)?),
        KeyType::UuidSubvol | KeyType::UuidReceivedSubvol => Item::UuidSubvol(u64_list(r)),
        KeyType::StringItem => Item::String(Name(r.take_rest().to_vec())),
        KeyType::TemporaryItem
        | KeyType::PersistentItem
        | KeyType::ExtentOwnerRef => unknown(r),
    };

    Ok(item)
}

const EXTENT_ITEM_SIZE: usize = 24;
const FSVERITY_DESCRIPTOR_SIZE: usize = 256;

fn unknown(r: &mut Reader<'_>) -> Item {
    Item::Unknown(r.take_rest().len())
}

/// Decode back-to-back records until the payload is exhausted
fn repeated<T>(
    r: &mut Reader<'_>,
    mut parse: impl FnMut(&mut Reader<'_>) -> Result<T, Error>,
) -> Result<Vec<T>, Error> {
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(parse(r)?);
    }
    Ok(out)
}

fn u64_list(r: &mut Reader<'_>) -> Vec<u64> {
    let mut out = Vec::with_capacity(r.remaining() / 8);
    while let Ok(value) = r.u64() {
        out.push(value);
    }
    out
}

fn uuid(r: &mut Reader<'_>) -> Result<Uuid, Error> {
    Ok(Uuid::from_bytes(r.array()?))
}

fn key(r: &mut Reader<'_>) -> Result<Key, Error> {
    Ok(Key::from(r.read::<DiskKey>()?))
}

fn name(r: &mut Reader<'_>, len: u16) -> Result<Name, Error> {
    Ok(Name(r.bytes(usize::from(len))?.to_vec()))
}

fn timespec(r: &mut Reader<'_>) -> Result<Timespec, Error> {
    Ok(Timespec {
        sec: r.u64()?,
        nsec: r.u32()?,
    })
}

fn inode_item(r: &mut Reader<'_>) -> Result<InodeItem, Error> {
    let generation = r.u64()?;
    let transid = r.u64()?;
    let size = r.u64()?;
    let nbytes = r.u64()?;
    let block_group = r.u64()?;
    let nlink = r.u32()?;
    let uid = r.u32()?;
    let gid = r.u32()?;
    let mode = r.u32()?;
    let rdev = r.u64()?;
    let flags = InodeFlags::from_bits_retain(r.u64()?);
    let sequence = r.u64()?;
    r.bytes(4 * 8)?;

    Ok(InodeItem {
        generation,
        transid,
        size,
        nbytes,
        block_group,
        nlink,
        uid,
        gid,
        mode,
        rdev,
        flags,
        sequence,
        atime: timespec(r)?,
        ctime: timespec(r)?,
        mtime: timespec(r)?,
        otime: timespec(r)?,
    })
}

fn inode_ref(r: &mut Reader<'_>) -> Result<InodeRef, Error> {
    let index = r.u64()?;
    let len = r.u16()?;
    Ok(InodeRef {
        index,
        name: name(r, len)?,
    })
}

fn inode_extref(r: &mut Reader<'_>) -> Result<InodeExtref, Error> {
    let parent_objectid = r.u64()?;
    let index = r.u64()?;
    let len = r.u16()?;
    Ok(InodeExtref {
        parent_objectid,
        index,
        name: name(r, len)?,
    })
}

fn dir_item(r: &mut Reader<'_>) -> Result<DirItem, Error> {
    let location = key(r)?;
    let transid = r.u64()?;
    let data_len = r.u16()?;
    let name_len = r.u16()?;
    let file_type = FileType::from(r.u8()?);
    Ok(DirItem {
        location,
        transid,
        file_type,
        name: name(r, name_len)?,
        data: name(r, data_len)?,
    })
}

fn verity_desc(key: &Key, r: &mut Reader<'_>) -> Result<Item, Error> {
    if key.offset == 0 {
        let size = r.u64()?;
        r.bytes(2 * 8)?;
        return Ok(Item::VerityDescriptor(VerityDescriptorItem {
            size,
            encryption: r.u8()?,
        }));
    }

    // The descriptor itself is split across items keyed by byte offset + 1
    if key.offset != 1 || r.remaining() < FSVERITY_DESCRIPTOR_SIZE {
        return Ok(Item::VerityData(Blob(r.take_rest().to_vec())));
    }

    let version = r.u8()?;
    let hash_algorithm = match r.u8()? {
        1 => VerityHash::Sha256,
        2 => VerityHash::Sha512,
        other => VerityHash::Other(other),
    };
    let log_blocksize = r.u8()?;
    let salt_size = r.u8()?;
    r.bytes(4)?;
    let data_size = r.u64()?;
    let root_hash = r.bytes(64)?[..hash_algorithm.digest_size()].to_vec();
    let salt = r.bytes(32)?[..usize::from(salt_size).min(32)].to_vec();
    r.bytes(144)?;

    Ok(Item::FsverityDescriptor(FsverityDescriptor {
        version,
        hash_algorithm,
        log_blocksize,
        data_size,
        root_hash,
        salt,
    }))
}

fn file_extent(r: &mut Reader<'_>) -> Result<FileExtent, Error> {
    let generation = r.u64()?;
    let ram_bytes = r.u64()?;
    let compression = Compression::from(r.u8()?);
    let encryption = r.u8()?;
    let other_encoding = r.u16()?;
    let extent_type = r.u8()?;

    let body = match extent_type {
        0 => FileExtentBody::Inline(Blob(r.take_rest().to_vec())),
        1 | 2 => {
            let location = ExtentLocation {
                disk_bytenr: r.u64()?,
                disk_num_bytes: r.u64()?,
                offset: r.u64()?,
                num_bytes: r.u64()?,
            };
            if extent_type == 1 {
                FileExtentBody::Regular(location)
            } else {
                FileExtentBody::Prealloc(location)
            }
        }
        other => FileExtentBody::Other { extent_type: other },
    };

    Ok(FileExtent {
        generation,
        ram_bytes,
        compression,
        encryption,
        other_encoding,
        body,
    })
}

fn extent_csum(r: &mut Reader<'_>, csum_type: CsumType) -> Result<Checksums, Error> {
    let size = csum_type.size();
    let mut sums = Vec::with_capacity(r.remaining() / size);
    while r.remaining() >= size {
        sums.push(r.bytes(size)?.to_vec());
    }
    Ok(Checksums(sums))
}

fn root_item(r: &mut Reader<'_>) -> Result<RootItem, Error> {
    let inode = inode_item(r)?;
    let generation = r.u64()?;
    let root_dirid = r.u64()?;
    let bytenr = r.u64()?;
    let byte_limit = r.u64()?;
    let bytes_used = r.u64()?;
    let last_snapshot = r.u64()?;
    let flags = RootFlags::from_bits_retain(r.u64()?);
    let refs = r.u32()?;
    let drop_progress = key(r)?;
    let drop_level = r.u8()?;
    let level = r.u8()?;

    // Old root items stop here
    let v2 = if r.is_empty() {
        None
    } else {
        let v2 = RootItemV2 {
            generation_v2: r.u64()?,
            uuid: uuid(r)?,
            parent_uuid: uuid(r)?,
            received_uuid: uuid(r)?,
            ctransid: r.u64()?,
            otransid: r.u64()?,
            stransid: r.u64()?,
            rtransid: r.u64()?,
            ctime: timespec(r)?,
            otime: timespec(r)?,
            stime: timespec(r)?,
            rtime: timespec(r)?,
        };
        r.bytes(8 * 8)?;
        Some(v2)
    };

    Ok(RootItem {
        inode,
        generation,
        root_dirid,
        bytenr,
        byte_limit,
        bytes_used,
        last_snapshot,
        flags,
        refs,
        drop_progress,
        drop_level,
        level,
        v2,
    })
}

fn root_ref(r: &mut Reader<'_>) -> Result<RootRef, Error> {
    let dirid = r.u64()?;
    let sequence = r.u64()?;
    let len = r.u16()?;
    Ok(RootRef {
        dirid,
        sequence,
        name: name(r, len)?,
    })
}

fn extent_data_ref(r: &mut Reader<'_>) -> Result<ExtentDataRef, Error> {
    Ok(ExtentDataRef {
        root: r.u64()?,
        objectid: r.u64()?,
        offset: r.u64()?,
        count: r.u32()?,
    })
}

fn extent_item(item_key: &Key, r: &mut Reader<'_>) -> Result<ExtentItem, Error> {
    let refs = r.u64()?;
    let generation = r.u64()?;
    let flags = ExtentFlags::from_bits_retain(r.u64()?);

    // Skinny metadata items keep the level in the key offset instead
    let tree_block = if item_key.is(KeyType::ExtentItem) && flags.contains(ExtentFlags::TREE_BLOCK) {
        Some(TreeBlockInfo {
            key: key(r)?,
            level: r.u8()?,
        })
    } else {
        None
    };

    let mut inline_refs = Vec::new();
    while let Some(&tag) = r.rest().first() {
        let inline = match KeyType::from_u8(tag) {
            Some(KeyType::TreeBlockRef) => {
                r.u8()?;
                InlineRef::TreeBlock { root: r.u64()? }
            }
            Some(KeyType::SharedBlockRef) => {
                r.u8()?;
                InlineRef::SharedBlock { parent: r.u64()? }
            }
            Some(KeyType::ExtentDataRef) => {
                // The data ref overlays the offset field
                r.u8()?;
                InlineRef::ExtentData(extent_data_ref(r)?)
            }
            Some(KeyType::SharedDataRef) => {
                r.u8()?;
                let parent = r.u64()?;
                InlineRef::SharedData {
                    parent,
                    count: r.u32()?,
                }
            }
            Some(KeyType::ExtentOwnerRef) => {
                r.u8()?;
                InlineRef::ExtentOwner { root: r.u64()? }
            }
            _ => {
                log::debug!("stopping at inline ref tag {tag:#x} in {item_key}");
                break;
            }
        };
        inline_refs.push(inline);
    }

    Ok(ExtentItem {
        refs,
        generation,
        flags,
        tree_block,
        inline_refs,
    })
}

fn free_space_header(r: &mut Reader<'_>) -> Result<FreeSpaceHeader, Error> {
    Ok(FreeSpaceHeader {
        location: key(r)?,
        generation: r.u64()?,
        num_entries: r.u64()?,
        num_bitmaps: r.u64()?,
    })
}

fn raid_stripe(r: &mut Reader<'_>) -> Result<Vec<RaidStride>, Error> {
    let mut strides = Vec::with_capacity(r.remaining() / 16);
    while r.remaining() >= 16 {
        strides.push(RaidStride {
            devid: r.u64()?,
            physical: r.u64()?,
        });
    }
    Ok(strides)
}

fn qgroup_status(r: &mut Reader<'_>) -> Result<QgroupStatus, Error> {
    let version = r.u64()?;
    let generation = r.u64()?;
    let flags = r.u64()?;
    let rescan = r.u64()?;
    let enable_gen = if r.remaining() >= 8 { Some(r.u64()?) } else { None };
    Ok(QgroupStatus {
        version,
        generation,
        flags,
        rescan,
        enable_gen,
    })
}

fn balance_args(r: &mut Reader<'_>) -> Result<BalanceArgs, Error> {
    let args = BalanceArgs {
        profiles: r.u64()?,
        usage: r.u64()?,
        devid: r.u64()?,
        pstart: r.u64()?,
        pend: r.u64()?,
        vstart: r.u64()?,
        vend: r.u64()?,
        target: r.u64()?,
        flags: r.u64()?,
        limit: r.u64()?,
        stripes_min: r.u32()?,
        stripes_max: r.u32()?,
    };
    r.bytes(6 * 8)?;
    Ok(args)
}

fn balance_item(r: &mut Reader<'_>) -> Result<BalanceItem, Error> {
    let item = BalanceItem {
        flags: r.u64()?,
        data: balance_args(r)?,
        meta: balance_args(r)?,
        sys: balance_args(r)?,
    };
    r.bytes(4 * 8)?;
    Ok(item)
}

fn dev_replace(r: &mut Reader<'_>) -> Result<DevReplace, Error> {
    Ok(DevReplace {
        src_devid: r.u64()?,
        cursor_left: r.u64()?,
        cursor_right: r.u64()?,
        cont_reading_from_srcdev_mode: r.u64()?,
        replace_state: r.u64()?,
        time_started: r.u64()?,
        time_stopped: r.u64()?,
        num_write_errors: r.u64()?,
        num_uncorrectable_read_errors: r.u64()?,
    })
}
