// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Read-only access to btrfs filesystems spanning one or more devices
//!
//! A [`Filesystem`] is assembled from a set of devices: their superblocks are
//! reconciled into a [`DeviceSet`], the bootstrap chunks seed a [`ChunkMap`],
//! and the chunk, root and log trees are walked to find every other tree.
//! From there any tree can be walked with a [`Visitor`].

use std::io;

use btrfs_ondisk::{self as ondisk, Key};
use thiserror::Error;
use uuid::Uuid;

pub mod chunk_map;
pub mod device;
pub mod discovery;
pub mod filesystem;
pub mod walker;

#[cfg(test)]
pub(crate) mod mock;

pub use chunk_map::{ChunkMap, Mapping};
pub use device::{ByteSource, Device, DeviceSet};
pub use discovery::{Discovery, NoDiscovery, SysfsDiscovery};
pub use filesystem::{Filesystem, NodeRead};
pub use walker::{
    ChunkCollector, LogRootCollector, NoopVisitor, RootCollector, TreeRoot, Visitor, WalkStats, Walker,
};

/// Deepest recursion a walk will attempt by default
pub const MAX_DEPTH: u8 = 8;

/// Smallest node size accepted when opening
pub const MIN_NODESIZE: u32 = 4096;

/// Largest node size accepted when opening
pub const MAX_NODESIZE: u32 = 65536;

/// Errors that can occur while assembling or traversing a filesystem
#[derive(Debug, Error)]
pub enum Error {
    /// No chunk covers the address, or its chunk cannot be read from
    #[error("logical address {0:#x} is not mapped")]
    AddressNotMapped(u64),

    /// An address resolved to a device that is not part of the set
    #[error("device {0} not found")]
    DeviceNotFound(u64),

    /// No devices were supplied
    #[error("no devices supplied")]
    NoDevices,

    #[error("incomplete device set: expected {expected} devices, found {found}")]
    IncompleteDeviceSet { expected: u64, found: usize },

    #[error("device {device} belongs to filesystem {found}, expected {expected}")]
    FsidMismatch { device: String, expected: Uuid, found: Uuid },

    /// A node claims to live somewhere other than where it was read from
    #[error("node at {requested:#x} claims address {found:#x}")]
    AddressMismatch { requested: u64, found: u64 },

    /// The superblock's node size is not a power of two between 4KiB and 64KiB
    #[error("unsupported node size {0}")]
    InvalidNodesize(u32),

    /// Raised only with strict checksum verification
    #[error("checksum mismatch in node at {0:#x}")]
    ChecksumMismatch(u64),

    #[error("truncated item {key}: needed {needed} bytes, {available} available")]
    TruncatedItem { key: Key, needed: usize, available: usize },

    #[error("chunk declares {0} stripes")]
    UnsupportedStripeCount(u16),

    #[error("traversal exceeded depth {depth} at {addr:#x}")]
    TraversalTooDeep { addr: u64, depth: u8 },

    #[error("node at {addr:#x} has level {found}, expected {expected}")]
    LevelMismatch { addr: u64, expected: u8, found: u8 },

    /// Decoding an on-disk structure failed
    #[error("ondisk: {0}")]
    Ondisk(#[source] ondisk::Error),

    #[error("io: {0}")]
    IO(#[from] io::Error),
}

impl From<ondisk::Error> for Error {
    fn from(err: ondisk::Error) -> Self {
        match err {
            ondisk::Error::TruncatedItem { key, needed, available } => Self::TruncatedItem {
                key,
                needed,
                available,
            },
            ondisk::Error::UnsupportedStripeCount(count) => Self::UnsupportedStripeCount(count),
            ondisk::Error::IO(err) => Self::IO(err),
            other => Self::Ondisk(other),
        }
    }
}

/// How a filesystem is opened and walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    mirror: usize,
    strict_decoding: bool,
    strict_checksums: bool,
    max_depth: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mirror: 0,
            strict_decoding: false,
            strict_checksums: false,
            max_depth: MAX_DEPTH,
        }
    }
}

impl Options {
    /// Select which superblock copy to read from each device
    pub fn with_mirror(self, mirror: usize) -> Self {
        Self { mirror, ..self }
    }

    /// Abort a walk on the first item that fails to decode
    pub fn with_strict_decoding(self, strict_decoding: bool) -> Self {
        Self {
            strict_decoding,
            ..self
        }
    }

    /// Abort a walk on the first checksum mismatch
    pub fn with_strict_checksums(self, strict_checksums: bool) -> Self {
        Self {
            strict_checksums,
            ..self
        }
    }

    pub fn with_max_depth(self, max_depth: u8) -> Self {
        Self { max_depth, ..self }
    }

    pub fn mirror(&self) -> usize {
        self.mirror
    }

    pub fn strict_decoding(&self) -> bool {
        self.strict_decoding
    }

    pub fn strict_checksums(&self) -> bool {
        self.strict_checksums
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }
}
