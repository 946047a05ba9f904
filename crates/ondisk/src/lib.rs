// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! On-disk structures of the btrfs filesystem
//!
//! This crate decodes the raw metadata of a btrfs filesystem: the superblock,
//! tree node headers, chunk records and the payloads of every known leaf item.
//! It performs no device I/O of its own beyond reading a superblock from a
//! caller supplied reader, and it never writes.

use std::io;

use thiserror::Error;

pub mod checksum;
pub mod chunk;
pub mod codec;
pub mod items;
pub mod key;
pub mod node;
pub mod superblock;

pub use checksum::{ChecksumOutcome, CsumType};
pub use chunk::{BlockGroupFlags, Chunk, RaidProfile, Stripe};
pub use items::{decode, Decoded, Item};
pub use key::{Key, KeyType};
pub use node::{Header, KeyPtr, Node};
pub use superblock::Superblock;

/// Errors that can occur while decoding on-disk structures
#[derive(Debug, Error)]
pub enum Error {
    /// A structure needed more bytes than were available
    #[error("truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// A leaf item payload ended before its declared contents
    #[error("truncated item {key}: needed {needed} bytes, {available} available")]
    TruncatedItem { key: Key, needed: usize, available: usize },

    /// The superblock magic did not match `_BHRfS_M`
    #[error("invalid superblock magic")]
    InvalidMagic,

    /// Only four superblock mirrors exist
    #[error("no superblock mirror {0}")]
    NoSuchMirror(usize),

    /// The superblock's system chunk array could not be parsed
    #[error("invalid bootstrap chunk array: {0}")]
    InvalidBootstrap(&'static str),

    /// A chunk record is internally inconsistent
    #[error("invalid chunk: {0}")]
    InvalidChunk(&'static str),

    /// A chunk declares more stripes than we are prepared to handle
    #[error("chunk declares {0} stripes (maximum {max})", max = chunk::MAX_STRIPES)]
    UnsupportedStripeCount(u16),

    /// Error decoding UTF-8 string data
    #[error("invalid utf8 in decode: {0}")]
    Utf8Decoding(#[from] std::str::Utf8Error),

    /// An I/O error occurred
    #[error("io: {0}")]
    IO(#[from] io::Error),
}
