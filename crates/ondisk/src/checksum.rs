// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Metadata checksums
//!
//! Superblocks and tree nodes carry a 32-byte checksum field covering every
//! byte after it. Only the leading `CsumType::size()` bytes are significant.

use std::fmt;

use serde::Serialize;
use serde_with::{hex::Hex, serde_as};
use sha2::{Digest, Sha256};

/// Size of the checksum field in superblocks and node headers
pub const CSUM_SIZE: usize = 32;

/// Checksum algorithm declared by the superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CsumType {
    Crc32c,
    XxHash64,
    Sha256,
    Blake2b,
    Unknown(u16),
}

impl From<u16> for CsumType {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Crc32c,
            1 => Self::XxHash64,
            2 => Self::Sha256,
            3 => Self::Blake2b,
            other => Self::Unknown(other),
        }
    }
}

impl CsumType {
    /// Number of significant bytes in a checksum of this type
    pub fn size(&self) -> usize {
        match self {
            Self::Crc32c => 4,
            Self::XxHash64 => 8,
            Self::Sha256 | Self::Blake2b | Self::Unknown(_) => 32,
        }
    }

    /// Compute the checksum of `data`, if we implement this algorithm
    pub fn compute(&self, data: &[u8]) -> Option<[u8; CSUM_SIZE]> {
        let mut out = [0u8; CSUM_SIZE];
        match self {
            Self::Crc32c => {
                out[..4].copy_from_slice(&crc32c::crc32c(data).to_le_bytes());
                Some(out)
            }
            Self::Sha256 => {
                out.copy_from_slice(&Sha256::digest(data));
                Some(out)
            }
            Self::XxHash64 | Self::Blake2b | Self::Unknown(_) => None,
        }
    }

    /// Verify `stored` against a freshly computed checksum of `data`
    pub fn verify(&self, stored: &[u8; CSUM_SIZE], data: &[u8]) -> ChecksumOutcome {
        let Some(computed) = self.compute(data) else {
            return ChecksumOutcome::Unsupported(*self);
        };

        let size = self.size();
        if stored[..size] == computed[..size] {
            ChecksumOutcome::Valid
        } else {
            ChecksumOutcome::Mismatch {
                stored: stored[..size].to_vec(),
                computed: computed[..size].to_vec(),
            }
        }
    }
}

impl fmt::Display for CsumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32c => f.write_str("crc32c"),
            Self::XxHash64 => f.write_str("xxhash64"),
            Self::Sha256 => f.write_str("sha256"),
            Self::Blake2b => f.write_str("blake2b"),
            Self::Unknown(value) => write!(f, "{value:x}"),
        }
    }
}

/// Result of checking a stored checksum
///
/// "We could not check" is kept apart from "we checked and it was wrong".
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChecksumOutcome {
    Valid,
    Mismatch {
        #[serde_as(as = "Hex")]
        stored: Vec<u8>,
        #[serde_as(as = "Hex")]
        computed: Vec<u8>,
    },
    Unsupported(CsumType),
}

impl ChecksumOutcome {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_crc32c_verify() {
        let data = b"123456789";
        let mut stored = [0u8; CSUM_SIZE];
        // Standard CRC-32C check value
        stored[..4].copy_from_slice(&0xe3069283u32.to_le_bytes());
        assert_eq!(CsumType::Crc32c.verify(&stored, data), ChecksumOutcome::Valid);

        stored[0] ^= 0xff;
        assert!(CsumType::Crc32c.verify(&stored, data).is_mismatch());
    }

    #[test_log::test]
    fn test_unsupported_is_distinct() {
        let stored = [0u8; CSUM_SIZE];
        assert_eq!(
            CsumType::Blake2b.verify(&stored, b"abc"),
            ChecksumOutcome::Unsupported(CsumType::Blake2b)
        );
        assert_eq!(CsumType::from(1), CsumType::XxHash64);
        assert_eq!(CsumType::from(9).size(), 32);
    }

    #[test_log::test]
    fn test_sha256_verify() {
        let data = b"abc";
        let stored = CsumType::Sha256.compute(data).unwrap();
        assert_eq!(stored[0], 0xba);
        assert_eq!(CsumType::Sha256.verify(&stored, data), ChecksumOutcome::Valid);
    }
}
