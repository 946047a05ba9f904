// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Depth-first tree traversal
//!
//! A [`Walker`] descends from a root node, left to right, handing every node
//! header and every decoded leaf item to a [`Visitor`]. Nodes are never
//! deduplicated; a block reachable twice is visited twice.

use std::collections::BTreeMap;

use btrfs_ondisk::{
    self as ondisk, decode, key::objectid, ChecksumOutcome, Chunk, Decoded, Header, Item, Key, KeyType,
};
use log::{debug, trace, warn};
use serde::Serialize;

use crate::{filesystem::NodeRead, Error, Filesystem};

/// The root of one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeRoot {
    /// Key of the `ROOT_ITEM` describing this tree
    pub key: Key,
    pub bytenr: u64,
    pub level: u8,
    pub generation: u64,
}

impl TreeRoot {
    /// Object id of the tree
    pub fn id(&self) -> u64 {
        self.key.objectid
    }
}

/// Receives nodes and items during a walk
pub trait Visitor {
    /// Called before walking each tree in [`Filesystem::walk_all`]
    fn tree(&mut self, _root: &TreeRoot) {}

    fn node(&mut self, _addr: u64, _header: &Header, _checksum: &ChecksumOutcome) {}

    fn item(&mut self, key: &Key, payload: &[u8], decoded: &Result<Decoded, ondisk::Error>);
}

/// Visits without collecting anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVisitor;

impl Visitor for NoopVisitor {
    fn item(&mut self, _key: &Key, _payload: &[u8], _decoded: &Result<Decoded, ondisk::Error>) {}
}

/// Collects `CHUNK_ITEM`s while walking the chunk tree
#[derive(Debug, Default, Clone)]
pub struct ChunkCollector {
    /// Chunks and their logical start addresses
    pub chunks: Vec<(u64, Chunk)>,
}

impl Visitor for ChunkCollector {
    fn item(&mut self, key: &Key, _payload: &[u8], decoded: &Result<Decoded, ondisk::Error>) {
        if let Ok(Decoded {
            item: Item::Chunk(chunk), ..
        }) = decoded
        {
            self.chunks.push((key.offset, chunk.clone()));
        }
    }
}

/// Collects tree roots while walking the root tree
#[derive(Debug, Default, Clone)]
pub struct RootCollector {
    /// Roots keyed by tree object id
    pub roots: BTreeMap<u64, TreeRoot>,
}

impl Visitor for RootCollector {
    fn item(&mut self, key: &Key, _payload: &[u8], decoded: &Result<Decoded, ondisk::Error>) {
        if let Some(root) = tree_root(key, decoded) {
            if let Some(previous) = self.roots.insert(key.objectid, root) {
                debug!("root {} replaces {}", root.key, previous.key);
            }
        }
    }
}

/// Collects the per-subvolume log roots while walking the log root tree
#[derive(Debug, Default, Clone)]
pub struct LogRootCollector {
    pub roots: Vec<TreeRoot>,
}

impl Visitor for LogRootCollector {
    fn item(&mut self, key: &Key, _payload: &[u8], decoded: &Result<Decoded, ondisk::Error>) {
        if key.objectid != objectid::TREE_LOG {
            return;
        }
        if let Some(root) = tree_root(key, decoded) {
            self.roots.push(root);
        }
    }
}

fn tree_root(key: &Key, decoded: &Result<Decoded, ondisk::Error>) -> Option<TreeRoot> {
    if !key.is(KeyType::RootItem) {
        return None;
    }
    match decoded {
        Ok(Decoded {
            item: Item::Root(root), ..
        }) => Some(TreeRoot {
            key: *key,
            bytenr: root.bytenr,
            level: root.level,
            generation: root.generation,
        }),
        _ => None,
    }
}

/// Counters gathered during a walk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WalkStats {
    pub nodes: u64,
    pub items: u64,
    pub decode_errors: u64,
    pub checksum_mismatches: u64,
    /// Trees abandoned by [`Filesystem::walk_all`]
    pub failed_trees: u64,
}

impl std::ops::AddAssign for WalkStats {
    fn add_assign(&mut self, other: Self) {
        self.nodes += other.nodes;
        self.items += other.items;
        self.decode_errors += other.decode_errors;
        self.checksum_mismatches += other.checksum_mismatches;
        self.failed_trees += other.failed_trees;
    }
}

/// Recursive descent over the trees of a [`Filesystem`]
#[derive(Debug, Clone, Copy)]
pub struct Walker<'a> {
    fs: &'a Filesystem,
    max_depth: u8,
    strict_decoding: bool,
    strict_checksums: bool,
}

impl<'a> Walker<'a> {
    pub fn new(fs: &'a Filesystem) -> Self {
        let options = fs.options();
        Self {
            fs,
            max_depth: options.max_depth(),
            strict_decoding: options.strict_decoding(),
            strict_checksums: options.strict_checksums(),
        }
    }

    /// Override the depth budget taken from [`Options`]
    pub fn with_max_depth(self, max_depth: u8) -> Self {
        Self { max_depth, ..self }
    }

    pub fn with_strict_decoding(self, strict: bool) -> Self {
        Self {
            strict_decoding: strict,
            ..self
        }
    }

    pub fn with_strict_checksums(self, strict: bool) -> Self {
        Self {
            strict_checksums: strict,
            ..self
        }
    }

    /// Walk the tree whose root node is at `addr`
    pub fn walk<V: Visitor + ?Sized>(&self, addr: u64, visitor: &mut V) -> Result<WalkStats, Error> {
        let mut stats = WalkStats::default();
        self.descend(addr, None, 0, visitor, &mut stats)?;
        debug!("walked {addr:#x}: {stats:?}");
        Ok(stats)
    }

    /// Walk a tree, checking its root node against the level recorded for it
    pub fn walk_tree<V: Visitor + ?Sized>(&self, root: &TreeRoot, visitor: &mut V) -> Result<WalkStats, Error> {
        let mut stats = WalkStats::default();
        self.descend(root.bytenr, Some(root.level), 0, visitor, &mut stats)?;
        debug!("walked tree {} at {:#x}: {stats:?}", root.key, root.bytenr);
        Ok(stats)
    }

    fn descend<V: Visitor + ?Sized>(
        &self,
        addr: u64,
        expected_level: Option<u8>,
        depth: u8,
        visitor: &mut V,
        stats: &mut WalkStats,
    ) -> Result<(), Error> {
        if depth >= self.max_depth {
            return Err(Error::TraversalTooDeep { addr, depth });
        }

        let NodeRead { node, checksum } = self.fs.read_node(addr)?;
        stats.nodes += 1;

        if checksum.is_mismatch() {
            stats.checksum_mismatches += 1;
            if self.strict_checksums {
                return Err(Error::ChecksumMismatch(addr));
            }
        }

        let level = node.level();
        if let Some(expected) = expected_level {
            if level != expected {
                return Err(Error::LevelMismatch {
                    addr,
                    expected,
                    found: level,
                });
            }
        }

        trace!(
            "node {addr:#x} level {level} owner {} with {} entries",
            node.header().owner(),
            node.header().nritems()
        );
        visitor.node(addr, node.header(), &checksum);

        if node.is_leaf() {
            let csum_type = self.fs.superblock().csum_type();
            for (key, payload) in node.items() {
                stats.items += 1;
                let decoded = decode(&key, payload, csum_type);
                match &decoded {
                    Ok(d) if d.leftover > 0 => trace!("{key}: {} bytes left over", d.leftover),
                    Ok(_) => trace!("{key}"),
                    Err(e) => {
                        stats.decode_errors += 1;
                        warn!("failed to decode {key} in node {addr:#x}: {e}");
                    }
                }
                visitor.item(&key, payload, &decoded);
                if self.strict_decoding {
                    decoded?;
                }
            }
        } else {
            for ptr in node.pointers() {
                self.descend(ptr.blockptr, Some(level - 1), depth + 1, visitor, stats)?;
            }
        }

        Ok(())
    }
}
