// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Filesystem assembly and node reading

use std::{collections::BTreeMap, path::Path};

use btrfs_ondisk::{key::objectid, ChecksumOutcome, Key, KeyType, Node, Superblock};
use log::{debug, info, warn};

use crate::{
    chunk_map::ChunkMap,
    device::{ByteSource, Device, DeviceSet},
    discovery::Discovery,
    walker::{ChunkCollector, LogRootCollector, RootCollector, TreeRoot, Visitor, WalkStats, Walker},
    Error, Options, MAX_NODESIZE, MIN_NODESIZE,
};

/// A node and the outcome of verifying its checksum
#[derive(Debug, Clone)]
pub struct NodeRead {
    pub node: Node,
    pub checksum: ChecksumOutcome,
}

/// An assembled, read-only filesystem
#[derive(Debug)]
pub struct Filesystem {
    devices: DeviceSet,
    superblock: Superblock,
    chunks: ChunkMap,
    options: Options,
    roots: BTreeMap<u64, TreeRoot>,
    log_roots: Vec<TreeRoot>,
}

impl Filesystem {
    /// Open the filesystem on the devices at `paths`
    pub fn open<P: AsRef<Path>>(paths: &[P], discovery: &dyn Discovery, options: Options) -> Result<Self, Error> {
        let devices = paths
            .iter()
            .map(|path| Device::open(path.as_ref(), options.mirror()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_devices(devices, discovery, options)
    }

    /// Open the filesystem on already opened byte sources
    pub fn from_sources(
        sources: Vec<(String, Box<dyn ByteSource>)>,
        discovery: &dyn Discovery,
        options: Options,
    ) -> Result<Self, Error> {
        let devices = sources
            .into_iter()
            .map(|(name, source)| Device::new(name, source, options.mirror()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_devices(devices, discovery, options)
    }

    fn from_devices(devices: Vec<Device>, discovery: &dyn Discovery, options: Options) -> Result<Self, Error> {
        let devices = DeviceSet::reconcile(devices, discovery, &options)?;
        let superblock = devices.superblock().clone();

        match superblock.checksum() {
            ChecksumOutcome::Valid => {}
            ChecksumOutcome::Mismatch { .. } if options.strict_checksums() => {
                return Err(Error::ChecksumMismatch(superblock.bytenr.get()))
            }
            ChecksumOutcome::Mismatch { stored, computed } => {
                warn!("superblock checksum mismatch: stored {stored:02x?}, computed {computed:02x?}")
            }
            ChecksumOutcome::Unsupported(csum_type) => debug!("cannot verify {csum_type} checksums"),
        }

        let nodesize = superblock.nodesize();
        if !nodesize.is_power_of_two() || !(MIN_NODESIZE..=MAX_NODESIZE).contains(&nodesize) {
            return Err(Error::InvalidNodesize(nodesize));
        }

        let mut chunks = ChunkMap::new();
        for (key, chunk) in superblock.bootstrap_chunks()? {
            chunks.insert(key.offset, chunk);
        }
        info!("seeded {} bootstrap chunks", chunks.len());

        let mut fs = Self {
            devices,
            superblock,
            chunks,
            options,
            roots: BTreeMap::new(),
            log_roots: Vec::new(),
        };

        let mut collector = ChunkCollector::default();
        fs.walker().walk_tree(&fs.chunk_tree(), &mut collector)?;
        for (start, chunk) in collector.chunks {
            fs.chunks.insert(start, chunk);
        }
        info!("chunk tree maps {} chunks", fs.chunks.len());

        let mut collector = RootCollector::default();
        fs.walker().walk_tree(&fs.root_tree(), &mut collector)?;
        fs.roots = collector.roots;
        info!("root tree lists {} trees", fs.roots.len());

        if let Some(log_tree) = fs.log_tree() {
            let mut collector = LogRootCollector::default();
            fs.walker().walk_tree(&log_tree, &mut collector)?;
            fs.log_roots = collector.roots;
            info!("log tree holds {} log roots", fs.log_roots.len());
        }

        Ok(fs)
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// The superblock everything was resolved from
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn chunks(&self) -> &ChunkMap {
        &self.chunks
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn walker(&self) -> Walker<'_> {
        Walker::new(self)
    }

    /// Roots listed in the root tree, keyed by tree id
    pub fn roots(&self) -> &BTreeMap<u64, TreeRoot> {
        &self.roots
    }

    pub fn log_roots(&self) -> &[TreeRoot] {
        &self.log_roots
    }

    fn superblock_root(objectid: u64, bytenr: u64, level: u8, generation: u64) -> TreeRoot {
        TreeRoot {
            key: Key::new(objectid, KeyType::RootItem as u8, 0),
            bytenr,
            level,
            generation,
        }
    }

    pub fn root_tree(&self) -> TreeRoot {
        let sb = &self.superblock;
        Self::superblock_root(objectid::ROOT_TREE, sb.root(), sb.root_level, sb.generation())
    }

    pub fn chunk_tree(&self) -> TreeRoot {
        let sb = &self.superblock;
        Self::superblock_root(
            objectid::CHUNK_TREE,
            sb.chunk_root(),
            sb.chunk_root_level,
            sb.chunk_root_generation.get(),
        )
    }

    /// The log root tree, if a log is present
    pub fn log_tree(&self) -> Option<TreeRoot> {
        let sb = &self.superblock;
        (sb.log_root() != 0)
            .then(|| Self::superblock_root(objectid::TREE_LOG, sb.log_root(), sb.log_root_level, sb.generation()))
    }

    /// Every known tree: root, chunk and log root trees, then the trees they list
    pub fn trees(&self) -> Vec<TreeRoot> {
        let mut trees = vec![self.root_tree(), self.chunk_tree()];
        trees.extend(self.log_tree());
        trees.extend(self.roots.values().copied());
        trees.extend(self.log_roots.iter().copied());
        trees
    }

    /// Fill `buf` from logical address `addr`
    ///
    /// Reads crossing a stripe boundary are split across devices.
    pub fn read_logical(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let logical = addr
                .checked_add(done as u64)
                .ok_or(Error::AddressNotMapped(addr))?;
            let mapping = self.chunks.resolve(logical, (buf.len() - done) as u64)?;
            if mapping.len == 0 {
                return Err(Error::AddressNotMapped(logical));
            }
            let device = self
                .devices
                .get(mapping.devid)
                .ok_or(Error::DeviceNotFound(mapping.devid))?;
            let end = done + mapping.len as usize;
            device.read_at(mapping.physical, &mut buf[done..end])?;
            done = end;
        }
        Ok(())
    }

    /// Read and parse the node at `addr`
    ///
    /// Fails when the node's header names a different address. Checksum
    /// mismatches are reported in the result, not as errors.
    pub fn read_node(&self, addr: u64) -> Result<NodeRead, Error> {
        let mut bytes = vec![0u8; self.superblock.nodesize() as usize];
        self.read_logical(addr, &mut bytes)?;

        let node = Node::parse(bytes)?;
        let found = node.header().bytenr();
        if found != addr {
            return Err(Error::AddressMismatch { requested: addr, found });
        }

        let checksum = node.checksum(self.superblock.csum_type());
        if let ChecksumOutcome::Mismatch { stored, computed } = &checksum {
            warn!("checksum mismatch in node {addr:#x}: stored {stored:02x?}, computed {computed:02x?}");
        }

        Ok(NodeRead { node, checksum })
    }

    /// Walk every known tree, skipping trees that cannot be walked
    pub fn walk_all<V: Visitor + ?Sized>(&self, visitor: &mut V) -> WalkStats {
        let walker = self.walker();
        let mut total = WalkStats::default();
        for root in self.trees() {
            visitor.tree(&root);
            match walker.walk_tree(&root, visitor) {
                Ok(stats) => total += stats,
                Err(e) => {
                    warn!("skipping tree {} at {:#x}: {e}", root.key, root.bytenr);
                    total.failed_trees += 1;
                }
            }
        }
        total
    }
}
