// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Locating the other members of a multi-device filesystem

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    str::FromStr,
};

use btrfs_ondisk::Superblock;
use log::trace;
use uuid::Uuid;

const SYSFS_DIR: &str = "sys/class/block";
const DEVFS_DIR: &str = "dev";

/// Finds devices belonging to a filesystem
pub trait Discovery {
    /// Paths of every device carrying a superblock with this fsid
    fn find_devices(&self, fsid: &Uuid) -> io::Result<Vec<PathBuf>>;
}

/// Finds nothing; only the devices supplied by the caller are used
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn find_devices(&self, _fsid: &Uuid) -> io::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Probes every block device listed in sysfs for a matching superblock
#[derive(Debug, Clone)]
pub struct SysfsDiscovery {
    sysroot: PathBuf,
}

impl Default for SysfsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsDiscovery {
    pub fn new() -> Self {
        Self::in_sysroot("/")
    }

    /// Discover devices below an alternative system root
    pub fn in_sysroot(sysroot: impl Into<PathBuf>) -> Self {
        Self {
            sysroot: sysroot.into(),
        }
    }

    fn probe(path: &Path) -> Option<Uuid> {
        let mut file = File::open(path).ok()?;
        let superblock = Superblock::from_reader(&mut file, 0).ok()?;
        Some(superblock.fsid())
    }
}

impl Discovery for SysfsDiscovery {
    fn find_devices(&self, fsid: &Uuid) -> io::Result<Vec<PathBuf>> {
        let sysfs_dir = self.sysroot.join(SYSFS_DIR);
        let devfs_dir = self.sysroot.join(DEVFS_DIR);

        let entries = fs::read_dir(&sysfs_dir)?
            .filter_map(Result::ok)
            .filter_map(|e| Some(e.file_name().to_str()?.to_owned()));

        let mut found = Vec::new();
        for name in entries {
            // Empty devices (unbound loop devices and the like) cannot hold a filesystem
            if sysfs_read::<u64>(&sysfs_dir.join(&name), "size").unwrap_or(0) == 0 {
                continue;
            }

            let path = devfs_dir.join(&name);
            match Self::probe(&path) {
                Some(id) if id == *fsid => {
                    trace!("{} belongs to {fsid}", path.display());
                    found.push(path);
                }
                _ => trace!("{} does not belong to {fsid}", path.display()),
            }
        }

        Ok(found)
    }
}

/// Read and parse a sysfs attribute
fn sysfs_read<T>(node: &Path, key: &str) -> Option<T>
where
    T: FromStr,
{
    fs::read_to_string(node.join(key)).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::Image;

    #[test_log::test]
    fn test_sysfs_discovery() {
        let sysroot = tempfile::tempdir().unwrap();
        let root = sysroot.path();

        let image = Image::new().with_num_devices(2).with_devid(2);
        for (name, size, bytes) in [
            ("loop0", "8192", image.build()),
            ("loop1", "8192", Image::new().with_fsid([0x33; 16]).build()),
            ("loop2", "0", Vec::new()),
            ("sda", "8192", vec![0u8; 0x20000]),
        ] {
            fs::create_dir_all(root.join(SYSFS_DIR).join(name)).unwrap();
            fs::write(root.join(SYSFS_DIR).join(name).join("size"), size).unwrap();
            fs::create_dir_all(root.join(DEVFS_DIR)).unwrap();
            fs::write(root.join(DEVFS_DIR).join(name), bytes).unwrap();
        }

        let discovery = SysfsDiscovery::in_sysroot(root);
        let found = discovery.find_devices(&Uuid::from_bytes(image.fsid)).unwrap();
        assert_eq!(found, vec![root.join(DEVFS_DIR).join("loop0")]);

        assert!(NoDiscovery.find_devices(&Uuid::nil()).unwrap().is_empty());
    }
}
