// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Member devices of a filesystem

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    sync::Mutex,
};

use btrfs_ondisk::Superblock;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::{discovery::Discovery, Error, Options};

/// Anything a device image can be read from
pub trait ByteSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ByteSource for T {}

/// One member device and the superblock copy read from it
pub struct Device {
    devid: u64,
    name: String,
    superblock: Superblock,
    source: Mutex<Box<dyn ByteSource>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("devid", &self.devid)
            .field("name", &self.name)
            .field("fsid", &self.superblock.fsid())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Read the superblock from `source` and wrap it as a device
    pub fn new(name: impl Into<String>, mut source: Box<dyn ByteSource>, mirror: usize) -> Result<Self, Error> {
        let name = name.into();
        let superblock = Superblock::from_reader(&mut source, mirror)?;
        let devid = superblock.dev_item().devid;
        debug!("{name}: devid {devid} of filesystem {}", superblock.fsid());

        Ok(Self {
            devid,
            name,
            superblock,
            source: Mutex::new(source),
        })
    }

    /// Open a device image or block device by path
    pub fn open(path: &Path, mirror: usize) -> Result<Self, Error> {
        let file = File::open(path)?;
        Self::new(path.display().to_string(), Box::new(file), mirror)
    }

    pub fn devid(&self) -> u64 {
        self.devid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Fill `buf` from the given physical offset
    ///
    /// Access to the underlying source is serialised, so a device may be shared
    /// between threads.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let mut source = self
            .source
            .lock()
            .map_err(|_| io::Error::other(format!("{}: source lock poisoned", self.name)))?;
        source.seek(SeekFrom::Start(offset))?;
        source.read_exact(buf)?;
        Ok(())
    }
}

/// The reconciled members of one filesystem, keyed by devid
#[derive(Debug)]
pub struct DeviceSet {
    fsid: Uuid,
    primary: u64,
    devices: BTreeMap<u64, Device>,
}

impl DeviceSet {
    /// Check that `devices` form one complete filesystem
    ///
    /// All devices must share the fsid of the first one. When fewer devices
    /// than the superblock declares were supplied, `discovery` is asked for the
    /// rest. The first device's superblock is the one the filesystem uses.
    pub fn reconcile(devices: Vec<Device>, discovery: &dyn Discovery, options: &Options) -> Result<Self, Error> {
        let mut devices = devices.into_iter();
        let first = devices.next().ok_or(Error::NoDevices)?;
        let fsid = first.superblock.fsid();
        let expected = first.superblock.num_devices();
        let primary = first.devid;

        let mut set = Self {
            fsid,
            primary,
            devices: BTreeMap::new(),
        };
        set.add(first);

        for device in devices {
            let found = device.superblock.fsid();
            if found != fsid {
                return Err(Error::FsidMismatch {
                    device: device.name,
                    expected: fsid,
                    found,
                });
            }
            set.add(device);
        }

        if (set.devices.len() as u64) < expected {
            info!(
                "{} of {expected} devices supplied, searching for the rest of {fsid}",
                set.devices.len()
            );
            for path in discovery.find_devices(&fsid)? {
                let device = match Device::open(&path, options.mirror()) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!("skipping {}: {e}", path.display());
                        continue;
                    }
                };
                if device.superblock.fsid() != fsid {
                    debug!("skipping {}: belongs to {}", path.display(), device.superblock.fsid());
                    continue;
                }
                set.add(device);
            }
        }

        if set.devices.len() as u64 != expected {
            return Err(Error::IncompleteDeviceSet {
                expected,
                found: set.devices.len(),
            });
        }

        info!("assembled {expected} devices for filesystem {fsid}");
        Ok(set)
    }

    fn add(&mut self, device: Device) {
        if let Some(existing) = self.devices.get(&device.devid) {
            debug!(
                "ignoring {}: devid {} already provided by {}",
                device.name, device.devid, existing.name
            );
            return;
        }
        self.devices.insert(device.devid, device);
    }

    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    /// Superblock of the first device supplied
    pub fn superblock(&self) -> &Superblock {
        // The primary device is always present once reconciled
        &self.devices[&self.primary].superblock
    }

    pub fn get(&self, devid: u64) -> Option<&Device> {
        self.devices.get(&devid)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }
}
