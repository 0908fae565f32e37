// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Kernel control paths and the access layer used to reach them.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const SYS_BUS_PCI_DEVICES: &str = "/sys/bus/pci/devices";
pub const SYS_BUS_PCI_DRIVERS: &str = "/sys/bus/pci/drivers";
pub const SYS_KERNEL_IOMMU_GROUPS: &str = "/sys/kernel/iommu_groups";
pub const SYS_DEVICES_VFIO_AP: &str = "/sys/devices/vfio_ap";
pub const DEV_VFIO: &str = "/dev/vfio";

pub const VFIO_PCI_DRIVER: &str = "vfio-pci";
pub const VFIO_NEW_ID_PATH: &str = "/sys/bus/pci/drivers/vfio-pci/new_id";
pub const VFIO_REMOVE_ID_PATH: &str = "/sys/bus/pci/drivers/vfio-pci/remove_id";

pub fn pci_device_path(bdf: &str) -> PathBuf {
    Path::new(SYS_BUS_PCI_DEVICES).join(bdf)
}

/// Unbind file of whatever driver currently owns `bdf`.
pub fn pci_driver_unbind_path(bdf: &str) -> PathBuf {
    pci_device_path(bdf).join("driver").join("unbind")
}

pub fn pci_driver_bind_path(driver: &str) -> PathBuf {
    Path::new(SYS_BUS_PCI_DRIVERS).join(driver).join("bind")
}

pub fn iommu_group_link_path(bdf: &str) -> PathBuf {
    pci_device_path(bdf).join("iommu_group")
}

pub fn iommu_group_devices_path(group: &str) -> PathBuf {
    Path::new(SYS_KERNEL_IOMMU_GROUPS).join(group).join("devices")
}

/// Character device userspace opens to use an IOMMU group.
pub fn vfio_group_node(group: u32) -> PathBuf {
    Path::new(DEV_VFIO).join(group.to_string())
}

/// Access to the kernel sysfs interface.
///
/// Paths are always the absolute kernel paths (`/sys/...`); implementations
/// decide where they actually live.
pub trait Sysfs: Send + Sync {
    /// Write `data` to an existing control file.
    fn write(&self, path: &Path, data: &str) -> io::Result<()>;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Target of a symbolic link, as stored in the link.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Absolute path with every symbolic link resolved.
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Entry names of a directory, sorted.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    fn file_len(&self, path: &Path) -> io::Result<u64>;
}

/// Sysfs of the running host, optionally mounted below another root.
#[derive(Clone, Debug)]
pub struct HostSysfs {
    root: PathBuf,
}

impl Default for HostSysfs {
    fn default() -> Self {
        HostSysfs {
            root: PathBuf::from("/"),
        }
    }
}

impl HostSysfs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        HostSysfs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.join(path),
        }
    }
}

impl Sysfs for HostSysfs {
    fn write(&self, path: &Path, data: &str) -> io::Result<()> {
        // Control files are never created, a missing one is an error.
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.host_path(path))?;
        file.write_all(data.as_bytes())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(self.host_path(path))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.host_path(path))
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        let resolved = fs::canonicalize(self.host_path(path))?;
        let root = fs::canonicalize(&self.root)?;
        match resolved.strip_prefix(&root) {
            Ok(relative) => Ok(Path::new("/").join(relative)),
            Err(_) => Ok(resolved),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = fs::read_dir(self.host_path(path))?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(self.host_path(path))?.len())
    }
}
