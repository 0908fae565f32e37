// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! IOMMU group resolution.
//!
//! Every function of an IOMMU group shares the same DMA isolation domain and
//! has to be handed to the guest together. A group is described on the host by
//! `/sys/kernel/iommu_groups/<N>/devices`, holding one entry per member: PCI
//! functions are named after their BDF, mediated devices after their UUID.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use vm_allocator::PciePort;
use vm_device::DeviceInfo;

use crate::sysfs::{iommu_group_devices_path, pci_device_path, Sysfs, SYS_DEVICES_VFIO_AP};
use crate::vfio_device::{VfioApDev, VfioDev, VfioPciDev};
use crate::{Result, VfioError};

/// Upper bound on the length of generated member ids.
pub const MAX_DEV_ID_SIZE: usize = 31;

// Conventional PCI functions only expose 256 bytes of config space.
const PCI_CONFIG_SPACE_SIZE: u64 = 256;
const PCI_BASE_CLASS_BRIDGE: u32 = 0x06;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VfioDeviceType {
    PciNormal,
    PciMediated,
    ApMediated,
}

/// What a single group member resolves to on the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VfioDetails {
    pub device_type: VfioDeviceType,
    /// Not applicable to AP devices. May be empty for a mediated device
    /// whose parent could not be determined.
    pub bdf: Option<String>,
    pub sysfs_dev: PathBuf,
}

/// Classify the group member at `device_path` from its file name.
pub fn vfio_device_type(sysfs: &dyn Sysfs, device_path: &Path) -> Result<VfioDeviceType> {
    let name = device_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // 0000:00:1c.0
    if name.split(':').count() == 3 {
        return Ok(VfioDeviceType::PciNormal);
    }

    // f79944e4-5a3d-11e8-99ce-479cbab002e4
    if name.split('-').count() != 5 {
        return Err(VfioError::UnknownDeviceFile(name));
    }

    if resolve_sysfs_dev(sysfs, device_path)?.starts_with(SYS_DEVICES_VFIO_AP) {
        Ok(VfioDeviceType::ApMediated)
    } else {
        Ok(VfioDeviceType::PciMediated)
    }
}

fn resolve_sysfs_dev(sysfs: &dyn Sysfs, device_path: &Path) -> Result<PathBuf> {
    sysfs
        .canonicalize(device_path)
        .map_err(|source| VfioError::ResolveSysfsDev {
            path: device_path.to_path_buf(),
            source,
        })
}

/// Resolve the group member `file_name` listed under `iommu_devices_path`.
pub fn vfio_details(
    sysfs: &dyn Sysfs,
    file_name: &str,
    iommu_devices_path: &Path,
) -> Result<VfioDetails> {
    let device_path = iommu_devices_path.join(file_name);
    let device_type = vfio_device_type(sysfs, &device_path)?;

    let details = match device_type {
        // The full address is kept, functions may sit on different root buses.
        VfioDeviceType::PciNormal => VfioDetails {
            device_type,
            bdf: Some(file_name.to_owned()),
            sysfs_dev: pci_device_path(file_name),
        },
        VfioDeviceType::PciMediated => {
            let sysfs_dev = resolve_sysfs_dev(sysfs, &device_path)?;
            let bdf = mediated_bdf(&sysfs_dev.to_string_lossy());
            if bdf.is_empty() {
                warn!(
                    "Could not find the parent function of mediated device {}",
                    sysfs_dev.display()
                );
            }
            VfioDetails {
                device_type,
                bdf: Some(bdf),
                sysfs_dev,
            }
        }
        VfioDeviceType::ApMediated => VfioDetails {
            device_type,
            bdf: None,
            sysfs_dev: resolve_sysfs_dev(sysfs, &device_path)?,
        },
    };

    Ok(details)
}

/// Address of the parent function of a mediated device, taken from its
/// resolved sysfs path, e.g. `/sys/devices/pci0000:00/0000:00:02.0/<uuid>`.
pub fn mediated_bdf(sysfs_dev: &str) -> String {
    let tokens: Vec<&str> = sysfs_dev.split('/').collect();
    if tokens.len() < 4 {
        return String::new();
    }
    tokens[tokens.len() - 2].to_owned()
}

/// Group number, i.e. the last component of `host_path`.
pub fn iommu_group_number(host_path: &Path) -> Result<String> {
    host_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VfioError::InvalidGroupPath(host_path.to_path_buf()))
}

/// Builds a device id from `kind` and `id`, bounded to [`MAX_DEV_ID_SIZE`].
pub fn make_name_id(kind: &str, id: &str) -> String {
    let mut name = format!("{kind}-{id}");
    if name.len() > MAX_DEV_ID_SIZE {
        let mut end = MAX_DEV_ID_SIZE;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

fn is_pcie_device(sysfs: &dyn Sysfs, bdf: &str) -> bool {
    let config = pci_device_path(bdf).join("config");
    match sysfs.file_len(&config) {
        Ok(len) => len > PCI_CONFIG_SPACE_SIZE,
        Err(e) => {
            warn!("Couldn't stat configuration space of {bdf}: {e}");
            false
        }
    }
}

fn is_bridge(sysfs: &dyn Sysfs, bdf: &str) -> Result<bool> {
    let Ok(class) = sysfs.read_to_string(&pci_device_path(bdf).join("class")) else {
        return Ok(false);
    };
    let class = class.trim();
    let value = u32::from_str_radix(class.trim_start_matches("0x"), 16).map_err(|_| {
        VfioError::InvalidPciClass {
            bdf: bdf.to_owned(),
            class: class.to_owned(),
        }
    })?;

    Ok(value >> 16 == PCI_BASE_CLASS_BRIDGE)
}

/// Resolve the IOMMU group named by `info.host_path` into the list of its
/// members, in file name order.
///
/// Bridges are left out. A group without any other member is an error.
pub fn resolve_group(sysfs: &dyn Sysfs, info: &DeviceInfo) -> Result<Vec<VfioDev>> {
    let group = iommu_group_number(&info.host_path)?;
    let devices_path = iommu_group_devices_path(&group);
    let names = sysfs
        .read_dir(&devices_path)
        .map_err(|source| VfioError::ReadGroup {
            path: devices_path.clone(),
            source,
        })?;

    let mut vfio_devs = Vec::with_capacity(names.len());
    for (index, name) in names.iter().enumerate() {
        let details = vfio_details(sysfs, name, &devices_path)?;
        let id = make_name_id("vfio", &format!("{}{}", info.id, index));

        let vfio_dev = match details.device_type {
            VfioDeviceType::PciNormal | VfioDeviceType::PciMediated => {
                let bdf = details.bdf.unwrap_or_default();
                if !bdf.is_empty() && is_bridge(sysfs, &bdf)? {
                    info!("Skipping bridge {bdf} of IOMMU group {group}");
                    continue;
                }

                let is_pcie = !bdf.is_empty() && is_pcie_device(sysfs, &bdf);
                let pci = VfioPciDev {
                    id,
                    bdf,
                    sysfs_dev: details.sysfs_dev,
                    is_pcie,
                    port: if is_pcie { info.port } else { PciePort::NoPort },
                    bus: None,
                };
                if details.device_type == VfioDeviceType::PciNormal {
                    VfioDev::PciNormal(pci)
                } else {
                    VfioDev::PciMediated(pci)
                }
            }
            VfioDeviceType::ApMediated => VfioDev::ApMediated(VfioApDev {
                id,
                sysfs_dev: details.sysfs_dev,
            }),
        };

        debug!("IOMMU group {group} member {name}: {vfio_dev:?}");
        vfio_devs.push(vfio_dev);
    }

    if vfio_devs.is_empty() {
        return Err(VfioError::EmptyGroup(group));
    }

    Ok(vfio_devs)
}
