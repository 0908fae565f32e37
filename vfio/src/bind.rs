// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Hand a PCI function over from its host driver to `vfio-pci` and back.
//!
//! Both directions go through the kernel driver core files: unbind from the
//! current driver, update the dynamic id table of `vfio-pci`, then bind to the
//! new driver.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::sysfs::{
    iommu_group_link_path, pci_driver_bind_path, pci_driver_unbind_path, vfio_group_node, Sysfs,
    VFIO_NEW_ID_PATH, VFIO_PCI_DRIVER, VFIO_REMOVE_ID_PATH,
};
use crate::{Result, VfioError};

fn write_sysfs(sysfs: &dyn Sysfs, path: &Path, data: &str) -> Result<()> {
    sysfs
        .write(path, data)
        .map_err(|source| VfioError::SysfsWrite {
            path: path.to_path_buf(),
            data: data.to_owned(),
            source,
        })
}

/// Unbind `bdf` from `host_driver` and claim it for `vfio-pci`.
///
/// `vendor_device_id` uses the `new_id` format, e.g. `"8086 10fb"`. Returns
/// the VFIO group node of the device, e.g. `/dev/vfio/12`.
pub fn bind_device_to_vfio(
    sysfs: &dyn Sysfs,
    bdf: &str,
    host_driver: &str,
    vendor_device_id: &str,
) -> Result<PathBuf> {
    info!("Unbinding device {bdf} from driver {host_driver}");
    write_sysfs(sysfs, &pci_driver_unbind_path(bdf), bdf)?;

    info!("Registering {vendor_device_id} with {VFIO_PCI_DRIVER}");
    write_sysfs(sysfs, Path::new(VFIO_NEW_ID_PATH), vendor_device_id)?;

    // Registering the id usually makes vfio-pci probe the device already, in
    // which case the explicit bind fails with EBUSY.
    let bind_path = pci_driver_bind_path(VFIO_PCI_DRIVER);
    info!("Binding device {bdf} to {VFIO_PCI_DRIVER}");
    if let Err(e) = write_sysfs(sysfs, &bind_path, bdf) {
        warn!("Ignoring failed bind of {bdf} to {VFIO_PCI_DRIVER}: {e}");
    }

    let link_path = iommu_group_link_path(bdf);
    let link = sysfs
        .read_link(&link_path)
        .map_err(|source| VfioError::ReadIommuGroup {
            path: link_path.clone(),
            source,
        })?;
    let group = link
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(|| VfioError::InvalidIommuGroup(link.clone()))?;

    let node = vfio_group_node(group);
    info!("Device {bdf} is now reachable through {}", node.display());
    Ok(node)
}

/// Release `bdf` from `vfio-pci` and give it back to `host_driver`.
pub fn bind_device_to_host(
    sysfs: &dyn Sysfs,
    bdf: &str,
    host_driver: &str,
    vendor_device_id: &str,
) -> Result<()> {
    info!("Unbinding device {bdf} from {VFIO_PCI_DRIVER}");
    write_sysfs(sysfs, &pci_driver_unbind_path(bdf), bdf)?;

    info!("Removing {vendor_device_id} from {VFIO_PCI_DRIVER}");
    write_sysfs(sysfs, Path::new(VFIO_REMOVE_ID_PATH), vendor_device_id)?;

    info!("Binding device {bdf} to driver {host_driver}");
    write_sysfs(sysfs, &pci_driver_bind_path(host_driver), bdf)
}
