// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use log::debug;
use serde::Serialize;

use crate::sysfs::{iommu_group_link_path, pci_device_path, Sysfs, VFIO_PCI_DRIVER};
use crate::{Result, VfioError};

/// Host view of a PCI function, as exposed under `/sys/bus/pci/devices`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PciHostDevice {
    pub bdf: String,
    /// Lowercase hex without prefix, e.g. `8086`.
    pub vendor_id: String,
    pub device_id: String,
    pub class: String,
    /// Driver currently bound, `None` when unbound.
    pub driver: Option<String>,
    pub iommu_group: Option<u32>,
}

impl PciHostDevice {
    pub fn probe(sysfs: &dyn Sysfs, bdf: &str) -> Result<Self> {
        let device_path = pci_device_path(bdf);
        let read_id = |name: &str| -> Result<String> {
            Ok(read_value(sysfs, &device_path.join(name))?
                .trim_start_matches("0x")
                .to_lowercase())
        };

        let vendor_id = read_id("vendor")?;
        let device_id = read_id("device")?;
        let class = read_value(sysfs, &device_path.join("class"))?;
        let driver = link_name(sysfs, &device_path.join("driver"));
        let iommu_group =
            link_name(sysfs, &iommu_group_link_path(bdf)).and_then(|g| g.parse().ok());

        debug!(
            "Probed PCI device {bdf}: vendor {vendor_id} device {device_id} driver {driver:?} group {iommu_group:?}"
        );

        Ok(PciHostDevice {
            bdf: bdf.to_owned(),
            vendor_id,
            device_id,
            class,
            driver,
            iommu_group,
        })
    }

    /// Id pair in the format expected by `new_id`/`remove_id`.
    pub fn vendor_device_id(&self) -> String {
        format!("{} {}", self.vendor_id, self.device_id)
    }

    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref() == Some(VFIO_PCI_DRIVER)
    }
}

fn read_value(sysfs: &dyn Sysfs, path: &Path) -> Result<String> {
    sysfs
        .read_to_string(path)
        .map(|s| s.trim().to_owned())
        .map_err(|source| VfioError::SysfsRead {
            path: path.to_path_buf(),
            source,
        })
}

fn link_name(sysfs: &dyn Sysfs, link: &Path) -> Option<String> {
    sysfs
        .read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
}
