// Copyright © 2019 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Host side of VFIO device passthrough.
//!
//! - [`group`] turns an IOMMU group into the list of functions that have to
//!   be handed to the guest together.
//! - [`bind`] moves a PCI function between its host driver and `vfio-pci`.
//! - [`VfioDevice`] is the attachable unit tracked by the device manager.
//!
//! All host interaction goes through the [`Sysfs`] trait so that the kernel
//! interface can be rooted elsewhere or simulated.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use vm_device::DeviceType;
use vm_migration::MigratableError;

pub mod bind;
pub mod group;
pub mod host;
pub mod sysfs;
mod vfio_device;

pub use bind::{bind_device_to_host, bind_device_to_vfio};
pub use group::{resolve_group, VfioDeviceType};
pub use host::PciHostDevice;
pub use sysfs::{HostSysfs, Sysfs};
pub use vfio_device::{VfioApDev, VfioDev, VfioDevice, VfioDeviceState, VfioPciDev};

#[derive(Debug, Error)]
pub enum VfioError {
    #[error("Invalid IOMMU group path: {0}")]
    InvalidGroupPath(PathBuf),

    #[error("Failed to read IOMMU group devices at {path}: {source}")]
    ReadGroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Incorrect tokens found while parsing VFIO details: {0}")]
    UnknownDeviceFile(String),

    #[error("Failed to resolve sysfs device {path}: {source}")]
    ResolveSysfsDev {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid PCI class {class:?} for device {bdf}")]
    InvalidPciClass { bdf: String, class: String },

    #[error("IOMMU group {0} has no device to pass through")]
    EmptyGroup(String),

    #[error("Failed to write {data:?} to {path}: {source}")]
    SysfsWrite {
        path: PathBuf,
        data: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    SysfsRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read IOMMU group link {path}: {source}")]
    ReadIommuGroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid IOMMU group link {0}")]
    InvalidIommuGroup(PathBuf),

    #[error("Failed to reserve a PCIe slot: {0}")]
    PcieSlot(#[source] vm_allocator::Error),

    #[error("Unexpected device type {0} in VFIO device state")]
    UnexpectedDeviceType(DeviceType),

    #[error("Failed to restore VFIO device: {0}")]
    Restore(#[source] MigratableError),
}

pub type Result<T> = std::result::Result<T, VfioError>;
