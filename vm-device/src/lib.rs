// Copyright © 2019 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Base abstraction shared by every device handed to a sandbox VM.
//!
//! A device is attached to (and detached from) a [`DeviceReceiver`], the
//! component that actually makes it visible inside the guest. Several logical
//! owners may attach the same device; only the first attach and the last
//! detach reach the receiver.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_allocator::PciePort;
use vm_migration::Snapshottable;

mod device;

pub use crate::device::{
    AttachCount, AttachCountError, AttachGuard, CountOp, GenericDevice, GenericDeviceState,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid attach count for device {id}: {source}")]
    AttachCount {
        id: String,
        #[source]
        source: AttachCountError,
    },

    #[error("Device receiver rejected device {id}: {source}")]
    Receiver {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to prepare device {id}: {source}")]
    Backend {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Device kind tag, also used as the persisted type of a device state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Generic,
    Block,
    Network,
    VhostUser,
    Vfio,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DeviceType::Generic => "generic",
            DeviceType::Block => "block",
            DeviceType::Network => "network",
            DeviceType::VhostUser => "vhost-user",
            DeviceType::Vfio => "vfio",
        };
        f.write_str(name)
    }
}

/// Description of a host device requested by a workload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    /// For VFIO devices, the IOMMU group (`/dev/vfio/<N>` or
    /// `/sys/kernel/iommu_groups/<N>`).
    pub host_path: PathBuf,
    /// Present at VM boot instead of being hotplugged.
    pub cold_plug: bool,
    #[serde(default)]
    pub port: PciePort,
}

/// Capability offered by the VM sandbox to make devices visible in the guest.
pub trait DeviceReceiver: Send + Sync {
    /// Register a device to be present when the VM boots.
    fn append_device(&self, device: &dyn Device) -> anyhow::Result<()>;

    /// Hotplug a device into the running VM.
    fn hotplug_add_device(&self, device: &dyn Device, kind: DeviceType) -> anyhow::Result<()>;

    /// Hot-unplug a device from the running VM.
    fn hotplug_remove_device(&self, device: &dyn Device, kind: DeviceType)
        -> anyhow::Result<()>;
}

/// A device owned by one sandbox.
pub trait Device: Snapshottable + Send + Sync + Any {
    /// Make the device visible to the guest through `receiver`.
    fn attach(&mut self, receiver: &dyn DeviceReceiver) -> Result<()>;

    /// Remove the device from the guest through `receiver`.
    fn detach(&mut self, receiver: &dyn DeviceReceiver) -> Result<()>;

    fn device_type(&self) -> DeviceType;

    fn generic(&self) -> &GenericDevice;

    fn generic_mut(&mut self) -> &mut GenericDevice;

    /// Lets receivers reach the concrete device type.
    fn as_any(&self) -> &dyn Any;

    fn device_id(&self) -> &str {
        self.generic().id()
    }

    fn attach_count(&self) -> u32 {
        self.generic().attach_count()
    }
}
