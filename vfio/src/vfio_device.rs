// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use vm_allocator::{PciePort, PciePortRegistry};
use vm_device::{
    AttachGuard, CountOp, Device, DeviceInfo, DeviceReceiver, DeviceType, GenericDevice,
    GenericDeviceState,
};
use vm_migration::{MigratableError, Snapshot, Snapshottable};

use crate::group::{resolve_group, VfioDeviceType};
use crate::sysfs::Sysfs;
use crate::{Result, VfioError};

/// A PCI function, or a mediated device carved out of one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VfioPciDev {
    pub id: String,
    pub bdf: String,
    pub sysfs_dev: PathBuf,
    #[serde(skip)]
    pub is_pcie: bool,
    #[serde(skip)]
    pub port: PciePort,
    /// Guest bus label, e.g. `rp0`, once placed behind a PCIe port.
    #[serde(skip)]
    pub bus: Option<String>,
}

/// An s390 adjunct processor queue, exposed as a mediated device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VfioApDev {
    pub id: String,
    pub sysfs_dev: PathBuf,
}

/// Member of an IOMMU group.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum VfioDev {
    PciNormal(VfioPciDev),
    PciMediated(VfioPciDev),
    ApMediated(VfioApDev),
}

impl VfioDev {
    pub fn id(&self) -> &str {
        match self {
            VfioDev::PciNormal(d) | VfioDev::PciMediated(d) => &d.id,
            VfioDev::ApMediated(d) => &d.id,
        }
    }

    /// `None` for AP devices, which have no PCI address.
    pub fn bdf(&self) -> Option<&str> {
        self.pci().map(|d| d.bdf.as_str())
    }

    pub fn sysfs_dev(&self) -> &Path {
        match self {
            VfioDev::PciNormal(d) | VfioDev::PciMediated(d) => &d.sysfs_dev,
            VfioDev::ApMediated(d) => &d.sysfs_dev,
        }
    }

    pub fn device_type(&self) -> VfioDeviceType {
        match self {
            VfioDev::PciNormal(_) => VfioDeviceType::PciNormal,
            VfioDev::PciMediated(_) => VfioDeviceType::PciMediated,
            VfioDev::ApMediated(_) => VfioDeviceType::ApMediated,
        }
    }

    pub fn pci(&self) -> Option<&VfioPciDev> {
        match self {
            VfioDev::PciNormal(d) | VfioDev::PciMediated(d) => Some(d),
            VfioDev::ApMediated(_) => None,
        }
    }

    pub fn pci_mut(&mut self) -> Option<&mut VfioPciDev> {
        match self {
            VfioDev::PciNormal(d) | VfioDev::PciMediated(d) => Some(d),
            VfioDev::ApMediated(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VfioDeviceState {
    #[serde(flatten)]
    pub generic: GenericDeviceState,
    pub vfio_devices: Vec<VfioDev>,
}

/// All the functions of one IOMMU group, passed through as a unit.
pub struct VfioDevice {
    generic: GenericDevice,
    vfio_devs: Vec<VfioDev>,
    sysfs: Arc<dyn Sysfs>,
    pcie_slots: Arc<PciePortRegistry>,
}

impl VfioDevice {
    pub fn new(info: DeviceInfo, sysfs: Arc<dyn Sysfs>, pcie_slots: Arc<PciePortRegistry>) -> Self {
        VfioDevice {
            generic: GenericDevice::new(info),
            vfio_devs: Vec::new(),
            sysfs,
            pcie_slots,
        }
    }

    /// Group members, empty until the first successful attach.
    pub fn vfio_devs(&self) -> &[VfioDev] {
        &self.vfio_devs
    }

    pub fn info(&self) -> &DeviceInfo {
        self.generic.info()
    }

    pub fn save(&self) -> VfioDeviceState {
        VfioDeviceState {
            generic: self.generic.save(DeviceType::Vfio),
            vfio_devices: self.vfio_devs.clone(),
        }
    }

    /// Rebuild a device from a saved state, without touching the host.
    pub fn load(
        state: VfioDeviceState,
        sysfs: Arc<dyn Sysfs>,
        pcie_slots: Arc<PciePortRegistry>,
    ) -> Result<Self> {
        if state.generic.device_type != DeviceType::Vfio {
            return Err(VfioError::UnexpectedDeviceType(state.generic.device_type));
        }

        Ok(VfioDevice {
            generic: GenericDevice::load(state.generic),
            vfio_devs: state.vfio_devices,
            sysfs,
            pcie_slots,
        })
    }

    pub fn restore(
        snapshot: &Snapshot,
        sysfs: Arc<dyn Sysfs>,
        pcie_slots: Arc<PciePortRegistry>,
    ) -> Result<Self> {
        let state = snapshot.to_state().map_err(VfioError::Restore)?;
        Self::load(state, sysfs, pcie_slots)
    }

    fn reserve_pcie_slots(&self, vfio_devs: &mut [VfioDev]) -> Result<()> {
        for vfio_dev in vfio_devs.iter_mut() {
            let Some(pci) = vfio_dev.pci_mut() else {
                continue;
            };
            if !pci.is_pcie || pci.port == PciePort::NoPort {
                continue;
            }

            let index = self
                .pcie_slots
                .reserve(pci.port, &pci.bdf)
                .map_err(VfioError::PcieSlot)?;
            pci.bus = pci.port.bus_label(index);
            debug!("Placed {} on {} bus {:?}", pci.bdf, pci.port, pci.bus);
        }

        Ok(())
    }
}

fn backend_error(id: &str, e: VfioError) -> vm_device::Error {
    vm_device::Error::Backend {
        id: id.to_owned(),
        source: e.into(),
    }
}

impl Device for VfioDevice {
    fn attach(&mut self, receiver: &dyn DeviceReceiver) -> vm_device::Result<()> {
        let Some(mut device) = AttachGuard::enter(self, CountOp::Increase)? else {
            return Ok(());
        };
        let id = device.device_id().to_owned();

        let mut vfio_devs = resolve_group(device.sysfs.as_ref(), device.generic.info())
            .map_err(|e| backend_error(&id, e))?;
        device
            .reserve_pcie_slots(&mut vfio_devs)
            .map_err(|e| backend_error(&id, e))?;
        device.vfio_devs = vfio_devs;

        let cold_plug = device.generic.info().cold_plug;
        let res = if cold_plug {
            receiver.append_device(&*device)
        } else {
            receiver.hotplug_add_device(&*device, DeviceType::Vfio)
        };
        if let Err(source) = res {
            error!("Failed to attach VFIO device {id} (cold plug: {cold_plug}): {source:?}");
            device.vfio_devs.clear();
            return Err(vm_device::Error::Receiver { id, source });
        }

        info!(
            "Device group {} attached via vfio passthrough",
            device.generic.info().host_path.display()
        );
        device.commit();
        Ok(())
    }

    fn detach(&mut self, receiver: &dyn DeviceReceiver) -> vm_device::Result<()> {
        let Some(device) = AttachGuard::enter(self, CountOp::Decrease)? else {
            return Ok(());
        };
        let id = device.device_id().to_owned();

        if device.generic.info().cold_plug {
            info!("Nothing to detach, VFIO device {id} was cold plugged");
            device.commit();
            return Ok(());
        }

        if let Err(source) = receiver.hotplug_remove_device(&*device, DeviceType::Vfio) {
            error!("Failed to unplug VFIO device {id}: {source:?}");
            return Err(vm_device::Error::Receiver { id, source });
        }

        info!(
            "Device group {} detached",
            device.generic.info().host_path.display()
        );
        device.commit();
        Ok(())
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Vfio
    }

    fn generic(&self) -> &GenericDevice {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericDevice {
        &mut self.generic
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Snapshottable for VfioDevice {
    fn id(&self) -> String {
        self.generic.id().to_owned()
    }

    fn snapshot(&self) -> std::result::Result<Snapshot, MigratableError> {
        Snapshot::new_from_state(&self.save())
    }
}
