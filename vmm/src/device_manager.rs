// Copyright © 2019 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::collections::BTreeMap;
use std::num::Wrapping;
use std::path::{Path, PathBuf};
use std::result;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vfio::group::iommu_group_number;
use vfio::sysfs::{DEV_VFIO, SYS_KERNEL_IOMMU_GROUPS};
use vfio::{Sysfs, VfioDevice, VfioError};
use vm_allocator::PciePortRegistry;
use vm_device::{Device, DeviceInfo, DeviceReceiver, DeviceType, GenericDeviceState};
use vm_migration::{MigratableError, Snapshot, SnapshotData, Snapshottable};

pub const DEVICE_MANAGER_SNAPSHOT_ID: &str = "device-manager";

const VFIO_DEVICE_NAME_PREFIX: &str = "_vfio";

/// Errors associated with device manager
#[derive(Debug, Error)]
pub enum DeviceManagerError {
    #[error("Unsupported device {0}, only VFIO groups can be passed through")]
    UnsupportedDevice(PathBuf),

    #[error("Device {0} already exists")]
    DuplicateId(String),

    #[error("Device {0} not found")]
    DeviceNotFound(String),

    #[error("Device {0} is still attached")]
    DeviceAttached(String),

    #[error("Failed to attach device: {0}")]
    Attach(#[source] vm_device::Error),

    #[error("Failed to detach device: {0}")]
    Detach(#[source] vm_device::Error),

    #[error("Cannot restore device {id} of type {device_type}")]
    UnsupportedDeviceType { id: String, device_type: DeviceType },

    #[error("Failed to restore device {0}: {1}")]
    RestoreDevice(String, #[source] VfioError),

    #[error("Failed to restore device manager: {0}")]
    Restore(#[source] MigratableError),
}

pub type DeviceManagerResult<T> = result::Result<T, DeviceManagerError>;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct DeviceManagerState {
    device_id_cnt: Wrapping<usize>,
}

/// Owns the devices handed to one sandbox VM.
///
/// The same IOMMU group requested several times is only created once, every
/// request adding a reference to it.
pub struct DeviceManager {
    devices: BTreeMap<String, Arc<Mutex<dyn Device>>>,

    // Counter to keep track of the consumed device IDs.
    device_id_cnt: Wrapping<usize>,

    sysfs: Arc<dyn Sysfs>,

    // PCIe bus positions, shared by every device of the VM.
    pcie_slots: Arc<PciePortRegistry>,
}

fn is_vfio_path(host_path: &Path) -> bool {
    host_path.starts_with(DEV_VFIO) || host_path.starts_with(SYS_KERNEL_IOMMU_GROUPS)
}

impl DeviceManager {
    pub fn new(sysfs: Arc<dyn Sysfs>, pcie_slots: Arc<PciePortRegistry>) -> Self {
        DeviceManager {
            devices: BTreeMap::new(),
            device_id_cnt: Wrapping(0),
            sysfs,
            pcie_slots,
        }
    }

    pub fn pcie_slots(&self) -> &Arc<PciePortRegistry> {
        &self.pcie_slots
    }

    fn next_device_name(&mut self, prefix: &str) -> String {
        loop {
            let name = format!("{}{}", prefix, self.device_id_cnt);
            self.device_id_cnt += Wrapping(1);
            if !self.devices.contains_key(&name) {
                return name;
            }
        }
    }

    // `/dev/vfio/N` and `/sys/kernel/iommu_groups/N` name the same group.
    fn find_by_group(&self, group: &str) -> Option<&Arc<Mutex<dyn Device>>> {
        self.devices.values().find(|d| {
            iommu_group_number(&d.lock().unwrap().generic().info().host_path)
                .is_ok_and(|g| g == group)
        })
    }

    /// Returns the device backing the IOMMU group of `info`, creating it on
    /// first request.
    pub fn new_device(&mut self, mut info: DeviceInfo) -> DeviceManagerResult<Arc<Mutex<dyn Device>>> {
        if !is_vfio_path(&info.host_path) {
            return Err(DeviceManagerError::UnsupportedDevice(info.host_path));
        }
        let Ok(group) = iommu_group_number(&info.host_path) else {
            return Err(DeviceManagerError::UnsupportedDevice(info.host_path));
        };

        if let Some(device) = self.find_by_group(&group) {
            let refs = device.lock().unwrap().generic_mut().reference();
            debug!(
                "Reusing device for IOMMU group {} ({}), {} references",
                group,
                info.host_path.display(),
                refs
            );
            return Ok(device.clone());
        }

        if info.id.is_empty() {
            info.id = self.next_device_name(VFIO_DEVICE_NAME_PREFIX);
        } else if self.devices.contains_key(&info.id) {
            return Err(DeviceManagerError::DuplicateId(info.id));
        }

        let id = info.id.clone();
        let mut device = VfioDevice::new(info, self.sysfs.clone(), self.pcie_slots.clone());
        device.generic_mut().reference();
        info!("Created VFIO device {id}");

        let device: Arc<Mutex<dyn Device>> = Arc::new(Mutex::new(device));
        self.devices.insert(id, device.clone());
        Ok(device)
    }

    /// Drops one reference to the device, forgetting it with the last one.
    pub fn remove_device(&mut self, id: &str) -> DeviceManagerResult<()> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| DeviceManagerError::DeviceNotFound(id.to_owned()))?;

        let mut device = device.lock().unwrap();
        if device.attach_count() > 0 {
            return Err(DeviceManagerError::DeviceAttached(id.to_owned()));
        }
        let refs = device.generic_mut().dereference();
        drop(device);

        if refs == 0 {
            self.devices.remove(id);
            info!("Removed device {id}");
        }
        Ok(())
    }

    pub fn get_device_by_id(&self, id: &str) -> Option<Arc<Mutex<dyn Device>>> {
        self.devices.get(id).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Mutex<dyn Device>>> {
        self.devices.values().cloned().collect()
    }

    pub fn is_device_attached(&self, id: &str) -> bool {
        self.devices
            .get(id)
            .is_some_and(|d| d.lock().unwrap().attach_count() > 0)
    }

    fn device(&self, id: &str) -> DeviceManagerResult<&Arc<Mutex<dyn Device>>> {
        self.devices
            .get(id)
            .ok_or_else(|| DeviceManagerError::DeviceNotFound(id.to_owned()))
    }

    pub fn attach_device(&self, id: &str, receiver: &dyn DeviceReceiver) -> DeviceManagerResult<()> {
        self.device(id)?
            .lock()
            .unwrap()
            .attach(receiver)
            .map_err(DeviceManagerError::Attach)
    }

    pub fn detach_device(&self, id: &str, receiver: &dyn DeviceReceiver) -> DeviceManagerResult<()> {
        self.device(id)?
            .lock()
            .unwrap()
            .detach(receiver)
            .map_err(DeviceManagerError::Detach)
    }

    /// Rebuild every device found in `snapshot`, without touching the host.
    ///
    /// PCIe bus positions are not reserved again in `pcie_slots`: a device
    /// attached afterwards may be handed a bus label already in use by a
    /// restored device.
    pub fn restore(
        snapshot: &Snapshot,
        sysfs: Arc<dyn Sysfs>,
        pcie_slots: Arc<PciePortRegistry>,
    ) -> DeviceManagerResult<Self> {
        let state: DeviceManagerState = snapshot.to_state().map_err(DeviceManagerError::Restore)?;
        let mut device_manager = DeviceManager::new(sysfs, pcie_slots);
        device_manager.device_id_cnt = state.device_id_cnt;

        for (id, device_snapshot) in snapshot.snapshots.iter() {
            let generic: GenericDeviceState = device_snapshot
                .to_state()
                .map_err(DeviceManagerError::Restore)?;

            let device: Arc<Mutex<dyn Device>> = match generic.device_type {
                DeviceType::Vfio => Arc::new(Mutex::new(
                    VfioDevice::restore(
                        device_snapshot,
                        device_manager.sysfs.clone(),
                        device_manager.pcie_slots.clone(),
                    )
                    .map_err(|e| DeviceManagerError::RestoreDevice(id.clone(), e))?,
                )),
                device_type => {
                    warn!("Not restoring device {id} of type {device_type}");
                    return Err(DeviceManagerError::UnsupportedDeviceType {
                        id: id.clone(),
                        device_type,
                    });
                }
            };

            device_manager.devices.insert(id.clone(), device);
        }

        info!("Restored {} devices", device_manager.devices.len());
        Ok(device_manager)
    }
}

impl Snapshottable for DeviceManager {
    fn id(&self) -> String {
        DEVICE_MANAGER_SNAPSHOT_ID.to_string()
    }

    fn snapshot(&self) -> result::Result<Snapshot, MigratableError> {
        let mut snapshot = Snapshot::from_data(SnapshotData::new_from_state(&DeviceManagerState {
            device_id_cnt: self.device_id_cnt,
        })?);

        // We aggregate all devices snapshots.
        for device in self.devices.values() {
            let device = device.lock().unwrap();
            snapshot.add_snapshot(device.id(), device.snapshot()?);
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use test_infra::{ReceiverEvent, RecordingReceiver, SimulatedPciDevice, SimulatedSysfs};
    use vm_allocator::PciePort;
    use vm_device::GenericDevice;

    use super::*;

    fn device_manager() -> DeviceManager {
        let sysfs = SimulatedSysfs::new();
        sysfs.add_pci_device(SimulatedPciDevice::new("0000:01:00.0", 12));
        sysfs.add_pci_device(SimulatedPciDevice::new("0000:02:00.0", 13).config_len(256));
        DeviceManager::new(Arc::new(sysfs), Arc::new(PciePortRegistry::new()))
    }

    fn info(id: &str, host_path: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_owned(),
            host_path: PathBuf::from(host_path),
            cold_plug: false,
            port: PciePort::RootPort,
        }
    }

    #[test]
    fn test_new_device_reference_counting() {
        let mut dm = device_manager();
        let first = dm.new_device(info("nic", "/dev/vfio/12")).unwrap();
        let second = dm.new_device(info("other", "/dev/vfio/12")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.lock().unwrap().generic().ref_count(), 2);
        assert!(dm.get_device_by_id("other").is_none());

        dm.remove_device("nic").unwrap();
        assert!(dm.get_device_by_id("nic").is_some());
        dm.remove_device("nic").unwrap();
        assert!(dm.get_device_by_id("nic").is_none());
        assert!(matches!(
            dm.remove_device("nic"),
            Err(DeviceManagerError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_new_device_same_group_spellings() {
        let mut dm = device_manager();
        let receiver = RecordingReceiver::new();
        let dev = dm.new_device(info("a", "/dev/vfio/12")).unwrap();
        let sys = dm
            .new_device(info("b", "/sys/kernel/iommu_groups/12"))
            .unwrap();
        assert!(Arc::ptr_eq(&dev, &sys));
        assert_eq!(dev.lock().unwrap().generic().ref_count(), 2);
        assert!(dm.get_device_by_id("b").is_none());

        dm.attach_device("a", &receiver).unwrap();
        dm.attach_device("a", &receiver).unwrap();
        assert_eq!(
            receiver.events(),
            [ReceiverEvent::HotplugAdd("a".to_owned(), DeviceType::Vfio)]
        );

        let other = dm
            .new_device(info("c", "/sys/kernel/iommu_groups/13"))
            .unwrap();
        assert!(!Arc::ptr_eq(&dev, &other));
    }

    #[test]
    fn test_new_device_validation() {
        let mut dm = device_manager();
        assert!(matches!(
            dm.new_device(info("blk", "/dev/sda")),
            Err(DeviceManagerError::UnsupportedDevice(_))
        ));

        dm.new_device(info("nic", "/dev/vfio/12")).unwrap();
        assert!(matches!(
            dm.new_device(info("nic", "/sys/kernel/iommu_groups/13")),
            Err(DeviceManagerError::DuplicateId(_))
        ));

        let anonymous = dm.new_device(info("", "/dev/vfio/13")).unwrap();
        assert_eq!(anonymous.lock().unwrap().device_id(), "_vfio0");
    }

    #[test]
    fn test_attach_detach_by_id() {
        let mut dm = device_manager();
        let receiver = RecordingReceiver::new();
        dm.new_device(info("nic", "/dev/vfio/12")).unwrap();

        dm.attach_device("nic", &receiver).unwrap();
        dm.attach_device("nic", &receiver).unwrap();
        assert!(dm.is_device_attached("nic"));
        assert!(matches!(
            dm.remove_device("nic"),
            Err(DeviceManagerError::DeviceAttached(_))
        ));

        dm.detach_device("nic", &receiver).unwrap();
        dm.detach_device("nic", &receiver).unwrap();
        assert!(!dm.is_device_attached("nic"));
        assert_eq!(
            receiver.events(),
            [
                ReceiverEvent::HotplugAdd("nic".to_owned(), DeviceType::Vfio),
                ReceiverEvent::HotplugRemove("nic".to_owned(), DeviceType::Vfio),
            ]
        );
        assert!(matches!(
            dm.detach_device("nic", &receiver),
            Err(DeviceManagerError::Detach(_))
        ));
        assert!(matches!(
            dm.attach_device("gpu", &receiver),
            Err(DeviceManagerError::DeviceNotFound(_))
        ));
        dm.remove_device("nic").unwrap();
    }

    #[test]
    fn test_shared_pcie_slots() {
        let mut dm = device_manager();
        let receiver = RecordingReceiver::new();
        dm.new_device(info("a", "/dev/vfio/12")).unwrap();
        dm.new_device(info("b", "/dev/vfio/13")).unwrap();
        dm.attach_device("a", &receiver).unwrap();
        dm.attach_device("b", &receiver).unwrap();

        // Only the PCIe function takes a bus position.
        assert_eq!(dm.pcie_slots().occupied(PciePort::RootPort), ["0000:01:00.0"]);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut dm = device_manager();
        let receiver = RecordingReceiver::new();
        dm.new_device(info("nic", "/dev/vfio/12")).unwrap();
        dm.new_device(info("", "/dev/vfio/13")).unwrap();
        dm.attach_device("nic", &receiver).unwrap();

        let snapshot = dm.snapshot().unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let snapshot: Snapshot = serde_json::from_str(&json).unwrap();

        let mut restored = DeviceManager::restore(
            &snapshot,
            Arc::new(SimulatedSysfs::new()),
            Arc::new(PciePortRegistry::new()),
        )
        .unwrap();
        assert!(restored.is_device_attached("nic"));
        assert!(!restored.is_device_attached("_vfio0"));

        let nic = restored.get_device_by_id("nic").unwrap();
        let nic = nic.lock().unwrap();
        let vfio = nic.as_any().downcast_ref::<VfioDevice>().unwrap();
        assert_eq!(vfio.vfio_devs()[0].bdf(), Some("0000:01:00.0"));
        drop(nic);

        // The id counter survives, new anonymous devices do not collide.
        let next = restored.new_device(info("", "/dev/vfio/14")).unwrap();
        assert_eq!(next.lock().unwrap().device_id(), "_vfio1");
    }

    #[test]
    fn test_restore_rejects_unknown_kind() {
        let mut generic = GenericDevice::new(info("blk", "/dev/vfio/1"));
        generic.reference();
        let mut snapshot =
            Snapshot::new_from_state(&DeviceManagerState::default()).unwrap();
        snapshot.add_snapshot(
            "blk".to_owned(),
            Snapshot::new_from_state(&generic.save(DeviceType::Block)).unwrap(),
        );

        assert!(matches!(
            DeviceManager::restore(
                &snapshot,
                Arc::new(SimulatedSysfs::new()),
                Arc::new(PciePortRegistry::new())
            ),
            Err(DeviceManagerError::UnsupportedDeviceType {
                device_type: DeviceType::Block,
                ..
            })
        ));
    }
}
