// Copyright © 2021 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host fakes shared by the tests of the workspace.
//!
//! [`SimulatedSysfs`] models the kernel PCI driver core in memory and reacts
//! to control file writes the way the kernel does. [`SysfsTree`] lays out a
//! static sysfs hierarchy in a temporary directory, to be used through
//! [`HostSysfs`]. [`RecordingReceiver`] stands in for the VM side.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::anyhow;
use vfio::sysfs::{SYS_BUS_PCI_DEVICES, SYS_BUS_PCI_DRIVERS, SYS_KERNEL_IOMMU_GROUPS, VFIO_PCI_DRIVER};
use vfio::{HostSysfs, Sysfs};
use vm_device::{Device, DeviceReceiver, DeviceType};
use vmm_sys_util::tempdir::TempDir;

/// Description of a host PCI function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulatedPciDevice {
    pub bdf: String,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u32,
    pub config_len: u64,
    pub iommu_group: u32,
    pub driver: Option<String>,
}

impl SimulatedPciDevice {
    /// A PCIe network function bound to `ixgbe`.
    pub fn new(bdf: &str, iommu_group: u32) -> Self {
        SimulatedPciDevice {
            bdf: bdf.to_owned(),
            vendor_id: 0x8086,
            device_id: 0x10fb,
            class: 0x020000,
            config_len: 4096,
            iommu_group,
            driver: Some("ixgbe".to_owned()),
        }
    }

    pub fn ids(mut self, vendor_id: u16, device_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.device_id = device_id;
        self
    }

    pub fn class(mut self, class: u32) -> Self {
        self.class = class;
        self
    }

    pub fn config_len(mut self, config_len: u64) -> Self {
        self.config_len = config_len;
        self
    }

    pub fn driver(mut self, driver: Option<&str>) -> Self {
        self.driver = driver.map(str::to_owned);
        self
    }

    /// Id pair in the `new_id` format.
    pub fn vendor_device_id(&self) -> String {
        format!("{:04x} {:04x}", self.vendor_id, self.device_id)
    }

    fn real_path(&self) -> PathBuf {
        Path::new("/sys/devices/pci0000:00").join(&self.bdf)
    }
}

#[derive(Default)]
struct SimulatedState {
    devices: BTreeMap<String, SimulatedPciDevice>,
    // group -> (uuid, resolved path)
    mediated: BTreeMap<u32, Vec<(String, PathBuf)>>,
    drivers: BTreeSet<String>,
    new_ids: BTreeMap<String, BTreeSet<String>>,
    failing_binds: BTreeSet<String>,
    writes: Vec<(PathBuf, String)>,
}

/// In-memory kernel driver core.
///
/// Writes to `new_id` immediately bind matching unbound functions, like the
/// kernel probing them, so a following explicit `bind` fails as busy.
pub struct SimulatedSysfs {
    state: Mutex<SimulatedState>,
}

impl Default for SimulatedSysfs {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
}

fn components(path: &Path, prefix: &str) -> Option<Vec<String>> {
    let rest = path.strip_prefix(prefix).ok()?;
    Some(
        rest.components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect(),
    )
}

impl SimulatedSysfs {
    pub fn new() -> Self {
        let mut state = SimulatedState::default();
        state.drivers.insert(VFIO_PCI_DRIVER.to_owned());
        SimulatedSysfs {
            state: Mutex::new(state),
        }
    }

    pub fn add_pci_device(&self, device: SimulatedPciDevice) {
        let mut state = self.state.lock().unwrap();
        if let Some(driver) = &device.driver {
            state.drivers.insert(driver.clone());
        }
        state.devices.insert(device.bdf.clone(), device);
    }

    pub fn add_driver(&self, driver: &str) {
        self.state.lock().unwrap().drivers.insert(driver.to_owned());
    }

    /// Adds a mediated device resolving to `real_path` to `group`.
    pub fn add_mediated_device(&self, group: u32, uuid: &str, real_path: &str) {
        self.state
            .lock()
            .unwrap()
            .mediated
            .entry(group)
            .or_default()
            .push((uuid.to_owned(), PathBuf::from(real_path)));
    }

    /// Makes every explicit bind to `driver` fail.
    pub fn fail_bind(&self, driver: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_binds
            .insert(driver.to_owned());
    }

    pub fn driver_of(&self, bdf: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(bdf)
            .and_then(|d| d.driver.clone())
    }

    pub fn new_ids(&self, driver: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .new_ids
            .get(driver)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every accepted control file write, in order.
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().unwrap().writes.clone()
    }

    fn driver_write(
        state: &mut SimulatedState,
        path: &Path,
        driver: &str,
        file: &str,
        data: &str,
    ) -> io::Result<()> {
        if !state.drivers.contains(driver) {
            return Err(not_found(path));
        }

        match file {
            "new_id" => {
                state
                    .new_ids
                    .entry(driver.to_owned())
                    .or_default()
                    .insert(data.to_owned());
                for device in state.devices.values_mut() {
                    if device.driver.is_none() && device.vendor_device_id() == data {
                        device.driver = Some(driver.to_owned());
                    }
                }
                Ok(())
            }
            "remove_id" => {
                let removed = state
                    .new_ids
                    .get_mut(driver)
                    .map(|ids| ids.remove(data))
                    .unwrap_or(false);
                if removed {
                    Ok(())
                } else {
                    Err(io::Error::new(io::ErrorKind::NotFound, "no such id"))
                }
            }
            "bind" => {
                if state.failing_binds.contains(driver) {
                    return Err(io::Error::new(io::ErrorKind::Other, "bind rejected"));
                }
                let device = state.devices.get_mut(data).ok_or_else(|| not_found(path))?;
                if device.driver.is_some() {
                    return Err(io::Error::new(io::ErrorKind::Other, "device busy"));
                }
                device.driver = Some(driver.to_owned());
                Ok(())
            }
            _ => Err(not_found(path)),
        }
    }
}

impl Sysfs for SimulatedSysfs {
    fn write(&self, path: &Path, data: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(parts) = components(path, SYS_BUS_PCI_DEVICES) {
            // <bdf>/driver/unbind
            let [bdf, driver, unbind] = parts.as_slice() else {
                return Err(not_found(path));
            };
            if driver != "driver" || unbind != "unbind" {
                return Err(not_found(path));
            }
            let device = state.devices.get_mut(bdf).ok_or_else(|| not_found(path))?;
            if device.driver.is_none() {
                return Err(not_found(path));
            }
            if data != bdf {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, data.to_owned()));
            }
            device.driver = None;
        } else if let Some(parts) = components(path, SYS_BUS_PCI_DRIVERS) {
            let [driver, file] = parts.as_slice() else {
                return Err(not_found(path));
            };
            Self::driver_write(&mut state, path, driver, file, data)?;
        } else {
            return Err(not_found(path));
        }

        state.writes.push((path.to_path_buf(), data.to_owned()));
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let state = self.state.lock().unwrap();
        let parts = components(path, SYS_BUS_PCI_DEVICES).ok_or_else(|| not_found(path))?;
        let [bdf, file] = parts.as_slice() else {
            return Err(not_found(path));
        };
        let device = state.devices.get(bdf).ok_or_else(|| not_found(path))?;
        match file.as_str() {
            "vendor" => Ok(format!("0x{:04x}\n", device.vendor_id)),
            "device" => Ok(format!("0x{:04x}\n", device.device_id)),
            "class" => Ok(format!("0x{:06x}\n", device.class)),
            _ => Err(not_found(path)),
        }
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        let state = self.state.lock().unwrap();
        let parts = components(path, SYS_BUS_PCI_DEVICES).ok_or_else(|| not_found(path))?;
        let [bdf, file] = parts.as_slice() else {
            return Err(not_found(path));
        };
        let device = state.devices.get(bdf).ok_or_else(|| not_found(path))?;
        match file.as_str() {
            "driver" => device
                .driver
                .as_ref()
                .map(|d| PathBuf::from(format!("../../../bus/pci/drivers/{d}")))
                .ok_or_else(|| not_found(path)),
            "iommu_group" => Ok(PathBuf::from(format!(
                "../../../kernel/iommu_groups/{}",
                device.iommu_group
            ))),
            _ => Err(not_found(path)),
        }
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        let state = self.state.lock().unwrap();
        if let Some(parts) = components(path, SYS_BUS_PCI_DEVICES) {
            if let [bdf] = parts.as_slice() {
                if let Some(device) = state.devices.get(bdf) {
                    return Ok(device.real_path());
                }
            }
        } else if let Some(parts) = components(path, SYS_KERNEL_IOMMU_GROUPS) {
            if let [group, devices, name] = parts.as_slice() {
                let group: u32 = group.parse().map_err(|_| not_found(path))?;
                if devices == "devices" {
                    if let Some(device) = state.devices.get(name) {
                        if device.iommu_group == group {
                            return Ok(device.real_path());
                        }
                    }
                    let mdev = state
                        .mediated
                        .get(&group)
                        .and_then(|m| m.iter().find(|(uuid, _)| uuid == name));
                    if let Some((_, real)) = mdev {
                        return Ok(real.clone());
                    }
                }
            }
        }
        Err(not_found(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let parts = components(path, SYS_KERNEL_IOMMU_GROUPS).ok_or_else(|| not_found(path))?;
        let [group, devices] = parts.as_slice() else {
            return Err(not_found(path));
        };
        if devices != "devices" {
            return Err(not_found(path));
        }
        let group: u32 = group.parse().map_err(|_| not_found(path))?;

        let mut names: Vec<String> = state
            .devices
            .values()
            .filter(|d| d.iommu_group == group)
            .map(|d| d.bdf.clone())
            .collect();
        if let Some(mediated) = state.mediated.get(&group) {
            names.extend(mediated.iter().map(|(uuid, _)| uuid.clone()));
        }
        if names.is_empty() {
            return Err(not_found(path));
        }
        names.sort();
        Ok(names)
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        let state = self.state.lock().unwrap();
        let parts = components(path, SYS_BUS_PCI_DEVICES).ok_or_else(|| not_found(path))?;
        match parts.as_slice() {
            [bdf, config] if config == "config" => state
                .devices
                .get(bdf)
                .map(|d| d.config_len)
                .ok_or_else(|| not_found(path)),
            _ => Err(not_found(path)),
        }
    }
}

/// A static sysfs hierarchy on disk.
pub struct SysfsTree {
    tmp: TempDir,
}

impl SysfsTree {
    pub fn new() -> Self {
        let tree = SysfsTree {
            tmp: TempDir::new_with_prefix("/tmp/sysfs-tree-").unwrap(),
        };
        tree.add_driver(VFIO_PCI_DRIVER);
        for file in ["new_id", "remove_id"] {
            fs::write(tree.path(&format!("{SYS_BUS_PCI_DRIVERS}/{VFIO_PCI_DRIVER}/{file}")), "")
                .unwrap();
        }
        tree
    }

    pub fn root(&self) -> &Path {
        self.tmp.as_path()
    }

    /// Location of the absolute sysfs path `p` inside the tree.
    pub fn path(&self, p: &str) -> PathBuf {
        self.root().join(p.trim_start_matches('/'))
    }

    pub fn sysfs(&self) -> HostSysfs {
        HostSysfs::new(self.root())
    }

    pub fn add_driver(&self, driver: &str) {
        let dir = self.path(&format!("{SYS_BUS_PCI_DRIVERS}/{driver}"));
        fs::create_dir_all(&dir).unwrap();
        for file in ["bind", "unbind"] {
            fs::write(dir.join(file), "").unwrap();
        }
    }

    pub fn add_pci_device(&self, device: &SimulatedPciDevice) {
        let real = self.path(&device.real_path().to_string_lossy());
        fs::create_dir_all(&real).unwrap();
        fs::write(real.join("vendor"), format!("0x{:04x}\n", device.vendor_id)).unwrap();
        fs::write(real.join("device"), format!("0x{:04x}\n", device.device_id)).unwrap();
        fs::write(real.join("class"), format!("0x{:06x}\n", device.class)).unwrap();
        fs::write(real.join("config"), vec![0u8; device.config_len as usize]).unwrap();

        let group = device.iommu_group;
        fs::create_dir_all(self.path(&format!("{SYS_KERNEL_IOMMU_GROUPS}/{group}/devices")))
            .unwrap();
        symlink(
            format!("../../../kernel/iommu_groups/{group}"),
            real.join("iommu_group"),
        )
        .unwrap();
        if let Some(driver) = &device.driver {
            self.add_driver(driver);
            symlink(format!("../../../bus/pci/drivers/{driver}"), real.join("driver")).unwrap();
        }

        let bus = self.path(SYS_BUS_PCI_DEVICES);
        fs::create_dir_all(&bus).unwrap();
        symlink(
            format!("../../../devices/pci0000:00/{}", device.bdf),
            bus.join(&device.bdf),
        )
        .unwrap();
        self.link_group_member(group, &device.bdf, &device.real_path());
    }

    pub fn add_mediated_device(&self, group: u32, uuid: &str, real_path: &str) {
        fs::create_dir_all(self.path(real_path)).unwrap();
        self.link_group_member(group, uuid, Path::new(real_path));
    }

    fn link_group_member(&self, group: u32, name: &str, real: &Path) {
        let devices = self.path(&format!("{SYS_KERNEL_IOMMU_GROUPS}/{group}/devices"));
        fs::create_dir_all(&devices).unwrap();
        let target = Path::new("../../../../..").join(real.strip_prefix("/").unwrap_or(real));
        symlink(target, devices.join(name)).unwrap();
    }

    /// Last data written to the control file at the absolute sysfs path `p`.
    pub fn read(&self, p: &str) -> String {
        fs::read_to_string(self.path(p)).unwrap()
    }
}

impl Default for SysfsTree {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiverEvent {
    Append(String),
    HotplugAdd(String, DeviceType),
    HotplugRemove(String, DeviceType),
}

/// Device receiver recording every request it is given.
#[derive(Default)]
pub struct RecordingReceiver {
    events: Mutex<Vec<ReceiverEvent>>,
    failing: AtomicBool,
}

impl RecordingReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following request fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ReceiverEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: ReceiverEvent) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("receiver refused {event:?}"));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl DeviceReceiver for RecordingReceiver {
    fn append_device(&self, device: &dyn Device) -> anyhow::Result<()> {
        self.record(ReceiverEvent::Append(device.device_id().to_owned()))
    }

    fn hotplug_add_device(&self, device: &dyn Device, kind: DeviceType) -> anyhow::Result<()> {
        self.record(ReceiverEvent::HotplugAdd(device.device_id().to_owned(), kind))
    }

    fn hotplug_remove_device(&self, device: &dyn Device, kind: DeviceType) -> anyhow::Result<()> {
        self.record(ReceiverEvent::HotplugRemove(
            device.device_id().to_owned(),
            kind,
        ))
    }
}
