// Copyright © 2020 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::sync::Arc;

use test_infra::{ReceiverEvent, RecordingReceiver, SimulatedPciDevice, SimulatedSysfs};
use vfio::{VfioDev, VfioDevice};
use vm_allocator::{PciePort, PciePortRegistry};
use vm_device::{DeviceInfo, DeviceType};
use vmm::DeviceManager;

const AP_UUID: &str = "1d5c3a9e-8f0b-4e62-9a71-5b2c4d6e8f00";
const MDEV_UUID: &str = "f79944e4-5a3d-11e8-99ce-479cbab002e4";

fn info(id: &str, host_path: &str, cold_plug: bool, port: PciePort) -> DeviceInfo {
    DeviceInfo {
        id: id.to_owned(),
        host_path: PathBuf::from(host_path),
        cold_plug,
        port,
    }
}

fn host() -> Arc<SimulatedSysfs> {
    let sysfs = SimulatedSysfs::new();
    sysfs.add_pci_device(SimulatedPciDevice::new("0000:01:00.0", 12));
    sysfs.add_pci_device(
        SimulatedPciDevice::new("0000:01:00.1", 12)
            .class(0x040300)
            .config_len(256),
    );
    sysfs.add_pci_device(SimulatedPciDevice::new("0000:00:1c.0", 12).class(0x060400));
    sysfs.add_pci_device(SimulatedPciDevice::new("0000:05:00.0", 20).driver(None));
    sysfs.add_mediated_device(20, AP_UUID, &format!("/sys/devices/vfio_ap/matrix/{AP_UUID}"));
    sysfs.add_mediated_device(
        20,
        MDEV_UUID,
        &format!("/sys/devices/pci0000:00/0000:00:02.0/{MDEV_UUID}"),
    );
    Arc::new(sysfs)
}

mod lifecycle {
    use vm_migration::{Snapshot, Snapshottable};

    use super::*;

    #[test]
    fn test_attach_count_gates_receiver() {
        for n in 1..=5 {
            let mut dm = DeviceManager::new(host(), Arc::new(PciePortRegistry::new()));
            let receiver = RecordingReceiver::new();
            dm.new_device(info("gpu", "/dev/vfio/12", false, PciePort::RootPort))
                .unwrap();

            for _ in 0..n {
                dm.attach_device("gpu", &receiver).unwrap();
            }
            for _ in 0..n {
                dm.detach_device("gpu", &receiver).unwrap();
            }

            assert_eq!(
                receiver.events(),
                [
                    ReceiverEvent::HotplugAdd("gpu".to_owned(), DeviceType::Vfio),
                    ReceiverEvent::HotplugRemove("gpu".to_owned(), DeviceType::Vfio),
                ],
                "{n} attach/detach pairs"
            );
            assert!(!dm.is_device_attached("gpu"));
            let device = dm.get_device_by_id("gpu").unwrap();
            assert_eq!(device.lock().unwrap().attach_count(), 0);
        }
    }

    #[test]
    fn test_group_members_and_slots() {
        let slots = Arc::new(PciePortRegistry::new());
        let mut dm = DeviceManager::new(host(), slots.clone());
        let receiver = RecordingReceiver::new();
        let device = dm
            .new_device(info("gpu", "/dev/vfio/12", false, PciePort::RootPort))
            .unwrap();
        dm.attach_device("gpu", &receiver).unwrap();

        let device = device.lock().unwrap();
        let vfio = device.as_any().downcast_ref::<VfioDevice>().unwrap();

        // The root port bridge is not passed through.
        let bdfs: Vec<_> = vfio.vfio_devs().iter().map(|d| d.bdf()).collect();
        assert_eq!(bdfs, [Some("0000:01:00.0"), Some("0000:01:00.1")]);

        let gpu = vfio.vfio_devs()[0].pci().unwrap();
        assert!(gpu.is_pcie);
        assert_eq!(gpu.bus.as_deref(), Some("rp0"));
        let audio = vfio.vfio_devs()[1].pci().unwrap();
        assert!(!audio.is_pcie);
        assert_eq!(audio.bus, None);

        assert_eq!(slots.occupied(PciePort::RootPort), ["0000:01:00.0"]);
    }

    #[test]
    fn test_cold_plug_detach_skips_receiver() {
        let mut dm = DeviceManager::new(host(), Arc::new(PciePortRegistry::new()));
        let receiver = RecordingReceiver::new();
        dm.new_device(info("gpu", "/dev/vfio/12", true, PciePort::NoPort))
            .unwrap();

        dm.attach_device("gpu", &receiver).unwrap();
        receiver.set_failing(true);
        dm.detach_device("gpu", &receiver).unwrap();

        assert_eq!(receiver.events(), [ReceiverEvent::Append("gpu".to_owned())]);
        assert!(!dm.is_device_attached("gpu"));
    }

    #[test]
    fn test_failed_hotplug_is_compensated() {
        let mut dm = DeviceManager::new(host(), Arc::new(PciePortRegistry::new()));
        let receiver = RecordingReceiver::new();
        dm.new_device(info("gpu", "/dev/vfio/12", false, PciePort::NoPort))
            .unwrap();

        receiver.set_failing(true);
        assert!(dm.attach_device("gpu", &receiver).is_err());
        assert!(!dm.is_device_attached("gpu"));

        receiver.set_failing(false);
        dm.attach_device("gpu", &receiver).unwrap();
        assert!(dm.is_device_attached("gpu"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut dm = DeviceManager::new(host(), Arc::new(PciePortRegistry::new()));
        let receiver = RecordingReceiver::new();
        dm.new_device(info("acc", "/sys/kernel/iommu_groups/20", true, PciePort::NoPort))
            .unwrap();
        dm.attach_device("acc", &receiver).unwrap();

        let before: Vec<VfioDev> = {
            let device = dm.get_device_by_id("acc").unwrap();
            let device = device.lock().unwrap();
            let vfio = device.as_any().downcast_ref::<VfioDevice>().unwrap();
            vfio.vfio_devs().to_vec()
        };
        let ids: Vec<&str> = before.iter().map(|d| d.id()).collect();
        assert_eq!(ids, ["vfio-acc0", "vfio-acc1", "vfio-acc2"]);

        let json = serde_json::to_string(&dm.snapshot().unwrap()).unwrap();
        let snapshot: Snapshot = serde_json::from_str(&json).unwrap();
        let restored =
            DeviceManager::restore(&snapshot, host(), Arc::new(PciePortRegistry::new())).unwrap();

        let device = restored.get_device_by_id("acc").unwrap();
        let device = device.lock().unwrap();
        assert_eq!(device.attach_count(), 1);
        assert!(device.generic().info().cold_plug);

        let vfio = device.as_any().downcast_ref::<VfioDevice>().unwrap();
        // Port placement is recomputed on the next attach.
        assert_eq!(
            serde_json::to_value(vfio.vfio_devs()).unwrap(),
            serde_json::to_value(&before).unwrap()
        );
        let bdfs: Vec<_> = vfio.vfio_devs().iter().map(|d| d.bdf()).collect();
        assert_eq!(bdfs, [Some("0000:05:00.0"), None, Some("0000:00:02.0")]);
        assert!(matches!(vfio.vfio_devs()[1], VfioDev::ApMediated(_)));
        assert!(matches!(vfio.vfio_devs()[2], VfioDev::PciMediated(_)));
    }
}

mod rebind {
    use std::path::Path;

    use vfio::{bind_device_to_host, bind_device_to_vfio};

    use super::*;

    #[test]
    fn test_rebind_restores_host_driver() {
        let sysfs = host();
        let nic = SimulatedPciDevice::new("0000:01:00.0", 12);

        let node =
            bind_device_to_vfio(sysfs.as_ref(), &nic.bdf, "ixgbe", &nic.vendor_device_id())
                .unwrap();
        assert_eq!(node, Path::new("/dev/vfio/12"));
        assert_eq!(sysfs.driver_of(&nic.bdf).as_deref(), Some("vfio-pci"));
        assert_eq!(sysfs.new_ids("vfio-pci"), ["8086 10fb"]);

        bind_device_to_host(sysfs.as_ref(), &nic.bdf, "ixgbe", &nic.vendor_device_id()).unwrap();
        assert_eq!(sysfs.driver_of(&nic.bdf).as_deref(), Some("ixgbe"));
        assert!(sysfs.new_ids("vfio-pci").is_empty());
    }

    #[test]
    fn test_failed_vfio_bind_does_not_abort_claim() {
        let sysfs = host();
        sysfs.fail_bind("vfio-pci");

        let node = bind_device_to_vfio(sysfs.as_ref(), "0000:01:00.0", "ixgbe", "8086 10fb")
            .unwrap();
        assert_eq!(node, Path::new("/dev/vfio/12"));
        assert_eq!(sysfs.writes().len(), 2);
    }

    #[test]
    fn test_unbound_device_cannot_be_claimed() {
        let sysfs = host();
        assert!(bind_device_to_vfio(sysfs.as_ref(), "0000:05:00.0", "none", "8086 10fb").is_err());
        assert!(sysfs.writes().is_empty());
        assert_eq!(sysfs.driver_of("0000:05:00.0"), None);
    }

    #[test]
    fn test_give_back_to_another_host_driver() {
        let sysfs = host();
        bind_device_to_vfio(sysfs.as_ref(), "0000:01:00.0", "ixgbe", "8086 10fb").unwrap();

        assert!(
            bind_device_to_host(sysfs.as_ref(), "0000:01:00.0", "ixgbevf", "8086 10fb").is_err()
        );
        assert_eq!(sysfs.driver_of("0000:01:00.0"), None);

        sysfs.add_driver("ixgbevf");
        bind_device_to_vfio(sysfs.as_ref(), "0000:01:00.1", "ixgbe", "8086 10fb").unwrap();
        bind_device_to_host(sysfs.as_ref(), "0000:01:00.1", "ixgbevf", "8086 10fb").unwrap();
        assert_eq!(sysfs.driver_of("0000:01:00.1").as_deref(), Some("ixgbevf"));
    }

    #[test]
    fn test_bind_then_attach() {
        let sysfs = host();
        bind_device_to_vfio(sysfs.as_ref(), "0000:01:00.0", "ixgbe", "8086 10fb").unwrap();

        let mut dm = DeviceManager::new(sysfs, Arc::new(PciePortRegistry::new()));
        let receiver = RecordingReceiver::new();
        dm.new_device(info("nic", "/dev/vfio/12", false, PciePort::SwitchPort))
            .unwrap();
        dm.attach_device("nic", &receiver).unwrap();
        assert_eq!(
            dm.pcie_slots().occupied(PciePort::SwitchPort),
            ["0000:01:00.0"]
        );
    }
}

mod cli {
    use std::process::{Command, Output};

    use test_infra::SysfsTree;

    use super::*;

    fn run(tree: &SysfsTree, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_vfio-passthrough"))
            .arg("--sysfs-root")
            .arg(tree.root())
            .args(args)
            .output()
            .unwrap()
    }

    fn tree() -> SysfsTree {
        let tree = SysfsTree::new();
        tree.add_pci_device(&SimulatedPciDevice::new("0000:03:00.0", 9).ids(0x15b3, 0x1018));
        tree
    }

    #[test]
    fn test_probe() {
        let tree = tree();
        let output = run(&tree, &["probe", "--bdf", "0000:03:00.0"]);
        assert!(output.status.success());

        let probed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(probed["vendorId"], "15b3");
        assert_eq!(probed["deviceId"], "1018");
        assert_eq!(probed["driver"], "ixgbe");
        assert_eq!(probed["iommuGroup"], 9);
    }

    #[test]
    fn test_bind_vfio_and_back() {
        let tree = tree();
        let output = run(&tree, &["bind-vfio", "--bdf", "0000:03:00.0"]);
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "/dev/vfio/9\n");
        assert_eq!(tree.read("/sys/bus/pci/drivers/ixgbe/unbind"), "0000:03:00.0");
        assert_eq!(tree.read("/sys/bus/pci/drivers/vfio-pci/new_id"), "15b3 1018");

        let output = run(
            &tree,
            &["bind-host", "--bdf", "0000:03:00.0", "--driver", "mlx5_core"],
        );
        assert!(!output.status.success());

        tree.add_driver("mlx5_core");
        let output = run(
            &tree,
            &["bind-host", "--bdf", "0000:03:00.0", "--driver", "mlx5_core"],
        );
        assert!(output.status.success());
        assert_eq!(tree.read("/sys/bus/pci/drivers/vfio-pci/remove_id"), "15b3 1018");
        assert_eq!(tree.read("/sys/bus/pci/drivers/mlx5_core/bind"), "0000:03:00.0");
    }

    #[test]
    fn test_bind_vfio_already_bound() {
        let tree = tree();
        tree.add_pci_device(&SimulatedPciDevice::new("0000:04:00.0", 11).driver(Some("vfio-pci")));

        let output = run(&tree, &["bind-vfio", "--bdf", "0000:04:00.0"]);
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "/dev/vfio/11\n");
        assert_eq!(tree.read("/sys/bus/pci/drivers/vfio-pci/new_id"), "");
        assert_eq!(tree.read("/sys/bus/pci/drivers/vfio-pci/bind"), "");
    }

    #[test]
    fn test_group() {
        let tree = tree();
        let output = run(
            &tree,
            &["group", "--host-path", "/dev/vfio/9", "--id", "nic", "--port", "root-port"],
        );
        assert!(output.status.success());

        let members: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(members[0]["type"], "pci-normal");
        assert_eq!(members[0]["id"], "vfio-nic0");
        assert_eq!(members[0]["bdf"], "0000:03:00.0");
        assert_eq!(members[0]["sysfsDev"], "/sys/bus/pci/devices/0000:03:00.0");
    }

    #[test]
    fn test_errors_are_reported() {
        let tree = tree();
        let output = run(&tree, &["probe", "--bdf", "0000:04:00.0"]);
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("Failed to probe PCI device 0000:04:00.0"));
        assert!(stderr.contains("chain of errors"));

        let output = run(&tree, &["group", "--host-path", "/dev/vfio/9", "--port", "slot"]);
        assert_eq!(output.status.code(), Some(1));
    }
}
