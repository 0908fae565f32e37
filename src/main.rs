// Copyright © 2019 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

mod test_util;

use std::path::PathBuf;
use std::process;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, LevelFilter};
use thiserror::Error;
use vfio::sysfs::vfio_group_node;
use vfio::{
    bind_device_to_host, bind_device_to_vfio, resolve_group, HostSysfs, PciHostDevice, VfioError,
};
use vfio_passthrough::cli_print_error_chain;
use vm_allocator::PciePort;
use vm_device::DeviceInfo;

#[derive(Debug, Error)]
enum Error {
    #[error("Failed to probe PCI device {0}")]
    Probe(String, #[source] VfioError),
    #[error("No host driver is bound to {0}, use --driver")]
    UnknownDriver(String),
    #[error("Failed to bind {0} to vfio-pci")]
    BindVfio(String, #[source] VfioError),
    #[error("Failed to bind {0} back to its host driver")]
    BindHost(String, #[source] VfioError),
    #[error("Invalid PCIe port")]
    Port(#[source] vm_allocator::Error),
    #[error("Failed to resolve IOMMU group {0}")]
    Group(String, #[source] VfioError),
    #[error("Failed to format output")]
    Output(#[source] serde_json::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn bdf_arg() -> Arg {
    Arg::new("bdf")
        .long("bdf")
        .help("PCI address of the function, e.g. 0000:01:00.0")
        .num_args(1)
        .required(true)
}

fn vendor_device_arg() -> Arg {
    Arg::new("vendor-device")
        .long("vendor-device")
        .help("Vendor and device ids as \"vvvv dddd\", read from sysfs when omitted")
        .num_args(1)
}

fn create_app() -> Command {
    Command::new("vfio-passthrough")
        .version(env!("BUILD_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Prepare host PCI functions for VFIO passthrough.")
        .subcommand_required(true)
        .args([
            Arg::new("sysfs-root")
                .long("sysfs-root")
                .help("Directory the host sysfs is found under")
                .num_args(1)
                .default_value("/")
                .global(true),
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of debugging output")
                .global(true),
        ])
        .subcommand(
            Command::new("bind-host")
                .about("Release a function from vfio-pci and bind it to its host driver")
                .args([
                    bdf_arg(),
                    Arg::new("driver")
                        .long("driver")
                        .help("Host driver to bind the function to")
                        .num_args(1)
                        .required(true),
                    vendor_device_arg(),
                ]),
        )
        .subcommand(
            Command::new("bind-vfio")
                .about("Unbind a function from its host driver and bind it to vfio-pci")
                .args([
                    bdf_arg(),
                    Arg::new("driver")
                        .long("driver")
                        .help("Current host driver, read from sysfs when omitted")
                        .num_args(1),
                    vendor_device_arg(),
                ]),
        )
        .subcommand(
            Command::new("group")
                .about("List the members of an IOMMU group as passed through")
                .args([
                    Arg::new("host-path")
                        .long("host-path")
                        .help("IOMMU group, /dev/vfio/<N> or /sys/kernel/iommu_groups/<N>")
                        .num_args(1)
                        .required(true),
                    Arg::new("id")
                        .long("id")
                        .help("Device id the member ids derive from")
                        .num_args(1)
                        .default_value("dev"),
                    Arg::new("port")
                        .long("port")
                        .help("PCIe port the group is placed behind")
                        .num_args(1)
                        .default_value("no-port"),
                ]),
        )
        .subcommand(
            Command::new("probe")
                .about("Show what the host knows about a PCI function")
                .arg(bdf_arg()),
        )
}

fn init_logger(cmd_arguments: &ArgMatches) {
    let log_level = match cmd_arguments.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();
}

// Arguments with a default value or marked required are always present.
fn arg<'a>(matches: &'a ArgMatches, id: &str) -> &'a str {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .unwrap_or_default()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).map_err(Error::Output)?
    );
    Ok(())
}

fn bind_vfio(sysfs: &HostSysfs, matches: &ArgMatches) -> Result<()> {
    let bdf = arg(matches, "bdf");
    let probed = PciHostDevice::probe(sysfs, bdf).map_err(|e| Error::Probe(bdf.to_owned(), e))?;

    if probed.is_vfio_bound() {
        if let Some(group) = probed.iommu_group {
            info!("Device {bdf} is already bound to vfio-pci");
            println!("{}", vfio_group_node(group).display());
            return Ok(());
        }
    }

    let driver = match matches.get_one::<String>("driver") {
        Some(driver) => driver.clone(),
        None => probed
            .driver
            .clone()
            .ok_or_else(|| Error::UnknownDriver(bdf.to_owned()))?,
    };
    let vendor_device_id = matches
        .get_one::<String>("vendor-device")
        .cloned()
        .unwrap_or_else(|| probed.vendor_device_id());

    let node = bind_device_to_vfio(sysfs, bdf, &driver, &vendor_device_id)
        .map_err(|e| Error::BindVfio(bdf.to_owned(), e))?;
    println!("{}", node.display());
    Ok(())
}

fn bind_host(sysfs: &HostSysfs, matches: &ArgMatches) -> Result<()> {
    let bdf = arg(matches, "bdf");
    let vendor_device_id = match matches.get_one::<String>("vendor-device") {
        Some(id) => id.clone(),
        None => PciHostDevice::probe(sysfs, bdf)
            .map_err(|e| Error::Probe(bdf.to_owned(), e))?
            .vendor_device_id(),
    };

    bind_device_to_host(sysfs, bdf, arg(matches, "driver"), &vendor_device_id)
        .map_err(|e| Error::BindHost(bdf.to_owned(), e))
}

fn group(sysfs: &HostSysfs, matches: &ArgMatches) -> Result<()> {
    let host_path = arg(matches, "host-path");
    let info = DeviceInfo {
        id: arg(matches, "id").to_owned(),
        host_path: PathBuf::from(host_path),
        cold_plug: false,
        port: arg(matches, "port").parse::<PciePort>().map_err(Error::Port)?,
    };

    let vfio_devs =
        resolve_group(sysfs, &info).map_err(|e| Error::Group(host_path.to_owned(), e))?;
    print_json(&vfio_devs)
}

fn start(cmd_arguments: &ArgMatches) -> Result<()> {
    let sysfs = HostSysfs::new(arg(cmd_arguments, "sysfs-root"));
    info!("Using sysfs under {}", sysfs.root().display());

    match cmd_arguments.subcommand() {
        Some(("bind-host", matches)) => bind_host(&sysfs, matches),
        Some(("bind-vfio", matches)) => bind_vfio(&sysfs, matches),
        Some(("group", matches)) => group(&sysfs, matches),
        Some(("probe", matches)) => {
            let bdf = arg(matches, "bdf");
            let host =
                PciHostDevice::probe(&sysfs, bdf).map_err(|e| Error::Probe(bdf.to_owned(), e))?;
            print_json(&host)
        }
        _ => unreachable!(),
    }
}

fn main() {
    let cmd_arguments = create_app().get_matches();
    init_logger(&cmd_arguments);

    if let Err(top_error) = start(&cmd_arguments) {
        cli_print_error_chain(&top_error, "vfio-passthrough");
        process::exit(1);
    }
}
