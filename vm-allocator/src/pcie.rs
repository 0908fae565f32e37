// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Device {0} is not placed behind a PCIe port")]
    NoPort(String),
    #[error("Device {bdf} already occupies a slot on {owner}")]
    Conflict { bdf: String, owner: PciePort },
    #[error("No bus index left on {0}")]
    Exhausted(PciePort),
    #[error("Unknown PCIe port kind: {0}")]
    UnknownPort(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Kind of PCIe port a passthrough device group is plugged behind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PciePort {
    /// Plain PCI placement, no guest PCIe topology.
    #[default]
    NoPort,
    RootPort,
    SwitchPort,
    BridgePort,
}

impl PciePort {
    /// Prefix used to build the guest bus label of devices behind this port.
    pub fn prefix(&self) -> Option<&'static str> {
        match self {
            PciePort::NoPort => None,
            PciePort::RootPort => Some("rp"),
            PciePort::SwitchPort => Some("swp"),
            PciePort::BridgePort => Some("bp"),
        }
    }

    /// Guest bus label for the device holding `index` on this port, e.g. `rp0`.
    pub fn bus_label(&self, index: u32) -> Option<String> {
        self.prefix().map(|prefix| format!("{prefix}{index}"))
    }
}

impl fmt::Display for PciePort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PciePort::NoPort => "no-port",
            PciePort::RootPort => "root-port",
            PciePort::SwitchPort => "switch-port",
            PciePort::BridgePort => "bridge-port",
        };
        f.write_str(name)
    }
}

impl FromStr for PciePort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no-port" => Ok(PciePort::NoPort),
            "root-port" => Ok(PciePort::RootPort),
            "switch-port" => Ok(PciePort::SwitchPort),
            "bridge-port" => Ok(PciePort::BridgePort),
            _ => Err(Error::UnknownPort(s.to_owned())),
        }
    }
}

/// Tracks which host functions occupy bus positions behind each PCIe port.
///
/// The position of a BDF in its port list is the bus index handed out when it
/// was reserved. Entries are never evicted, so a label stays valid for the
/// lifetime of the registry, which is expected to match the sandbox VM.
///
/// # Example
///
/// ```
/// # use vm_allocator::{PciePort, PciePortRegistry};
/// let registry = PciePortRegistry::new();
/// assert_eq!(registry.reserve(PciePort::RootPort, "0000:01:00.0").unwrap(), 0);
/// assert_eq!(registry.reserve(PciePort::RootPort, "0000:02:00.0").unwrap(), 1);
/// assert_eq!(registry.reserve(PciePort::SwitchPort, "0000:03:00.0").unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct PciePortRegistry {
    ports: Mutex<BTreeMap<PciePort, Vec<String>>>,
}

impl PciePortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a bus position for `bdf` behind `port` and returns its index.
    ///
    /// The index is the number of devices already reserved on `port`.
    /// Reserving a BDF that already holds a position on the same port returns
    /// that position again.
    pub fn reserve(&self, port: PciePort, bdf: &str) -> Result<u32> {
        if port == PciePort::NoPort {
            return Err(Error::NoPort(bdf.to_owned()));
        }

        let mut ports = self.ports.lock().unwrap();

        if let Some((owner, _)) = ports
            .iter()
            .find(|(p, bdfs)| **p != port && bdfs.iter().any(|b| b == bdf))
        {
            return Err(Error::Conflict {
                bdf: bdf.to_owned(),
                owner: *owner,
            });
        }

        let bdfs = ports.entry(port).or_default();
        if let Some(index) = bdfs.iter().position(|b| b == bdf) {
            debug!("{bdf} already holds bus index {index} on {port}");
            return u32::try_from(index).map_err(|_| Error::Exhausted(port));
        }

        let index = u32::try_from(bdfs.len()).map_err(|_| Error::Exhausted(port))?;
        bdfs.push(bdf.to_owned());
        info!("Reserved bus index {index} on {port} for {bdf}");

        Ok(index)
    }

    /// BDFs occupying `port`, ordered by bus index.
    pub fn occupied(&self, port: PciePort) -> Vec<String> {
        self.ports
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, port: PciePort, bdf: &str) -> bool {
        self.ports
            .lock()
            .unwrap()
            .get(&port)
            .is_some_and(|bdfs| bdfs.iter().any(|b| b == bdf))
    }
}
