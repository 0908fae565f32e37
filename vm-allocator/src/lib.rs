// Copyright © 2019 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Manages guest-visible resources that are handed out to passthrough devices.

mod pcie;

pub use crate::pcie::{Error, PciePort, PciePortRegistry, Result};
