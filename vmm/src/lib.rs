// Copyright © 2019 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Sandbox side of device passthrough: the devices owned by one VM.

pub mod device_manager;

pub use device_manager::{
    DeviceManager, DeviceManagerError, DeviceManagerResult, DEVICE_MANAGER_SNAPSHOT_ID,
};
