// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::ops::{Deref, DerefMut};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Device, DeviceInfo, DeviceType, Result};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachCountError {
    #[error("device was attached too many times")]
    Overflow,
    #[error("detaching a device that wasn't attached")]
    Underflow,
}

/// Direction of an attach count bump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountOp {
    Increase,
    Decrease,
}

impl CountOp {
    fn inverse(self) -> Self {
        match self {
            CountOp::Increase => CountOp::Decrease,
            CountOp::Decrease => CountOp::Increase,
        }
    }
}

/// Number of logical owners currently holding a device attached.
///
/// Only the 0 -> 1 and 1 -> 0 transitions correspond to real hardware
/// operations; every other bump reports that the operation must be skipped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachCount(u32);

impl AttachCount {
    pub fn new(count: u32) -> Self {
        AttachCount(count)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Returns `true` when the device was already attached by someone else.
    pub fn increase(&mut self) -> std::result::Result<bool, AttachCountError> {
        let count = self.0.checked_add(1).ok_or(AttachCountError::Overflow)?;
        self.0 = count;
        Ok(count > 1)
    }

    /// Returns `true` when other owners still hold the device attached.
    pub fn decrease(&mut self) -> std::result::Result<bool, AttachCountError> {
        let count = self.0.checked_sub(1).ok_or(AttachCountError::Underflow)?;
        self.0 = count;
        Ok(count > 0)
    }

    pub fn bump(&mut self, op: CountOp) -> std::result::Result<bool, AttachCountError> {
        match op {
            CountOp::Increase => self.increase(),
            CountOp::Decrease => self.decrease(),
        }
    }

    // Undoes a bump that just succeeded, so it cannot leave the valid range.
    fn revert(&mut self, op: CountOp) {
        self.0 = match op.inverse() {
            CountOp::Increase => self.0.saturating_add(1),
            CountOp::Decrease => self.0.saturating_sub(1),
        };
    }
}

/// State common to every device kind.
#[derive(Clone, Debug)]
pub struct GenericDevice {
    id: String,
    info: DeviceInfo,
    ref_count: u32,
    attach_count: AttachCount,
}

/// Persisted form of [`GenericDevice`], embedded in each device kind state.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericDeviceState {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub attach_count: u32,
    pub ref_count: u32,
    pub device_info: DeviceInfo,
}

impl GenericDevice {
    pub fn new(info: DeviceInfo) -> Self {
        GenericDevice {
            id: info.id.clone(),
            info,
            ref_count: 0,
            attach_count: AttachCount::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn attach_count(&self) -> u32 {
        self.attach_count.get()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Adds a reference from a new user of the device, returns the new count.
    pub fn reference(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_add(1);
        self.ref_count
    }

    /// Drops a reference, returns the remaining count.
    pub fn dereference(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    pub fn save(&self, device_type: DeviceType) -> GenericDeviceState {
        GenericDeviceState {
            id: self.id.clone(),
            device_type,
            attach_count: self.attach_count.get(),
            ref_count: self.ref_count,
            device_info: self.info.clone(),
        }
    }

    pub fn load(state: GenericDeviceState) -> Self {
        GenericDevice {
            id: state.id,
            info: state.device_info,
            ref_count: state.ref_count,
            attach_count: AttachCount::new(state.attach_count),
        }
    }
}

/// Scoped attach count bump.
///
/// Entering the guard bumps the count of the device. Unless [`commit`] is
/// called, dropping the guard applies the inverse bump, so any failure of the
/// guarded hardware operation leaves the count as if nothing happened.
///
/// [`commit`]: AttachGuard::commit
pub struct AttachGuard<'a, D: Device + ?Sized> {
    device: &'a mut D,
    op: CountOp,
    armed: bool,
}

impl<'a, D: Device + ?Sized> AttachGuard<'a, D> {
    /// Bumps the count of `device`. Returns `None` when the real operation
    /// must be skipped because other owners still hold the device.
    pub fn enter(device: &'a mut D, op: CountOp) -> Result<Option<Self>> {
        let skip = device
            .generic_mut()
            .attach_count
            .bump(op)
            .map_err(|source| crate::Error::AttachCount {
                id: device.device_id().to_owned(),
                source,
            })?;

        if skip {
            debug!(
                "Skipping {:?} of device {}, attach count is {}",
                op,
                device.device_id(),
                device.attach_count()
            );
            return Ok(None);
        }

        Ok(Some(AttachGuard {
            device,
            op,
            armed: true,
        }))
    }

    /// Keeps the bump: the guarded operation succeeded.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl<D: Device + ?Sized> Deref for AttachGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
    }
}

impl<D: Device + ?Sized> DerefMut for AttachGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
    }
}

impl<D: Device + ?Sized> Drop for AttachGuard<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.device.generic_mut().attach_count.revert(self.op);
            warn!(
                "Rolled back {:?} of device {}, attach count is {}",
                self.op,
                self.device.device_id(),
                self.device.attach_count()
            );
        }
    }
}
