// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Decisions about which devices this SP may upgrade, and when.

use crate::config::Config;
use crate::work_item::DeviceStatus;
use crate::work_item::ForceFlags;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fup_messages::DeviceType;
use fup_messages::SpId;
use std::collections::BTreeMap;

/// What the engine knows about the rest of the enclosure when it evaluates
/// the environment gate.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentView<'a> {
    /// False while the peer SP is unreachable.
    pub peer_present: bool,
    pub devices: &'a BTreeMap<DeviceId, DeviceStatus>,
}

pub trait PolicyGate {
    /// Whether this SP is responsible for upgrading `device`. Symmetric
    /// hardware owned by the peer is never touched locally.
    fn is_owned_by_local(&self, device: &DeviceId, status: &DeviceStatus)
        -> bool;

    /// Whether the device is eligible for upgrade at all.
    fn is_qualified(&self, status: &DeviceStatus) -> bool {
        status.inserted && !status.faulted && status.downloadable
    }

    /// Whether upgrading `device` requires the peer's permission.
    fn requires_peer_permission(
        &self,
        device: &DeviceId,
        force_flags: ForceFlags,
    ) -> bool;

    /// Whether the rest of the enclosure can tolerate this SP upgrading
    /// `target` now.
    fn environment_allows_upgrade(
        &self,
        target: &DeviceTarget,
        force_flags: ForceFlags,
        env: &EnvironmentView<'_>,
    ) -> bool;
}

/// The policy used on real systems: each SP owns the devices on its side,
/// shared device classes need the peer's permission, and the environment
/// gate requires a reachable peer whose half of the unit is healthy.
#[derive(Debug, Clone)]
pub struct StandardPolicy {
    local_sp: SpId,
    single_sp: bool,
    peer_permission_device_types: Vec<DeviceType>,
}

impl StandardPolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            local_sp: config.local_sp,
            single_sp: config.single_sp,
            peer_permission_device_types: config
                .peer_permission_device_types
                .clone(),
        }
    }

    fn acts_alone(&self, force_flags: ForceFlags) -> bool {
        self.single_sp || force_flags.contains(ForceFlags::SINGLE_SP_MODE)
    }
}

impl PolicyGate for StandardPolicy {
    fn is_owned_by_local(
        &self,
        _device: &DeviceId,
        status: &DeviceStatus,
    ) -> bool {
        self.single_sp || status.side == self.local_sp
    }

    fn requires_peer_permission(
        &self,
        device: &DeviceId,
        force_flags: ForceFlags,
    ) -> bool {
        !self.acts_alone(force_flags)
            && self.peer_permission_device_types.contains(&device.device_type)
    }

    fn environment_allows_upgrade(
        &self,
        target: &DeviceTarget,
        force_flags: ForceFlags,
        env: &EnvironmentView<'_>,
    ) -> bool {
        if self.acts_alone(force_flags)
            || force_flags.contains(ForceFlags::NO_ENV_CHECK)
        {
            return true;
        }
        if !env.peer_present {
            return false;
        }
        // Every peer-side device of the same unit must be healthy, since
        // the peer depends on it while ours is being reset.
        env.devices
            .iter()
            .filter(|(device, status)| {
                device.shares_unit(&target.device)
                    && status.side != self.local_sp
            })
            .all(|(_, status)| status.inserted && !status.faulted)
    }
}
