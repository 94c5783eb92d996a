// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use crate::hardware::ImageData;
use crate::hardware::ImageHandle;
use crate::hardware::ImageHeader;
use crate::hardware::OperationHandle;
use bitflags::bitflags;
use camino::Utf8PathBuf;
use fup_messages::DeviceTarget;
use fup_messages::FirmwareTarget;
use fup_messages::SpId;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

bitflags! {
    /// Options that relax or alter the normal upgrade pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ForceFlags: u32 {
        /// Skip the peer environment gate.
        const NO_ENV_CHECK = 1 << 0;
        /// Download but do not activate; a later primary activation brings
        /// the image into service.
        const ACTIVATION_DEFERRED = 1 << 1;
        /// Re-parse the manifest even if it is cached.
        const READ_MANIFEST_FILE = 1 << 2;
        /// Flash even if the device already runs the image revision.
        const NO_REV_CHECK = 1 << 3;
        /// Behave as the only SP: no peer permission, no environment gate.
        const SINGLE_SP_MODE = 1 << 4;
    }
}

impl ForceFlags {
    pub const NONE: Self = Self::empty();

    /// Flags that describe a single expansion rather than the caller's
    /// intent, and so are not carried over when an upgrade is re-initiated.
    pub(crate) const PER_EXPANSION: Self =
        Self::ACTIVATION_DEFERRED.union(Self::READ_MANIFEST_FILE);
}

/// A status code reported by the hardware, passed through unmodified.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HwStatusCode(pub u32);

impl fmt::Display for HwStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Outcome attached to a work item when it leaves the active pipeline.
///
/// Hardware-reported failures are carried as [`CompletionStatus::Hardware`];
/// the set of codes is owned by the hardware and is not interpreted here.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum CompletionStatus {
    #[default]
    None,
    InProgress,
    Ok,
    FailNoPeerPermission,
    FailBadEnvStatus,
    Aborted,
    FailImageNotFound,
    FailIncompatibleImage,
    FailRetriesExhausted,
    FailNewRevMismatch,
    Hardware(HwStatusCode),
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Failures caused by the environment rather than the device; these are
    /// re-initiated automatically when the gating condition clears.
    pub fn is_environmental(&self) -> bool {
        matches!(self, Self::FailNoPeerPermission | Self::FailBadEnvStatus)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware(code) => write!(f, "hardware({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Pipeline stages, in order. A work item moves forward at most one stage
/// per scheduling pass.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpgradeStage {
    None,
    WaitBeforeUpgrade,
    WaitForInterDeviceDelay,
    ReadImageHeader,
    CheckRev,
    ReadEntireImage,
    GetPeerPermission,
    CheckEnvStatus,
    DownloadImage,
    GetDownloadStatus,
    ActivateImage,
    GetActivateStatus,
    CheckResult,
    RefreshDeviceStatus,
    EndUpgrade,
    ReleaseImage,
}

impl UpgradeStage {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// True from the point a peer grant has been consumed until the item
    /// finishes.
    pub(crate) fn is_past_permission_gate(&self) -> bool {
        *self >= Self::CheckEnvStatus && *self < Self::EndUpgrade
    }

    pub(crate) fn is_activating(&self) -> bool {
        matches!(self, Self::ActivateImage | Self::GetActivateStatus)
    }
}

/// Identity code burned into the hardware; selects which image family
/// applies.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HardwareIdentity {
    pub product_id: String,
    pub unique_id: u32,
}

impl fmt::Display for HardwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.product_id, self.unique_id)
    }
}

/// Protocol version negotiated with the device's management interface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const LEGACY: Self = Self { major: 1, minor: 0 };
    pub const MANIFEST: Self = Self { major: 2, minor: 0 };
}

/// Snapshot of a device's state as reported by the status-notification
/// system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// The SP this device is associated with.
    pub side: SpId,
    pub inserted: bool,
    pub faulted: bool,
    pub downloadable: bool,
    pub identity: HardwareIdentity,
    pub protocol: ProtocolVersion,
    /// Running revision of each firmware target on the device.
    pub firmware_revs: BTreeMap<FirmwareTarget, String>,
}

impl DeviceStatus {
    pub fn firmware_rev(&self, target: FirmwareTarget) -> &str {
        self.firmware_revs.get(&target).map(String::as_str).unwrap_or("")
    }
}

/// One in-flight upgrade attempt for one (device, firmware target) pair.
#[derive(Debug)]
pub(crate) struct WorkItem {
    /// Creation order within this engine; strictly increasing.
    pub seq: u64,
    pub target: DeviceTarget,
    pub identity: HardwareIdentity,
    pub protocol: ProtocolVersion,
    /// Image file named by the manifest, if this item came from one.
    pub image_file: Option<Utf8PathBuf>,
    pub current_rev: String,
    pub image_rev: Option<String>,
    pub pre_upgrade_rev: Option<String>,
    pub force_flags: ForceFlags,
    pub retry_count: u32,
    pub stage: UpgradeStage,
    pub stage_entered: Option<Instant>,
    pub completion: CompletionStatus,
    pub abort_requested: bool,
    pub image: Option<ImageHandle>,
    pub header: Option<ImageHeader>,
    pub image_data: Option<ImageData>,
    pub operation: Option<OperationHandle>,
    pub refreshed_rev: Option<String>,
    /// Set once the peer has been told we are activating `target`.
    pub announced_activation: bool,
}

/// Fields needed to create a [`WorkItem`]; the store assigns the sequence
/// number on insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NewWorkItem {
    pub target: DeviceTarget,
    pub identity: HardwareIdentity,
    pub protocol: ProtocolVersion,
    pub image_file: Option<Utf8PathBuf>,
    pub current_rev: String,
    pub image_rev: Option<String>,
    pub force_flags: ForceFlags,
    pub retry_count: u32,
}

impl WorkItem {
    pub fn new(seq: u64, new: NewWorkItem) -> Self {
        Self {
            seq,
            target: new.target,
            identity: new.identity,
            protocol: new.protocol,
            image_file: new.image_file,
            current_rev: new.current_rev,
            image_rev: new.image_rev,
            pre_upgrade_rev: None,
            force_flags: new.force_flags,
            retry_count: new.retry_count,
            stage: UpgradeStage::None,
            stage_entered: None,
            completion: CompletionStatus::InProgress,
            abort_requested: false,
            image: None,
            header: None,
            image_data: None,
            operation: None,
            refreshed_rev: None,
            announced_activation: false,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.force_flags.contains(ForceFlags::ACTIVATION_DEFERRED)
    }

    pub fn snapshot(&self) -> WorkItemSnapshot {
        WorkItemSnapshot {
            target: self.target,
            stage: Some(self.stage),
            completion: self.completion,
            current_rev: self.current_rev.clone(),
            image_rev: self.image_rev.clone(),
            pre_upgrade_rev: self.pre_upgrade_rev.clone(),
            force_flags: self.force_flags.bits(),
            retry_count: self.retry_count,
        }
    }
}

/// Externally visible view of one upgrade, live or finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItemSnapshot {
    pub target: DeviceTarget,
    /// `None` once the work item has been released.
    pub stage: Option<UpgradeStage>,
    pub completion: CompletionStatus,
    pub current_rev: String,
    pub image_rev: Option<String>,
    pub pre_upgrade_rev: Option<String>,
    pub force_flags: u32,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_follows_pipeline() {
        assert!(UpgradeStage::None < UpgradeStage::WaitBeforeUpgrade);
        assert!(UpgradeStage::GetDownloadStatus < UpgradeStage::ActivateImage);
        assert!(UpgradeStage::EndUpgrade < UpgradeStage::ReleaseImage);
        assert!(!UpgradeStage::GetPeerPermission.is_past_permission_gate());
        assert!(UpgradeStage::CheckEnvStatus.is_past_permission_gate());
        assert!(!UpgradeStage::EndUpgrade.is_past_permission_gate());
    }

    #[test]
    fn hardware_codes_pass_through() {
        let status = CompletionStatus::Hardware(HwStatusCode(0x8000_0042));
        assert_eq!(status.to_string(), "hardware(0x80000042)");
        assert!(!status.is_environmental());
        assert!(CompletionStatus::FailBadEnvStatus.is_environmental());
        assert!(CompletionStatus::FailNoPeerPermission.is_environmental());
    }
}
