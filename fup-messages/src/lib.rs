// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

//! Wire types exchanged between the two storage processors of an enclosure
//! while coordinating firmware upgrades, plus the identifiers both sides use
//! to name devices and firmware targets.

mod image_header;

use core::fmt;
use core::str;
use serde::Deserialize;
use serde::Serialize;
use static_assertions::const_assert;

pub use hubpack::error::Error as HubpackError;
pub use hubpack::{deserialize, serialize, SerializedSize};
pub use image_header::*;
pub use strum::IntoEnumIterator;

/// Maximum size in bytes for a serialized message.
pub const MAX_SERIALIZED_SIZE: usize = 128;

pub mod version {
    pub const V1: u32 = 1;

    /// The version this crate speaks; peers on any other version are
    /// rejected.
    pub const CURRENT: u32 = V1;
}

#[derive(
    Debug, Clone, Copy, SerializedSize, Serialize, Deserialize, PartialEq, Eq,
)]
pub struct Header {
    /// Protocol version.
    pub version: u32,
    /// Arbitrary message id; replies carry the id of the request they answer.
    pub message_id: u32,
}

#[derive(
    Debug, Clone, Copy, SerializedSize, Serialize, Deserialize, PartialEq, Eq,
)]
pub struct Message {
    pub header: Header,
    pub kind: PeerMessage,
}

const_assert!(Message::MAX_SIZE <= MAX_SERIALIZED_SIZE);

/// Serialize `message` into `out`, returning the number of bytes written.
pub fn serialize_message(
    out: &mut [u8; MAX_SERIALIZED_SIZE],
    message: &Message,
) -> Result<usize, HubpackError> {
    hubpack::serialize(out, message)
}

/// Deserialize a full message from `data`, rejecting trailing bytes.
pub fn deserialize_message(data: &[u8]) -> Result<Message, DecodeError> {
    let (message, rest) = hubpack::deserialize::<Message>(data)
        .map_err(DecodeError::Deserialize)?;
    if !rest.is_empty() {
        return Err(DecodeError::UnexpectedTrailingData(rest.len()));
    }
    if message.header.version != version::CURRENT {
        return Err(DecodeError::WrongVersion {
            expected: version::CURRENT,
            got: message.header.version,
        });
    }
    Ok(message)
}

#[derive(Debug, Clone, Copy)]
pub enum DecodeError {
    Deserialize(HubpackError),
    UnexpectedTrailingData(usize),
    WrongVersion { expected: u32, got: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deserialize(err) => {
                write!(f, "failed to deserialize message: {err}")
            }
            Self::UnexpectedTrailingData(n) => {
                write!(f, "message had {n} unexpected trailing bytes")
            }
            Self::WrongVersion { expected, got } => write!(
                f,
                "wrong protocol version (expected {expected}, got {got})"
            ),
        }
    }
}

/// Messages exchanged between the two SPs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    SerializedSize,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum PeerMessage {
    /// Sent when an SP comes up or regains contact with its peer.
    PeerAlive { sp: SpId },
    /// Ask the peer whether we may upgrade `target`.
    PermissionRequest { request_id: RequestId, target: DeviceTarget },
    PermissionGrant { request_id: RequestId, target: DeviceTarget },
    PermissionDeny {
        request_id: RequestId,
        target: DeviceTarget,
        reason: DenyReason,
    },
    /// The sender is about to activate a new image on `target`, which will
    /// reset it.
    ActivateStart { target: DeviceTarget },
    /// The sender has finished upgrading `target` (successfully or not).
    UpgradeEnd { target: DeviceTarget },
}

impl PeerMessage {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub enum DenyReason {
    /// The peer is already upgrading a device in the same unit.
    UpgradeInProgress,
    /// The peer is activating an image in the same unit.
    ActivationInProgress,
    /// Both SPs asked at the same time and the peer keeps priority.
    Contention,
}

/// Identifies one of the two storage processors in an enclosure.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializedSize,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SpId {
    A,
    B,
}

impl SpId {
    pub fn peer(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for SpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "SPA"),
            Self::B => write!(f, "SPB"),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializedSize,
    Serialize,
    Deserialize,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceType {
    /// Link control card.
    Lcc,
    PowerSupply,
    Fan,
    /// Standby power supply.
    Sps,
    IoModule,
    BaseBoard,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Physical location of a device within the array.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializedSize,
    Serialize,
    Deserialize,
)]
pub struct Location {
    pub bus: u8,
    pub enclosure: u8,
    /// Sub-enclosure index for enclosures that contain more than one
    /// expander complex; zero otherwise.
    pub component_id: u8,
    pub slot: u8,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.bus, self.enclosure, self.component_id, self.slot
        )
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializedSize,
    Serialize,
    Deserialize,
)]
pub struct DeviceId {
    pub device_type: DeviceType,
    pub location: Location,
}

impl DeviceId {
    /// Returns true if `self` and `other` are the same class of device in the
    /// same (sub-)enclosure, i.e., the symmetric pair the two SPs share.
    pub fn shares_unit(&self, other: &DeviceId) -> bool {
        self.device_type == other.device_type
            && self.location.bus == other.location.bus
            && self.location.enclosure == other.location.enclosure
            && self.location.component_id == other.location.component_id
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.device_type.as_str(), self.location)
    }
}

/// The piece of a device being flashed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializedSize,
    Serialize,
    Deserialize,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FirmwareTarget {
    /// Combined image for devices that carry a single image.
    Main,
    Expander,
    ExpanderBoot,
    InitString,
    Fpga,
    Cpld,
}

impl FirmwareTarget {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Activating a primary image resets the device and brings every staged
    /// image into service with it.
    pub fn is_primary(&self) -> bool {
        match self {
            Self::Main | Self::Expander => true,
            Self::ExpanderBoot | Self::InitString | Self::Fpga | Self::Cpld => {
                false
            }
        }
    }
}

/// Key for a single upgrade: one firmware target on one device.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializedSize,
    Serialize,
    Deserialize,
)]
pub struct DeviceTarget {
    pub device: DeviceId,
    pub firmware: FirmwareTarget,
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.firmware.as_str())
    }
}

/// Identifies one outstanding permission request, so a late grant or deny can
/// be matched to the request that asked for it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    SerializedSize,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct RequestId(pub [u8; 16]);

impl From<uuid::Uuid> for RequestId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.into_bytes())
    }
}

impl From<RequestId> for uuid::Uuid {
    fn from(id: RequestId) -> Self {
        Self::from_bytes(id.0)
    }
}

/// Interpret a nul-padded byte field as a string.
pub(crate) fn padded_as_str(bytes: &[u8]) -> Option<&str> {
    let n = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    str::from_utf8(&bytes[..n]).ok()
}

/// Error returned when a string does not fit its fixed-size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldTooLong {
    pub max: usize,
}

pub(crate) fn pad_str<const N: usize>(
    value: &str,
) -> Result<[u8; N], FieldTooLong> {
    if value.len() > N {
        return Err(FieldTooLong { max: N });
    }
    let mut out = [0; N];
    out[..value.len()].copy_from_slice(value.as_bytes());
    Ok(out)
}
