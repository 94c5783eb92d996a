// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The tests in this module check that the serialized form of messages from
//! peer protocol version 1 have not changed.
//!
//! If a test in this module fails, _do not change the test_! This means you
//! have changed, deleted, or reordered an existing message type or enum
//! variant, and you should revert that change. Both SPs of an enclosure may
//! be running different software versions in the middle of an upgrade.

use super::assert_serialized;
use fup_messages::DenyReason;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fup_messages::DeviceType;
use fup_messages::FirmwareTarget;
use fup_messages::Header;
use fup_messages::Location;
use fup_messages::Message;
use fup_messages::PeerMessage;
use fup_messages::RawImageHeader;
use fup_messages::RequestId;
use fup_messages::SerializedSize;
use fup_messages::SpId;

const HEADER_BYTES: [u8; 8] = [1, 0, 0, 0, 4, 3, 2, 1];
const TARGET_BYTES: [u8; 6] = [2, 0, 1, 0, 3, 4];

fn header() -> Header {
    Header { version: 1, message_id: 0x0102_0304 }
}

fn target() -> DeviceTarget {
    DeviceTarget {
        device: DeviceId {
            device_type: DeviceType::Fan,
            location: Location {
                bus: 0,
                enclosure: 1,
                component_id: 0,
                slot: 3,
            },
        },
        firmware: FirmwareTarget::Fpga,
    }
}

fn message_bytes(kind: &[u8]) -> Vec<u8> {
    let mut bytes = HEADER_BYTES.to_vec();
    bytes.extend_from_slice(kind);
    bytes
}

#[test]
fn peer_alive() {
    let mut out = [0; Message::MAX_SIZE];
    let message = Message {
        header: header(),
        kind: PeerMessage::PeerAlive { sp: SpId::B },
    };
    assert_serialized(&mut out, &message_bytes(&[0, 1]), &message);
}

#[test]
fn permission_messages() {
    let mut out = [0; Message::MAX_SIZE];
    let request_id = RequestId([0xaa; 16]);

    let mut kind = vec![1];
    kind.extend_from_slice(&request_id.0);
    kind.extend_from_slice(&TARGET_BYTES);
    let message = Message {
        header: header(),
        kind: PeerMessage::PermissionRequest { request_id, target: target() },
    };
    assert_serialized(&mut out, &message_bytes(&kind), &message);

    let mut kind = vec![2];
    kind.extend_from_slice(&request_id.0);
    kind.extend_from_slice(&TARGET_BYTES);
    let message = Message {
        header: header(),
        kind: PeerMessage::PermissionGrant { request_id, target: target() },
    };
    assert_serialized(&mut out, &message_bytes(&kind), &message);

    for (reason, reason_byte) in [
        (DenyReason::UpgradeInProgress, 0),
        (DenyReason::ActivationInProgress, 1),
        (DenyReason::Contention, 2),
    ] {
        let mut kind = vec![3];
        kind.extend_from_slice(&request_id.0);
        kind.extend_from_slice(&TARGET_BYTES);
        kind.push(reason_byte);
        let message = Message {
            header: header(),
            kind: PeerMessage::PermissionDeny {
                request_id,
                target: target(),
                reason,
            },
        };
        assert_serialized(&mut out, &message_bytes(&kind), &message);
    }
}

#[test]
fn activation_notifications() {
    let mut out = [0; Message::MAX_SIZE];

    let mut kind = vec![4];
    kind.extend_from_slice(&TARGET_BYTES);
    let message = Message {
        header: header(),
        kind: PeerMessage::ActivateStart { target: target() },
    };
    assert_serialized(&mut out, &message_bytes(&kind), &message);

    let mut kind = vec![5];
    kind.extend_from_slice(&TARGET_BYTES);
    let message = Message {
        header: header(),
        kind: PeerMessage::UpgradeEnd { target: target() },
    };
    assert_serialized(&mut out, &message_bytes(&kind), &message);
}

#[test]
fn device_types() {
    let mut out = [0; DeviceType::MAX_SIZE];
    for (device_type, serialized) in [
        (DeviceType::Lcc, &[0]),
        (DeviceType::PowerSupply, &[1]),
        (DeviceType::Fan, &[2]),
        (DeviceType::Sps, &[3]),
        (DeviceType::IoModule, &[4]),
        (DeviceType::BaseBoard, &[5]),
    ] {
        assert_serialized(&mut out, serialized, &device_type);
    }
}

#[test]
fn firmware_targets() {
    let mut out = [0; FirmwareTarget::MAX_SIZE];
    for (target, serialized) in [
        (FirmwareTarget::Main, &[0]),
        (FirmwareTarget::Expander, &[1]),
        (FirmwareTarget::ExpanderBoot, &[2]),
        (FirmwareTarget::InitString, &[3]),
        (FirmwareTarget::Fpga, &[4]),
        (FirmwareTarget::Cpld, &[5]),
    ] {
        assert_serialized(&mut out, serialized, &target);
    }
}

#[test]
fn image_header() {
    let mut out = [0; RawImageHeader::MAX_SIZE];
    let header =
        RawImageHeader::new(FirmwareTarget::Expander, "VOYAGER", "2.04", 8)
            .unwrap();

    #[rustfmt::skip]
    let expected = [
        0x49, 0x50, 0x55, 0x46, // magic
        1, 0, 0, 0, // version
        1, // target
        b'V', b'O', b'Y', b'A', b'G', b'E', b'R', 0,
        0, 0, 0, 0, 0, 0, 0, 0,
        b'2', b'.', b'0', b'4', 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0,
        8, 0, 0, 0, // payload_len
    ];
    assert_serialized(&mut out, &expected, &header);
}
