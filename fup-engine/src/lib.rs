// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! This crate upgrades the firmware of field-replaceable devices in a
//! dual-SP enclosure, coordinating with the peer SP before touching
//! hardware both SPs depend on.
//!
//! The primary entry point is [`UpgradeEngine`].

mod config;
mod coordinator;
mod engine;
mod hardware;
mod manifest;
mod peer;
mod persist;
mod policy;
mod stage;
mod store;
mod work_item;

pub mod error;
pub mod sim;

pub use config::Config;
pub use config::LoadError;
pub use config::PeerRetryConfig;
pub use engine::Collaborators;
pub use engine::InitiateOutcome;
pub use engine::PassSummary;
pub use engine::StatusChangeOutcome;
pub use engine::UpgradeEngine;
pub use hardware::DirectoryImageRepository;
pub use hardware::HardwareTransport;
pub use hardware::ImageData;
pub use hardware::ImageHandle;
pub use hardware::ImageHeader;
pub use hardware::ImageRepository;
pub use hardware::OperationHandle;
pub use hardware::OperationStatus;
pub use manifest::ManifestEntry;
pub use manifest::ManifestImage;
pub use peer::PeerChannel;
pub use peer::PeerEvent;
pub use persist::InMemoryStateStore;
pub use persist::JsonFileStateStore;
pub use persist::UpgradeRecord;
pub use persist::UpgradeStateStore;
pub use policy::EnvironmentView;
pub use policy::PolicyGate;
pub use policy::StandardPolicy;
pub use work_item::CompletionStatus;
pub use work_item::DeviceStatus;
pub use work_item::ForceFlags;
pub use work_item::HardwareIdentity;
pub use work_item::HwStatusCode;
pub use work_item::ProtocolVersion;
pub use work_item::UpgradeStage;
pub use work_item::WorkItemSnapshot;
