// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use camino::Utf8PathBuf;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fup_messages::FirmwareTarget;
use slog_error_chain::SlogInlineError;
use std::io;
use thiserror::Error;

/// Errors returned to callers of the notification and administrative
/// operations.
#[derive(Debug, Error, SlogInlineError)]
pub enum UpgradeError {
    #[error("no status has been reported for device {0}")]
    UnknownDevice(DeviceId),
    #[error("device {0} is owned by the peer SP")]
    NotOwnedByLocal(DeviceId),
    #[error("device {0} is not qualified for upgrade")]
    NotQualified(DeviceId),
    #[error("failed to resolve manifest for device {device}")]
    Manifest {
        device: DeviceId,
        #[source]
        err: ManifestError,
    },
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ManifestError {
    #[error("manifest for {product_id} has no primary image")]
    NoPrimaryImage { product_id: String },
    #[error("manifest for {product_id} lists {target:?} more than once")]
    DuplicateTarget { product_id: String, target: FirmwareTarget },
    #[error("manifest for {product_id} is empty")]
    Empty { product_id: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Failures talking to the device. These are treated as transient and
/// retried until the work item's retry budget is spent.
#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum TransportError {
    #[error("device {0} is busy")]
    Busy(DeviceTarget),
    #[error("timed out waiting for device {0}")]
    Timeout(DeviceTarget),
    #[error("unknown operation handle {0}")]
    UnknownOperation(u64),
    #[error("bad image header for {target}: {reason}")]
    BadHeader { target: DeviceTarget, reason: String },
    #[error("I/O error talking to {target}: {message}")]
    Io { target: DeviceTarget, message: String },
}

#[derive(Debug, Error, SlogInlineError)]
pub enum RepositoryError {
    #[error("image file {path} not found")]
    NotFound { path: Utf8PathBuf },
    #[error("no image for {product_id} target {target:?}")]
    NoImage { product_id: String, target: FirmwareTarget },
    #[error("no manifest entry for {product_id}")]
    NoManifestEntry { product_id: String },
    #[error("error reading {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("error parsing manifest {path}")]
    ManifestParse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
}

impl RepositoryError {
    /// Missing images and manifest entries are terminal; everything else may
    /// succeed on retry.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. }
            | Self::NoImage { .. }
            | Self::NoManifestEntry { .. } => true,
            Self::Io { .. } | Self::ManifestParse { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum PeerChannelError {
    #[error("failed to encode peer message")]
    Encode,
    #[error("peer channel closed")]
    Closed,
}

#[derive(Debug, Error, SlogInlineError)]
pub enum PersistError {
    #[error("error reading {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("error writing {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("error parsing {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
    #[error("error serializing upgrade records")]
    Serialize(#[source] serde_json::Error),
}
