// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Interfaces to the hardware and to the firmware image store.

use crate::error::RepositoryError;
use crate::error::TransportError;
use crate::manifest::ManifestEntry;
use crate::work_item::HardwareIdentity;
use crate::work_item::HwStatusCode;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use fup_messages::DeviceTarget;
use fup_messages::FirmwareTarget;
use fup_messages::RawImageHeader;
use std::fs;
use std::io::Read;
use std::sync::Arc;

/// A resolved firmware image, not yet read in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub path: Utf8PathBuf,
    /// The header block at the front of the image file.
    pub header_block: Vec<u8>,
}

/// A firmware image held in memory until the work item using it is
/// released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub path: Utf8PathBuf,
    pub bytes: Arc<Vec<u8>>,
}

impl ImageData {
    /// The part of the image that is sent to the device.
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(RawImageHeader::BLOCK_SIZE..).unwrap_or(&[])
    }
}

/// Image header as interpreted for a particular target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub product_id: String,
    pub target: FirmwareTarget,
    pub revision: String,
    pub payload_len: u64,
}

impl TryFrom<&RawImageHeader> for ImageHeader {
    type Error = fup_messages::ImageHeaderError;

    fn try_from(raw: &RawImageHeader) -> Result<Self, Self::Error> {
        let product_id = raw
            .product_id()
            .ok_or(fup_messages::ImageHeaderError::InvalidString)?;
        let revision = raw
            .revision()
            .ok_or(fup_messages::ImageHeaderError::InvalidString)?;
        Ok(Self {
            product_id: product_id.to_string(),
            target: raw.target,
            revision: revision.to_string(),
            payload_len: u64::from(raw.payload_len),
        })
    }
}

/// Handle to a download or activation started on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Complete,
    /// The device reported a failure; the code is surfaced as-is.
    Failed(HwStatusCode),
}

/// Operations against one physical firmware target. None of these may block;
/// long-running work is started by one call and polled by another.
pub trait HardwareTransport {
    fn read_header(
        &mut self,
        target: &DeviceTarget,
        image: &ImageHandle,
    ) -> Result<ImageHeader, TransportError>;

    fn begin_download(
        &mut self,
        target: &DeviceTarget,
        image: &ImageData,
    ) -> Result<OperationHandle, TransportError>;

    fn poll_download(
        &mut self,
        handle: OperationHandle,
    ) -> Result<OperationStatus, TransportError>;

    fn activate(
        &mut self,
        target: &DeviceTarget,
    ) -> Result<OperationHandle, TransportError>;

    fn poll_activate(
        &mut self,
        handle: OperationHandle,
    ) -> Result<OperationStatus, TransportError>;

    /// Read the revision the target is currently running.
    fn read_revision(
        &mut self,
        target: &DeviceTarget,
    ) -> Result<String, TransportError>;

    /// Give up on an operation that has not reached a terminal state.
    ///
    /// Hardware is not required to support cancellation; the default does
    /// nothing and the operation is left to finish on its own.
    fn release(&mut self, _handle: OperationHandle) {}
}

/// Source of firmware images and manifests.
pub trait ImageRepository {
    /// Find the image for `target` on hardware with `identity`. `file` is the
    /// image named by a manifest, when there is one.
    fn resolve_image(
        &self,
        identity: &HardwareIdentity,
        target: FirmwareTarget,
        file: Option<&Utf8Path>,
    ) -> Result<ImageHandle, RepositoryError>;

    fn load_image(
        &self,
        image: &ImageHandle,
    ) -> Result<ImageData, RepositoryError>;

    /// Parse the manifest and return the entry for `identity`.
    fn resolve_manifest(
        &self,
        identity: &HardwareIdentity,
    ) -> Result<ManifestEntry, RepositoryError>;
}

/// Images stored on disk.
///
/// Single images live at `<root>/<product_id>/<target>.img`; the manifest
/// lives at `<root>/manifest.json` and names files relative to `<root>`.
#[derive(Debug, Clone)]
pub struct DirectoryImageRepository {
    root: Utf8PathBuf,
}

impl DirectoryImageRepository {
    pub const MANIFEST_FILE: &'static str = "manifest.json";

    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Parse every entry in the manifest.
    pub fn read_manifest(&self) -> Result<Vec<ManifestEntry>, RepositoryError> {
        let path = self.root.join(Self::MANIFEST_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound { path });
            }
            Err(err) => return Err(RepositoryError::Io { path, err }),
        };
        serde_json::from_str(&contents)
            .map_err(|err| RepositoryError::ManifestParse { path, err })
    }

    fn image_path(
        &self,
        identity: &HardwareIdentity,
        target: FirmwareTarget,
        file: Option<&Utf8Path>,
    ) -> Utf8PathBuf {
        match file {
            Some(file) => self.root.join(file),
            None => self
                .root
                .join(&identity.product_id)
                .join(format!("{}.img", target.as_str())),
        }
    }
}

impl ImageRepository for DirectoryImageRepository {
    fn resolve_image(
        &self,
        identity: &HardwareIdentity,
        target: FirmwareTarget,
        file: Option<&Utf8Path>,
    ) -> Result<ImageHandle, RepositoryError> {
        let path = self.image_path(identity, target, file);
        let mut f = match fs::File::open(&path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound { path });
            }
            Err(err) => return Err(RepositoryError::Io { path, err }),
        };

        let mut header_block = vec![0; RawImageHeader::BLOCK_SIZE];
        f.read_exact(&mut header_block)
            .map_err(|err| RepositoryError::Io { path: path.clone(), err })?;

        Ok(ImageHandle { path, header_block })
    }

    fn load_image(
        &self,
        image: &ImageHandle,
    ) -> Result<ImageData, RepositoryError> {
        let bytes = fs::read(&image.path).map_err(|err| RepositoryError::Io {
            path: image.path.clone(),
            err,
        })?;
        Ok(ImageData { path: image.path.clone(), bytes: Arc::new(bytes) })
    }

    fn resolve_manifest(
        &self,
        identity: &HardwareIdentity,
    ) -> Result<ManifestEntry, RepositoryError> {
        self.read_manifest()?
            .into_iter()
            .find(|entry| entry.product_id == identity.product_id)
            .ok_or_else(|| RepositoryError::NoManifestEntry {
                product_id: identity.product_id.clone(),
            })
    }
}
