// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Expansion of one device into the work items that upgrade it.

use crate::error::ManifestError;
use crate::hardware::ImageRepository;
use crate::work_item::DeviceStatus;
use crate::work_item::ForceFlags;
use crate::work_item::HardwareIdentity;
use crate::work_item::NewWorkItem;
use crate::work_item::ProtocolVersion;
use camino::Utf8PathBuf;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fup_messages::FirmwareTarget;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// All images that make up the firmware of one hardware family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub product_id: String,
    pub images: Vec<ManifestImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestImage {
    pub target: FirmwareTarget,
    pub revision: String,
    /// Image file, relative to the image repository.
    pub file: Utf8PathBuf,
}

impl ManifestEntry {
    pub fn primary(&self) -> Option<&ManifestImage> {
        self.images.iter().find(|image| image.target.is_primary())
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.images.is_empty() {
            return Err(ManifestError::Empty {
                product_id: self.product_id.clone(),
            });
        }
        let mut seen = BTreeSet::new();
        for image in &self.images {
            if !seen.insert(image.target) {
                return Err(ManifestError::DuplicateTarget {
                    product_id: self.product_id.clone(),
                    target: image.target,
                });
            }
        }
        if self.primary().is_none() {
            return Err(ManifestError::NoPrimaryImage {
                product_id: self.product_id.clone(),
            });
        }
        Ok(())
    }
}

/// How a device's firmware is laid out, chosen once per device from its
/// negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradePath {
    /// One combined image; one work item.
    SingleImage,
    /// Several images described by a manifest; one work item per image.
    Manifest,
}

impl UpgradePath {
    pub fn for_protocol(protocol: ProtocolVersion) -> Self {
        if protocol.major >= ProtocolVersion::MANIFEST.major {
            Self::Manifest
        } else {
            Self::SingleImage
        }
    }
}

/// What the caller asked to upgrade.
pub(crate) struct ExpansionRequest<'a> {
    pub device: DeviceId,
    pub status: &'a DeviceStatus,
    pub force_flags: ForceFlags,
    pub retry_count: u32,
}

/// Resolves devices to work items, caching parsed manifest entries per
/// hardware family.
pub(crate) struct ManifestResolver {
    log: Logger,
    cache: BTreeMap<String, ManifestEntry>,
}

impl ManifestResolver {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.new(o!("component" => "ManifestResolver")),
            cache: BTreeMap::new(),
        }
    }

    pub fn cached_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.cache.values()
    }

    /// Produce the work items for `request`, in the order they must be
    /// inserted. For manifest devices every dependent image comes first,
    /// deferred, and the primary image comes last.
    pub fn expand(
        &mut self,
        repo: &dyn ImageRepository,
        path: UpgradePath,
        request: &ExpansionRequest<'_>,
    ) -> Result<Vec<NewWorkItem>, ManifestError> {
        match path {
            UpgradePath::SingleImage => Ok(vec![self.single_image(request)]),
            UpgradePath::Manifest => self.manifest_images(repo, request),
        }
    }

    fn single_image(&self, request: &ExpansionRequest<'_>) -> NewWorkItem {
        let firmware = FirmwareTarget::Main;
        NewWorkItem {
            target: DeviceTarget { device: request.device, firmware },
            identity: request.status.identity.clone(),
            protocol: request.status.protocol,
            image_file: None,
            current_rev: request.status.firmware_rev(firmware).to_string(),
            image_rev: None,
            force_flags: request.force_flags - ForceFlags::READ_MANIFEST_FILE,
            retry_count: request.retry_count,
        }
    }

    fn manifest_images(
        &mut self,
        repo: &dyn ImageRepository,
        request: &ExpansionRequest<'_>,
    ) -> Result<Vec<NewWorkItem>, ManifestError> {
        let reparse =
            request.force_flags.contains(ForceFlags::READ_MANIFEST_FILE);
        let entry = self.entry(repo, &request.status.identity, reparse)?;
        let primary =
            entry.primary().ok_or_else(|| ManifestError::NoPrimaryImage {
                product_id: entry.product_id.clone(),
            })?;

        let mut flags = request.force_flags - ForceFlags::PER_EXPANSION;

        // An expander still running a major revision 1 image cannot take
        // part in an environment check across an upgrade to major revision 2
        // or later.
        let running = request.status.firmware_rev(primary.target);
        if let (Some(hw_major), Some(image_major)) =
            (rev_major(running), rev_major(&primary.revision))
        {
            if hw_major < 2 && image_major > 1 {
                info!(
                    self.log,
                    "expander revision lock, skipping environment check";
                    "device" => %request.device,
                    "running" => running,
                    "image" => &primary.revision,
                );
                flags |= ForceFlags::NO_ENV_CHECK;
            }
        }

        let make_item = |image: &ManifestImage, flags: ForceFlags| {
            NewWorkItem {
                target: DeviceTarget {
                    device: request.device,
                    firmware: image.target,
                },
                identity: request.status.identity.clone(),
                protocol: request.status.protocol,
                image_file: Some(image.file.clone()),
                current_rev: request
                    .status
                    .firmware_rev(image.target)
                    .to_string(),
                image_rev: Some(image.revision.clone()),
                force_flags: flags,
                retry_count: request.retry_count,
            }
        };

        let mut items: Vec<NewWorkItem> = entry
            .images
            .iter()
            .filter(|image| image.target != primary.target)
            .map(|image| {
                make_item(image, flags | ForceFlags::ACTIVATION_DEFERRED)
            })
            .collect();
        items.push(make_item(primary, flags));

        debug!(
            self.log, "expanded manifest";
            "device" => %request.device,
            "product_id" => &entry.product_id,
            "items" => items.len(),
        );
        Ok(items)
    }

    fn entry(
        &mut self,
        repo: &dyn ImageRepository,
        identity: &HardwareIdentity,
        reparse: bool,
    ) -> Result<ManifestEntry, ManifestError> {
        if !reparse {
            if let Some(entry) = self.cache.get(&identity.product_id) {
                return Ok(entry.clone());
            }
        }

        let entry = repo.resolve_manifest(identity)?;
        entry.validate()?;
        debug!(
            self.log, "parsed manifest";
            "product_id" => &entry.product_id,
            "images" => entry.images.len(),
        );
        self.cache.insert(identity.product_id.clone(), entry.clone());
        Ok(entry)
    }
}

fn parse_rev(rev: &str) -> Option<Vec<u32>> {
    rev.trim().split('.').map(|part| part.trim().parse().ok()).collect()
}

/// Major component of a dotted revision string.
pub(crate) fn rev_major(rev: &str) -> Option<u32> {
    parse_rev(rev).and_then(|parts| parts.first().copied())
}

/// Compare two revision strings as the hardware reports them: numerically
/// when both are dotted numbers ("1.05" == "1.5"), otherwise as trimmed,
/// case-insensitive text.
pub(crate) fn revisions_match(a: &str, b: &str) -> bool {
    match (parse_rev(a), parse_rev(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::hardware::ImageData;
    use crate::hardware::ImageHandle;
    use camino::Utf8Path;
    use fup_messages::DeviceType;
    use fup_messages::Location;
    use fup_messages::SpId;
    use std::cell::Cell;

    struct CountingRepo {
        entry: ManifestEntry,
        calls: Cell<usize>,
    }

    impl ImageRepository for CountingRepo {
        fn resolve_image(
            &self,
            identity: &HardwareIdentity,
            target: FirmwareTarget,
            _file: Option<&Utf8Path>,
        ) -> Result<ImageHandle, RepositoryError> {
            Err(RepositoryError::NoImage {
                product_id: identity.product_id.clone(),
                target,
            })
        }

        fn load_image(
            &self,
            image: &ImageHandle,
        ) -> Result<ImageData, RepositoryError> {
            Err(RepositoryError::NotFound { path: image.path.clone() })
        }

        fn resolve_manifest(
            &self,
            _identity: &HardwareIdentity,
        ) -> Result<ManifestEntry, RepositoryError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.entry.clone())
        }
    }

    fn image(target: FirmwareTarget, revision: &str) -> ManifestImage {
        ManifestImage {
            target,
            revision: revision.to_string(),
            file: format!("voyager/{}.img", target.as_str()).into(),
        }
    }

    fn repo(images: Vec<ManifestImage>) -> CountingRepo {
        CountingRepo {
            entry: ManifestEntry { product_id: "VOYAGER".to_string(), images },
            calls: Cell::new(0),
        }
    }

    fn lcc() -> DeviceId {
        DeviceId {
            device_type: DeviceType::Lcc,
            location: Location {
                bus: 0,
                enclosure: 2,
                component_id: 0,
                slot: 0,
            },
        }
    }

    fn status(expander_rev: &str) -> DeviceStatus {
        DeviceStatus {
            side: SpId::A,
            inserted: true,
            faulted: false,
            downloadable: true,
            identity: HardwareIdentity {
                product_id: "VOYAGER".to_string(),
                unique_id: 0x11,
            },
            protocol: ProtocolVersion::MANIFEST,
            firmware_revs: [
                (FirmwareTarget::Expander, expander_rev.to_string()),
                (FirmwareTarget::InitString, "1.00".to_string()),
                (FirmwareTarget::Fpga, "0.30".to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn resolver() -> ManifestResolver {
        ManifestResolver::new(&Logger::root(slog::Discard, o!()))
    }

    #[test]
    fn primary_is_created_last_and_dependents_are_deferred() {
        // Primary listed first in the file to make sure order comes from the
        // resolver and not from the manifest.
        let repo = repo(vec![
            image(FirmwareTarget::Expander, "2.10"),
            image(FirmwareTarget::InitString, "1.02"),
            image(FirmwareTarget::Fpga, "0.31"),
        ]);
        let status = status("2.04");
        let request = ExpansionRequest {
            device: lcc(),
            status: &status,
            force_flags: ForceFlags::NONE,
            retry_count: 0,
        };

        let items = resolver()
            .expand(&repo, UpgradePath::Manifest, &request)
            .unwrap();

        let targets: Vec<_> =
            items.iter().map(|item| item.target.firmware).collect();
        assert_eq!(
            targets,
            [
                FirmwareTarget::InitString,
                FirmwareTarget::Fpga,
                FirmwareTarget::Expander
            ]
        );
        for item in &items[..2] {
            assert!(item.force_flags.contains(ForceFlags::ACTIVATION_DEFERRED));
        }
        let primary_flags = items[2].force_flags;
        assert!(!primary_flags.contains(ForceFlags::ACTIVATION_DEFERRED));
        assert!(!items[2].force_flags.contains(ForceFlags::NO_ENV_CHECK));
        assert_eq!(items[0].current_rev, "1.00");
        assert_eq!(items[0].image_rev.as_deref(), Some("1.02"));
        assert_eq!(items[2].current_rev, "2.04");
    }

    #[test]
    fn manifest_is_cached_until_reparse_requested() {
        let repo = repo(vec![image(FirmwareTarget::Expander, "2.10")]);
        let status = status("2.04");
        let mut resolver = resolver();
        let mut request = ExpansionRequest {
            device: lcc(),
            status: &status,
            force_flags: ForceFlags::NONE,
            retry_count: 0,
        };

        resolver.expand(&repo, UpgradePath::Manifest, &request).unwrap();
        resolver.expand(&repo, UpgradePath::Manifest, &request).unwrap();
        assert_eq!(repo.calls.get(), 1);

        request.force_flags = ForceFlags::READ_MANIFEST_FILE;
        let items =
            resolver.expand(&repo, UpgradePath::Manifest, &request).unwrap();
        assert_eq!(repo.calls.get(), 2);
        assert!(!items[0].force_flags.contains(ForceFlags::READ_MANIFEST_FILE));
        assert_eq!(resolver.cached_entries().count(), 1);
    }

    #[test]
    fn old_expander_skips_environment_check() {
        let repo = repo(vec![
            image(FirmwareTarget::Fpga, "0.31"),
            image(FirmwareTarget::Expander, "2.10"),
        ]);
        let status = status("1.44");
        let request = ExpansionRequest {
            device: lcc(),
            status: &status,
            force_flags: ForceFlags::NONE,
            retry_count: 0,
        };

        let items = resolver()
            .expand(&repo, UpgradePath::Manifest, &request)
            .unwrap();
        assert!(items
            .iter()
            .all(|item| item.force_flags.contains(ForceFlags::NO_ENV_CHECK)));
    }

    #[test]
    fn manifest_without_primary_is_rejected() {
        let repo = repo(vec![image(FirmwareTarget::Fpga, "0.31")]);
        let status = status("2.04");
        let request = ExpansionRequest {
            device: lcc(),
            status: &status,
            force_flags: ForceFlags::NONE,
            retry_count: 0,
        };
        assert!(matches!(
            resolver().expand(&repo, UpgradePath::Manifest, &request),
            Err(ManifestError::NoPrimaryImage { .. })
        ));
    }

    #[test]
    fn legacy_protocol_uses_single_image() {
        assert_eq!(
            UpgradePath::for_protocol(ProtocolVersion::LEGACY),
            UpgradePath::SingleImage
        );
        assert_eq!(
            UpgradePath::for_protocol(ProtocolVersion { major: 3, minor: 1 }),
            UpgradePath::Manifest
        );

        let repo = repo(vec![]);
        let mut status = status("2.04");
        status.protocol = ProtocolVersion::LEGACY;
        status.firmware_revs.insert(FirmwareTarget::Main, "7.1".to_string());
        let request = ExpansionRequest {
            device: lcc(),
            status: &status,
            force_flags: ForceFlags::READ_MANIFEST_FILE
                | ForceFlags::NO_REV_CHECK,
            retry_count: 2,
        };
        let items = resolver()
            .expand(&repo, UpgradePath::SingleImage, &request)
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].target.firmware, FirmwareTarget::Main);
        assert_eq!(items[0].current_rev, "7.1");
        assert_eq!(items[0].force_flags, ForceFlags::NO_REV_CHECK);
        assert_eq!(items[0].retry_count, 2);
        assert_eq!(repo.calls.get(), 0);
    }

    #[test]
    fn revision_comparison() {
        assert!(revisions_match("1.05", "1.5"));
        assert!(revisions_match(" 2.04", "2.04 "));
        assert!(!revisions_match("2.04", "2.10"));
        assert!(revisions_match("cdef-A", "CDEF-a"));
        assert_eq!(rev_major("12.3"), Some(12));
        assert_eq!(rev_major(""), None);
    }
}
