// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! One step of the upgrade pipeline for one work item.

use crate::config::Config;
use crate::coordinator::PeerPermissionCoordinator;
use crate::coordinator::PermissionPoll;
use crate::hardware::HardwareTransport;
use crate::hardware::ImageRepository;
use crate::hardware::OperationStatus;
use crate::manifest::revisions_match;
use crate::peer::PeerChannel;
use crate::policy::EnvironmentView;
use crate::policy::PolicyGate;
use crate::store::WorkItemStore;
use crate::work_item::CompletionStatus;
use crate::work_item::ForceFlags;
use crate::work_item::UpgradeStage;
use crate::work_item::WorkItem;
use fup_messages::PeerMessage;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::time::Duration;
use std::time::Instant;

/// Result of evaluating the current stage of a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StageResult {
    /// Not ready yet; evaluate the same stage next pass.
    Stay,
    Next(UpgradeStage),
    /// Leave the pipeline with the given status; cleanup still runs.
    Complete(CompletionStatus),
    /// A transient failure; try the same stage again next pass, or fail with
    /// `exhausted` if the retry budget is spent.
    Retry { reason: String, exhausted: CompletionStatus },
}

/// Everything a stage may touch besides the work item itself.
pub(crate) struct StageContext<'a> {
    pub log: &'a Logger,
    pub config: &'a Config,
    pub now: Instant,
    pub transport: &'a mut dyn HardwareTransport,
    pub images: &'a dyn ImageRepository,
    pub peer: &'a mut dyn PeerChannel,
    pub policy: &'a dyn PolicyGate,
    pub coordinator: &'a mut PeerPermissionCoordinator,
    pub env: EnvironmentView<'a>,
    /// Every other live work item; the one being advanced has been taken
    /// out.
    pub others: &'a WorkItemStore,
    pub inter_device_delay: Duration,
    pub last_activation: &'a mut Option<Instant>,
}

fn retry(reason: impl ToString) -> StageResult {
    StageResult::Retry {
        reason: reason.to_string(),
        exhausted: CompletionStatus::FailRetriesExhausted,
    }
}

/// Evaluate the current stage of `item`. `EndUpgrade` and `ReleaseImage`
/// touch engine-wide state and are handled by the engine.
pub(crate) fn advance(
    item: &mut WorkItem,
    cx: &mut StageContext<'_>,
) -> StageResult {
    let entered = item.stage_entered.unwrap_or(cx.now);
    match item.stage {
        UpgradeStage::None => {
            StageResult::Next(UpgradeStage::WaitBeforeUpgrade)
        }
        UpgradeStage::WaitBeforeUpgrade => {
            if cx.now.duration_since(entered) >= cx.config.wait_before_upgrade()
            {
                StageResult::Next(UpgradeStage::WaitForInterDeviceDelay)
            } else {
                StageResult::Stay
            }
        }
        UpgradeStage::WaitForInterDeviceDelay => {
            let delay = cx.inter_device_delay;
            let since_activation = cx
                .last_activation
                .map(|at| cx.now.duration_since(at))
                .unwrap_or(Duration::MAX);
            if cx.now.duration_since(entered) >= delay
                && since_activation >= delay
            {
                StageResult::Next(UpgradeStage::ReadImageHeader)
            } else {
                StageResult::Stay
            }
        }
        UpgradeStage::ReadImageHeader => read_image_header(item, cx),
        UpgradeStage::CheckRev => check_rev(item, cx),
        UpgradeStage::ReadEntireImage => read_entire_image(item, cx),
        UpgradeStage::GetPeerPermission => {
            match cx.coordinator.poll(&item.target, cx.peer, cx.now) {
                PermissionPoll::Granted => {
                    StageResult::Next(UpgradeStage::CheckEnvStatus)
                }
                PermissionPoll::Denied => StageResult::Complete(
                    CompletionStatus::FailNoPeerPermission,
                ),
                PermissionPoll::Waiting => StageResult::Stay,
            }
        }
        UpgradeStage::CheckEnvStatus => {
            if cx.policy.environment_allows_upgrade(
                &item.target,
                item.force_flags,
                &cx.env,
            ) {
                StageResult::Next(UpgradeStage::DownloadImage)
            } else {
                warn!(
                    cx.log, "environment does not allow upgrade";
                    "target" => %item.target,
                );
                StageResult::Complete(CompletionStatus::FailBadEnvStatus)
            }
        }
        UpgradeStage::DownloadImage => {
            let Some(image) = item.image_data.as_ref() else {
                return StageResult::Next(UpgradeStage::ReadEntireImage);
            };
            match cx.transport.begin_download(&item.target, image) {
                Ok(handle) => {
                    item.operation = Some(handle);
                    info!(
                        cx.log, "download started";
                        "target" => %item.target,
                        "image_rev" => item.image_rev.as_deref(),
                    );
                    StageResult::Next(UpgradeStage::GetDownloadStatus)
                }
                Err(err) => retry(err),
            }
        }
        UpgradeStage::GetDownloadStatus => {
            if item.is_deferred() {
                return poll_operation(
                    item,
                    cx,
                    Operation::Download,
                    UpgradeStage::CheckResult,
                );
            }
            // Activating resets the device; every image staged for it must
            // have finished before the primary image moves on to activate.
            let waiting_on = pending_dependents(item, cx.others);
            if waiting_on > 0 {
                debug!(
                    cx.log, "activation waiting on dependent images";
                    "target" => %item.target,
                    "waiting_on" => waiting_on,
                );
                return StageResult::Stay;
            }
            poll_operation(
                item,
                cx,
                Operation::Download,
                UpgradeStage::ActivateImage,
            )
        }
        UpgradeStage::ActivateImage => activate_image(item, cx),
        UpgradeStage::GetActivateStatus => {
            poll_operation(
                item,
                cx,
                Operation::Activate,
                UpgradeStage::CheckResult,
            )
        }
        UpgradeStage::CheckResult => check_result(item, cx),
        UpgradeStage::RefreshDeviceStatus => {
            match cx.transport.read_revision(&item.target) {
                Ok(rev) => {
                    debug!(
                        cx.log, "refreshed revision";
                        "target" => %item.target,
                        "rev" => &rev,
                    );
                    item.refreshed_rev = Some(rev);
                }
                // The upgrade itself is done; the next status notification
                // will carry the revision.
                Err(err) => warn!(
                    cx.log, "failed to refresh revision";
                    "target" => %item.target,
                    &err,
                ),
            }
            StageResult::Next(UpgradeStage::EndUpgrade)
        }
        UpgradeStage::EndUpgrade | UpgradeStage::ReleaseImage => {
            StageResult::Stay
        }
    }
}

fn read_image_header(
    item: &mut WorkItem,
    cx: &mut StageContext<'_>,
) -> StageResult {
    if item.image.is_none() {
        match cx.images.resolve_image(
            &item.identity,
            item.target.firmware,
            item.image_file.as_deref(),
        ) {
            Ok(image) => item.image = Some(image),
            Err(err) if err.is_not_found() => {
                warn!(cx.log, "no image"; "target" => %item.target, &err);
                return StageResult::Complete(
                    CompletionStatus::FailImageNotFound,
                );
            }
            Err(err) => return retry(err),
        }
    }
    let Some(image) = item.image.as_ref() else {
        return StageResult::Stay;
    };
    match cx.transport.read_header(&item.target, image) {
        Ok(header) => {
            item.header = Some(header);
            StageResult::Next(UpgradeStage::CheckRev)
        }
        Err(err) => retry(err),
    }
}

fn check_rev(item: &mut WorkItem, cx: &mut StageContext<'_>) -> StageResult {
    let Some(header) = item.header.as_ref() else {
        return StageResult::Next(UpgradeStage::ReadImageHeader);
    };

    if header.product_id != item.identity.product_id
        || header.target != item.target.firmware
    {
        warn!(
            cx.log, "image does not match device";
            "target" => %item.target,
            "image_product_id" => &header.product_id,
            "image_target" => header.target.as_str(),
        );
        return StageResult::Complete(CompletionStatus::FailIncompatibleImage);
    }
    if let Some(expected) = item.image_rev.as_deref() {
        if !revisions_match(expected, &header.revision) {
            warn!(
                cx.log, "image revision does not match manifest";
                "target" => %item.target,
                "manifest_rev" => expected,
                "image_rev" => &header.revision,
            );
            return StageResult::Complete(
                CompletionStatus::FailIncompatibleImage,
            );
        }
    }

    item.image_rev = Some(header.revision.clone());
    item.pre_upgrade_rev = Some(item.current_rev.clone());

    if revisions_match(&item.current_rev, &header.revision)
        && !item.force_flags.contains(ForceFlags::NO_REV_CHECK)
    {
        info!(
            cx.log, "device already runs image revision";
            "target" => %item.target,
            "rev" => &item.current_rev,
        );
        return StageResult::Complete(CompletionStatus::Ok);
    }
    StageResult::Next(UpgradeStage::ReadEntireImage)
}

fn read_entire_image(
    item: &mut WorkItem,
    cx: &mut StageContext<'_>,
) -> StageResult {
    let Some(image) = item.image.as_ref() else {
        return StageResult::Next(UpgradeStage::ReadImageHeader);
    };
    match cx.images.load_image(image) {
        Ok(data) => {
            item.image_data = Some(data);
            if cx
                .policy
                .requires_peer_permission(&item.target.device, item.force_flags)
            {
                StageResult::Next(UpgradeStage::GetPeerPermission)
            } else {
                StageResult::Next(UpgradeStage::CheckEnvStatus)
            }
        }
        Err(err) if err.is_not_found() => {
            StageResult::Complete(CompletionStatus::FailImageNotFound)
        }
        Err(err) => retry(err),
    }
}

/// Other work items for the same device that have not yet finished.
fn pending_dependents(item: &WorkItem, others: &WorkItemStore) -> usize {
    others
        .for_device(&item.target.device)
        .filter(|other| other.stage < UpgradeStage::EndUpgrade)
        .count()
}

fn activate_image(
    item: &mut WorkItem,
    cx: &mut StageContext<'_>,
) -> StageResult {
    if !item.announced_activation {
        let message = PeerMessage::ActivateStart { target: item.target };
        match cx.peer.send(message) {
            Ok(()) => item.announced_activation = true,
            Err(err) => debug!(
                cx.log, "could not announce activation to peer";
                "target" => %item.target,
                &err,
            ),
        }
    }

    match cx.transport.activate(&item.target) {
        Ok(handle) => {
            item.operation = Some(handle);
            *cx.last_activation = Some(cx.now);
            info!(cx.log, "activation started"; "target" => %item.target);
            StageResult::Next(UpgradeStage::GetActivateStatus)
        }
        Err(err) => retry(err),
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Download,
    Activate,
}

fn poll_operation(
    item: &mut WorkItem,
    cx: &mut StageContext<'_>,
    operation: Operation,
    next: UpgradeStage,
) -> StageResult {
    let Some(handle) = item.operation else {
        // Nothing outstanding; go back and start the operation again.
        return StageResult::Next(match operation {
            Operation::Download => UpgradeStage::DownloadImage,
            Operation::Activate => UpgradeStage::ActivateImage,
        });
    };
    let status = match operation {
        Operation::Download => cx.transport.poll_download(handle),
        Operation::Activate => cx.transport.poll_activate(handle),
    };
    match status {
        Ok(OperationStatus::InProgress) => StageResult::Stay,
        Ok(OperationStatus::Complete) => {
            item.operation = None;
            StageResult::Next(next)
        }
        Ok(OperationStatus::Failed(code)) => {
            item.operation = None;
            warn!(
                cx.log, "device reported failure";
                "target" => %item.target,
                "stage" => item.stage.as_str(),
                "code" => %code,
            );
            StageResult::Complete(CompletionStatus::Hardware(code))
        }
        Err(err) => retry(err),
    }
}

fn check_result(item: &mut WorkItem, cx: &mut StageContext<'_>) -> StageResult {
    // A deferred image is staged but not running until the primary image
    // is activated; there is nothing to read back yet.
    if item.is_deferred() {
        return StageResult::Next(UpgradeStage::RefreshDeviceStatus);
    }
    let Some(expected) = item.image_rev.clone() else {
        return StageResult::Next(UpgradeStage::RefreshDeviceStatus);
    };
    match cx.transport.read_revision(&item.target) {
        Ok(rev) if revisions_match(&rev, &expected) => {
            item.refreshed_rev = Some(rev);
            StageResult::Next(UpgradeStage::RefreshDeviceStatus)
        }
        // The device may still be coming out of reset.
        Ok(rev) => StageResult::Retry {
            reason: format!("running revision {rev}, expected {expected}"),
            exhausted: CompletionStatus::FailNewRevMismatch,
        },
        Err(err) => StageResult::Retry {
            reason: err.to_string(),
            exhausted: CompletionStatus::FailNewRevMismatch,
        },
    }
}
