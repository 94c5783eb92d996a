// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use crate::config::Config;
use crate::coordinator::PeerPermissionCoordinator;
use crate::coordinator::Undelivered;
use crate::error::UpgradeError;
use crate::hardware::HardwareTransport;
use crate::hardware::ImageRepository;
use crate::manifest::ExpansionRequest;
use crate::manifest::ManifestEntry;
use crate::manifest::ManifestResolver;
use crate::manifest::UpgradePath;
use crate::peer::PeerChannel;
use crate::peer::PeerEvent;
use crate::persist::UpgradeRecord;
use crate::persist::UpgradeStateStore;
use crate::policy::EnvironmentView;
use crate::policy::PolicyGate;
use crate::stage;
use crate::stage::StageContext;
use crate::stage::StageResult;
use crate::store::WorkItemStore;
use crate::work_item::CompletionStatus;
use crate::work_item::DeviceStatus;
use crate::work_item::ForceFlags;
use crate::work_item::UpgradeStage;
use crate::work_item::WorkItem;
use crate::work_item::WorkItemSnapshot;
use fup_messages::DenyReason;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fup_messages::FirmwareTarget;
use fup_messages::PeerMessage;
use fup_messages::RequestId;
use fup_messages::SpId;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

/// The collaborators an [`UpgradeEngine`] drives. Each is a trait object so
/// tests and simulations can substitute their own.
pub struct Collaborators {
    pub transport: Box<dyn HardwareTransport>,
    pub images: Box<dyn ImageRepository>,
    pub peer: Box<dyn PeerChannel>,
    pub policy: Box<dyn PolicyGate>,
    pub state_store: Box<dyn UpgradeStateStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiateOutcome {
    /// Work items were created for these firmware targets, in creation
    /// order.
    Started(Vec<FirmwareTarget>),
    /// The device already has an upgrade in flight; nothing was created.
    AlreadyInProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeOutcome {
    NoAction,
    /// The device newly qualified for upgrade.
    Initiated(InitiateOutcome),
    /// The device was pulled; its in-flight upgrade will be aborted at the
    /// end of the next pass.
    AbortRequested,
}

/// What happened during one call to [`UpgradeEngine::run_pass`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Peer events drained at the start of the pass.
    pub peer_events: usize,
    /// Work items that moved to a different stage.
    pub transitions: usize,
    /// Work items that finished this pass, with their outcome.
    pub completed: Vec<(DeviceTarget, CompletionStatus)>,
    /// Work items destroyed this pass.
    pub released: usize,
    /// Devices re-initiated from the resume queue.
    pub resumed: Vec<DeviceId>,
}

/// Firmware upgrade engine for one SP.
///
/// The engine owns every in-flight work item for the devices this SP is
/// responsible for. Nothing happens on its own: the host reports device
/// status through [`UpgradeEngine::on_device_status_changed`] and calls
/// [`UpgradeEngine::run_pass`] periodically, and each pass advances every
/// work item by at most one stage.
pub struct UpgradeEngine {
    log: Logger,
    config: Config,
    transport: Box<dyn HardwareTransport>,
    images: Box<dyn ImageRepository>,
    peer: Box<dyn PeerChannel>,
    policy: Box<dyn PolicyGate>,
    state_store: Box<dyn UpgradeStateStore>,
    store: WorkItemStore,
    resolver: ManifestResolver,
    coordinator: PeerPermissionCoordinator,
    devices: BTreeMap<DeviceId, DeviceStatus>,
    history: BTreeMap<DeviceTarget, UpgradeRecord>,
    /// Devices to re-initiate once their status is known and nothing is in
    /// flight for them.
    resume_queue: BTreeSet<DeviceId>,
    peer_present: bool,
    peer_contact_lost: bool,
    /// Targets the peer has announced it is activating.
    peer_activating: BTreeSet<DeviceTarget>,
    inter_device_delay: Duration,
    last_activation: Option<Instant>,
}

impl UpgradeEngine {
    /// Create an engine, loading persisted records from the state store.
    ///
    /// A record still marked in progress belongs to an upgrade interrupted
    /// by a restart; it is rewritten as aborted, and every aborted device is
    /// queued to be re-initiated once.
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!(
            "component" => "UpgradeEngine",
            "local_sp" => config.local_sp.to_string(),
        ));
        let Collaborators { transport, images, peer, policy, state_store } =
            collaborators;

        let coordinator =
            PeerPermissionCoordinator::new(config.peer_retry, &log);
        let mut engine = Self {
            resolver: ManifestResolver::new(&log),
            coordinator,
            inter_device_delay: config.inter_device_delay(),
            log,
            config,
            transport,
            images,
            peer,
            policy,
            state_store,
            store: WorkItemStore::default(),
            devices: BTreeMap::new(),
            history: BTreeMap::new(),
            resume_queue: BTreeSet::new(),
            peer_present: true,
            peer_contact_lost: false,
            peer_activating: BTreeSet::new(),
            last_activation: None,
        };
        engine.restore_records();
        engine.announce_alive();
        engine
    }

    fn restore_records(&mut self) {
        let records = match self.state_store.load() {
            Ok(records) => records,
            Err(err) => {
                error!(self.log, "failed to load upgrade records"; &err);
                return;
            }
        };

        let mut interrupted = 0;
        for mut record in records {
            if record.completion == CompletionStatus::InProgress {
                record.completion = CompletionStatus::Aborted;
                interrupted += 1;
            }
            if record.completion == CompletionStatus::Aborted {
                self.resume_queue.insert(record.target.device);
            }
            self.history.insert(record.target, record);
        }
        if interrupted > 0 {
            self.persist();
        }
        info!(
            self.log, "loaded upgrade records";
            "records" => self.history.len(),
            "interrupted" => interrupted,
            "to_resume" => self.resume_queue.len(),
        );
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_sp(&self) -> SpId {
        self.config.local_sp
    }

    /// Report a device's latest status.
    ///
    /// An upgrade is initiated only when the device goes from not qualified
    /// to qualified; a device that stays qualified is left alone. A device
    /// that goes from inserted to not inserted has its upgrade aborted.
    pub fn on_device_status_changed(
        &mut self,
        device: DeviceId,
        status: DeviceStatus,
    ) -> Result<StatusChangeOutcome, UpgradeError> {
        let previous = self.devices.insert(device, status.clone());
        let was_inserted = previous.as_ref().is_some_and(|s| s.inserted);
        let was_healthy =
            previous.as_ref().is_some_and(|s| s.inserted && !s.faulted);
        let was_qualified = previous
            .as_ref()
            .is_some_and(|s| self.policy.is_qualified(s));

        if was_inserted && !status.inserted {
            return Ok(if self.abort_upgrade(&device) {
                StatusChangeOutcome::AbortRequested
            } else {
                StatusChangeOutcome::NoAction
            });
        }

        if !self.policy.is_owned_by_local(&device, &status) {
            // Our half of a unit may have failed the environment gate
            // because the peer's half was missing or faulted.
            if !was_healthy && status.inserted && !status.faulted {
                self.queue_for_unit(&device, |completion| {
                    completion == CompletionStatus::FailBadEnvStatus
                });
            }
            return Ok(StatusChangeOutcome::NoAction);
        }

        let qualified = self.policy.is_qualified(&status);
        if !qualified || was_qualified {
            return Ok(StatusChangeOutcome::NoAction);
        }

        let force_flags = if self.resume_queue.contains(&device) {
            self.saved_force_flags(&device)
        } else {
            ForceFlags::NONE
        };
        self.initiate_upgrade(device, force_flags, 0)
            .map(StatusChangeOutcome::Initiated)
    }

    /// Report that a device has been removed. Returns whether an upgrade
    /// was in flight.
    pub fn on_device_removed(&mut self, device: &DeviceId) -> bool {
        if let Some(status) = self.devices.get_mut(device) {
            status.inserted = false;
        }
        self.abort_upgrade(device)
    }

    /// Start upgrading `device`.
    ///
    /// The device must have reported status, be owned by this SP, and be
    /// qualified. If any work item already exists for the device this is a
    /// no-op.
    pub fn initiate_upgrade(
        &mut self,
        device: DeviceId,
        force_flags: ForceFlags,
        retry_count: u32,
    ) -> Result<InitiateOutcome, UpgradeError> {
        let status = self
            .devices
            .get(&device)
            .cloned()
            .ok_or(UpgradeError::UnknownDevice(device))?;
        if !self.policy.is_owned_by_local(&device, &status) {
            return Err(UpgradeError::NotOwnedByLocal(device));
        }
        if !self.policy.is_qualified(&status) {
            return Err(UpgradeError::NotQualified(device));
        }

        self.resume_queue.remove(&device);
        if self.store.contains_device(&device) {
            debug!(
                self.log, "upgrade already in progress";
                "device" => %device,
            );
            return Ok(InitiateOutcome::AlreadyInProgress);
        }

        let path = UpgradePath::for_protocol(status.protocol);
        let request = ExpansionRequest {
            device,
            status: &status,
            force_flags,
            retry_count,
        };
        let items = self
            .resolver
            .expand(&*self.images, path, &request)
            .map_err(|err| UpgradeError::Manifest { device, err })?;

        let mut started = Vec::with_capacity(items.len());
        for new in items {
            let record = UpgradeRecord {
                target: new.target,
                completion: CompletionStatus::InProgress,
                force_flags: new.force_flags.bits(),
                current_rev: new.current_rev.clone(),
                previous_rev: Some(new.current_rev.clone()),
                image_rev: new.image_rev.clone(),
            };
            let firmware = new.target.firmware;
            if self.store.insert(new).is_some() {
                self.history.insert(record.target, record);
                started.push(firmware);
            }
        }
        self.persist();

        info!(
            self.log, "upgrade initiated";
            "device" => %device,
            "path" => ?path,
            "targets" => ?started,
            "force_flags" => ?force_flags,
            "retry_count" => retry_count,
        );
        Ok(InitiateOutcome::Started(started))
    }

    /// Re-initiate every device whose last upgrade was aborted, with the
    /// force flags it was started with. Returns the devices started.
    pub fn resume_upgrade(&mut self) -> Vec<DeviceId> {
        let aborted: BTreeSet<DeviceId> = self
            .history
            .values()
            .filter(|record| record.completion == CompletionStatus::Aborted)
            .map(|record| record.target.device)
            .collect();

        let mut resumed = Vec::new();
        for device in aborted {
            match self.initiate_saved(device) {
                Ok(_) => resumed.push(device),
                Err(err) => warn!(
                    self.log, "failed to resume upgrade";
                    "device" => %device,
                    &err,
                ),
            }
        }
        resumed
    }

    /// Live work items for `device`, plus the last recorded outcome of any
    /// target that has none.
    pub fn get_upgrade_info(&self, device: &DeviceId) -> Vec<WorkItemSnapshot> {
        let mut info: BTreeMap<FirmwareTarget, WorkItemSnapshot> = self
            .history
            .values()
            .filter(|record| record.target.device == *device)
            .map(|record| (record.target.firmware, record.snapshot()))
            .collect();
        for item in self.store.for_device(device) {
            info.insert(item.target.firmware, item.snapshot());
        }
        info.into_values().collect()
    }

    /// Request that every work item for `device` be aborted. The abort takes
    /// effect after stage advancement in the next pass. Returns whether any
    /// work item was affected.
    pub fn abort_upgrade(&mut self, device: &DeviceId) -> bool {
        self.resume_queue.remove(device);
        let mut aborted = false;
        for item in self.store.iter_mut() {
            if item.target.device == *device
                && item.stage < UpgradeStage::EndUpgrade
            {
                item.abort_requested = true;
                aborted = true;
            }
        }
        if aborted {
            info!(self.log, "abort requested"; "device" => %device);
        }
        aborted
    }

    /// Abort every upgrade in flight and drop any pending resumes.
    pub fn terminate_upgrade(&mut self) -> usize {
        self.resume_queue.clear();
        let mut aborted = 0;
        for item in self.store.iter_mut() {
            if item.stage < UpgradeStage::EndUpgrade {
                item.abort_requested = true;
                aborted += 1;
            }
        }
        info!(self.log, "terminating all upgrades"; "work_items" => aborted);
        aborted
    }

    pub fn any_upgrade_in_progress(&self) -> bool {
        !self.store.is_empty()
    }

    /// Whether `device` is being activated locally, or the peer has
    /// announced an activation in the same unit.
    pub fn is_activate_in_progress(&self, device: &DeviceId) -> bool {
        self.store
            .for_device(device)
            .any(|item| item.stage.is_activating())
            || self
                .peer_activating
                .iter()
                .any(|target| target.device.shares_unit(device))
    }

    pub fn set_inter_device_delay(&mut self, delay: Duration) {
        info!(self.log, "inter-device delay changed"; "delay" => ?delay);
        self.inter_device_delay = delay;
    }

    pub fn inter_device_delay(&self) -> Duration {
        self.inter_device_delay
    }

    /// Manifest entries parsed so far.
    pub fn manifest_info(&self) -> Vec<ManifestEntry> {
        self.resolver.cached_entries().cloned().collect()
    }

    /// Last recorded outcome of every (device, firmware target) pair.
    pub fn upgrade_records(&self) -> Vec<UpgradeRecord> {
        self.history.values().cloned().collect()
    }

    /// True when nothing is in flight and no resume is waiting on a device
    /// whose status is known.
    pub fn is_idle(&self) -> bool {
        self.store.is_empty()
            && self
                .resume_queue
                .iter()
                .all(|device| !self.devices.contains_key(device))
    }

    /// Run one scheduling pass.
    ///
    /// Peer events are drained first, then every work item is advanced by
    /// at most one stage in creation order, then pending aborts are applied,
    /// and finally queued resumes are re-initiated.
    pub fn run_pass(&mut self, now: Instant) -> PassSummary {
        let mut summary = PassSummary::default();

        while let Some(event) = self.peer.try_recv() {
            summary.peer_events += 1;
            self.handle_peer_event(event, now);
        }

        for seq in self.store.seqs() {
            let Some(mut item) = self.store.take(seq) else {
                continue;
            };
            let from = item.stage;
            let keep = match item.stage {
                UpgradeStage::EndUpgrade => {
                    self.end_upgrade(&mut item, now);
                    summary.completed.push((item.target, item.completion));
                    true
                }
                UpgradeStage::ReleaseImage => {
                    self.release_image(&mut item);
                    false
                }
                _ => {
                    let result = {
                        let mut cx = StageContext {
                            log: &self.log,
                            config: &self.config,
                            now,
                            transport: &mut *self.transport,
                            images: &*self.images,
                            peer: &mut *self.peer,
                            policy: &*self.policy,
                            coordinator: &mut self.coordinator,
                            env: EnvironmentView {
                                peer_present: self.peer_present,
                                devices: &self.devices,
                            },
                            others: &self.store,
                            inter_device_delay: self.inter_device_delay,
                            last_activation: &mut self.last_activation,
                        };
                        stage::advance(&mut item, &mut cx)
                    };
                    self.apply_result(&mut item, result, now);
                    true
                }
            };

            if item.stage != from {
                summary.transitions += 1;
                debug!(
                    self.log, "stage transition";
                    "target" => %item.target,
                    "from" => from.as_str(),
                    "to" => item.stage.as_str(),
                );
            }
            if keep {
                self.store.put_back(item);
            } else {
                summary.released += 1;
            }
        }

        self.apply_aborts(now);
        summary.resumed = self.process_resume_queue();
        summary
    }

    fn apply_result(
        &self,
        item: &mut WorkItem,
        result: StageResult,
        now: Instant,
    ) {
        match result {
            StageResult::Stay => {}
            StageResult::Next(stage) => enter(item, stage, now),
            StageResult::Complete(completion) => {
                item.completion = completion;
                enter(item, UpgradeStage::EndUpgrade, now);
            }
            StageResult::Retry { reason, exhausted } => {
                item.retry_count += 1;
                if item.retry_count > self.config.max_retries {
                    error!(
                        self.log, "retries exhausted";
                        "target" => %item.target,
                        "stage" => item.stage.as_str(),
                        "reason" => reason,
                        "completion" => %exhausted,
                    );
                    item.completion = exhausted;
                    enter(item, UpgradeStage::EndUpgrade, now);
                } else {
                    warn!(
                        self.log, "stage failed, will retry";
                        "target" => %item.target,
                        "stage" => item.stage.as_str(),
                        "reason" => reason,
                        "retry_count" => item.retry_count,
                    );
                }
            }
        }
    }

    /// Aborts are honored only after the pass has advanced every item, so a
    /// stage already due this pass runs to completion first.
    fn apply_aborts(&mut self, now: Instant) {
        for item in self.store.iter_mut() {
            if item.abort_requested && item.stage < UpgradeStage::EndUpgrade {
                info!(
                    self.log, "aborting upgrade";
                    "target" => %item.target,
                    "stage" => item.stage.as_str(),
                );
                item.completion = CompletionStatus::Aborted;
                enter(item, UpgradeStage::EndUpgrade, now);
            }
        }
    }

    fn end_upgrade(&mut self, item: &mut WorkItem, now: Instant) {
        if item.completion == CompletionStatus::InProgress {
            item.completion = CompletionStatus::Ok;
        }

        let current_rev = match (&item.completion, &item.refreshed_rev) {
            (CompletionStatus::Ok, Some(rev)) => rev.clone(),
            _ => item.current_rev.clone(),
        };
        if let Some(status) = self.devices.get_mut(&item.target.device) {
            status
                .firmware_revs
                .insert(item.target.firmware, current_rev.clone());
        }
        self.history.insert(
            item.target,
            UpgradeRecord {
                target: item.target,
                completion: item.completion,
                force_flags: item.force_flags.bits(),
                current_rev,
                previous_rev: item.pre_upgrade_rev.clone(),
                image_rev: item.image_rev.clone(),
            },
        );

        if item.announced_activation
            || self.coordinator.holds_grant(&item.target)
        {
            let message = PeerMessage::UpgradeEnd { target: item.target };
            if let Err(err) = self.peer.send(message) {
                warn!(
                    self.log, "failed to notify peer of upgrade end";
                    "target" => %item.target,
                    &err,
                );
            }
        }
        self.persist();

        match item.completion {
            CompletionStatus::Ok | CompletionStatus::Aborted => info!(
                self.log, "upgrade finished";
                "target" => %item.target,
                "completion" => %item.completion,
                "image_rev" => item.image_rev.as_deref(),
            ),
            completion if completion.is_environmental() => warn!(
                self.log, "upgrade blocked by environment";
                "target" => %item.target,
                "completion" => %completion,
            ),
            completion => error!(
                self.log, "upgrade failed";
                "target" => %item.target,
                "completion" => %completion,
                "retry_count" => item.retry_count,
            ),
        }
        enter(item, UpgradeStage::ReleaseImage, now);
    }

    /// Final cleanup; runs for every work item regardless of outcome.
    fn release_image(&mut self, item: &mut WorkItem) {
        if self.coordinator.release(&item.target) {
            debug!(self.log, "released peer grant"; "target" => %item.target);
        }
        if let Some(handle) = item.operation.take() {
            // The hardware may not support cancellation; the operation is
            // left to finish on its own.
            warn!(
                self.log, "releasing outstanding hardware operation";
                "target" => %item.target,
                "handle" => handle.0,
            );
            self.transport.release(handle);
        }
        item.image_data = None;
        item.image = None;
        item.header = None;
    }

    fn handle_peer_event(&mut self, event: PeerEvent, now: Instant) {
        match event {
            PeerEvent::MessageReceived(message) => {
                self.peer_present = true;
                if self.peer_contact_lost {
                    self.contact_restored();
                }
                self.handle_peer_message(message);
            }
            PeerEvent::PeerNotPresent(message) => {
                // The next message from the peer counts as a restore.
                self.peer_present = false;
                self.peer_contact_lost = true;
                self.request_undelivered(message, Undelivered::NotPresent, now);
            }
            PeerEvent::PeerBusy(message) => {
                self.request_undelivered(message, Undelivered::Busy, now);
            }
            PeerEvent::FatalError(message) => {
                self.request_undelivered(message, Undelivered::Fatal, now);
            }
            PeerEvent::ContactLost => {
                warn!(self.log, "lost contact with peer");
                self.peer_present = false;
                self.peer_contact_lost = true;
                self.peer_activating.clear();
                // Nobody will answer; fail them now and let the restore
                // re-initiate them.
                self.coordinator.deny_outstanding();
            }
            PeerEvent::ContactRestored => {
                self.peer_present = true;
                self.contact_restored();
            }
        }
    }

    fn request_undelivered(
        &mut self,
        message: PeerMessage,
        why: Undelivered,
        now: Instant,
    ) {
        match message {
            PeerMessage::PermissionRequest { request_id, target } => {
                self.coordinator
                    .handle_undelivered(&target, request_id, why, now);
            }
            other => debug!(
                self.log, "peer message not delivered";
                "message" => other.as_str(),
                "reason" => ?why,
            ),
        }
    }

    fn handle_peer_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::PeerAlive { sp } => {
                debug!(self.log, "peer alive"; "peer" => %sp);
                self.queue_environmental_failures();
            }
            PeerMessage::PermissionRequest { request_id, target } => {
                let reply = self.evaluate_request(request_id, target);
                if let Err(err) = self.peer.send(reply) {
                    warn!(
                        self.log, "failed to answer permission request";
                        "target" => %target,
                        &err,
                    );
                }
            }
            PeerMessage::PermissionGrant { request_id, target } => {
                self.coordinator.handle_grant(&target, request_id);
            }
            PeerMessage::PermissionDeny { request_id, target, reason } => {
                self.coordinator.handle_deny(&target, request_id, reason);
            }
            PeerMessage::ActivateStart { target } => {
                debug!(self.log, "peer activating"; "target" => %target);
                self.peer_activating.insert(target);
            }
            PeerMessage::UpgradeEnd { target } => {
                debug!(self.log, "peer finished upgrade"; "target" => %target);
                self.peer_activating.remove(&target);
                self.queue_for_unit(&target.device, |completion| {
                    completion == CompletionStatus::FailNoPeerPermission
                });
            }
        }
    }

    /// Decide whether the peer may upgrade `target`, based on what this SP
    /// is doing to the same unit.
    fn evaluate_request(
        &self,
        request_id: RequestId,
        target: DeviceTarget,
    ) -> PeerMessage {
        let mut local = self
            .store
            .iter()
            .filter(|item| item.target.device.shares_unit(&target.device));

        let reason = if local.clone().any(|item| item.stage.is_activating()) {
            Some(DenyReason::ActivationInProgress)
        } else if local.any(|item| {
            item.stage.is_past_permission_gate()
                || self.coordinator.holds_grant(&item.target)
        }) {
            Some(DenyReason::UpgradeInProgress)
        } else if self.config.local_sp == SpId::A
            && self
                .coordinator
                .outstanding()
                .any(|ours| ours.device.shares_unit(&target.device))
        {
            // Both SPs asked for the same unit at once; A goes first.
            Some(DenyReason::Contention)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                info!(
                    self.log, "denying peer permission";
                    "target" => %target,
                    "reason" => ?reason,
                );
                PeerMessage::PermissionDeny { request_id, target, reason }
            }
            None => {
                info!(
                    self.log, "granting peer permission";
                    "target" => %target,
                );
                PeerMessage::PermissionGrant { request_id, target }
            }
        }
    }

    fn contact_restored(&mut self) {
        info!(self.log, "peer contact restored");
        self.peer_contact_lost = false;
        self.announce_alive();
        self.queue_environmental_failures();
    }

    /// Tell the peer we are up, so it re-scans upgrades it failed while it
    /// could not reach us. Receiving `PeerAlive` never triggers a reply.
    fn announce_alive(&mut self) {
        if self.config.single_sp {
            return;
        }
        let message = PeerMessage::PeerAlive { sp: self.config.local_sp };
        if let Err(err) = self.peer.send(message) {
            warn!(self.log, "failed to announce to peer"; &err);
        }
    }

    fn queue_environmental_failures(&mut self) {
        let queued = self.queue_matching(|record| {
            record.completion.is_environmental()
        });
        if queued > 0 {
            info!(
                self.log, "re-initiating environmental failures";
                "devices" => queued,
            );
        }
    }

    /// Queue local devices in the same unit as `device` whose last
    /// completion matches.
    fn queue_for_unit<F>(&mut self, device: &DeviceId, matches: F)
    where
        F: Fn(CompletionStatus) -> bool,
    {
        let queued = self.queue_matching(|record| {
            record.target.device.shares_unit(device)
                && matches(record.completion)
        });
        if queued > 0 {
            debug!(
                self.log, "queued devices for resume";
                "unit" => %device,
                "devices" => queued,
            );
        }
    }

    fn queue_matching<F>(&mut self, matches: F) -> usize
    where
        F: Fn(&UpgradeRecord) -> bool,
    {
        let devices: BTreeSet<DeviceId> = self
            .history
            .values()
            .filter(|record| matches(record))
            .map(|record| record.target.device)
            .collect();
        let queued = devices.len();
        self.resume_queue.extend(devices);
        queued
    }

    fn process_resume_queue(&mut self) -> Vec<DeviceId> {
        let ready: Vec<DeviceId> = self
            .resume_queue
            .iter()
            .filter(|device| {
                self.devices.contains_key(*device)
                    && !self.store.contains_device(device)
            })
            .copied()
            .collect();

        let mut resumed = Vec::new();
        for device in ready {
            self.resume_queue.remove(&device);
            match self.initiate_saved(device) {
                Ok(InitiateOutcome::Started(_)) => resumed.push(device),
                Ok(InitiateOutcome::AlreadyInProgress) => {}
                // Qualification is re-checked on resume; a device that no
                // longer qualifies waits for its next status change.
                Err(err) => debug!(
                    self.log, "not resuming upgrade";
                    "device" => %device,
                    &err,
                ),
            }
        }
        resumed
    }

    fn initiate_saved(
        &mut self,
        device: DeviceId,
    ) -> Result<InitiateOutcome, UpgradeError> {
        let force_flags = self.saved_force_flags(&device);
        self.initiate_upgrade(device, force_flags, 0)
    }

    /// Force flags the device was last upgraded with, minus those that only
    /// applied to a single manifest expansion.
    fn saved_force_flags(&self, device: &DeviceId) -> ForceFlags {
        self.history
            .values()
            .filter(|record| record.target.device == *device)
            .fold(ForceFlags::NONE, |flags, record| {
                flags | record.force_flags()
            })
            - ForceFlags::PER_EXPANSION
    }

    fn persist(&mut self) {
        let records: Vec<UpgradeRecord> =
            self.history.values().cloned().collect();
        if let Err(err) = self.state_store.save(&records) {
            error!(self.log, "failed to persist upgrade records"; &err);
        }
    }
}

fn enter(item: &mut WorkItem, stage: UpgradeStage, now: Instant) {
    item.stage = stage;
    item.stage_entered = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::InMemoryStateStore;
    use crate::policy::StandardPolicy;
    use crate::sim::SimImageRepository;
    use crate::sim::SimPeerLink;
    use crate::sim::SimTransport;
    use crate::work_item::HardwareIdentity;
    use crate::work_item::ProtocolVersion;
    use fup_messages::DeviceType;
    use fup_messages::Location;

    fn psu() -> DeviceId {
        DeviceId {
            device_type: DeviceType::PowerSupply,
            location: Location {
                bus: 0,
                enclosure: 0,
                component_id: 0,
                slot: 0,
            },
        }
    }

    fn status(rev: &str) -> DeviceStatus {
        DeviceStatus {
            side: SpId::A,
            inserted: true,
            faulted: false,
            downloadable: true,
            identity: HardwareIdentity {
                product_id: "JUNO".to_string(),
                unique_id: 0x4a,
            },
            protocol: ProtocolVersion::LEGACY,
            firmware_revs: [(FirmwareTarget::Main, rev.to_string())]
                .into_iter()
                .collect(),
        }
    }

    fn engine(
        transport: &SimTransport,
        store: &InMemoryStateStore,
    ) -> UpgradeEngine {
        let mut config = Config::new(SpId::A);
        config.single_sp = true;
        let mut images = SimImageRepository::default();
        images.add_image("JUNO", FirmwareTarget::Main, "2.0", vec![0xaa; 32]);
        let (peer, _other) = SimPeerLink::pair();
        UpgradeEngine::new(
            config.clone(),
            Collaborators {
                transport: Box::new(transport.clone()),
                images: Box::new(images),
                peer: Box::new(peer),
                policy: Box::new(StandardPolicy::new(&config)),
                state_store: Box::new(store.clone()),
            },
            &Logger::root(slog::Discard, o!()),
        )
    }

    #[test]
    fn unknown_device_is_rejected() {
        let transport = SimTransport::default();
        let mut engine = engine(&transport, &InMemoryStateStore::default());
        assert!(matches!(
            engine.initiate_upgrade(psu(), ForceFlags::NONE, 0),
            Err(UpgradeError::UnknownDevice(_))
        ));
    }

    #[test]
    fn retry_budget_counts_from_initial_retry_count() {
        let transport = SimTransport::default();
        transport.set_revision(
            DeviceTarget { device: psu(), firmware: FirmwareTarget::Main },
            "1.0",
        );
        transport.fail_next(crate::sim::SimOp::ReadHeader, 10);
        let mut engine = engine(&transport, &InMemoryStateStore::default());
        // Report status without going through the notification path, which
        // would initiate with a fresh retry budget.
        engine.devices.insert(psu(), status("1.0"));

        // Two of the three retries are already spent.
        engine.initiate_upgrade(psu(), ForceFlags::NONE, 2).unwrap();

        let start = Instant::now();
        let mut completed = Vec::new();
        for i in 0..20 {
            let summary = engine.run_pass(start + Duration::from_secs(i));
            completed.extend(summary.completed);
        }
        assert_eq!(
            completed,
            [(
                DeviceTarget { device: psu(), firmware: FirmwareTarget::Main },
                CompletionStatus::FailRetriesExhausted
            )]
        );
        let header_reads = transport
            .calls()
            .iter()
            .filter(|call| matches!(call, crate::sim::SimCall::ReadHeader(_)))
            .count();
        assert_eq!(header_reads, 2);
    }

    #[test]
    fn removed_device_is_aborted_and_requalifies_on_reinsertion() {
        let transport = SimTransport::default();
        let mut engine = engine(&transport, &InMemoryStateStore::default());
        engine.on_device_status_changed(psu(), status("1.0")).unwrap();

        assert!(engine.on_device_removed(&psu()));
        let start = Instant::now();
        let mut completed = Vec::new();
        for i in 0..5 {
            let summary = engine.run_pass(start + Duration::from_secs(i));
            completed.extend(summary.completed);
        }
        assert_eq!(
            completed,
            [(
                DeviceTarget { device: psu(), firmware: FirmwareTarget::Main },
                CompletionStatus::Aborted
            )]
        );
        assert!(engine.is_idle());

        let outcome =
            engine.on_device_status_changed(psu(), status("1.0")).unwrap();
        assert_eq!(
            outcome,
            StatusChangeOutcome::Initiated(InitiateOutcome::Started(vec![
                FirmwareTarget::Main
            ]))
        );
    }

    #[test]
    fn interrupted_upgrade_is_recorded_as_aborted() {
        let store = InMemoryStateStore::default();
        let transport = SimTransport::default();
        {
            let mut engine = engine(&transport, &store);
            engine.on_device_status_changed(psu(), status("1.0")).unwrap();
            assert!(engine.any_upgrade_in_progress());
        }
        assert_eq!(
            store.records()[0].completion,
            CompletionStatus::InProgress
        );

        let engine = engine(&transport, &store);
        assert_eq!(store.records()[0].completion, CompletionStatus::Aborted);
        assert!(engine.resume_queue.contains(&psu()));
        assert!(!engine.any_upgrade_in_progress());
    }
}
