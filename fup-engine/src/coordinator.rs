// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Requester side of the peer permission handshake.

use crate::config::PeerRetryConfig;
use crate::peer::PeerChannel;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use fup_messages::DenyReason;
use fup_messages::DeviceTarget;
use fup_messages::PeerMessage;
use fup_messages::RequestId;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PermissionPoll {
    Granted,
    Denied,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermissionState {
    /// Request sent; waiting for the peer to answer.
    Pending,
    /// The peer was busy; send the request again at the given time.
    RetryAt(Instant),
    Granted,
    Denied,
}

struct PermissionRecord {
    request_id: RequestId,
    state: PermissionState,
    busy_retries: u32,
    backoff: ExponentialBackoff,
}

/// Why a message we sent was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Undelivered {
    NotPresent,
    Busy,
    Fatal,
}

pub(crate) struct PeerPermissionCoordinator {
    log: Logger,
    retry: PeerRetryConfig,
    records: BTreeMap<DeviceTarget, PermissionRecord>,
}

impl PeerPermissionCoordinator {
    pub fn new(retry: PeerRetryConfig, log: &Logger) -> Self {
        Self {
            log: log.new(o!("component" => "PeerPermissionCoordinator")),
            retry,
            records: BTreeMap::new(),
        }
    }

    /// Drive the handshake for `target`: send the request on first call,
    /// resend after a busy backoff expires, and report the outcome once the
    /// peer has answered.
    pub fn poll(
        &mut self,
        target: &DeviceTarget,
        channel: &mut dyn PeerChannel,
        now: Instant,
    ) -> PermissionPoll {
        let resend = match self.records.get(target) {
            None => None,
            Some(record) => match record.state {
                PermissionState::Granted => return PermissionPoll::Granted,
                PermissionState::Denied => return PermissionPoll::Denied,
                PermissionState::Pending => return PermissionPoll::Waiting,
                PermissionState::RetryAt(when) if now < when => {
                    return PermissionPoll::Waiting;
                }
                PermissionState::RetryAt(_) => Some(record.request_id),
            },
        };

        let request_id = match resend {
            Some(request_id) => request_id,
            None => {
                let request_id = RequestId::from(Uuid::new_v4());
                self.records.insert(
                    *target,
                    PermissionRecord {
                        request_id,
                        state: PermissionState::Pending,
                        busy_retries: 0,
                        backoff: self.retry.backoff(),
                    },
                );
                request_id
            }
        };

        let message = PeerMessage::PermissionRequest {
            request_id,
            target: *target,
        };
        match channel.send(message) {
            Ok(()) => {
                debug!(
                    self.log, "sent permission request";
                    "target" => %target,
                    "request_id" => %Uuid::from(request_id),
                );
                self.set_state(target, PermissionState::Pending);
                PermissionPoll::Waiting
            }
            Err(err) => {
                warn!(
                    self.log, "failed to send permission request";
                    "target" => %target,
                    &err,
                );
                self.set_state(target, PermissionState::Denied);
                PermissionPoll::Denied
            }
        }
    }

    fn set_state(&mut self, target: &DeviceTarget, state: PermissionState) {
        if let Some(record) = self.records.get_mut(target) {
            record.state = state;
        }
    }

    /// Find the outstanding record a reply refers to. Replies for requests we
    /// no longer track, or for an older request on the same target, are
    /// stale and ignored.
    fn matching_pending<'a>(
        records: &'a mut BTreeMap<DeviceTarget, PermissionRecord>,
        target: &DeviceTarget,
        request_id: RequestId,
    ) -> Option<&'a mut PermissionRecord> {
        let record = records.get_mut(target)?;
        if record.request_id != request_id {
            return None;
        }
        match record.state {
            PermissionState::Pending | PermissionState::RetryAt(_) => {
                Some(record)
            }
            PermissionState::Granted | PermissionState::Denied => None,
        }
    }

    pub fn handle_grant(
        &mut self,
        target: &DeviceTarget,
        request_id: RequestId,
    ) {
        let record =
            Self::matching_pending(&mut self.records, target, request_id);
        match record {
            Some(record) => {
                record.state = PermissionState::Granted;
                info!(self.log, "peer granted permission"; "target" => %target);
            }
            None => {
                debug!(
                    self.log, "ignoring stale permission grant";
                    "target" => %target,
                    "request_id" => %Uuid::from(request_id),
                );
            }
        }
    }

    pub fn handle_deny(
        &mut self,
        target: &DeviceTarget,
        request_id: RequestId,
        reason: DenyReason,
    ) {
        let record =
            Self::matching_pending(&mut self.records, target, request_id);
        match record {
            Some(record) => {
                record.state = PermissionState::Denied;
                info!(
                    self.log, "peer denied permission";
                    "target" => %target,
                    "reason" => ?reason,
                );
            }
            None => {
                debug!(
                    self.log, "ignoring stale permission deny";
                    "target" => %target,
                    "request_id" => %Uuid::from(request_id),
                );
            }
        }
    }

    /// Handle a permission request that the channel failed to deliver.
    ///
    /// A missing peer or a fatal channel error denies the request
    /// immediately; a busy peer schedules a retry until the retry budget is
    /// spent.
    pub fn handle_undelivered(
        &mut self,
        target: &DeviceTarget,
        request_id: RequestId,
        why: Undelivered,
        now: Instant,
    ) {
        let max_attempts = self.retry.max_attempts;
        let Some(record) =
            Self::matching_pending(&mut self.records, target, request_id)
        else {
            return;
        };
        match why {
            Undelivered::NotPresent | Undelivered::Fatal => {
                record.state = PermissionState::Denied;
                warn!(
                    self.log, "permission request undeliverable";
                    "target" => %target,
                    "reason" => ?why,
                );
            }
            Undelivered::Busy => {
                record.busy_retries += 1;
                let delay = if record.busy_retries > max_attempts {
                    None
                } else {
                    record.backoff.next_backoff()
                };
                match delay {
                    Some(delay) => {
                        record.state = PermissionState::RetryAt(now + delay);
                        debug!(
                            self.log, "peer busy, will retry";
                            "target" => %target,
                            "attempt" => record.busy_retries,
                            "delay" => ?delay,
                        );
                    }
                    None => {
                        record.state = PermissionState::Denied;
                        warn!(
                            self.log, "peer busy, giving up";
                            "target" => %target,
                            "attempts" => record.busy_retries,
                        );
                    }
                }
            }
        }
    }

    /// True while a request for `target` is outstanding or granted.
    #[cfg(test)]
    pub fn is_requesting(&self, target: &DeviceTarget) -> bool {
        self.records.get(target).is_some_and(|record| {
            record.state != PermissionState::Denied
        })
    }

    pub fn holds_grant(&self, target: &DeviceTarget) -> bool {
        self.records
            .get(target)
            .is_some_and(|record| record.state == PermissionState::Granted)
    }

    /// Forget the record for `target`; returns whether a grant was held.
    pub fn release(&mut self, target: &DeviceTarget) -> bool {
        self.records
            .remove(target)
            .is_some_and(|record| record.state == PermissionState::Granted)
    }

    /// Deny every request still waiting on the peer. Returns how many were
    /// denied.
    pub fn deny_outstanding(&mut self) -> usize {
        let mut denied = 0;
        for (target, record) in self.records.iter_mut() {
            if let PermissionState::Pending | PermissionState::RetryAt(_) =
                record.state
            {
                record.state = PermissionState::Denied;
                denied += 1;
                warn!(
                    self.log, "abandoning permission request";
                    "target" => %target,
                );
            }
        }
        denied
    }

    /// Requests that are outstanding (not yet answered) for any target.
    pub fn outstanding(&self) -> impl Iterator<Item = &DeviceTarget> {
        self.records.iter().filter_map(|(target, record)| match record.state {
            PermissionState::Pending | PermissionState::RetryAt(_) => {
                Some(target)
            }
            PermissionState::Granted | PermissionState::Denied => None,
        })
    }
}
