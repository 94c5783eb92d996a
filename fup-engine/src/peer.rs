// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use crate::error::PeerChannelError;
use fup_messages::PeerMessage;

/// Something the peer channel reports between scheduling passes.
///
/// Delivery failures carry the message that could not be delivered so it can
/// be matched to the request that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    MessageReceived(PeerMessage),
    PeerNotPresent(PeerMessage),
    PeerBusy(PeerMessage),
    FatalError(PeerMessage),
    ContactLost,
    ContactRestored,
}

/// Best-effort, point-to-point channel to the peer SP.
pub trait PeerChannel {
    fn send(&mut self, message: PeerMessage) -> Result<(), PeerChannelError>;

    /// Next pending event, if any. Never blocks.
    fn try_recv(&mut self) -> Option<PeerEvent>;
}
