// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! In-process stand-ins for the hardware, image repository and peer link,
//! used by tests and by `faux-fup` to run an enclosure without hardware.

use crate::error::PeerChannelError;
use crate::error::RepositoryError;
use crate::error::TransportError;
use crate::hardware::HardwareTransport;
use crate::hardware::ImageData;
use crate::hardware::ImageHandle;
use crate::hardware::ImageHeader;
use crate::hardware::ImageRepository;
use crate::hardware::OperationHandle;
use crate::hardware::OperationStatus;
use crate::manifest::ManifestEntry;
use crate::peer::PeerChannel;
use crate::peer::PeerEvent;
use crate::work_item::HardwareIdentity;
use crate::work_item::HwStatusCode;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use fup_messages::version;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fup_messages::FirmwareTarget;
use fup_messages::Header;
use fup_messages::Message;
use fup_messages::PeerMessage;
use fup_messages::RawImageHeader;
use fup_messages::MAX_SERIALIZED_SIZE;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Transport operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimOp {
    ReadHeader,
    BeginDownload,
    PollDownload,
    Activate,
    PollActivate,
    ReadRevision,
}

/// A call made against a [`SimTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    ReadHeader(DeviceTarget),
    BeginDownload(DeviceTarget),
    PollDownload(OperationHandle),
    Activate(DeviceTarget),
    PollActivate(OperationHandle),
    ReadRevision(DeviceTarget),
    Release(OperationHandle),
}

#[derive(Debug, Clone)]
enum SimOperation {
    Download { target: DeviceTarget, revision: String, polls_left: u32 },
    Activate { target: DeviceTarget, polls_left: u32 },
}

#[derive(Debug, Default)]
struct TransportState {
    running: BTreeMap<DeviceTarget, String>,
    /// Downloaded images waiting for the device to be activated.
    staged: BTreeMap<DeviceTarget, String>,
    operations: BTreeMap<u64, SimOperation>,
    next_handle: u64,
    download_polls: u32,
    activate_polls: u32,
    failures: BTreeMap<SimOp, u32>,
    download_failure: Option<HwStatusCode>,
    activation_ignored: bool,
    calls: Vec<SimCall>,
}

impl TransportState {
    fn inject_failure(
        &mut self,
        op: SimOp,
        target: DeviceTarget,
    ) -> Result<(), TransportError> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(TransportError::Io {
                    target,
                    message: format!("injected {op:?} failure"),
                })
            }
            _ => Ok(()),
        }
    }

    fn start(&mut self, operation: SimOperation) -> OperationHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.operations.insert(handle, operation);
        OperationHandle(handle)
    }
}

/// A set of devices that accept downloads and activations instantly, or
/// after a configurable number of polls.
///
/// Clones share the same devices, so a test can keep one clone to inspect
/// and drive the device while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct SimTransport {
    state: Arc<Mutex<TransportState>>,
}

impl SimTransport {
    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_revision(&self, target: DeviceTarget, revision: &str) {
        self.lock().running.insert(target, revision.to_string());
    }

    pub fn revision(&self, target: &DeviceTarget) -> Option<String> {
        self.lock().running.get(target).cloned()
    }

    /// Revision downloaded to `target` but not yet activated.
    pub fn staged_revision(&self, target: &DeviceTarget) -> Option<String> {
        self.lock().staged.get(target).cloned()
    }

    /// Number of `InProgress` answers before a download or activation
    /// completes.
    pub fn set_poll_counts(&self, download: u32, activate: u32) {
        let mut state = self.lock();
        state.download_polls = download;
        state.activate_polls = activate;
    }

    /// Make the next `count` calls of `op` fail with an I/O error.
    pub fn fail_next(&self, op: SimOp, count: u32) {
        self.lock().failures.insert(op, count);
    }

    /// Make the next download finish with a hardware error.
    pub fn fail_download_with(&self, code: HwStatusCode) {
        self.lock().download_failure = Some(code);
    }

    /// Let activations complete without the staged images taking effect.
    pub fn set_activation_ignored(&self, ignored: bool) {
        self.lock().activation_ignored = ignored;
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    pub fn outstanding_operations(&self) -> usize {
        self.lock().operations.len()
    }
}

impl HardwareTransport for SimTransport {
    fn read_header(
        &mut self,
        target: &DeviceTarget,
        image: &ImageHandle,
    ) -> Result<ImageHeader, TransportError> {
        let mut state = self.lock();
        state.calls.push(SimCall::ReadHeader(*target));
        state.inject_failure(SimOp::ReadHeader, *target)?;

        let bad_header = |reason: String| TransportError::BadHeader {
            target: *target,
            reason,
        };
        let raw = RawImageHeader::decode(&image.header_block)
            .map_err(|err| bad_header(err.to_string()))?;
        ImageHeader::try_from(&raw).map_err(|err| bad_header(err.to_string()))
    }

    fn begin_download(
        &mut self,
        target: &DeviceTarget,
        image: &ImageData,
    ) -> Result<OperationHandle, TransportError> {
        let mut state = self.lock();
        state.calls.push(SimCall::BeginDownload(*target));
        state.inject_failure(SimOp::BeginDownload, *target)?;

        let bad_header = |err: fup_messages::ImageHeaderError| {
            TransportError::BadHeader {
                target: *target,
                reason: err.to_string(),
            }
        };
        let raw = RawImageHeader::decode(&image.bytes).map_err(bad_header)?;
        raw.check_image_len(image.bytes.len()).map_err(bad_header)?;
        let revision = raw.revision().unwrap_or_default().to_string();
        let polls_left = state.download_polls;
        Ok(state.start(SimOperation::Download {
            target: *target,
            revision,
            polls_left,
        }))
    }

    fn poll_download(
        &mut self,
        handle: OperationHandle,
    ) -> Result<OperationStatus, TransportError> {
        let mut state = self.lock();
        state.calls.push(SimCall::PollDownload(handle));
        let Some(SimOperation::Download { target, revision, polls_left }) =
            state.operations.get(&handle.0).cloned()
        else {
            return Err(TransportError::UnknownOperation(handle.0));
        };
        state.inject_failure(SimOp::PollDownload, target)?;

        if polls_left > 0 {
            state.operations.insert(
                handle.0,
                SimOperation::Download {
                    target,
                    revision,
                    polls_left: polls_left - 1,
                },
            );
            return Ok(OperationStatus::InProgress);
        }
        state.operations.remove(&handle.0);
        if let Some(code) = state.download_failure.take() {
            return Ok(OperationStatus::Failed(code));
        }
        state.staged.insert(target, revision);
        Ok(OperationStatus::Complete)
    }

    fn activate(
        &mut self,
        target: &DeviceTarget,
    ) -> Result<OperationHandle, TransportError> {
        let mut state = self.lock();
        state.calls.push(SimCall::Activate(*target));
        state.inject_failure(SimOp::Activate, *target)?;
        let polls_left = state.activate_polls;
        Ok(state.start(SimOperation::Activate { target: *target, polls_left }))
    }

    fn poll_activate(
        &mut self,
        handle: OperationHandle,
    ) -> Result<OperationStatus, TransportError> {
        let mut state = self.lock();
        state.calls.push(SimCall::PollActivate(handle));
        let Some(SimOperation::Activate { target, polls_left }) =
            state.operations.get(&handle.0).cloned()
        else {
            return Err(TransportError::UnknownOperation(handle.0));
        };
        state.inject_failure(SimOp::PollActivate, target)?;

        if polls_left > 0 {
            state.operations.insert(
                handle.0,
                SimOperation::Activate { target, polls_left: polls_left - 1 },
            );
            return Ok(OperationStatus::InProgress);
        }
        state.operations.remove(&handle.0);
        if !state.activation_ignored {
            // Activation resets the whole device, bringing every staged
            // image into service.
            let device = target.device;
            let staged: Vec<DeviceTarget> = state
                .staged
                .keys()
                .filter(|staged| staged.device == device)
                .copied()
                .collect();
            for staged in staged {
                if let Some(revision) = state.staged.remove(&staged) {
                    state.running.insert(staged, revision);
                }
            }
        }
        Ok(OperationStatus::Complete)
    }

    fn read_revision(
        &mut self,
        target: &DeviceTarget,
    ) -> Result<String, TransportError> {
        let mut state = self.lock();
        state.calls.push(SimCall::ReadRevision(*target));
        state.inject_failure(SimOp::ReadRevision, *target)?;
        Ok(state.running.get(target).cloned().unwrap_or_default())
    }

    fn release(&mut self, handle: OperationHandle) {
        let mut state = self.lock();
        state.calls.push(SimCall::Release(handle));
        state.operations.remove(&handle.0);
    }
}

#[derive(Debug, Clone)]
struct SimImage {
    header_product_id: String,
    target: FirmwareTarget,
    revision: String,
    payload: Vec<u8>,
}

/// Images and manifests held in memory.
#[derive(Debug, Clone, Default)]
pub struct SimImageRepository {
    images: BTreeMap<Utf8PathBuf, SimImage>,
    manifests: BTreeMap<String, ManifestEntry>,
}

impl SimImageRepository {
    /// Path a single image for `product_id` and `target` is found at when no
    /// manifest names one.
    pub fn default_path(
        product_id: &str,
        target: FirmwareTarget,
    ) -> Utf8PathBuf {
        Utf8PathBuf::from(product_id).join(format!("{}.img", target.as_str()))
    }

    /// Add an image at its default path.
    pub fn add_image(
        &mut self,
        product_id: &str,
        target: FirmwareTarget,
        revision: &str,
        payload: Vec<u8>,
    ) -> &mut Self {
        let path = Self::default_path(product_id, target);
        self.add_image_file(path, product_id, target, revision, payload)
    }

    /// Add an image at `path`. The header carries `product_id` and
    /// `target`, which need not match where the image is found.
    pub fn add_image_file(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        product_id: &str,
        target: FirmwareTarget,
        revision: &str,
        payload: Vec<u8>,
    ) -> &mut Self {
        self.images.insert(
            path.into(),
            SimImage {
                header_product_id: product_id.to_string(),
                target,
                revision: revision.to_string(),
                payload,
            },
        );
        self
    }

    pub fn add_manifest(&mut self, entry: ManifestEntry) -> &mut Self {
        self.manifests.insert(entry.product_id.clone(), entry);
        self
    }

    fn encode(
        path: &Utf8Path,
        image: &SimImage,
    ) -> Result<Vec<u8>, RepositoryError> {
        let invalid = |message: String| RepositoryError::Io {
            path: path.to_owned(),
            err: io::Error::new(io::ErrorKind::InvalidData, message),
        };
        let payload_len = u32::try_from(image.payload.len())
            .map_err(|_| invalid("payload too large".to_string()))?;
        let header = RawImageHeader::new(
            image.target,
            &image.header_product_id,
            &image.revision,
            payload_len,
        )
        .map_err(|err| invalid(format!("{err:?}")))?;
        let block = header.encode().map_err(|err| invalid(err.to_string()))?;

        let mut bytes = block.to_vec();
        bytes.extend_from_slice(&image.payload);
        Ok(bytes)
    }

    fn find(&self, path: &Utf8Path) -> Result<&SimImage, RepositoryError> {
        self.images
            .get(path)
            .ok_or_else(|| RepositoryError::NotFound { path: path.to_owned() })
    }
}

impl ImageRepository for SimImageRepository {
    fn resolve_image(
        &self,
        identity: &HardwareIdentity,
        target: FirmwareTarget,
        file: Option<&Utf8Path>,
    ) -> Result<ImageHandle, RepositoryError> {
        let path = match file {
            Some(file) => file.to_owned(),
            None => Self::default_path(&identity.product_id, target),
        };
        let image = self.find(&path)?;
        let mut header_block = Self::encode(&path, image)?;
        header_block.truncate(RawImageHeader::BLOCK_SIZE);
        Ok(ImageHandle { path, header_block })
    }

    fn load_image(
        &self,
        image: &ImageHandle,
    ) -> Result<ImageData, RepositoryError> {
        let bytes = Self::encode(&image.path, self.find(&image.path)?)?;
        Ok(ImageData { path: image.path.clone(), bytes: Arc::new(bytes) })
    }

    fn resolve_manifest(
        &self,
        identity: &HardwareIdentity,
    ) -> Result<ManifestEntry, RepositoryError> {
        self.manifests.get(&identity.product_id).cloned().ok_or_else(|| {
            RepositoryError::NoManifestEntry {
                product_id: identity.product_id.clone(),
            }
        })
    }
}

#[derive(Debug, Clone)]
enum Inbound {
    Datagram(Vec<u8>),
    Event(PeerEvent),
}

#[derive(Debug)]
struct LinkState {
    inbox: [VecDeque<Inbound>; 2],
    /// Whether each end is present, as seen by the other.
    present: [bool; 2],
    /// Sends from each end that will be answered with "busy".
    busy: [u32; 2],
    fatal: [bool; 2],
    connected: bool,
    next_message_id: u32,
}

/// A pair of connected [`SimPeerChannel`]s.
///
/// Every message is encoded and decoded with the wire codec on its way
/// across, so the link exercises the same framing a real channel would.
pub struct SimPeerLink;

impl SimPeerLink {
    pub fn pair() -> (SimPeerChannel, SimPeerChannel) {
        let state = Arc::new(Mutex::new(LinkState {
            inbox: [VecDeque::new(), VecDeque::new()],
            present: [true, true],
            busy: [0, 0],
            fatal: [false, false],
            connected: true,
            next_message_id: 0,
        }));
        (
            SimPeerChannel { end: 0, state: Arc::clone(&state) },
            SimPeerChannel { end: 1, state },
        )
    }
}

/// One end of a [`SimPeerLink`].
#[derive(Debug, Clone)]
pub struct SimPeerChannel {
    end: usize,
    state: Arc<Mutex<LinkState>>,
}

impl SimPeerChannel {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn far_end(&self) -> usize {
        1 - self.end
    }

    /// Mark the other end as absent; our sends report "not present" until
    /// it returns.
    pub fn set_peer_present(&self, present: bool) {
        let far = self.far_end();
        self.lock().present[far] = present;
    }

    /// Answer our next `count` sends with "busy".
    pub fn set_peer_busy(&self, count: u32) {
        let end = self.end;
        self.lock().busy[end] = count;
    }

    /// Make every subsequent send from this end report a fatal error.
    pub fn set_fatal(&self, fatal: bool) {
        let end = self.end;
        self.lock().fatal[end] = fatal;
    }

    /// Drop everything in flight and report contact lost to both ends.
    pub fn lose_contact(&self) {
        let mut state = self.lock();
        state.connected = false;
        for inbox in state.inbox.iter_mut() {
            inbox.clear();
            inbox.push_back(Inbound::Event(PeerEvent::ContactLost));
        }
    }

    pub fn restore_contact(&self) {
        let mut state = self.lock();
        state.connected = true;
        for inbox in state.inbox.iter_mut() {
            inbox.push_back(Inbound::Event(PeerEvent::ContactRestored));
        }
    }

    /// Queue an event for this end, as if the channel had reported it.
    pub fn inject(&self, event: PeerEvent) {
        let end = self.end;
        self.lock().inbox[end].push_back(Inbound::Event(event));
    }

    /// Messages waiting to be received by this end.
    pub fn pending(&self) -> usize {
        let end = self.end;
        self.lock().inbox[end].len()
    }
}

impl PeerChannel for SimPeerChannel {
    fn send(&mut self, message: PeerMessage) -> Result<(), PeerChannelError> {
        let (end, far) = (self.end, self.far_end());
        let mut state = self.lock();

        let undelivered = if state.fatal[end] {
            Some(PeerEvent::FatalError(message))
        } else if !state.connected || !state.present[far] {
            Some(PeerEvent::PeerNotPresent(message))
        } else if state.busy[end] > 0 {
            state.busy[end] -= 1;
            Some(PeerEvent::PeerBusy(message))
        } else {
            None
        };
        if let Some(event) = undelivered {
            state.inbox[end].push_back(Inbound::Event(event));
            return Ok(());
        }

        let message_id = state.next_message_id;
        state.next_message_id = state.next_message_id.wrapping_add(1);
        let message = Message {
            header: Header { version: version::CURRENT, message_id },
            kind: message,
        };
        let mut buf = [0; MAX_SERIALIZED_SIZE];
        let n = fup_messages::serialize_message(&mut buf, &message)
            .map_err(|_| PeerChannelError::Encode)?;
        state.inbox[far].push_back(Inbound::Datagram(buf[..n].to_vec()));
        Ok(())
    }

    fn try_recv(&mut self) -> Option<PeerEvent> {
        let end = self.end;
        let mut state = self.lock();
        while let Some(inbound) = state.inbox[end].pop_front() {
            match inbound {
                Inbound::Event(event) => return Some(event),
                Inbound::Datagram(data) => {
                    // Undecodable datagrams are dropped, as a lossy channel
                    // would.
                    let decoded = fup_messages::deserialize_message(&data);
                    if let Ok(message) = decoded {
                        return Some(PeerEvent::MessageReceived(message.kind));
                    }
                }
            }
        }
        None
    }
}

/// Identifier for a simulated device on bus 0.
pub fn device_id(
    device_type: fup_messages::DeviceType,
    enclosure: u8,
    slot: u8,
) -> DeviceId {
    DeviceId {
        device_type,
        location: fup_messages::Location {
            bus: 0,
            enclosure,
            component_id: 0,
            slot,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fup_messages::DeviceType;
    use fup_messages::SpId;

    fn target(firmware: FirmwareTarget) -> DeviceTarget {
        DeviceTarget { device: device_id(DeviceType::Lcc, 0, 0), firmware }
    }

    #[test]
    fn activation_brings_every_staged_image_into_service() {
        let mut images = SimImageRepository::default();
        images
            .add_image("VOYAGER", FirmwareTarget::Fpga, "0.31", vec![1; 8])
            .add_image("VOYAGER", FirmwareTarget::Expander, "2.10", vec![2; 8]);
        let identity = HardwareIdentity {
            product_id: "VOYAGER".to_string(),
            unique_id: 0x11,
        };
        let mut transport = SimTransport::default();
        transport.set_revision(target(FirmwareTarget::Fpga), "0.30");

        for firmware in [FirmwareTarget::Fpga, FirmwareTarget::Expander] {
            let handle =
                images.resolve_image(&identity, firmware, None).unwrap();
            let header =
                transport.read_header(&target(firmware), &handle).unwrap();
            assert_eq!(header.target, firmware);
            let data = images.load_image(&handle).unwrap();
            assert_eq!(data.payload().len(), 8);
            let op =
                transport.begin_download(&target(firmware), &data).unwrap();
            assert_eq!(
                transport.poll_download(op).unwrap(),
                OperationStatus::Complete
            );
        }
        assert_eq!(
            transport.revision(&target(FirmwareTarget::Fpga)).as_deref(),
            Some("0.30")
        );

        let op = transport.activate(&target(FirmwareTarget::Expander)).unwrap();
        assert_eq!(
            transport.poll_activate(op).unwrap(),
            OperationStatus::Complete
        );
        assert_eq!(
            transport.revision(&target(FirmwareTarget::Fpga)).as_deref(),
            Some("0.31")
        );
        assert_eq!(
            transport.revision(&target(FirmwareTarget::Expander)).as_deref(),
            Some("2.10")
        );
        assert_eq!(transport.outstanding_operations(), 0);
    }

    #[test]
    fn link_reports_undeliverable_sends_to_sender() {
        let (mut a, mut b) = SimPeerLink::pair();
        let alive = PeerMessage::PeerAlive { sp: SpId::A };

        a.send(alive).unwrap();
        assert_eq!(b.try_recv(), Some(PeerEvent::MessageReceived(alive)));
        assert_eq!(b.try_recv(), None);

        a.set_peer_busy(1);
        a.send(alive).unwrap();
        assert_eq!(a.try_recv(), Some(PeerEvent::PeerBusy(alive)));
        assert_eq!(b.pending(), 0);

        a.set_peer_present(false);
        a.send(alive).unwrap();
        assert_eq!(a.try_recv(), Some(PeerEvent::PeerNotPresent(alive)));

        a.lose_contact();
        assert_eq!(a.try_recv(), Some(PeerEvent::ContactLost));
        assert_eq!(b.try_recv(), Some(PeerEvent::ContactLost));
    }
}
