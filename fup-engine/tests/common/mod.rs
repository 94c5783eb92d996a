// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

// Not every test file uses every helper.
#![allow(dead_code)]

use fup_engine::sim;
use fup_engine::sim::SimCall;
use fup_engine::sim::SimImageRepository;
use fup_engine::sim::SimPeerChannel;
use fup_engine::sim::SimPeerLink;
use fup_engine::sim::SimTransport;
use fup_engine::Collaborators;
use fup_engine::CompletionStatus;
use fup_engine::Config;
use fup_engine::DeviceStatus;
use fup_engine::HardwareIdentity;
use fup_engine::InMemoryStateStore;
use fup_engine::ManifestEntry;
use fup_engine::ManifestImage;
use fup_engine::PassSummary;
use fup_engine::ProtocolVersion;
use fup_engine::StandardPolicy;
use fup_engine::UpgradeEngine;
use fup_engine::UpgradeStage;
use fup_engine::UpgradeStateStore;
use fup_engine::WorkItemSnapshot;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fup_messages::DeviceType;
use fup_messages::FirmwareTarget;
use fup_messages::SpId;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::time::Duration;
use std::time::Instant;

pub const FAN_PRODUCT: &str = "BLOWER";
pub const FAN_IMAGE_REV: &str = "1.7";
pub const PSU_PRODUCT: &str = "JUNO";
pub const PSU_IMAGE_REV: &str = "3.1";
pub const LCC_PRODUCT: &str = "VOYAGER";
pub const LCC_EXPANDER_REV: &str = "2.10";
pub const LCC_INIT_STRING_REV: &str = "1.02";
pub const LCC_FPGA_REV: &str = "0.31";

/// Set `FUP_TEST_LOG` to see engine logs in test output.
pub fn test_logger() -> Logger {
    if std::env::var_os("FUP_TEST_LOG").is_some() {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    } else {
        Logger::root(slog::Discard, o!())
    }
}

pub fn fan(slot: u8) -> DeviceId {
    sim::device_id(DeviceType::Fan, 0, slot)
}

pub fn psu(slot: u8) -> DeviceId {
    sim::device_id(DeviceType::PowerSupply, 0, slot)
}

pub fn lcc(slot: u8) -> DeviceId {
    sim::device_id(DeviceType::Lcc, 0, slot)
}

pub fn target(device: DeviceId, firmware: FirmwareTarget) -> DeviceTarget {
    DeviceTarget { device, firmware }
}

fn single_image_status(
    side: SpId,
    product_id: &str,
    rev: &str,
) -> DeviceStatus {
    DeviceStatus {
        side,
        inserted: true,
        faulted: false,
        downloadable: true,
        identity: HardwareIdentity {
            product_id: product_id.to_string(),
            unique_id: 0x1000,
        },
        protocol: ProtocolVersion::LEGACY,
        firmware_revs: [(FirmwareTarget::Main, rev.to_string())]
            .into_iter()
            .collect(),
    }
}

pub fn fan_status(side: SpId, rev: &str) -> DeviceStatus {
    single_image_status(side, FAN_PRODUCT, rev)
}

pub fn psu_status(side: SpId, rev: &str) -> DeviceStatus {
    single_image_status(side, PSU_PRODUCT, rev)
}

/// An LCC running an old init string and FPGA image alongside the given
/// expander revision.
pub fn lcc_status(side: SpId, expander_rev: &str) -> DeviceStatus {
    DeviceStatus {
        side,
        inserted: true,
        faulted: false,
        downloadable: true,
        identity: HardwareIdentity {
            product_id: LCC_PRODUCT.to_string(),
            unique_id: 0x2000,
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

/// Program the simulated device with the revisions `status` reports.
pub fn install(
    transport: &SimTransport,
    device: DeviceId,
    status: &DeviceStatus,
) {
    for (firmware, rev) in &status.firmware_revs {
        transport.set_revision(target(device, *firmware), rev);
    }
}

pub fn image_repository() -> SimImageRepository {
    let mut images = SimImageRepository::default();
    let main = FirmwareTarget::Main;
    images
        .add_image(FAN_PRODUCT, main, FAN_IMAGE_REV, vec![0xf0; 64])
        .add_image(PSU_PRODUCT, main, PSU_IMAGE_REV, vec![0x50; 64]);

    // Listed with the primary image first; expansion must still put it last.
    let manifest = [
        (FirmwareTarget::Expander, LCC_EXPANDER_REV, "voyager/exp.bin"),
        (FirmwareTarget::InitString, LCC_INIT_STRING_REV, "voyager/init.bin"),
        (FirmwareTarget::Fpga, LCC_FPGA_REV, "voyager/fpga.bin"),
    ];
    let mut entry = ManifestEntry {
        product_id: LCC_PRODUCT.to_string(),
        images: Vec::new(),
    };
    for (firmware, revision, file) in manifest {
        let payload = vec![0xcc; 96];
        images.add_image_file(file, LCC_PRODUCT, firmware, revision, payload);
        entry.images.push(ManifestImage {
            target: firmware,
            revision: revision.to_string(),
            file: file.into(),
        });
    }
    images.add_manifest(entry);
    images
}

pub fn build_engine(
    config: Config,
    transport: &SimTransport,
    images: &SimImageRepository,
    peer: SimPeerChannel,
    state_store: Box<dyn UpgradeStateStore>,
) -> UpgradeEngine {
    let policy = StandardPolicy::new(&config);
    UpgradeEngine::new(
        config,
        Collaborators {
            transport: Box::new(transport.clone()),
            images: Box::new(images.clone()),
            peer: Box::new(peer),
            policy: Box::new(policy),
            state_store,
        },
        &test_logger(),
    )
}

/// An engine on a system with only one SP.
pub fn single_sp_engine(
    transport: &SimTransport,
    images: &SimImageRepository,
    state: &InMemoryStateStore,
) -> UpgradeEngine {
    let mut config = Config::new(SpId::A);
    config.single_sp = true;
    let (peer, _unused) = SimPeerLink::pair();
    build_engine(config, transport, images, peer, Box::new(state.clone()))
}

/// One SP of a dual-SP enclosure, with a handle on its end of the peer
/// link for fault injection.
pub struct TestSp {
    pub engine: UpgradeEngine,
    pub link: SimPeerChannel,
    pub state: InMemoryStateStore,
}

impl TestSp {
    pub fn new(
        sp: SpId,
        transport: &SimTransport,
        images: &SimImageRepository,
        link: SimPeerChannel,
    ) -> Self {
        let state = InMemoryStateStore::default();
        let engine = build_engine(
            Config::new(sp),
            transport,
            images,
            link.clone(),
            Box::new(state.clone()),
        );
        Self { engine, link, state }
    }

    /// Report `status` for `device`, expecting no error.
    pub fn report(&mut self, device: DeviceId, status: &DeviceStatus) {
        self.engine
            .on_device_status_changed(device, status.clone())
            .unwrap();
    }
}

/// Both SPs of an enclosure, sharing one set of simulated hardware.
pub fn enclosure(
    transport: &SimTransport,
    images: &SimImageRepository,
) -> (TestSp, TestSp) {
    let (a, b) = SimPeerLink::pair();
    (
        TestSp::new(SpId::A, transport, images, a),
        TestSp::new(SpId::B, transport, images, b),
    )
}

/// Scheduling passes happen one simulated second apart.
pub struct Clock {
    start: Instant,
    ticks: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self { start: Instant::now(), ticks: 0 }
    }

    pub fn tick(&mut self) -> Instant {
        self.ticks += 1;
        self.start + Duration::from_secs(self.ticks)
    }
}

/// Run passes until the engine has nothing left to do, returning every
/// completion in the order it was reported.
pub fn run_until_idle(
    engine: &mut UpgradeEngine,
    clock: &mut Clock,
) -> Vec<(DeviceTarget, CompletionStatus)> {
    let mut completed = Vec::new();
    for _ in 0..200 {
        if engine.is_idle() {
            return completed;
        }
        let summary = engine.run_pass(clock.tick());
        completed.extend(summary.completed);
    }
    panic!("engine did not go idle");
}

/// Run passes on both SPs, A first, until both are idle. `observe` sees
/// each pass's summaries.
pub fn run_pair_until_idle<F>(
    a: &mut TestSp,
    b: &mut TestSp,
    clock: &mut Clock,
    mut observe: F,
) where
    F: FnMut(&TestSp, &PassSummary, &TestSp, &PassSummary),
{
    for _ in 0..200 {
        let quiet = a.link.pending() == 0 && b.link.pending() == 0;
        if quiet && a.engine.is_idle() && b.engine.is_idle() {
            return;
        }
        let now = clock.tick();
        let sa = a.engine.run_pass(now);
        let sb = b.engine.run_pass(now);
        observe(a, &sa, b, &sb);
    }
    panic!("enclosure did not go idle");
}

/// Run passes on both SPs until `done` holds.
pub fn run_pair_until<F>(
    a: &mut TestSp,
    b: &mut TestSp,
    clock: &mut Clock,
    done: F,
) where
    F: Fn(&TestSp, &TestSp) -> bool,
{
    for _ in 0..200 {
        if done(a, b) {
            return;
        }
        let now = clock.tick();
        a.engine.run_pass(now);
        b.engine.run_pass(now);
    }
    panic!("enclosure never reached the expected state");
}

/// Live stage of `firmware` on `device`, if it has a work item.
pub fn stage_of(
    engine: &UpgradeEngine,
    device: DeviceId,
    firmware: FirmwareTarget,
) -> Option<UpgradeStage> {
    snapshot_of(engine, device, firmware).and_then(|snapshot| snapshot.stage)
}

pub fn snapshot_of(
    engine: &UpgradeEngine,
    device: DeviceId,
    firmware: FirmwareTarget,
) -> Option<WorkItemSnapshot> {
    engine
        .get_upgrade_info(&device)
        .into_iter()
        .find(|snapshot| snapshot.target.firmware == firmware)
}

/// Run passes until `firmware` on `device` reaches `stage`.
pub fn run_until_stage(
    engine: &mut UpgradeEngine,
    clock: &mut Clock,
    device: DeviceId,
    firmware: FirmwareTarget,
    stage: UpgradeStage,
) {
    for _ in 0..200 {
        if stage_of(engine, device, firmware) == Some(stage) {
            return;
        }
        engine.run_pass(clock.tick());
    }
    panic!("{device}/{firmware:?} never reached {stage:?}");
}

pub fn count_calls<F>(transport: &SimTransport, matches: F) -> usize
where
    F: Fn(&SimCall) -> bool,
{
    transport.calls().iter().filter(|call| matches(call)).count()
}

pub fn downloads_of(transport: &SimTransport, device: DeviceId) -> usize {
    count_calls(transport, |call| {
        matches!(call, SimCall::BeginDownload(t) if t.device == device)
    })
}
