// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Parser;
use clap::Subcommand;
use fup_engine::sim::device_id;
use fup_engine::sim::SimImageRepository;
use fup_engine::sim::SimPeerLink;
use fup_engine::sim::SimTransport;
use fup_engine::Collaborators;
use fup_engine::Config;
use fup_engine::DeviceStatus;
use fup_engine::DirectoryImageRepository;
use fup_engine::HardwareIdentity;
use fup_engine::InMemoryStateStore;
use fup_engine::JsonFileStateStore;
use fup_engine::ManifestEntry;
use fup_engine::ManifestImage;
use fup_engine::ProtocolVersion;
use fup_engine::StandardPolicy;
use fup_engine::UpgradeEngine;
use fup_engine::UpgradeRecord;
use fup_engine::UpgradeStateStore;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fup_messages::DeviceType;
use fup_messages::FirmwareTarget;
use fup_messages::RawImageHeader;
use fup_messages::SpId;
use serde_json::json;
use slog::info;
use slog::o;
use slog::warn;
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog_async::AsyncGuard;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

/// Command line program that exercises the firmware upgrade engine against
/// simulated hardware, and inspects upgrade configuration and images.
#[derive(Parser, Debug)]
struct Args {
    #[clap(
        short,
        long,
        default_value = "info",
        value_parser = level_from_str,
        help = "Log level: {off,critical,error,warn,info,debug,trace}",
    )]
    log_level: Level,

    /// Write logs to a file instead of stderr.
    #[clap(long)]
    logfile: Option<PathBuf>,

    /// Emit parseable JSON on stdout instead of "human-readable" data.
    #[clap(long, value_names = ["pretty"], value_parser = json_pretty_from_str)]
    json: Option<Option<JsonPretty>>,

    #[clap(subcommand)]
    command: Command,
}

fn level_from_str(s: &str) -> Result<Level> {
    if let Ok(level) = s.parse() {
        Ok(level)
    } else {
        bail!(format!("Invalid log level: {}", s))
    }
}

#[derive(Debug, Clone, Copy)]
struct JsonPretty;

fn json_pretty_from_str(s: &str) -> Result<JsonPretty> {
    if s == "pretty" {
        Ok(JsonPretty)
    } else {
        bail!("expected \"pretty\"")
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run both SPs of a simulated enclosure until every upgrade finishes.
    Simulate {
        /// Engine configuration; `local_sp` is overridden for each SP.
        #[clap(long)]
        config: Option<Utf8PathBuf>,

        /// Persist each SP's upgrade records in this directory. Running
        /// again with the same directory resumes interrupted upgrades.
        #[clap(long)]
        state_dir: Option<Utf8PathBuf>,

        /// Time between scheduling passes.
        #[clap(long, default_value = "10ms")]
        pass_interval: humantime::Duration,

        /// Give up after this many passes.
        #[clap(long, default_value_t = 1000)]
        max_passes: usize,

        /// Stop after this many passes without finishing, leaving upgrades
        /// in progress in the state directory.
        #[clap(long)]
        interrupt_after: Option<usize>,
    },

    /// Parse and print an engine configuration file.
    CheckConfig { path: Utf8PathBuf },

    /// Print the manifest of an image directory.
    ShowManifest { image_dir: Utf8PathBuf },

    /// Decode and check the header of a firmware image file.
    InspectImage { path: Utf8PathBuf },
}

fn build_logger(
    level: Level,
    path: Option<&Path>,
) -> Result<(Logger, AsyncGuard)> {
    fn make_drain<D: slog_term::Decorator + Send + 'static>(
        level: Level,
        decorator: D,
    ) -> (slog::Fuse<slog_async::Async>, AsyncGuard) {
        let drain = slog_term::FullFormat::new(decorator)
            .build()
            .filter_level(level)
            .fuse();
        let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
        (drain.fuse(), guard)
    }

    let (drain, guard) = if let Some(path) = path {
        let file = File::create(path).with_context(|| {
            format!("failed to create logfile {}", path.display())
        })?;
        make_drain(level, slog_term::PlainDecorator::new(file))
    } else {
        make_drain(level, slog_term::TermDecorator::new().build())
    };

    Ok((Logger::root(drain, o!("component" => "faux-fup")), guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (log, log_guard) =
        build_logger(args.log_level, args.logfile.as_deref())?;

    let result = run_command(args.command, args.json.is_some(), &log).await;

    // Flush logs before we write any output.
    drop(log_guard);

    match result? {
        Output::Json(value) => match args.json {
            Some(Some(JsonPretty)) => {
                serde_json::to_writer_pretty(io::stdout().lock(), &value)?
            }
            _ => serde_json::to_writer(io::stdout().lock(), &value)?,
        },
        Output::Lines(lines) => {
            for line in lines {
                println!("{line}");
            }
        }
    }

    Ok(())
}

enum Output {
    Json(serde_json::Value),
    Lines(Vec<String>),
}

async fn run_command(
    command: Command,
    json: bool,
    log: &Logger,
) -> Result<Output> {
    match command {
        Command::Simulate {
            config,
            state_dir,
            pass_interval,
            max_passes,
            interrupt_after,
        } => {
            let base = match config {
                Some(path) => Config::from_file(&path)
                    .with_context(|| format!("failed to load {path}"))?,
                None => Config::new(SpId::A),
            };
            let outcome = simulate(
                base,
                state_dir.as_deref(),
                pass_interval.into(),
                interrupt_after.unwrap_or(max_passes).min(max_passes),
                log,
            )
            .await?;

            if json {
                Ok(Output::Json(json!({
                    "passes": outcome.passes,
                    "finished": outcome.finished,
                    "records": outcome.records,
                })))
            } else {
                let mut lines = vec![format!(
                    "{} after {} passes",
                    if outcome.finished { "finished" } else { "stopped" },
                    outcome.passes
                )];
                for (sp, records) in &outcome.records {
                    for record in records {
                        lines.push(format_record(sp, record));
                    }
                }
                Ok(Output::Lines(lines))
            }
        }
        Command::CheckConfig { path } => {
            let config = Config::from_file(&path)
                .with_context(|| format!("failed to load {path}"))?;
            if json {
                Ok(Output::Json(serde_json::to_value(config)?))
            } else {
                Ok(Output::Lines(vec![format!("{config:#?}")]))
            }
        }
        Command::ShowManifest { image_dir } => {
            let entries = DirectoryImageRepository::new(image_dir.clone())
                .read_manifest()
                .with_context(|| {
                    format!("failed to read manifest in {image_dir}")
                })?;
            if json {
                Ok(Output::Json(serde_json::to_value(entries)?))
            } else {
                let mut lines = Vec::new();
                for entry in entries {
                    lines.push(entry.product_id.clone());
                    for image in &entry.images {
                        lines.push(format!(
                            "    {:<12} {:<8} {}",
                            image.target.as_str(),
                            image.revision,
                            image.file,
                        ));
                    }
                }
                Ok(Output::Lines(lines))
            }
        }
        Command::InspectImage { path } => {
            let header = inspect_image(&path)?;
            let product_id = header.product_id().unwrap_or_default();
            let revision = header.revision().unwrap_or_default();
            if json {
                Ok(Output::Json(json!({
                    "product_id": product_id,
                    "target": header.target,
                    "revision": revision,
                    "payload_len": header.payload_len,
                })))
            } else {
                Ok(Output::Lines(vec![
                    format!("product id:  {product_id}"),
                    format!("target:      {}", header.target.as_str()),
                    format!("revision:    {revision}"),
                    format!("payload len: {}", header.payload_len),
                ]))
            }
        }
    }
}

fn format_record(sp: &str, record: &UpgradeRecord) -> String {
    format!(
        "{sp} {}: {} ({} -> {})",
        record.target,
        record.completion,
        record.previous_rev.as_deref().unwrap_or("?"),
        record.current_rev,
    )
}

fn inspect_image(path: &Utf8Path) -> Result<RawImageHeader> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {path}"))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .with_context(|| format!("failed to read {path}"))?;
    let header = RawImageHeader::decode(&data).map_err(|err| {
        anyhow!("bad image header in {path}: {err}")
    })?;
    header.check_image_len(data.len()).map_err(|err| {
        anyhow!("image {path} does not match its header: {err}")
    })?;
    Ok(header)
}

struct SimulationOutcome {
    passes: usize,
    finished: bool,
    records: BTreeMap<String, Vec<UpgradeRecord>>,
}

/// A two-SP enclosure: each SP owns one link control card (manifest
/// images), one fan (single image, shared with the peer) and one power
/// supply that is already up to date.
struct Enclosure {
    transport: SimTransport,
    images: SimImageRepository,
    devices: Vec<(DeviceId, DeviceStatus)>,
}

fn simulated_enclosure() -> Enclosure {
    let mut images = SimImageRepository::default();
    let lcc_images = [
        (FirmwareTarget::Expander, "2.10"),
        (FirmwareTarget::InitString, "1.02"),
        (FirmwareTarget::Fpga, "0.31"),
    ];
    let mut manifest =
        ManifestEntry { product_id: "VOYAGER".to_string(), images: vec![] };
    for (target, revision) in lcc_images {
        let file = Utf8PathBuf::from(format!("lcc/{}.img", target.as_str()));
        images.add_image_file(
            file.clone(),
            "VOYAGER",
            target,
            revision,
            vec![0x5a; 256],
        );
        manifest.images.push(ManifestImage {
            target,
            revision: revision.to_string(),
            file,
        });
    }
    images
        .add_manifest(manifest)
        .add_image("BLOWER", FirmwareTarget::Main, "1.7", vec![0xf0; 128])
        .add_image("JUNO", FirmwareTarget::Main, "3.1", vec![0x0f; 128]);

    let transport = SimTransport::default();
    transport.set_poll_counts(3, 2);

    let mut devices = Vec::new();
    for (slot, side) in [(0, SpId::A), (1, SpId::B)] {
        let mut add = |device_type,
                       product_id: &str,
                       protocol,
                       revs: &[(FirmwareTarget, &str)]| {
            let device = device_id(device_type, 0, slot);
            for (firmware, rev) in revs {
                let target = DeviceTarget { device, firmware: *firmware };
                transport.set_revision(target, rev);
            }
            devices.push((
                device,
                DeviceStatus {
                    side,
                    inserted: true,
                    faulted: false,
                    downloadable: true,
                    identity: HardwareIdentity {
                        product_id: product_id.to_string(),
                        unique_id: u32::from(slot),
                    },
                    protocol,
                    firmware_revs: revs
                        .iter()
                        .map(|(target, rev)| (*target, rev.to_string()))
                        .collect(),
                },
            ));
        };
        add(
            DeviceType::Lcc,
            "VOYAGER",
            ProtocolVersion::MANIFEST,
            &[
                (FirmwareTarget::Expander, "2.04"),
                (FirmwareTarget::InitString, "1.00"),
                (FirmwareTarget::Fpga, "0.30"),
            ],
        );
        add(
            DeviceType::Fan,
            "BLOWER",
            ProtocolVersion::LEGACY,
            &[(FirmwareTarget::Main, "1.5")],
        );
        add(
            DeviceType::PowerSupply,
            "JUNO",
            ProtocolVersion::LEGACY,
            &[(FirmwareTarget::Main, "3.1")],
        );
    }

    Enclosure { transport, images, devices }
}

async fn simulate(
    base: Config,
    state_dir: Option<&Utf8Path>,
    pass_interval: std::time::Duration,
    max_passes: usize,
    log: &Logger,
) -> Result<SimulationOutcome> {
    let enclosure = simulated_enclosure();
    let (link_a, link_b) = SimPeerLink::pair();

    let mut engines = Vec::new();
    for (sp, link) in [(SpId::A, link_a), (SpId::B, link_b)] {
        let config = Config { local_sp: sp, ..base.clone() };
        let state_store: Box<dyn UpgradeStateStore> = match state_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create state directory {dir}")
                })?;
                let path = dir.join(format!("{sp}.json"));
                Box::new(JsonFileStateStore::new(path))
            }
            None => Box::new(InMemoryStateStore::default()),
        };
        let collaborators = Collaborators {
            transport: Box::new(enclosure.transport.clone()),
            images: Box::new(enclosure.images.clone()),
            peer: Box::new(link),
            policy: Box::new(StandardPolicy::new(&config)),
            state_store,
        };
        engines.push((sp, UpgradeEngine::new(config, collaborators, log)));
    }

    for (sp, engine) in engines.iter_mut() {
        for (device, status) in &enclosure.devices {
            if let Err(err) =
                engine.on_device_status_changed(*device, status.clone())
            {
                warn!(
                    log, "status change rejected";
                    "sp" => %sp,
                    "device" => %device,
                    &err,
                );
            }
        }
    }

    let mut interval = tokio::time::interval(pass_interval);
    let mut passes = 0;
    let mut finished = false;
    while passes < max_passes {
        let now = interval.tick().await.into_std();
        passes += 1;
        for (sp, engine) in engines.iter_mut() {
            let summary = engine.run_pass(now);
            for (target, completion) in summary.completed {
                info!(
                    log, "work item finished";
                    "sp" => %sp,
                    "target" => %target,
                    "completion" => %completion,
                );
            }
        }
        if engines.iter().all(|(_, engine)| engine.is_idle()) {
            finished = true;
            break;
        }
    }

    let records = engines
        .iter()
        .map(|(sp, engine)| (sp.to_string(), engine.upgrade_records()))
        .collect();
    Ok(SimulationOutcome { passes, finished, records })
}
