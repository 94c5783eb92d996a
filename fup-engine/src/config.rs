// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Configuration for one SP's upgrade engine.

use backoff::ExponentialBackoff;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use fup_messages::DeviceType;
use fup_messages::SpId;
use serde::Deserialize;
use serde::Serialize;
use slog_error_chain::SlogInlineError;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Config {
    /// The SP this engine runs on.
    pub local_sp: SpId,
    /// Set on systems with only one SP; disables the peer handshake and
    /// environment gate entirely.
    #[serde(default)]
    pub single_sp: bool,
    /// Number of transient I/O failures a work item tolerates before it
    /// fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Time a new work item waits before it starts.
    #[serde(default)]
    pub wait_before_upgrade_secs: u64,
    /// Minimum time between activating one device and starting the next.
    #[serde(default)]
    pub inter_device_delay_secs: u64,
    #[serde(default)]
    pub peer_retry: PeerRetryConfig,
    /// Device classes shared by both SPs, which need the peer's permission
    /// before they are upgraded.
    #[serde(default = "default_peer_permission_device_types")]
    pub peer_permission_device_types: Vec<DeviceType>,
    /// Where to persist upgrade records; in memory only if unset.
    #[serde(default)]
    pub state_file: Option<Utf8PathBuf>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_peer_permission_device_types() -> Vec<DeviceType> {
    vec![DeviceType::Fan, DeviceType::PowerSupply, DeviceType::Sps]
}

impl Config {
    pub fn new(local_sp: SpId) -> Self {
        Self {
            local_sp,
            single_sp: false,
            max_retries: default_max_retries(),
            wait_before_upgrade_secs: 0,
            inter_device_delay_secs: 0,
            peer_retry: PeerRetryConfig::default(),
            peer_permission_device_types:
                default_peer_permission_device_types(),
            state_file: None,
        }
    }

    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }

    pub fn wait_before_upgrade(&self) -> Duration {
        Duration::from_secs(self.wait_before_upgrade_secs)
    }

    pub fn inter_device_delay(&self) -> Duration {
        Duration::from_secs(self.inter_device_delay_secs)
    }
}

/// Retry policy for permission requests the peer reports as busy.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PeerRetryConfig {
    pub initial_interval_millis: u64,
    pub max_interval_millis: u64,
    /// Busy replies tolerated before the request is treated as denied.
    pub max_attempts: u32,
}

impl Default for PeerRetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_millis: 500,
            max_interval_millis: 8_000,
            max_attempts: 10,
        }
    }
}

impl PeerRetryConfig {
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(
                self.initial_interval_millis,
            ),
            max_interval: Duration::from_millis(self.max_interval_millis),
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff::backoff::Backoff::reset(&mut backoff);
        backoff
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}
