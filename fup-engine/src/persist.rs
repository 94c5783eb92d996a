// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Upgrade records that survive a restart.

use crate::error::PersistError;
use crate::work_item::CompletionStatus;
use crate::work_item::ForceFlags;
use crate::work_item::WorkItemSnapshot;
use camino::Utf8PathBuf;
use fup_messages::DeviceTarget;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Last known outcome of upgrading one (device, firmware target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRecord {
    pub target: DeviceTarget,
    pub completion: CompletionStatus,
    pub force_flags: u32,
    pub current_rev: String,
    pub previous_rev: Option<String>,
    pub image_rev: Option<String>,
}

impl UpgradeRecord {
    pub fn force_flags(&self) -> ForceFlags {
        ForceFlags::from_bits_truncate(self.force_flags)
    }

    pub(crate) fn snapshot(&self) -> WorkItemSnapshot {
        WorkItemSnapshot {
            target: self.target,
            stage: None,
            completion: self.completion,
            current_rev: self.current_rev.clone(),
            image_rev: self.image_rev.clone(),
            pre_upgrade_rev: self.previous_rev.clone(),
            force_flags: self.force_flags,
            retry_count: 0,
        }
    }
}

pub trait UpgradeStateStore {
    fn load(&mut self) -> Result<Vec<UpgradeRecord>, PersistError>;

    fn save(&mut self, records: &[UpgradeRecord]) -> Result<(), PersistError>;
}

/// Records kept in a JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: Utf8PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UpgradeStateStore for JsonFileStateStore {
    fn load(&mut self) -> Result<Vec<UpgradeRecord>, PersistError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            // Nothing saved yet.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(PersistError::Read { path: self.path.clone(), err });
            }
        };
        serde_json::from_str(&contents)
            .map_err(|err| PersistError::Parse { path: self.path.clone(), err })
    }

    fn save(&mut self, records: &[UpgradeRecord]) -> Result<(), PersistError> {
        let contents = serde_json::to_vec_pretty(records)
            .map_err(PersistError::Serialize)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .map_err(|err| PersistError::Write { path: tmp.clone(), err })?;
        fs::rename(&tmp, &self.path)
            .map_err(|err| PersistError::Write { path: self.path.clone(), err })
    }
}

/// Records kept in memory; clones share the same records, so a test or
/// simulation can hand one clone to an engine and inspect another, or hand
/// it to a second engine to model a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    records: Arc<Mutex<Vec<UpgradeRecord>>>,
}

impl InMemoryStateStore {
    pub fn records(&self) -> Vec<UpgradeRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UpgradeRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UpgradeStateStore for InMemoryStateStore {
    fn load(&mut self) -> Result<Vec<UpgradeRecord>, PersistError> {
        Ok(self.records())
    }

    fn save(&mut self, records: &[UpgradeRecord]) -> Result<(), PersistError> {
        *self.lock() = records.to_vec();
        Ok(())
    }
}
