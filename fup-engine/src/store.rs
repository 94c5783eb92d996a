// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use crate::work_item::NewWorkItem;
use crate::work_item::WorkItem;
use fup_messages::DeviceId;
use fup_messages::DeviceTarget;
use fxhash::FxHashMap;
use std::collections::BTreeMap;

/// In-flight work items, keyed by (device, firmware target), iterated in
/// creation order.
///
/// At most one work item exists per key; inserting a duplicate is a no-op.
#[derive(Debug, Default)]
pub(crate) struct WorkItemStore {
    items: BTreeMap<u64, WorkItem>,
    index: FxHashMap<DeviceTarget, u64>,
    next_seq: u64,
}

impl WorkItemStore {
    /// Insert a new work item, returning its sequence number, or `None` if
    /// one already exists for the same key.
    pub fn insert(&mut self, new: NewWorkItem) -> Option<u64> {
        if self.index.contains_key(&new.target) {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(new.target, seq);
        self.items.insert(seq, WorkItem::new(seq, new));
        Some(seq)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_device(&self, device: &DeviceId) -> bool {
        self.index.keys().any(|target| target.device == *device)
    }

    #[cfg(test)]
    pub fn get(&self, target: &DeviceTarget) -> Option<&WorkItem> {
        self.index.get(target).and_then(|seq| self.items.get(seq))
    }

    /// Sequence numbers of every item, oldest first.
    pub fn seqs(&self) -> Vec<u64> {
        self.items.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> + Clone {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkItem> {
        self.items.values_mut()
    }

    pub fn for_device<'a>(
        &'a self,
        device: &'a DeviceId,
    ) -> impl Iterator<Item = &'a WorkItem> + 'a {
        self.items.values().filter(move |item| item.target.device == *device)
    }

    /// Remove an item so it can be advanced without holding a borrow on the
    /// rest of the store. Either [`WorkItemStore::put_back`] it or drop it.
    pub fn take(&mut self, seq: u64) -> Option<WorkItem> {
        let item = self.items.remove(&seq)?;
        self.index.remove(&item.target);
        Some(item)
    }

    pub fn put_back(&mut self, item: WorkItem) {
        self.index.insert(item.target, item.seq);
        self.items.insert(item.seq, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::ForceFlags;
    use crate::work_item::HardwareIdentity;
    use crate::work_item::ProtocolVersion;
    use fup_messages::DeviceType;
    use fup_messages::FirmwareTarget;
    use fup_messages::Location;

    fn new_item(slot: u8, firmware: FirmwareTarget) -> NewWorkItem {
        NewWorkItem {
            target: DeviceTarget {
                device: DeviceId {
                    device_type: DeviceType::PowerSupply,
                    location: Location {
                        bus: 0,
                        enclosure: 0,
                        component_id: 0,
                        slot,
                    },
                },
                firmware,
            },
            identity: HardwareIdentity {
                product_id: "JUNO".to_string(),
                unique_id: 3,
            },
            protocol: ProtocolVersion::LEGACY,
            image_file: None,
            current_rev: "1.0".to_string(),
            image_rev: None,
            force_flags: ForceFlags::NONE,
            retry_count: 0,
        }
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut store = WorkItemStore::default();
        assert_eq!(store.insert(new_item(0, FirmwareTarget::Main)), Some(0));
        assert_eq!(store.insert(new_item(0, FirmwareTarget::Main)), None);
        assert_eq!(store.insert(new_item(0, FirmwareTarget::Cpld)), Some(1));
        assert_eq!(store.insert(new_item(1, FirmwareTarget::Main)), Some(2));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn take_and_put_back_preserve_order_and_key() {
        let mut store = WorkItemStore::default();
        let first = new_item(0, FirmwareTarget::Cpld);
        let second = new_item(0, FirmwareTarget::Main);
        let key = first.target;
        store.insert(first);
        store.insert(second);

        let item = store.take(0).unwrap();
        assert!(store.get(&key).is_none());
        // While taken, the key is free, but the engine never inserts during
        // a pass.
        store.put_back(item);
        assert_eq!(store.get(&key).map(|item| item.seq), Some(0));
        assert_eq!(store.seqs(), vec![0, 1]);

        let device = key.device;
        assert_eq!(store.for_device(&device).count(), 2);
        assert!(store.contains_device(&device));

        drop(store.take(0));
        drop(store.take(1));
        assert!(store.is_empty());
        assert!(!store.contains_device(&device));
    }
}
