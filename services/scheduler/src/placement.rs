//! Host selection for non-pinned slots.
//!
//! The policy spreads a process type across hosts first and balances total
//! load second: pick the active host with the fewest instances of the same
//! process type, then the fewest jobs overall, then the lowest host ID.

use std::collections::{BTreeMap, HashMap};

use convoy_id::HostId;

use crate::hosts::HostSet;
use crate::store::{JobStore, TypeKey};

/// Load accounting for one decision batch.
///
/// Built from a snapshot and updated as the batch assigns or frees hosts, so
/// several placements in one batch see each other.
#[derive(Debug, Clone, Default)]
pub struct Placer {
    load: BTreeMap<HostId, usize>,
    by_type: HashMap<TypeKey, HashMap<HostId, usize>>,
}

impl Placer {
    pub fn new(store: &JobStore, hosts: &HostSet) -> Self {
        let mut placer = Self {
            load: hosts.active().map(|h| (h.host_id.clone(), 0)).collect(),
            by_type: HashMap::new(),
        };
        for record in store.records().filter(|r| r.is_on_host()) {
            if let Some(host_id) = &record.host_id {
                placer.assign(host_id, &record.type_key());
            }
        }
        placer
    }

    fn type_count(&self, host_id: &HostId, key: &TypeKey) -> usize {
        self.by_type
            .get(key)
            .and_then(|hosts| hosts.get(host_id))
            .copied()
            .unwrap_or(0)
    }

    /// Best host for a job of `key`, without reserving it.
    pub fn choose(&self, key: &TypeKey) -> Option<HostId> {
        self.load
            .iter()
            .min_by_key(|(host_id, total)| (self.type_count(host_id, key), **total, *host_id))
            .map(|(host_id, _)| host_id.clone())
    }

    /// Choose a host and count the new job against it.
    pub fn place(&mut self, key: &TypeKey) -> Option<HostId> {
        let host_id = self.choose(key)?;
        self.assign(&host_id, key);
        Some(host_id)
    }

    /// Count a job against a host. Inactive hosts are ignored.
    pub fn assign(&mut self, host_id: &HostId, key: &TypeKey) {
        let Some(total) = self.load.get_mut(host_id) else {
            return;
        };
        *total += 1;
        *self
            .by_type
            .entry(key.clone())
            .or_default()
            .entry(host_id.clone())
            .or_insert(0) += 1;
    }

    /// Stop counting a job against a host.
    pub fn release(&mut self, host_id: &HostId, key: &TypeKey) {
        if let Some(total) = self.load.get_mut(host_id) {
            *total = total.saturating_sub(1);
        }
        if let Some(count) = self
            .by_type
            .get_mut(key)
            .and_then(|hosts| hosts.get_mut(host_id))
        {
            *count = count.saturating_sub(1);
        }
    }

    /// Jobs counted against a host.
    pub fn load(&self, host_id: &HostId) -> usize {
        self.load.get(host_id).copied().unwrap_or(0)
    }
}
