//! Host Membership Tracker state.
//!
//! An event-sourced host set: hosts only leave on an explicit removal event.
//! Removed hosts are kept as inactive so records that ran on them can still
//! be resolved.

use std::collections::BTreeMap;

use convoy_id::HostId;
use serde::Serialize;

/// A worker host known to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct Host {
    pub host_id: HostId,

    /// Agent address (`host:port`).
    pub address: String,

    pub active: bool,
}

/// Known hosts, ordered by ID.
#[derive(Debug, Default, Clone)]
pub struct HostSet {
    hosts: BTreeMap<HostId, Host>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host as active. Returns true if the active set changed.
    ///
    /// Re-adding an active host only refreshes its address.
    pub fn add(&mut self, host_id: HostId, address: impl Into<String>) -> bool {
        let address = address.into();
        match self.hosts.get_mut(&host_id) {
            Some(host) => {
                host.address = address;
                let changed = !host.active;
                host.active = true;
                changed
            }
            None => {
                self.hosts.insert(
                    host_id.clone(),
                    Host {
                        host_id,
                        address,
                        active: true,
                    },
                );
                true
            }
        }
    }

    /// Mark a host inactive. Returns true if the active set changed.
    pub fn remove(&mut self, host_id: &HostId) -> bool {
        match self.hosts.get_mut(host_id) {
            Some(host) if host.active => {
                host.active = false;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, host_id: &HostId) -> Option<&Host> {
        self.hosts.get(host_id)
    }

    pub fn is_active(&self, host_id: &HostId) -> bool {
        self.hosts.get(host_id).is_some_and(|h| h.active)
    }

    /// Active hosts in ID order.
    pub fn active(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values().filter(|h| h.active)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn all(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }
}
