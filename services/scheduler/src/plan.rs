//! Snapshots and decisions.
//!
//! Decision functions never mutate scheduler state. They read a [`Snapshot`]
//! and append [`Decision`]s to a [`Plan`]; the scheduler core applies the
//! finished plan in one step.

use std::collections::HashSet;
use std::time::Duration;

use convoy_events::{JobSpec, JobState};
use convoy_id::{HostId, JobId};
use convoy_reconcile::BackoffPolicy;
use tokio::time::Instant;
use tracing::debug;

use crate::formation::FormationTable;
use crate::hosts::HostSet;
use crate::placement::Placer;
use crate::store::{JobRecord, JobStore, SlotKey, TypeKey};

/// Immutable view of scheduler state for one decision.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub store: &'a JobStore,
    pub hosts: &'a HostSet,
    pub formations: &'a FormationTable,
    pub backoff: BackoffPolicy,
    pub now: Instant,
}

/// A new instantiation of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawn {
    pub job_id: JobId,
    pub slot: SlotKey,
    pub spec: JobSpec,
    pub restart_count: u32,

    /// Backoff before the instantiation may be dispatched.
    pub delay: Duration,

    /// Host chosen for immediate dispatch. `None` with a zero delay means no
    /// host was eligible.
    pub host_id: Option<HostId>,
}

/// One intended change to scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Insert a pending record, then dispatch it or arm its backoff timer.
    Spawn(Spawn),

    /// Dispatch a pending record to a host.
    Place { job_id: JobId, host_id: HostId },

    /// A backoff timer elapsed but no host is eligible yet.
    AwaitHost { job_id: JobId },

    /// Apply an agent-observed non-terminal state.
    Transition { job_id: JobId, state: JobState },

    /// Ask the agent to stop a dispatched record.
    Stop { job_id: JobId },

    /// Re-send a stop whose dispatch failed.
    RetryStop { job_id: JobId },

    /// Drop a pending record that never reached a host.
    Cancel { job_id: JobId },

    /// Stop a process the agent still runs for an ended record.
    Reap { job_id: JobId, host_id: HostId },

    /// Record the end of an instantiation.
    Terminate {
        job_id: JobId,
        state: JobState,
        exit_status: Option<i32>,
    },
}

/// Decisions accumulated against one snapshot.
///
/// Tracks what the batch already decided so later steps see earlier ones:
/// slots claimed by spawns, records ended, host load.
#[derive(Debug)]
pub struct Plan<'a> {
    snap: Snapshot<'a>,
    placer: Placer,
    ended: HashSet<JobId>,
    claimed: HashSet<SlotKey>,
    decisions: Vec<Decision>,
}

impl<'a> Plan<'a> {
    pub fn new(snap: Snapshot<'a>) -> Self {
        Self {
            placer: Placer::new(snap.store, snap.hosts),
            snap,
            ended: HashSet::new(),
            claimed: HashSet::new(),
            decisions: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> Snapshot<'a> {
        self.snap
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn into_decisions(self) -> Vec<Decision> {
        self.decisions
    }

    /// The record was stopped, cancelled or terminated in this batch.
    pub fn is_ended(&self, job_id: &JobId) -> bool {
        self.ended.contains(job_id)
    }

    /// A live record or an earlier spawn in this batch holds the slot.
    pub fn slot_held(&self, slot: &SlotKey) -> bool {
        self.claimed.contains(slot)
            || self
                .snap
                .store
                .live_for_slot(slot)
                .is_some_and(|r| !self.is_ended(&r.job_id))
    }

    /// Live counted instances of a non-omni type after this batch.
    pub fn formation_live(&self, key: &TypeKey) -> usize {
        let existing = self
            .snap
            .store
            .live_formation_slots(key)
            .filter(|r| !self.is_ended(&r.job_id))
            .count();
        let spawned = self
            .claimed
            .iter()
            .filter(|slot| slot_type_matches(slot, key))
            .count();
        existing + spawned
    }

    /// Lowest instance index of a type not held after this batch.
    pub fn next_index(&self, key: &TypeKey) -> u32 {
        let used: HashSet<u32> = self
            .snap
            .store
            .live_formation_slots(key)
            .filter(|r| !self.is_ended(&r.job_id))
            .filter_map(|r| r.slot.index())
            .chain(
                self.claimed
                    .iter()
                    .filter(|slot| slot_type_matches(slot, key))
                    .filter_map(SlotKey::index),
            )
            .collect();
        (0..).find(|i| !used.contains(i)).unwrap_or(u32::MAX)
    }

    fn choose_host(&mut self, slot: &SlotKey, key: &TypeKey) -> Option<HostId> {
        match slot.pinned_host() {
            Some(host_id) if self.snap.hosts.is_active(host_id) => {
                self.placer.assign(host_id, key);
                Some(host_id.clone())
            }
            Some(_) => None,
            None => self.placer.place(key),
        }
    }

    /// Create a new instantiation of `slot` running `spec`.
    pub fn spawn(&mut self, slot: SlotKey, spec: JobSpec, restart_count: u32, delay: Duration) {
        let key = TypeKey::new(
            convoy_events::FormationKey {
                app_id: spec.app_id,
                release_id: spec.release_id,
            },
            spec.process_type.clone().unwrap_or_default(),
        );
        let host_id = if delay.is_zero() {
            self.choose_host(&slot, &key)
        } else {
            None
        };
        if delay.is_zero() && host_id.is_none() {
            debug!(slot = %slot, "No eligible active host, slot stays pending");
        }

        self.claimed.insert(slot.clone());
        self.decisions.push(Decision::Spawn(Spawn {
            job_id: spec.job_id,
            slot,
            spec,
            restart_count,
            delay,
            host_id,
        }));
    }

    /// Dispatch a pending record if a host is eligible.
    pub fn place_pending(&mut self, record: &JobRecord) {
        let key = record.type_key();
        match self.choose_host(&record.slot, &key) {
            Some(host_id) => self.decisions.push(Decision::Place {
                job_id: record.job_id,
                host_id,
            }),
            None if record.next_restart_at.is_some() => {
                self.decisions.push(Decision::AwaitHost {
                    job_id: record.job_id,
                });
            }
            None => {}
        }
    }

    /// Planned stop: cancel a pending record, stop a dispatched one.
    pub fn stop(&mut self, record: &JobRecord) {
        if !self.ended.insert(record.job_id) {
            return;
        }
        match record.state {
            JobState::Pending => self.decisions.push(Decision::Cancel {
                job_id: record.job_id,
            }),
            JobState::Starting | JobState::Up => {
                self.release_host(record);
                self.decisions.push(Decision::Stop {
                    job_id: record.job_id,
                });
            }
            _ => {}
        }
    }

    /// End an instantiation.
    pub fn terminate(&mut self, record: &JobRecord, state: JobState, exit_status: Option<i32>) {
        if !self.ended.insert(record.job_id) {
            return;
        }
        self.release_host(record);
        self.decisions.push(Decision::Terminate {
            job_id: record.job_id,
            state,
            exit_status,
        });
    }

    pub fn transition(&mut self, record: &JobRecord, state: JobState) {
        self.decisions.push(Decision::Transition {
            job_id: record.job_id,
            state,
        });
    }

    pub fn reap(&mut self, record: &JobRecord, host_id: &HostId) {
        self.decisions.push(Decision::Reap {
            job_id: record.job_id,
            host_id: host_id.clone(),
        });
    }

    pub fn retry_stop(&mut self, record: &JobRecord) {
        self.decisions.push(Decision::RetryStop {
            job_id: record.job_id,
        });
    }

    fn release_host(&mut self, record: &JobRecord) {
        if let Some(host_id) = &record.host_id {
            self.placer.release(host_id, &record.type_key());
        }
    }
}

fn slot_type_matches(slot: &SlotKey, key: &TypeKey) -> bool {
    match slot {
        SlotKey::Formation {
            app_id,
            release_id,
            process_type,
            ..
        } => {
            *app_id == key.formation.app_id
                && *release_id == key.formation.release_id
                && *process_type == key.process_type
        }
        _ => false,
    }
}
