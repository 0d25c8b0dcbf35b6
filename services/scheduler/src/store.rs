//! Job State Store.
//!
//! In-memory authoritative record of every job the scheduler created. Only
//! the scheduler core mutates it; everything else reads it through a
//! [`Snapshot`](crate::plan::Snapshot).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use convoy_events::{FormationKey, JobSpec, JobState};
use convoy_id::{AppId, HostId, JobId, ReleaseId};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{SchedulerError, SchedulerResult};
use crate::hosts::HostSet;

/// Terminal records kept for queries before the oldest are dropped.
pub const MAX_RETAINED_TERMINAL: usize = 10_000;

// =============================================================================
// Slot Identity
// =============================================================================

/// Logical identity of a recurring instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotKey {
    /// Counted instance of a non-omni process type.
    Formation {
        app_id: AppId,
        release_id: ReleaseId,
        process_type: String,
        index: u32,
    },

    /// The single instance of an omni process type on one host.
    Omni {
        app_id: AppId,
        release_id: ReleaseId,
        process_type: String,
        host_id: HostId,
    },

    /// A one-off job; never replaced.
    OneOff { token: JobId },
}

impl SlotKey {
    pub fn is_one_off(&self) -> bool {
        matches!(self, Self::OneOff { .. })
    }

    pub fn is_omni(&self) -> bool {
        matches!(self, Self::Omni { .. })
    }

    /// Instance index of a formation slot.
    pub fn index(&self) -> Option<u32> {
        match self {
            Self::Formation { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Host an omni slot is pinned to.
    pub fn pinned_host(&self) -> Option<&HostId> {
        match self {
            Self::Omni { host_id, .. } => Some(host_id),
            _ => None,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Formation {
                app_id,
                release_id,
                process_type,
                index,
            } => write!(f, "{app_id}/{release_id}/{process_type}[{index}]"),
            Self::Omni {
                app_id,
                release_id,
                process_type,
                host_id,
            } => write!(f, "{app_id}/{release_id}/{process_type}@{host_id}"),
            Self::OneOff { token } => write!(f, "oneoff/{token}"),
        }
    }
}

/// A process type within one formation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    pub formation: FormationKey,
    pub process_type: String,
}

impl TypeKey {
    pub fn new(formation: FormationKey, process_type: impl Into<String>) -> Self {
        Self {
            formation,
            process_type: process_type.into(),
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.formation, self.process_type)
    }
}

// =============================================================================
// Job Records
// =============================================================================

/// One instantiation of a slot.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub slot: SlotKey,

    /// Assigned at dispatch; `None` while pending.
    pub host_id: Option<HostId>,

    pub state: JobState,

    /// Consecutive unplanned terminations of this slot before this one.
    pub restart_count: u32,

    /// When a backoff timer is outstanding, the time it fires.
    pub next_restart_at: Option<Instant>,

    pub exit_status: Option<i32>,

    /// Slot generation at creation. Timers tagged with another generation are
    /// stale.
    pub generation: u64,

    /// The scheduler asked for this instantiation to stop.
    pub planned_stop: bool,

    /// A stop dispatch exhausted its attempts and must be sent again.
    pub stop_retry: bool,

    /// A start call to the agent has not returned yet. Stops wait for it.
    pub start_pending: bool,

    /// When the current instantiation was last reported up.
    pub up_since: Option<Instant>,

    /// An `up` event went out for this instantiation.
    pub published_up: bool,

    pub spec: JobSpec,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl JobRecord {
    /// Create a pending record.
    pub fn pending(
        job_id: JobId,
        slot: SlotKey,
        spec: JobSpec,
        restart_count: u32,
        generation: u64,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            job_id,
            slot,
            host_id: None,
            state: JobState::Pending,
            restart_count,
            next_restart_at: None,
            exit_status: None,
            generation,
            planned_stop: false,
            stop_retry: false,
            start_pending: false,
            up_since: None,
            published_up: false,
            spec,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn app_id(&self) -> AppId {
        self.spec.app_id
    }

    pub fn release_id(&self) -> ReleaseId {
        self.spec.release_id
    }

    /// Process type name; empty for one-off jobs started without one.
    pub fn process_type(&self) -> &str {
        self.spec.process_type.as_deref().unwrap_or("")
    }

    pub fn type_key(&self) -> TypeKey {
        TypeKey::new(
            FormationKey {
                app_id: self.app_id(),
                release_id: self.release_id(),
            },
            self.process_type(),
        )
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Pending, not yet dispatched and not waiting on a backoff timer.
    pub fn is_awaiting_host(&self) -> bool {
        self.state == JobState::Pending && self.host_id.is_none() && self.next_restart_at.is_none()
    }

    /// Occupies a host: dispatched and not yet terminal.
    pub fn is_on_host(&self) -> bool {
        matches!(
            self.state,
            JobState::Starting | JobState::Up | JobState::Stopping
        )
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

/// Read-only view of a job record, as served by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct JobView {
    pub job_id: JobId,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    #[serde(rename = "type")]
    pub process_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<HostId>,
    pub state: JobState,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    pub omni: bool,
    pub one_off: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            app_id: record.app_id(),
            release_id: record.release_id(),
            process_type: record.process_type().to_string(),
            host_id: record.host_id.clone(),
            state: record.state,
            restart_count: record.restart_count,
            exit_status: record.exit_status,
            omni: record.slot.is_omni(),
            one_off: record.slot.is_one_off(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Per-slot bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
struct SlotEntry {
    generation: u64,

    /// The live record holding the slot.
    holder: Option<JobId>,

    /// Records in the store, live or retained, instantiating the slot.
    records: usize,
}

/// All job records, keyed by job ID.
///
/// Records not yet retired are indexed separately so per-message scans skip
/// retained terminal history.
#[derive(Debug, Default)]
pub struct JobStore {
    records: BTreeMap<JobId, JobRecord>,
    active: BTreeSet<JobId>,
    slots: HashMap<SlotKey, SlotEntry>,
    retired: VecDeque<JobId>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &JobId) -> Option<&JobRecord> {
        self.records.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &JobId) -> SchedulerResult<&mut JobRecord> {
        self.records
            .get_mut(job_id)
            .ok_or(SchedulerError::UnknownJob(*job_id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Slots with bookkeeping, i.e. held or still referenced by a record.
    pub fn tracked_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.values()
    }

    /// Records not yet retired.
    fn unretired(&self) -> impl Iterator<Item = &JobRecord> {
        self.active.iter().filter_map(|id| self.records.get(id))
    }

    pub fn live(&self) -> impl Iterator<Item = &JobRecord> {
        self.unretired().filter(|r| r.is_live())
    }

    /// Live records occupying counted formation slots of a type.
    pub fn live_formation_slots<'a>(
        &'a self,
        key: &'a TypeKey,
    ) -> impl Iterator<Item = &'a JobRecord> + 'a {
        self.live()
            .filter(move |r| matches!(r.slot, SlotKey::Formation { .. }) && r.type_key() == *key)
    }

    /// Live records occupying omni slots of a type.
    pub fn live_omni_slots<'a>(
        &'a self,
        key: &'a TypeKey,
    ) -> impl Iterator<Item = &'a JobRecord> + 'a {
        self.live()
            .filter(move |r| r.slot.is_omni() && r.type_key() == *key)
    }

    /// The live record currently holding a slot, if any.
    pub fn live_for_slot(&self, slot: &SlotKey) -> Option<&JobRecord> {
        self.slots
            .get(slot)
            .and_then(|entry| entry.holder)
            .and_then(|job_id| self.records.get(&job_id))
            .filter(|r| r.is_live())
    }

    /// Records dispatched to a host and not yet terminal.
    pub fn on_host<'a>(&'a self, host_id: &'a HostId) -> impl Iterator<Item = &'a JobRecord> + 'a {
        self.unretired()
            .filter(move |r| r.is_on_host() && r.host_id.as_ref() == Some(host_id))
    }

    pub fn for_app(&self, app_id: &AppId) -> impl Iterator<Item = &JobRecord> {
        let app_id = *app_id;
        self.records.values().filter(move |r| r.app_id() == app_id)
    }

    /// Process types that still hold live or stopping records for a formation.
    pub fn process_types(&self, formation: &FormationKey) -> Vec<String> {
        let mut types: Vec<String> = self
            .unretired()
            .filter(|r| !r.slot.is_one_off() && !r.state.is_terminal())
            .filter(|r| r.app_id() == formation.app_id && r.release_id() == formation.release_id)
            .map(|r| r.process_type().to_string())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Current generation of a slot (0 if never instantiated).
    pub fn slot_generation(&self, slot: &SlotKey) -> u64 {
        self.slots.get(slot).map_or(0, |entry| entry.generation)
    }

    /// Bump and return a slot's generation.
    pub fn next_generation(&mut self, slot: &SlotKey) -> u64 {
        let entry = self.slots.entry(slot.clone()).or_default();
        entry.generation += 1;
        entry.generation
    }

    /// Add a new record. Fails if the job ID exists or its slot is already
    /// held by a live record.
    pub fn insert(&mut self, record: JobRecord) -> SchedulerResult<()> {
        if self.records.contains_key(&record.job_id) {
            return Err(SchedulerError::InvariantViolation(format!(
                "duplicate job id {}",
                record.job_id
            )));
        }
        if let Some(holder) = self.live_for_slot(&record.slot) {
            return Err(SchedulerError::InvariantViolation(format!(
                "slot {} already held by {}",
                record.slot, holder.job_id
            )));
        }

        let entry = self.slots.entry(record.slot.clone()).or_default();
        entry.records += 1;
        if record.is_live() {
            entry.holder = Some(record.job_id);
        }
        self.active.insert(record.job_id);
        self.records.insert(record.job_id, record);
        Ok(())
    }

    /// Note that a record reached a terminal state, dropping the oldest
    /// terminal records past the retention cap.
    ///
    /// A slot's bookkeeping goes with the last record that references it.
    pub fn retire(&mut self, job_id: JobId) {
        if !self.active.remove(&job_id) {
            return;
        }
        if let Some(record) = self.records.get(&job_id) {
            if let Some(entry) = self.slots.get_mut(&record.slot) {
                if entry.holder == Some(job_id) {
                    entry.holder = None;
                }
            }
        }

        self.retired.push_back(job_id);
        while self.retired.len() > MAX_RETAINED_TERMINAL {
            let Some(old) = self.retired.pop_front() else {
                break;
            };
            let Some(record) = self.records.remove(&old) else {
                continue;
            };
            if let Some(entry) = self.slots.get_mut(&record.slot) {
                entry.records = entry.records.saturating_sub(1);
                if entry.records == 0 && entry.holder.is_none() {
                    self.slots.remove(&record.slot);
                }
            }
        }
    }

    /// Verify structural invariants against the current host set.
    pub fn check_invariants(&self, hosts: &HostSet) -> SchedulerResult<()> {
        for record in self.unretired() {
            if record.is_live()
                && self
                    .slots
                    .get(&record.slot)
                    .and_then(|entry| entry.holder)
                    != Some(record.job_id)
            {
                return Err(SchedulerError::InvariantViolation(format!(
                    "slot {} is not held by its live job {}",
                    record.slot, record.job_id
                )));
            }

            match (&record.host_id, record.state) {
                (Some(_), JobState::Pending) => {
                    return Err(SchedulerError::InvariantViolation(format!(
                        "pending job {} is assigned a host",
                        record.job_id
                    )));
                }
                (None, state) if record.is_on_host() => {
                    return Err(SchedulerError::InvariantViolation(format!(
                        "{state} job {} has no host",
                        record.job_id
                    )));
                }
                (Some(host_id), _) if record.is_on_host() && hosts.get(host_id).is_none() => {
                    return Err(SchedulerError::InvariantViolation(format!(
                        "job {} is on unknown host {host_id}",
                        record.job_id
                    )));
                }
                _ => {}
            }

            if let (Some(pinned), Some(host_id)) = (record.slot.pinned_host(), &record.host_id) {
                if pinned != host_id {
                    return Err(SchedulerError::InvariantViolation(format!(
                        "omni job {} pinned to {pinned} runs on {host_id}",
                        record.job_id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(app_id: AppId, release_id: ReleaseId, process_type: &str) -> JobSpec {
        JobSpec {
            job_id: JobId::new(),
            app_id,
            release_id,
            process_type: Some(process_type.to_string()),
            cmd: vec![],
            env: Default::default(),
        }
    }

    fn formation_record(app_id: AppId, release_id: ReleaseId, index: u32) -> JobRecord {
        let spec = spec(app_id, release_id, "web");
        let slot = SlotKey::Formation {
            app_id,
            release_id,
            process_type: "web".to_string(),
            index,
        };
        JobRecord::pending(spec.job_id, slot, spec, 0, 1)
    }

    #[test]
    fn test_insert_rejects_second_live_record_for_slot() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let mut store = JobStore::new();
        store.insert(formation_record(app_id, release_id, 0)).unwrap();

        let err = store
            .insert(formation_record(app_id, release_id, 0))
            .unwrap_err();
        assert!(err.is_fatal());

        store.insert(formation_record(app_id, release_id, 1)).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_terminal_record_frees_slot() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let mut store = JobStore::new();
        let first = formation_record(app_id, release_id, 0);
        let first_id = first.job_id;
        store.insert(first).unwrap();

        store.get_mut(&first_id).unwrap().state = JobState::Crashed;
        store.retire(first_id);

        store.insert(formation_record(app_id, release_id, 0)).unwrap();
        let key = TypeKey::new(FormationKey { app_id, release_id }, "web");
        assert_eq!(store.live_formation_slots(&key).count(), 1);
    }

    #[test]
    fn test_generations_increase_per_slot() {
        let mut store = JobStore::new();
        let slot = SlotKey::OneOff {
            token: JobId::new(),
        };
        assert_eq!(store.slot_generation(&slot), 0);
        assert_eq!(store.next_generation(&slot), 1);
        assert_eq!(store.next_generation(&slot), 2);
        assert_eq!(store.slot_generation(&slot), 2);
    }

    #[test]
    fn test_invariants_flag_job_on_unknown_host() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let mut store = JobStore::new();
        let mut record = formation_record(app_id, release_id, 0);
        record.state = JobState::Up;
        record.host_id = Some(HostId::parse("ghost").unwrap());
        store.insert(record).unwrap();

        let err = store.check_invariants(&HostSet::new()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvariantViolation(_)));

        let mut hosts = HostSet::new();
        hosts.add(HostId::parse("ghost").unwrap(), "10.0.0.9:1113");
        store.check_invariants(&hosts).unwrap();
    }

    #[test]
    fn test_invariants_flag_misplaced_omni_job() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let a = HostId::parse("a").unwrap();
        let b = HostId::parse("b").unwrap();
        let mut hosts = HostSet::new();
        hosts.add(a.clone(), "a:1113");
        hosts.add(b.clone(), "b:1113");

        let spec = spec(app_id, release_id, "logger");
        let slot = SlotKey::Omni {
            app_id,
            release_id,
            process_type: "logger".to_string(),
            host_id: a,
        };
        let mut record = JobRecord::pending(spec.job_id, slot, spec, 0, 1);
        record.state = JobState::Starting;
        record.host_id = Some(b);

        let mut store = JobStore::new();
        store.insert(record).unwrap();
        assert!(store.check_invariants(&hosts).is_err());
    }

    #[test]
    fn test_retire_prunes_oldest_terminal_records() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let mut store = JobStore::new();
        let mut first = None;
        for _ in 0..=MAX_RETAINED_TERMINAL {
            let mut record = formation_record(app_id, release_id, 0);
            record.state = JobState::Down;
            let job_id = record.job_id;
            first.get_or_insert(job_id);
            store.insert(record).unwrap();
            store.retire(job_id);
        }
        assert_eq!(store.len(), MAX_RETAINED_TERMINAL);
        assert!(store.get(&first.unwrap()).is_none());
    }

    #[test]
    fn test_slot_bookkeeping_leaves_with_pruned_records() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let mut store = JobStore::new();
        for _ in 0..MAX_RETAINED_TERMINAL + 5 {
            let spec = spec(app_id, release_id, "once");
            let slot = SlotKey::OneOff { token: spec.job_id };
            let generation = store.next_generation(&slot);
            let mut record = JobRecord::pending(spec.job_id, slot, spec, 0, generation);
            record.state = JobState::Down;
            let job_id = record.job_id;
            store.insert(record).unwrap();
            store.retire(job_id);
        }
        assert_eq!(store.len(), MAX_RETAINED_TERMINAL);
        assert_eq!(store.tracked_slots(), MAX_RETAINED_TERMINAL);
    }

    #[test]
    fn test_reused_slot_keeps_generation_while_referenced() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let mut store = JobStore::new();
        let slot = formation_record(app_id, release_id, 0).slot;
        for _ in 0..3 {
            let generation = store.next_generation(&slot);
            let mut record = formation_record(app_id, release_id, 0);
            record.generation = generation;
            let job_id = record.job_id;
            store.insert(record).unwrap();
            store.get_mut(&job_id).unwrap().state = JobState::Crashed;
            store.retire(job_id);
        }
        assert_eq!(store.slot_generation(&slot), 3);
        assert_eq!(store.tracked_slots(), 1);
    }

    #[test]
    fn test_retired_records_leave_live_views() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let a = HostId::parse("a").unwrap();
        let mut store = JobStore::new();
        let mut record = formation_record(app_id, release_id, 0);
        record.state = JobState::Up;
        record.host_id = Some(a.clone());
        let (job_id, slot) = (record.job_id, record.slot.clone());
        store.insert(record).unwrap();
        assert_eq!(store.live_for_slot(&slot).map(|r| r.job_id), Some(job_id));
        assert_eq!(store.on_host(&a).count(), 1);

        store.get_mut(&job_id).unwrap().state = JobState::Down;
        store.retire(job_id);
        assert!(store.live_for_slot(&slot).is_none());
        assert_eq!(store.on_host(&a).count(), 0);
        assert_eq!(store.live().count(), 0);
        assert!(store.get(&job_id).is_some());
    }

    #[test]
    fn test_process_types_include_stopping_records() {
        let (app_id, release_id) = (AppId::new(), ReleaseId::new());
        let mut store = JobStore::new();
        let mut record = formation_record(app_id, release_id, 0);
        record.state = JobState::Stopping;
        record.host_id = Some(HostId::parse("a").unwrap());
        store.insert(record).unwrap();

        assert_eq!(
            store.process_types(&FormationKey { app_id, release_id }),
            vec!["web".to_string()]
        );
    }
}
