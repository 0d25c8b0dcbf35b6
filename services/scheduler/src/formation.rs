//! Formation Reconciler.
//!
//! Diffs each process type's desired count against its live slots and plans
//! spawns or planned stops. Reconciling an unchanged formation plans nothing.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use convoy_events::{Formation, FormationKey, JobState};
use convoy_id::JobId;
use convoy_reconcile::{select_for_stop, StopPriority};
use tracing::{debug, instrument, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::omni;
use crate::plan::Plan;
use crate::store::{JobRecord, SlotKey, TypeKey};

/// Largest desired count accepted for one process type.
pub const MAX_INSTANCES_PER_TYPE: u32 = 10_000;

/// Current desired state, keyed by app and release.
#[derive(Debug, Default, Clone)]
pub struct FormationTable {
    formations: BTreeMap<FormationKey, Formation>,
}

impl FormationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a formation, returning the one it replaced.
    pub fn put(&mut self, formation: Formation) -> Option<Formation> {
        self.formations.insert(formation.key(), formation)
    }

    pub fn get(&self, key: &FormationKey) -> Option<&Formation> {
        self.formations.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Formation> {
        self.formations.values()
    }

    pub fn len(&self) -> usize {
        self.formations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formations.is_empty()
    }
}

/// Plan the changes that bring one formation to its desired counts.
///
/// Types named by the formation and types that still hold records are both
/// considered, so a type dropped from the formation is stopped. A failure on
/// one type is logged and does not affect the others.
#[instrument(skip_all, fields(formation = %formation.key()))]
pub fn reconcile(plan: &mut Plan<'_>, formation: &Formation) {
    let snap = plan.snapshot();
    let mut types: BTreeSet<String> = formation.processes.keys().cloned().collect();
    types.extend(snap.store.process_types(&formation.key()));

    for process_type in &types {
        let result = if formation.is_omni(process_type) {
            omni::reconcile_type(plan, formation, process_type)
        } else {
            reconcile_type(plan, formation, process_type)
        };
        if let Err(e) = result {
            warn!(
                formation = %formation.key(),
                process_type = %process_type,
                error = %e,
                "Failed to reconcile process type"
            );
        }
    }
}

/// Reject process types no slot can be built for.
pub fn validate_type(formation: &Formation, process_type: &str) -> SchedulerResult<()> {
    if process_type.is_empty() {
        return Err(SchedulerError::InvalidRequest(
            "process type name must not be empty".to_string(),
        ));
    }
    let desired = formation.desired(process_type);
    if desired > MAX_INSTANCES_PER_TYPE {
        return Err(SchedulerError::InvalidRequest(format!(
            "desired count {desired} for {process_type} exceeds {MAX_INSTANCES_PER_TYPE}"
        )));
    }
    Ok(())
}

fn reconcile_type(
    plan: &mut Plan<'_>,
    formation: &Formation,
    process_type: &str,
) -> SchedulerResult<()> {
    validate_type(formation, process_type)?;

    let snap = plan.snapshot();
    let key = TypeKey::new(formation.key(), process_type);

    // Per-host instances left over from when the type was omni.
    let stale: Vec<&JobRecord> = snap.store.live_omni_slots(&key).collect();
    for record in stale {
        plan.stop(record);
    }

    let desired = formation.desired(process_type) as usize;
    let live: Vec<&JobRecord> = snap
        .store
        .live_formation_slots(&key)
        .filter(|r| !plan.is_ended(&r.job_id))
        .collect();

    match live.len().cmp(&desired) {
        Ordering::Equal => {}
        Ordering::Less => {
            let missing = desired - live.len();
            debug!(type_key = %key, missing, "Scaling up");
            for _ in 0..missing {
                let index = plan.next_index(&key);
                let job_id = JobId::new();
                let slot = SlotKey::Formation {
                    app_id: formation.app_id,
                    release_id: formation.release_id,
                    process_type: process_type.to_string(),
                    index,
                };
                plan.spawn(slot, formation.job_spec(job_id, process_type), 0, Duration::ZERO);
            }
        }
        Ordering::Greater => {
            let excess = live.len() - desired;
            debug!(type_key = %key, excess, "Scaling down");
            let victims = select_for_stop(live, excess, |r| {
                (stop_priority(r.state), r.slot.index().unwrap_or(0))
            });
            for record in victims {
                plan.stop(record);
            }
        }
    }
    Ok(())
}

/// Records that have not reached a host are stopped before running ones.
pub fn stop_priority(state: JobState) -> StopPriority {
    match state {
        JobState::Pending => StopPriority::Unplaced,
        JobState::Starting => StopPriority::Starting,
        _ => StopPriority::Up,
    }
}
