//! Restart/Backoff Controller.
//!
//! Turns agent observations into state changes and decides whether an ended
//! instantiation is replaced. Planned stops are never replaced. An unplanned
//! termination of a formation or omni slot is replaced on the same slot after
//! `backoff.delay(restart_count)`; one-off slots are never replaced.

use std::collections::HashSet;
use std::time::Duration;

use convoy_events::{AgentJobState, AgentJobStatus, AgentReport, JobState};
use convoy_id::{HostId, JobId};
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentError;
use crate::error::{SchedulerError, SchedulerResult};
use crate::plan::Plan;
use crate::store::{JobRecord, SlotKey};

/// Why an instantiation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The agent reported the process exiting.
    Exit,

    /// The agent could not start the job.
    StartFailed,

    /// The agent no longer lists the job after reconnecting.
    Vanished,

    /// The host left the pool. Not charged to the slot's crash history.
    HostLost,
}

/// Apply a lifecycle report from a host agent.
#[instrument(skip_all, fields(job_id = %report.job_id, host_id = %host_id))]
pub fn on_report(plan: &mut Plan<'_>, host_id: &HostId, report: &AgentReport) -> SchedulerResult<()> {
    let snap = plan.snapshot();
    let record = snap
        .store
        .get(&report.job_id)
        .ok_or(SchedulerError::UnknownJob(report.job_id))?;

    if record.host_id.as_ref() != Some(host_id) {
        warn!(
            job_id = %report.job_id,
            host_id = %host_id,
            "Ignoring report from a host the job is not assigned to"
        );
        return Ok(());
    }

    observe(
        plan,
        record,
        report.resulting_state(),
        report.exit_status,
        TerminationCause::Exit,
    );
    Ok(())
}

/// Reconcile the store against an agent's full job listing.
///
/// Listed jobs are applied as reports, and listed jobs the store already
/// ended are stopped again. Jobs the store placed on the host that the agent
/// no longer lists have ended, unless their start call is still in flight.
#[instrument(skip_all, fields(host_id = %host_id, listed = jobs.len()))]
pub fn on_sync(plan: &mut Plan<'_>, host_id: &HostId, jobs: &[AgentJobStatus]) {
    let snap = plan.snapshot();
    let mut listed = HashSet::new();

    for status in jobs {
        listed.insert(status.job_id);
        let Some(record) = snap.store.get(&status.job_id) else {
            warn!(job_id = %status.job_id, "Agent lists unknown job");
            continue;
        };
        if record.host_id.as_ref() != Some(host_id) {
            warn!(job_id = %status.job_id, "Agent lists job assigned elsewhere");
            continue;
        }

        let running = matches!(status.state, AgentJobState::Starting | AgentJobState::Up);
        if running && record.state.is_terminal() {
            warn!(job_id = %record.job_id, state = %record.state, "Agent still runs an ended job, stopping it");
            plan.reap(record, host_id);
            continue;
        }
        if running && record.state == JobState::Stopping {
            plan.retry_stop(record);
            continue;
        }
        let state = AgentReport {
            job_id: status.job_id,
            state: status.state,
            exit_status: None,
        }
        .resulting_state();
        observe(plan, record, state, None, TerminationCause::Exit);
    }

    let vanished: Vec<&JobRecord> = snap
        .store
        .on_host(host_id)
        .filter(|r| !listed.contains(&r.job_id))
        .collect();
    for record in vanished {
        if record.start_pending {
            debug!(job_id = %record.job_id, "Unlisted job has a start in flight, keeping it");
            continue;
        }
        info!(job_id = %record.job_id, "Job missing from agent listing");
        terminate(plan, record, JobState::Down, None, TerminationCause::Vanished);
    }
}

/// A start dispatch exhausted its attempts.
pub fn on_start_failed(plan: &mut Plan<'_>, job_id: &JobId, host_id: &HostId, error: &AgentError) {
    let snap = plan.snapshot();
    let Some(record) = snap.store.get(job_id) else {
        return;
    };
    if record.host_id.as_ref() != Some(host_id) || !record.is_on_host() {
        debug!(job_id = %job_id, "Start failure for a job that moved on, ignoring");
        return;
    }

    warn!(job_id = %job_id, host_id = %host_id, error = %error, "Job failed to start");
    let state = if record.state == JobState::Stopping {
        JobState::Down
    } else {
        JobState::Crashed
    };
    terminate(plan, record, state, None, TerminationCause::StartFailed);
}

/// A backoff timer fired.
///
/// Stale timers are no-ops: the record must still be pending and carry the
/// slot's current generation.
#[instrument(skip_all, fields(job_id = %job_id, generation = generation))]
pub fn on_timer(plan: &mut Plan<'_>, job_id: &JobId, generation: u64) {
    let snap = plan.snapshot();
    let Some(record) = snap.store.get(job_id) else {
        debug!(job_id = %job_id, "Timer for a pruned job");
        return;
    };
    let current = snap.store.slot_generation(&record.slot);
    if record.state != JobState::Pending
        || record.next_restart_at.is_none()
        || record.generation != generation
        || current != generation
    {
        debug!(
            job_id = %job_id,
            generation,
            current,
            state = %record.state,
            "Stale backoff timer"
        );
        return;
    }

    if !pending_wanted(plan, record) {
        info!(job_id = %job_id, slot = %record.slot, "Slot no longer desired, dropping restart");
        plan.stop(record);
        return;
    }
    plan.place_pending(record);
}

/// End an instantiation and plan its replacement if one is due.
pub fn terminate(
    plan: &mut Plan<'_>,
    record: &JobRecord,
    state: JobState,
    exit_status: Option<i32>,
    cause: TerminationCause,
) {
    let planned = record.planned_stop || record.state == JobState::Stopping;
    plan.terminate(record, state, exit_status);

    if planned {
        debug!(job_id = %record.job_id, state = %state, "Planned stop completed");
        return;
    }
    if !replacement_wanted(plan, record) {
        debug!(job_id = %record.job_id, slot = %record.slot, "Slot not replaced");
        return;
    }

    let snap = plan.snapshot();
    let survived = record
        .up_since
        .is_some_and(|t| snap.backoff.survived(snap.now.saturating_duration_since(t)));
    let prior = if survived { 0 } else { record.restart_count };

    let (restart_count, delay) = match cause {
        TerminationCause::HostLost => (0, Duration::ZERO),
        _ => (prior.saturating_add(1), snap.backoff.delay(prior)),
    };

    info!(
        job_id = %record.job_id,
        slot = %record.slot,
        state = %state,
        cause = ?cause,
        restart_count,
        delay_ms = delay.as_millis() as u64,
        "Scheduling replacement"
    );

    let mut spec = record.spec.clone();
    spec.job_id = JobId::new();
    plan.spawn(record.slot.clone(), spec, restart_count, delay);
}

fn observe(
    plan: &mut Plan<'_>,
    record: &JobRecord,
    state: JobState,
    exit_status: Option<i32>,
    cause: TerminationCause,
) {
    match (record.state, state) {
        (current, _) if current.is_terminal() => {
            debug!(job_id = %record.job_id, state = %state, "Report for ended job, ignoring");
        }
        (JobState::Starting, JobState::Up) => plan.transition(record, JobState::Up),
        (_, JobState::Down | JobState::Crashed) => {
            terminate(plan, record, state, exit_status, cause);
        }
        _ => {}
    }
}

/// Whether an ended record's slot should get a new instantiation.
fn replacement_wanted(plan: &Plan<'_>, record: &JobRecord) -> bool {
    let snap = plan.snapshot();
    let key = record.type_key();
    let Some(formation) = snap.formations.get(&key.formation) else {
        return false;
    };
    match &record.slot {
        SlotKey::OneOff { .. } => false,
        SlotKey::Formation { process_type, .. } => {
            !formation.is_omni(process_type)
                && plan.formation_live(&key) < formation.desired(process_type) as usize
        }
        SlotKey::Omni {
            process_type,
            host_id,
            ..
        } => {
            formation.is_omni(process_type)
                && formation.desired(process_type) > 0
                && snap.hosts.is_active(host_id)
                && !plan.slot_held(&record.slot)
        }
    }
}

/// Whether a pending record waiting out its backoff should still run.
fn pending_wanted(plan: &Plan<'_>, record: &JobRecord) -> bool {
    let snap = plan.snapshot();
    let key = record.type_key();
    match &record.slot {
        SlotKey::OneOff { .. } => true,
        SlotKey::Formation { process_type, .. } => snap
            .formations
            .get(&key.formation)
            .is_some_and(|f| {
                !f.is_omni(process_type)
                    && plan.formation_live(&key) <= f.desired(process_type) as usize
            }),
        SlotKey::Omni {
            process_type,
            host_id,
            ..
        } => {
            snap.hosts.is_active(host_id)
                && snap
                    .formations
                    .get(&key.formation)
                    .is_some_and(|f| f.is_omni(process_type) && f.desired(process_type) > 0)
        }
    }
}
