//! Host Membership Tracker decisions.
//!
//! The host set itself lives in [`HostSet`](crate::hosts::HostSet) and is
//! updated by the core before these run, so the snapshot already shows the
//! host as active (added) or inactive (removed).

use convoy_events::JobState;
use convoy_id::HostId;
use tracing::{info, instrument};

use crate::omni;
use crate::plan::Plan;
use crate::restart::{self, TerminationCause};
use crate::store::JobRecord;

/// A host joined: place enabled omni types on it, re-send stops that failed
/// against it, and retry pending placements.
#[instrument(skip_all, fields(host_id = %host_id))]
pub fn host_added(plan: &mut Plan<'_>, host_id: &HostId) {
    omni::host_added(plan, host_id);
    retry_stops(plan, host_id);
    retry_pending(plan);
}

/// A host left: everything on it is down.
///
/// Non-omni slots are replaced elsewhere right away with a restart count of
/// zero. Omni slots pinned to the host are gone for good.
#[instrument(skip_all, fields(host_id = %host_id))]
pub fn host_removed(plan: &mut Plan<'_>, host_id: &HostId) {
    let snap = plan.snapshot();

    let lost: Vec<&JobRecord> = snap.store.on_host(host_id).collect();
    if !lost.is_empty() {
        info!(host_id = %host_id, jobs = lost.len(), "Host removed, marking its jobs down");
    }
    for record in lost {
        restart::terminate(plan, record, JobState::Down, None, TerminationCause::HostLost);
    }

    // Pinned slots waiting on a timer or a host will never run there.
    let orphaned: Vec<&JobRecord> = snap
        .store
        .live()
        .filter(|r| r.state == JobState::Pending && r.slot.pinned_host() == Some(host_id))
        .collect();
    for record in orphaned {
        plan.stop(record);
    }

    retry_pending(plan);
}

/// Dispatch every pending record that is waiting only for a host.
pub fn retry_pending(plan: &mut Plan<'_>) {
    let snap = plan.snapshot();
    let waiting: Vec<&JobRecord> = snap
        .store
        .live()
        .filter(|r| r.is_awaiting_host() && !plan.is_ended(&r.job_id))
        .collect();
    for record in waiting {
        plan.place_pending(record);
    }
}

fn retry_stops(plan: &mut Plan<'_>, host_id: &HostId) {
    let snap = plan.snapshot();
    let failed: Vec<&JobRecord> = snap
        .store
        .on_host(host_id)
        .filter(|r| r.state == JobState::Stopping && r.stop_retry)
        .collect();
    for record in failed {
        plan.retry_stop(record);
    }
}
