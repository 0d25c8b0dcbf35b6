//! Omni Placement Engine.
//!
//! Keeps exactly one instance of every enabled omni process type on each
//! active host. Omni slots are pinned to their host: when the host leaves,
//! the slot is gone and is never moved elsewhere.

use std::time::Duration;

use convoy_events::Formation;
use convoy_id::{HostId, JobId};
use tracing::{debug, instrument};

use crate::error::SchedulerResult;
use crate::formation::validate_type;
use crate::plan::Plan;
use crate::store::{JobRecord, SlotKey, TypeKey};

/// Plan the changes for one omni process type of a formation.
///
/// Any non-zero desired count enables the type on every active host; zero
/// stops it everywhere.
pub fn reconcile_type(
    plan: &mut Plan<'_>,
    formation: &Formation,
    process_type: &str,
) -> SchedulerResult<()> {
    validate_type(formation, process_type)?;

    let snap = plan.snapshot();
    let key = TypeKey::new(formation.key(), process_type);

    // Counted instances left over from when the type was not omni.
    let counted: Vec<&JobRecord> = snap.store.live_formation_slots(&key).collect();
    for record in counted {
        plan.stop(record);
    }

    if formation.desired(process_type) == 0 {
        let running: Vec<&JobRecord> = snap.store.live_omni_slots(&key).collect();
        if !running.is_empty() {
            debug!(type_key = %key, count = running.len(), "Disabling omni type");
        }
        for record in running {
            plan.stop(record);
        }
        return Ok(());
    }

    for host in snap.hosts.active() {
        ensure_on_host(plan, formation, process_type, &host.host_id);
    }
    Ok(())
}

/// Plan one instance of every enabled omni type on a newly added host.
#[instrument(skip_all, fields(host_id = %host_id))]
pub fn host_added(plan: &mut Plan<'_>, host_id: &HostId) {
    let snap = plan.snapshot();
    for formation in snap.formations.iter() {
        for process_type in formation.enabled_omni_types() {
            if validate_type(formation, process_type).is_ok() {
                ensure_on_host(plan, formation, process_type, host_id);
            }
        }
    }
}

/// The slot an omni type occupies on a host.
pub fn slot_for(formation: &Formation, process_type: &str, host_id: &HostId) -> SlotKey {
    SlotKey::Omni {
        app_id: formation.app_id,
        release_id: formation.release_id,
        process_type: process_type.to_string(),
        host_id: host_id.clone(),
    }
}

fn ensure_on_host(plan: &mut Plan<'_>, formation: &Formation, process_type: &str, host_id: &HostId) {
    let slot = slot_for(formation, process_type, host_id);
    if plan.slot_held(&slot) {
        return;
    }
    debug!(slot = %slot, "Placing omni instance");
    let job_id = JobId::new();
    plan.spawn(
        slot,
        formation.job_spec(job_id, process_type),
        0,
        Duration::ZERO,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formation::FormationTable;
    use crate::hosts::HostSet;
    use crate::plan::{Decision, Snapshot};
    use crate::store::JobStore;
    use convoy_events::{JobState, ProcessType};
    use convoy_id::{AppId, ReleaseId};
    use convoy_reconcile::BackoffPolicy;
    use tokio::time::Instant;

    fn host(s: &str) -> HostId {
        HostId::parse(s).unwrap()
    }

    fn omni_formation(count: u32) -> Formation {
        let mut f = Formation::new(AppId::new(), ReleaseId::new());
        f.release_processes.insert(
            "logger".to_string(),
            ProcessType {
                omni: true,
                ..Default::default()
            },
        );
        f.processes.insert("logger".to_string(), count);
        f
    }

    struct World {
        store: JobStore,
        hosts: HostSet,
        formations: FormationTable,
    }

    impl World {
        fn new(host_ids: &[&str], formation: &Formation) -> Self {
            let mut hosts = HostSet::new();
            for h in host_ids {
                hosts.add(host(h), format!("{h}:1113"));
            }
            let mut formations = FormationTable::new();
            formations.put(formation.clone());
            Self {
                store: JobStore::new(),
                hosts,
                formations,
            }
        }

        fn plan(&self, f: impl FnOnce(&mut Plan<'_>)) -> Vec<Decision> {
            let mut plan = Plan::new(Snapshot {
                store: &self.store,
                hosts: &self.hosts,
                formations: &self.formations,
                backoff: BackoffPolicy::default(),
                now: Instant::now(),
            });
            f(&mut plan);
            plan.into_decisions()
        }

        fn apply(&mut self, decisions: Vec<Decision>) {
            for d in decisions {
                if let Decision::Spawn(s) = d {
                    let mut record = JobRecord::pending(s.job_id, s.slot, s.spec, 0, 1);
                    record.host_id = s.host_id;
                    record.state = JobState::Up;
                    self.store.insert(record).unwrap();
                }
            }
        }
    }

    fn spawned_hosts(decisions: &[Decision]) -> Vec<HostId> {
        decisions
            .iter()
            .filter_map(|d| match d {
                Decision::Spawn(s) => s.slot.pinned_host().cloned(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_one_instance_per_active_host() {
        let f = omni_formation(1);
        let world = World::new(&["a", "b", "c"], &f);
        let decisions = world.plan(|p| reconcile_type(p, &f, "logger").unwrap());
        assert_eq!(spawned_hosts(&decisions), vec![host("a"), host("b"), host("c")]);

        // The desired count is an on/off switch, not a multiplier.
        let f = omni_formation(5);
        let world = World::new(&["a", "b"], &f);
        let decisions = world.plan(|p| reconcile_type(p, &f, "logger").unwrap());
        assert_eq!(decisions.len(), 2);
    }

    #[test]
    fn test_host_added_places_only_on_new_host() {
        let f = omni_formation(1);
        let mut world = World::new(&["a", "b"], &f);
        let decisions = world.plan(|p| reconcile_type(p, &f, "logger").unwrap());
        world.apply(decisions);

        world.hosts.add(host("c"), "c:1113");
        let decisions = world.plan(|p| host_added(p, &host("c")));
        assert_eq!(spawned_hosts(&decisions), vec![host("c")]);

        // Reconciling afterwards finds nothing more to do.
        world.apply(decisions);
        assert!(world
            .plan(|p| reconcile_type(p, &f, "logger").unwrap())
            .is_empty());
    }

    #[test]
    fn test_disabled_type_stops_everywhere() {
        let f = omni_formation(1);
        let mut world = World::new(&["a", "b"], &f);
        let decisions = world.plan(|p| reconcile_type(p, &f, "logger").unwrap());
        world.apply(decisions);

        let off = omni_formation(0);
        let off = Formation {
            app_id: f.app_id,
            release_id: f.release_id,
            ..off
        };
        let decisions = world.plan(|p| reconcile_type(p, &off, "logger").unwrap());
        assert_eq!(decisions.len(), 2);
        assert!(decisions
            .iter()
            .all(|d| matches!(d, Decision::Stop { .. })));
    }

    #[test]
    fn test_host_added_ignores_disabled_types() {
        let f = omni_formation(0);
        let mut world = World::new(&["a"], &f);
        world.hosts.add(host("b"), "b:1113");
        assert!(world.plan(|p| host_added(p, &host("b"))).is_empty());
    }
}
