//! End-to-end scheduling scenarios against the in-process mock fleet.

mod common;

use std::time::Duration;

use common::{count, drain, formation, host, rescale, settle, transitions, Cluster, SECOND};
use convoy_events::{JobState, ProcessType};
use convoy_id::{AppId, SequenceId};
use convoy_scheduler::RunJobRequest;

#[tokio::test(start_paused = true)]
async fn test_formation_scale_up_and_down() {
    let cluster = Cluster::start(&["a", "b"]).await;
    let mut events = cluster.subscribe().await;

    let f = formation(&[("echoer", 2)]);
    cluster.put(&f).await;
    let seen = transitions(&drain(&mut events));
    assert_eq!(count(&seen, "echoer", JobState::Up), 2);

    let f = rescale(&f, &[("echoer", 3), ("crasher", 1)]);
    cluster.put(&f).await;
    let seen = transitions(&drain(&mut events));
    assert_eq!(count(&seen, "echoer", JobState::Up), 1);
    assert_eq!(count(&seen, "crasher", JobState::Up), 1);

    let f = rescale(&f, &[("echoer", 1)]);
    cluster.put(&f).await;
    let seen = transitions(&drain(&mut events));
    assert_eq!(count(&seen, "echoer", JobState::Down), 2);
    assert_eq!(count(&seen, "echoer", JobState::Up), 0, "planned stops are not replaced");

    assert_eq!(cluster.up(f.app_id, "echoer").await, 1);
    assert_eq!(cluster.up(f.app_id, "crasher").await, 0);
    assert_eq!(cluster.agent.running_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_keeps_lowest_indices_spread() {
    let cluster = Cluster::start(&["a", "b", "c"]).await;
    let f = formation(&[("web", 3)]);
    cluster.put(&f).await;

    for id in ["a", "b", "c"] {
        assert_eq!(cluster.agent.running_on(&host(id)).await, 1);
    }

    cluster.put(&rescale(&f, &[("web", 1)])).await;
    let remaining = cluster.live(f.app_id, "web").await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].host_id, Some(host("a")));
}

async fn kill_current(cluster: &Cluster, app_id: AppId) {
    let live = cluster.live(app_id, "crasher").await;
    assert_eq!(live.len(), 1);
    assert!(cluster.agent.kill(live[0].job_id, 0).await);
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_backoff_doubles_and_resets() {
    let cluster = Cluster::start(&["a"]).await;
    let mut events = cluster.subscribe().await;
    let f = formation(&[("crasher", 1)]);
    cluster.put(&f).await;
    drain(&mut events);

    // First unplanned exit: replaced at once.
    kill_current(&cluster, f.app_id).await;
    let seen = transitions(&drain(&mut events));
    assert_eq!(
        seen,
        vec![
            ("crasher".to_string(), JobState::Down),
            ("crasher".to_string(), JobState::Up)
        ]
    );

    // Second: waits one period.
    kill_current(&cluster, f.app_id).await;
    drain(&mut events);
    let pending = cluster.live(f.app_id, "crasher").await;
    assert_eq!(pending.len(), 1, "replacement holds the slot while backing off");
    assert_eq!(pending[0].state, JobState::Pending);
    assert_eq!(pending[0].host_id, None);

    tokio::time::sleep(9 * SECOND).await;
    settle().await;
    assert_eq!(cluster.up(f.app_id, "crasher").await, 0);
    tokio::time::sleep(2 * SECOND).await;
    settle().await;
    assert_eq!(cluster.up(f.app_id, "crasher").await, 1);

    // Third: waits two periods.
    kill_current(&cluster, f.app_id).await;
    tokio::time::sleep(19 * SECOND).await;
    settle().await;
    assert_eq!(cluster.up(f.app_id, "crasher").await, 0);
    tokio::time::sleep(2 * SECOND).await;
    settle().await;
    assert_eq!(cluster.up(f.app_id, "crasher").await, 1);

    // Surviving a full period resets the history.
    tokio::time::sleep(10 * SECOND).await;
    drain(&mut events);
    kill_current(&cluster, f.app_id).await;
    let seen = transitions(&drain(&mut events));
    assert_eq!(count(&seen, "crasher", JobState::Up), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scale_to_zero_during_backoff_drops_restart() {
    let cluster = Cluster::start(&["a"]).await;
    let f = formation(&[("crasher", 1)]);
    cluster.put(&f).await;

    for _ in 0..2 {
        let live = cluster.live(f.app_id, "crasher").await;
        cluster.agent.kill(live[0].job_id, 1).await;
        settle().await;
    }
    assert_eq!(cluster.live(f.app_id, "crasher").await[0].state, JobState::Pending);

    cluster.put(&rescale(&f, &[("crasher", 0)])).await;
    assert!(cluster.live(f.app_id, "crasher").await.is_empty());

    let starts = cluster.agent.start_count().await;
    tokio::time::sleep(60 * SECOND).await;
    settle().await;
    assert_eq!(cluster.agent.start_count().await, starts, "stale timer is a no-op");
    assert!(cluster.live(f.app_id, "crasher").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_crash_on_stop_is_planned() {
    let cluster = Cluster::start(&["a"]).await;
    cluster.agent.set_stop_exit_status("crasher", 1).await;
    let mut events = cluster.subscribe().await;

    let f = formation(&[("crasher", 1)]);
    cluster.put(&f).await;
    cluster.put(&rescale(&f, &[("crasher", 0)])).await;

    let seen = transitions(&drain(&mut events));
    assert_eq!(
        seen,
        vec![
            ("crasher".to_string(), JobState::Up),
            ("crasher".to_string(), JobState::Crashed)
        ]
    );
    tokio::time::sleep(60 * SECOND).await;
    settle().await;
    assert!(cluster.live(f.app_id, "crasher").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_omni_follows_membership() {
    let cluster = Cluster::start(&["a", "b"]).await;
    let mut f = formation(&[("logger", 1), ("web", 1)]);
    f.release_processes.insert(
        "logger".to_string(),
        ProcessType {
            omni: true,
            ..Default::default()
        },
    );
    cluster.put(&f).await;
    assert_eq!(cluster.up(f.app_id, "logger").await, 2);

    cluster.add_host("c").await;
    assert_eq!(cluster.up(f.app_id, "logger").await, 3);
    assert_eq!(cluster.agent.running_of_type("logger").await.len(), 3);

    cluster.remove_host("a").await;
    let loggers = cluster.live(f.app_id, "logger").await;
    assert_eq!(loggers.len(), 2);
    assert!(loggers.iter().all(|j| j.host_id != Some(host("a"))));
    assert_eq!(cluster.up(f.app_id, "web").await, 1);

    // Disabling stops every instance.
    let mut off = f.clone();
    off.processes.insert("logger".to_string(), 0);
    cluster.put(&off).await;
    assert!(cluster.live(f.app_id, "logger").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_host_loss_replaces_without_backoff() {
    let cluster = Cluster::start(&["a", "b"]).await;
    let f = formation(&[("web", 2)]);
    cluster.put(&f).await;

    cluster.remove_host("a").await;
    let live = cluster.live(f.app_id, "web").await;
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|j| j.state == JobState::Up));
    assert!(live.iter().all(|j| j.host_id == Some(host("b"))));
}

#[tokio::test(start_paused = true)]
async fn test_no_hosts_leaves_pending_until_one_joins() {
    let cluster = Cluster::start(&[]).await;
    let f = formation(&[("web", 2)]);
    cluster.put(&f).await;

    let live = cluster.live(f.app_id, "web").await;
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|j| j.state == JobState::Pending));

    cluster.add_host("a").await;
    assert_eq!(cluster.up(f.app_id, "web").await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_crashes_and_backs_off() {
    let cluster = Cluster::start(&["a"]).await;
    cluster.agent.fail_host(&host("a")).await;
    let f = formation(&[("web", 1)]);
    cluster.put(&f).await;

    // Attempts span the default 30s budget.
    tokio::time::sleep(31 * SECOND).await;
    settle().await;
    let jobs = cluster.scheduler.list_jobs(Some(f.app_id)).await.unwrap();
    assert!(jobs.iter().any(|j| j.state == JobState::Crashed));
    assert_eq!(cluster.agent.start_count().await, 0);

    cluster.agent.restore_host(&host("a")).await;
    tokio::time::sleep(120 * SECOND).await;
    settle().await;
    assert_eq!(cluster.up(f.app_id, "web").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_off_job_runs_once() {
    let cluster = Cluster::start(&["a"]).await;
    let f = formation(&[("web", 0)]);
    cluster.put(&f).await;

    let job = cluster
        .scheduler
        .run_job(
            f.app_id,
            RunJobRequest {
                release_id: f.release_id,
                process_type: None,
                cmd: vec!["/bin/migrate".to_string()],
                env: Default::default(),
            },
        )
        .await
        .unwrap();
    settle().await;
    assert!(job.one_off);
    assert_eq!(
        cluster.scheduler.get_job(job.job_id).await.unwrap().state,
        JobState::Up
    );

    cluster.agent.kill(job.job_id, 0).await;
    settle().await;
    tokio::time::sleep(60 * SECOND).await;
    settle().await;
    assert_eq!(
        cluster.scheduler.get_job(job.job_id).await.unwrap().state,
        JobState::Down
    );
    assert_eq!(cluster.agent.running_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_agent_resync_ends_vanished_jobs() {
    let cluster = Cluster::start(&["a"]).await;
    let f = formation(&[("web", 2)]);
    cluster.put(&f).await;

    let before = cluster.live(f.app_id, "web").await;
    cluster.agent.forget(before[0].job_id).await;
    let listing = cluster.agent.listing(&host("a")).await;
    cluster.scheduler.sync(host("a"), listing).await.unwrap();
    settle().await;

    let after = cluster.live(f.app_id, "web").await;
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|j| j.job_id != before[0].job_id));
    assert_eq!(cluster.agent.running_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_slow_start_is_not_lost() {
    let cluster = Cluster::start(&["a"]).await;
    let f = formation(&[("web", 1)]);

    // The first start attempt fails; the retry lands after the scale-down.
    cluster.agent.fail_host(&host("a")).await;
    cluster.put(&f).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    cluster.agent.restore_host(&host("a")).await;
    cluster.put(&rescale(&f, &[("web", 0)])).await;

    tokio::time::sleep(5 * SECOND).await;
    settle().await;

    assert_eq!(cluster.agent.running_count().await, 0);
    assert!(cluster.live(f.app_id, "web").await.is_empty());
    let jobs = cluster.scheduler.list_jobs(Some(f.app_id)).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Down);
}

#[tokio::test(start_paused = true)]
async fn test_resync_keeps_job_whose_start_is_in_flight() {
    let cluster = Cluster::start(&["a"]).await;
    let f = formation(&[("web", 1)]);

    cluster.agent.fail_host(&host("a")).await;
    cluster.put(&f).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.agent.restore_host(&host("a")).await;

    // The agent has not seen the start yet, so it lists nothing.
    cluster.scheduler.sync(host("a"), vec![]).await.unwrap();
    tokio::time::sleep(5 * SECOND).await;
    settle().await;

    assert_eq!(cluster.agent.running_of_type("web").await.len(), 1);
    let live = cluster.live(f.app_id, "web").await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].state, JobState::Up);
    assert_eq!(cluster.agent.start_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_replay_and_caught_up_marker() {
    let cluster = Cluster::start(&["a"]).await;
    let f = formation(&[("web", 2)]);
    cluster.put(&f).await;

    let mut late = cluster
        .scheduler
        .subscribe(SequenceId::new(1), Some(f.app_id))
        .await
        .unwrap();
    let items = drain(&mut late);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].sequence_id(), SequenceId::new(2));
    assert!(items[1].is_caught_up());
    assert_eq!(items[1].sequence_id(), SequenceId::new(2));

    cluster.put(&rescale(&f, &[("web", 3)])).await;
    let items = drain(&mut late);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].sequence_id(), SequenceId::new(3));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_halts_loop() {
    let cluster = Cluster::start(&["a"]).await;
    cluster.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), cluster.task)
        .await
        .unwrap()
        .unwrap();
    assert!(!cluster.scheduler.is_alive());
}
