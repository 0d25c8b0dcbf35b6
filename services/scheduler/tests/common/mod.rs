//! Shared harness for scheduler integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use convoy_events::{Formation, HostEvent, JobState, JobStreamItem, ProcessType};
use convoy_id::{AppId, HostId, ReleaseId, SequenceId};
use convoy_scheduler::{JobView, MockHostAgent, Scheduler, SchedulerHandle, SchedulerSettings};
use tokio::sync::{mpsc, watch};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("convoy_scheduler=debug")
        .try_init();
}

pub fn host(id: &str) -> HostId {
    HostId::parse(id).unwrap()
}

pub struct Cluster {
    pub scheduler: SchedulerHandle,
    pub agent: Arc<MockHostAgent>,
    pub shutdown: watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<()>,
}

impl Cluster {
    pub async fn start(hosts: &[&str]) -> Self {
        Self::with_settings(hosts, SchedulerSettings::default()).await
    }

    pub async fn with_settings(hosts: &[&str], settings: SchedulerSettings) -> Self {
        init_tracing();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let agent = Arc::new(MockHostAgent::new());
        let (scheduler, task) = Scheduler::spawn(settings, agent.clone(), shutdown_rx);
        agent.attach(scheduler.clone());

        let cluster = Self {
            scheduler,
            agent,
            shutdown,
            task,
        };
        for id in hosts {
            cluster.add_host(id).await;
        }
        cluster
    }

    pub async fn add_host(&self, id: &str) {
        self.scheduler
            .host_event(HostEvent::added(host(id), format!("{id}:1113")))
            .await
            .unwrap();
        settle().await;
    }

    pub async fn remove_host(&self, id: &str) {
        self.scheduler
            .host_event(HostEvent::removed(host(id)))
            .await
            .unwrap();
        settle().await;
    }

    pub async fn put(&self, formation: &Formation) {
        self.scheduler.put_formation(formation.clone()).await.unwrap();
        settle().await;
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<JobStreamItem> {
        self.scheduler
            .subscribe(SequenceId::ZERO, None)
            .await
            .unwrap()
    }

    /// Live records of one process type.
    pub async fn live(&self, app_id: AppId, process_type: &str) -> Vec<JobView> {
        self.scheduler
            .list_jobs(Some(app_id))
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.process_type == process_type && j.state.is_live())
            .collect()
    }

    pub async fn up(&self, app_id: AppId, process_type: &str) -> usize {
        self.live(app_id, process_type)
            .await
            .iter()
            .filter(|j| j.state == JobState::Up)
            .count()
    }
}

/// Let spawned dispatch tasks and agent reports run to completion.
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

pub fn formation(counts: &[(&str, u32)]) -> Formation {
    let mut f = Formation::new(AppId::new(), ReleaseId::new());
    for (process_type, count) in counts {
        f.processes.insert(process_type.to_string(), *count);
        f.release_processes.insert(
            process_type.to_string(),
            ProcessType {
                cmd: vec![format!("/bin/{process_type}")],
                ..Default::default()
            },
        );
    }
    f
}

/// Replace the desired counts of an existing formation.
pub fn rescale(f: &Formation, counts: &[(&str, u32)]) -> Formation {
    let mut next = f.clone();
    next.processes.clear();
    for (process_type, count) in counts {
        next.processes.insert(process_type.to_string(), *count);
        next.release_processes
            .entry(process_type.to_string())
            .or_insert_with(|| ProcessType {
                cmd: vec![format!("/bin/{process_type}")],
                ..Default::default()
            });
    }
    next
}

/// Every item currently queued on a subscription.
pub fn drain(rx: &mut mpsc::Receiver<JobStreamItem>) -> Vec<JobStreamItem> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// `(process_type, state)` of each event, markers skipped.
pub fn transitions(items: &[JobStreamItem]) -> Vec<(String, JobState)> {
    items
        .iter()
        .filter_map(|item| match item {
            JobStreamItem::Event(e) => Some((e.process_type.clone(), e.state)),
            JobStreamItem::CaughtUp { .. } => None,
        })
        .collect()
}

pub fn count(transitions: &[(String, JobState)], process_type: &str, state: JobState) -> usize {
    transitions
        .iter()
        .filter(|(t, s)| t == process_type && *s == state)
        .count()
}

pub const SECOND: Duration = Duration::from_secs(1);
