//! Scheduler core.
//!
//! One actor owns the job store, host set, formations and event publisher.
//! Every input is a [`SchedulerMessage`]; for each one the actor takes a
//! snapshot, runs the decision functions, and applies the resulting plan
//! before reading the next message. Agent calls and backoff timers run as
//! separate tasks and report back through the same mailbox.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_events::{
    AgentJobStatus, AgentReport, Formation, FormationKey, HostEvent, HostEventKind, JobSpec,
    JobState, JobStreamItem,
};
use convoy_id::{AppId, HostId, JobId, ReleaseId, SequenceId};
use convoy_reconcile::{AttemptStrategy, BackoffPolicy, ConvergenceStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::actor::{self, Actor, ActorContext, ActorError, ActorHandle};
use crate::agent::{with_attempts, AgentError, HostAgent, HostTarget};
use crate::error::{SchedulerError, SchedulerResult};
use crate::formation::{self, validate_type, FormationTable};
use crate::hosts::{Host, HostSet};
use crate::membership;
use crate::plan::{Decision, Plan, Snapshot, Spawn};
use crate::publisher::{JobEventPublisher, DEFAULT_RETENTION};
use crate::restart;
use crate::store::{JobRecord, JobStore, JobView, SlotKey, TypeKey};

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_SIZE: usize = 1024;

/// Tunables for the scheduler core.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub backoff: BackoffPolicy,
    pub attempts: AttemptStrategy,
    pub event_retention: usize,
    pub mailbox_size: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            attempts: AttemptStrategy::default(),
            event_retention: DEFAULT_RETENTION,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
        }
    }
}

/// Request to run a one-off job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJobRequest {
    pub release_id: ReleaseId,

    /// Release process type to take the command and environment from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_type: Option<String>,

    /// Overrides the release command when non-empty.
    #[serde(default)]
    pub cmd: Vec<String>,

    /// Merged over the release environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Convergence of one process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeStatus {
    pub desired: usize,
    pub live: usize,
    pub up: usize,
    pub omni: bool,
    pub status: &'static str,
}

/// A stored formation and the process types that were left unreconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormationReceipt {
    #[serde(flatten)]
    pub formation: Formation,

    /// Rejected process types and why.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rejected: BTreeMap<String, String>,
}

/// A formation with its convergence per process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormationView {
    #[serde(flatten)]
    pub formation: Formation,
    pub status: BTreeMap<String, TypeStatus>,
}

type Reply<T> = oneshot::Sender<SchedulerResult<T>>;

/// Inputs to the scheduler core.
#[derive(Debug)]
pub enum SchedulerMessage {
    PutFormation {
        formation: Formation,
        reply: Reply<FormationReceipt>,
    },
    RunJob {
        app_id: AppId,
        request: RunJobRequest,
        reply: Reply<JobView>,
    },
    Report {
        host_id: HostId,
        report: AgentReport,
    },
    Sync {
        host_id: HostId,
        jobs: Vec<AgentJobStatus>,
    },
    Membership(HostEvent),
    TimerFired {
        job_id: JobId,
        generation: u64,
    },
    StartAcknowledged {
        job_id: JobId,
        host_id: HostId,
    },
    StartFailed {
        job_id: JobId,
        host_id: HostId,
        error: AgentError,
    },
    StopFailed {
        job_id: JobId,
        host_id: HostId,
        error: AgentError,
    },
    Subscribe {
        after: SequenceId,
        app_id: Option<AppId>,
        reply: Reply<mpsc::Receiver<JobStreamItem>>,
    },
    ListJobs {
        app_id: Option<AppId>,
        reply: Reply<Vec<JobView>>,
    },
    GetJob {
        job_id: JobId,
        reply: Reply<JobView>,
    },
    ListHosts {
        reply: Reply<Vec<Host>>,
    },
    ListFormations {
        reply: Reply<Vec<FormationView>>,
    },
}

impl SchedulerMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::PutFormation { .. } => "put_formation",
            Self::RunJob { .. } => "run_job",
            Self::Report { .. } => "report",
            Self::Sync { .. } => "sync",
            Self::Membership(_) => "membership",
            Self::TimerFired { .. } => "timer_fired",
            Self::StartAcknowledged { .. } => "start_acknowledged",
            Self::StartFailed { .. } => "start_failed",
            Self::StopFailed { .. } => "stop_failed",
            Self::Subscribe { .. } => "subscribe",
            Self::ListJobs { .. } => "list_jobs",
            Self::GetJob { .. } => "get_job",
            Self::ListHosts { .. } => "list_hosts",
            Self::ListFormations { .. } => "list_formations",
        }
    }
}

/// The scheduler core actor.
pub struct Scheduler {
    store: JobStore,
    hosts: HostSet,
    formations: FormationTable,
    publisher: JobEventPublisher,
    settings: SchedulerSettings,
    agent: Arc<dyn HostAgent>,
    mailbox: ActorHandle<SchedulerMessage>,
    timers: HashMap<JobId, JoinHandle<()>>,
}

impl Scheduler {
    /// Start the scheduler core on the current runtime.
    pub fn spawn(
        settings: SchedulerSettings,
        agent: Arc<dyn HostAgent>,
        shutdown: watch::Receiver<bool>,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (mailbox, task) =
            actor::spawn_with(settings.mailbox_size, shutdown, |mailbox| {
                Scheduler::new(settings, agent, mailbox)
            });
        (SchedulerHandle { mailbox }, task)
    }

    fn new(
        settings: SchedulerSettings,
        agent: Arc<dyn HostAgent>,
        mailbox: ActorHandle<SchedulerMessage>,
    ) -> Self {
        Self {
            store: JobStore::new(),
            hosts: HostSet::new(),
            formations: FormationTable::new(),
            publisher: JobEventPublisher::new(settings.event_retention),
            settings,
            agent,
            mailbox,
            timers: HashMap::new(),
        }
    }

    #[instrument(skip_all, fields(kind = msg.kind()))]
    fn process(&mut self, msg: SchedulerMessage) -> SchedulerResult<()> {
        match msg {
            SchedulerMessage::PutFormation { formation, reply } => {
                let result = self.put_formation(formation);
                respond(reply, result)
            }
            SchedulerMessage::RunJob {
                app_id,
                request,
                reply,
            } => {
                let result = self.run_job(app_id, request);
                respond(reply, result)
            }
            SchedulerMessage::Report { host_id, report } => {
                match self.execute(|plan| restart::on_report(plan, &host_id, &report)) {
                    Err(SchedulerError::UnknownJob(job_id)) => {
                        warn!(job_id = %job_id, host_id = %host_id, "Report for unknown job, ignoring");
                        Ok(())
                    }
                    other => other,
                }
            }
            SchedulerMessage::Sync { host_id, jobs } => {
                info!(host_id = %host_id, jobs = jobs.len(), "Agent resync");
                self.execute(|plan| {
                    restart::on_sync(plan, &host_id, &jobs);
                    Ok(())
                })
            }
            SchedulerMessage::Membership(event) => self.membership(event),
            SchedulerMessage::TimerFired { job_id, generation } => {
                self.timers.remove(&job_id);
                self.execute(|plan| {
                    restart::on_timer(plan, &job_id, generation);
                    Ok(())
                })
            }
            SchedulerMessage::StartAcknowledged { job_id, host_id } => {
                self.start_acknowledged(job_id, &host_id)
            }
            SchedulerMessage::StartFailed {
                job_id,
                host_id,
                error,
            } => {
                self.clear_start_pending(&job_id, &host_id);
                let failure = SchedulerError::TransientAgent {
                    host_id: host_id.clone(),
                    source: error.clone(),
                };
                debug!(job_id = %job_id, error = %failure, "Start dispatch failed");
                self.execute(|plan| {
                    restart::on_start_failed(plan, &job_id, &host_id, &error);
                    Ok(())
                })
            }
            SchedulerMessage::StopFailed {
                job_id,
                host_id,
                error,
            } => {
                self.stop_failed(job_id, &host_id, error);
                Ok(())
            }
            SchedulerMessage::Subscribe {
                after,
                app_id,
                reply,
            } => respond(reply, Ok(self.publisher.subscribe(after, app_id))),
            SchedulerMessage::ListJobs { app_id, reply } => {
                let jobs = match app_id {
                    Some(app_id) => self.store.for_app(&app_id).map(JobView::from).collect(),
                    None => self.store.records().map(JobView::from).collect(),
                };
                respond(reply, Ok(jobs))
            }
            SchedulerMessage::GetJob { job_id, reply } => {
                let job = self
                    .store
                    .get(&job_id)
                    .map(JobView::from)
                    .ok_or(SchedulerError::UnknownJob(job_id));
                respond(reply, job)
            }
            SchedulerMessage::ListHosts { reply } => {
                respond(reply, Ok(self.hosts.all().cloned().collect()))
            }
            SchedulerMessage::ListFormations { reply } => {
                let views = self
                    .formations
                    .iter()
                    .map(|f| self.formation_view(f))
                    .collect();
                respond(reply, Ok(views))
            }
        }
    }

    // =========================================================================
    // Message Handlers
    // =========================================================================

    /// Store a formation and reconcile it. Invalid process types are skipped
    /// and reported; the rest of the formation still converges.
    fn put_formation(&mut self, formation: Formation) -> SchedulerResult<FormationReceipt> {
        let rejected: BTreeMap<String, String> = formation
            .processes
            .keys()
            .filter_map(|process_type| {
                validate_type(&formation, process_type)
                    .err()
                    .map(|e| (process_type.clone(), e.to_string()))
            })
            .collect();

        let key = formation.key();
        info!(
            formation = %key,
            processes = ?formation.processes,
            rejected = rejected.len(),
            "Formation updated"
        );
        self.formations.put(formation.clone());

        self.execute(|plan| {
            let snap = plan.snapshot();
            if let Some(current) = snap.formations.get(&key) {
                formation::reconcile(plan, current);
            }
            Ok(())
        })?;
        Ok(FormationReceipt {
            formation,
            rejected,
        })
    }

    fn run_job(&mut self, app_id: AppId, request: RunJobRequest) -> SchedulerResult<JobView> {
        if let Some(process_type) = &request.process_type {
            if process_type.is_empty() {
                return Err(SchedulerError::InvalidRequest(
                    "process type name must not be empty".to_string(),
                ));
            }
        }

        let job_id = JobId::new();
        let key = FormationKey {
            app_id,
            release_id: request.release_id,
        };
        let mut spec = match (self.formations.get(&key), &request.process_type) {
            (Some(formation), Some(process_type)) => formation.job_spec(job_id, process_type),
            _ => JobSpec {
                job_id,
                app_id,
                release_id: request.release_id,
                process_type: request.process_type.clone(),
                cmd: Vec::new(),
                env: BTreeMap::new(),
            },
        };
        if !request.cmd.is_empty() {
            spec.cmd = request.cmd;
        }
        spec.env.extend(request.env);

        info!(job_id = %job_id, app_id = %app_id, "Running one-off job");
        self.execute(|plan| {
            plan.spawn(SlotKey::OneOff { token: job_id }, spec, 0, Duration::ZERO);
            Ok(())
        })?;

        self.store
            .get(&job_id)
            .map(JobView::from)
            .ok_or(SchedulerError::UnknownJob(job_id))
    }

    fn membership(&mut self, event: HostEvent) -> SchedulerResult<()> {
        let host_id = event.host_id;
        match event.kind {
            HostEventKind::Added => {
                let Some(address) = event.address else {
                    warn!(host_id = %host_id, "Host added without an address, ignoring");
                    return Ok(());
                };
                if !self.hosts.add(host_id.clone(), address) {
                    debug!(host_id = %host_id, "Host already active");
                    return Ok(());
                }
                info!(host_id = %host_id, active = self.hosts.active_count(), "Host added");
                self.execute(|plan| {
                    membership::host_added(plan, &host_id);
                    Ok(())
                })
            }
            HostEventKind::Removed => {
                if !self.hosts.remove(&host_id) {
                    debug!(host_id = %host_id, "Host not active");
                    return Ok(());
                }
                info!(host_id = %host_id, active = self.hosts.active_count(), "Host removed");
                self.execute(|plan| {
                    membership::host_removed(plan, &host_id);
                    Ok(())
                })
            }
        }
    }

    /// The agent accepted a start. A stop decided while the call was in
    /// flight is sent now.
    fn start_acknowledged(&mut self, job_id: JobId, host_id: &HostId) -> SchedulerResult<()> {
        if !self.clear_start_pending(&job_id, host_id) {
            return Ok(());
        }
        match self.store.get(&job_id).map(|r| r.state) {
            Some(JobState::Stopping) => {
                debug!(job_id = %job_id, "Start acknowledged, sending deferred stop");
                self.dispatch_stop(job_id)
            }
            Some(state) if state.is_terminal() => self.apply(Decision::Reap {
                job_id,
                host_id: host_id.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Returns whether the record was waiting on a start to `host_id`.
    fn clear_start_pending(&mut self, job_id: &JobId, host_id: &HostId) -> bool {
        match self.store.get_mut(job_id) {
            Ok(record) if record.host_id.as_ref() == Some(host_id) && record.start_pending => {
                record.start_pending = false;
                true
            }
            _ => false,
        }
    }

    fn stop_failed(&mut self, job_id: JobId, host_id: &HostId, error: AgentError) {
        let Ok(record) = self.store.get_mut(&job_id) else {
            return;
        };
        if record.state != JobState::Stopping || record.host_id.as_ref() != Some(host_id) {
            debug!(job_id = %job_id, host_id = %host_id, error = %error, "Stop failed for a job that moved on");
            return;
        }
        warn!(
            job_id = %job_id,
            host_id = %host_id,
            error = %error,
            "Stop dispatch failed, will retry when the host reconnects"
        );
        record.stop_retry = true;
        record.touch();
    }

    fn formation_view(&self, formation: &Formation) -> FormationView {
        let mut status = BTreeMap::new();
        for process_type in formation.processes.keys() {
            let key = TypeKey::new(formation.key(), process_type.as_str());
            let omni = formation.is_omni(process_type);
            let (desired, live): (usize, Vec<&JobRecord>) = if omni {
                let desired = if formation.desired(process_type) > 0 {
                    self.hosts.active_count()
                } else {
                    0
                };
                (desired, self.store.live_omni_slots(&key).collect())
            } else {
                (
                    formation.desired(process_type) as usize,
                    self.store.live_formation_slots(&key).collect(),
                )
            };
            let up = live.iter().filter(|r| r.state == JobState::Up).count();
            status.insert(
                process_type.clone(),
                TypeStatus {
                    desired,
                    live: live.len(),
                    up,
                    omni,
                    status: ConvergenceStatus::of(up, desired).as_str(),
                },
            );
        }
        FormationView {
            formation: formation.clone(),
            status,
        }
    }

    // =========================================================================
    // Decide and Apply
    // =========================================================================

    /// Run decision functions against a snapshot, then apply their plan.
    fn execute<F>(&mut self, decide: F) -> SchedulerResult<()>
    where
        F: FnOnce(&mut Plan<'_>) -> SchedulerResult<()>,
    {
        let snapshot = Snapshot {
            store: &self.store,
            hosts: &self.hosts,
            formations: &self.formations,
            backoff: self.settings.backoff,
            now: Instant::now(),
        };
        let mut plan = Plan::new(snapshot);
        let outcome = decide(&mut plan);
        let decisions = plan.into_decisions();

        for decision in decisions {
            self.apply(decision)?;
        }
        self.store.check_invariants(&self.hosts)?;
        outcome
    }

    fn apply(&mut self, decision: Decision) -> SchedulerResult<()> {
        match decision {
            Decision::Spawn(spawn) => self.apply_spawn(spawn),
            Decision::Place { job_id, host_id } => self.dispatch(job_id, host_id),
            Decision::AwaitHost { job_id } => {
                let record = record_mut(&mut self.store, &job_id)?;
                record.next_restart_at = None;
                record.touch();
                info!(job_id = %job_id, slot = %record.slot, "Backoff elapsed, waiting for a host");
                Ok(())
            }
            Decision::Transition { job_id, state } => {
                let record = record_mut(&mut self.store, &job_id)?;
                record.state = state;
                record.touch();
                if state == JobState::Up {
                    record.up_since = Some(Instant::now());
                    if !record.published_up {
                        record.published_up = true;
                        self.publisher.publish(record, JobState::Up);
                    }
                }
                debug!(job_id = %job_id, state = %state, "Job transitioned");
                Ok(())
            }
            Decision::Stop { job_id } => {
                self.cancel_timer(&job_id);
                let record = record_mut(&mut self.store, &job_id)?;
                record.state = JobState::Stopping;
                record.planned_stop = true;
                record.stop_retry = false;
                record.touch();
                debug!(job_id = %job_id, slot = %record.slot, "Stopping job");
                self.dispatch_stop(job_id)
            }
            Decision::RetryStop { job_id } => {
                let record = record_mut(&mut self.store, &job_id)?;
                record.stop_retry = false;
                debug!(job_id = %job_id, "Retrying stop");
                self.dispatch_stop(job_id)
            }
            Decision::Cancel { job_id } => {
                self.cancel_timer(&job_id);
                let record = record_mut(&mut self.store, &job_id)?;
                record.state = JobState::Down;
                record.planned_stop = true;
                record.next_restart_at = None;
                record.touch();
                let slot = record.slot.clone();
                self.store.next_generation(&slot);
                self.store.retire(job_id);
                debug!(job_id = %job_id, slot = %slot, "Pending job cancelled");
                Ok(())
            }
            Decision::Reap { job_id, host_id } => {
                match self.hosts.get(&host_id) {
                    Some(host) if host.active => {
                        let target = HostTarget {
                            host_id,
                            address: host.address.clone(),
                        };
                        self.send_stop(job_id, target);
                    }
                    _ => debug!(job_id = %job_id, host_id = %host_id, "Host inactive, not reaping"),
                }
                Ok(())
            }
            Decision::Terminate {
                job_id,
                state,
                exit_status,
            } => {
                self.cancel_timer(&job_id);
                let record = record_mut(&mut self.store, &job_id)?;
                record.state = state;
                record.exit_status = exit_status;
                record.next_restart_at = None;
                record.stop_retry = false;
                record.touch();
                if record.published_up {
                    self.publisher.publish(record, state);
                }
                info!(
                    job_id = %job_id,
                    slot = %record.slot,
                    state = %state,
                    exit_status = ?exit_status,
                    "Job ended"
                );
                self.store.retire(job_id);
                Ok(())
            }
        }
    }

    fn apply_spawn(&mut self, spawn: Spawn) -> SchedulerResult<()> {
        let job_id = spawn.job_id;
        let generation = self.store.next_generation(&spawn.slot);
        let mut record = JobRecord::pending(
            job_id,
            spawn.slot,
            spawn.spec,
            spawn.restart_count,
            generation,
        );

        if !spawn.delay.is_zero() {
            record.next_restart_at = Some(Instant::now() + spawn.delay);
            self.store.insert(record)?;
            self.arm_timer(job_id, generation, spawn.delay);
            return Ok(());
        }

        let slot = record.slot.clone();
        self.store.insert(record)?;
        match spawn.host_id {
            Some(host_id) => self.dispatch(job_id, host_id),
            None => {
                warn!(job_id = %job_id, slot = %slot, error = %SchedulerError::Placement, "Job left pending");
                Ok(())
            }
        }
    }

    /// Mark a pending record starting on `host_id` and send the start.
    fn dispatch(&mut self, job_id: JobId, host_id: HostId) -> SchedulerResult<()> {
        let address = match self.hosts.get(&host_id) {
            Some(host) if host.active => host.address.clone(),
            _ => {
                return Err(SchedulerError::InvariantViolation(format!(
                    "job {job_id} placed on inactive host {host_id}"
                )))
            }
        };
        self.cancel_timer(&job_id);

        let record = record_mut(&mut self.store, &job_id)?;
        record.state = JobState::Starting;
        record.host_id = Some(host_id.clone());
        record.next_restart_at = None;
        record.start_pending = true;
        record.touch();
        let spec = record.spec.clone();
        info!(job_id = %job_id, host_id = %host_id, slot = %record.slot, "Dispatching job");

        let agent = Arc::clone(&self.agent);
        let mailbox = self.mailbox.clone();
        let attempts = self.settings.attempts;
        let target = HostTarget { host_id, address };
        tokio::spawn(async move {
            let result = with_attempts(attempts, || agent.start_job(&target, &spec)).await;
            let host_id = target.host_id;
            let outcome = match result {
                Ok(_) => SchedulerMessage::StartAcknowledged { job_id, host_id },
                Err(error) => SchedulerMessage::StartFailed {
                    job_id,
                    host_id,
                    error,
                },
            };
            if mailbox.send(outcome).await.is_err() {
                debug!(job_id = %job_id, "Scheduler gone, dropping start outcome");
            }
        });
        Ok(())
    }

    /// Send a stop for a record already marked stopping.
    ///
    /// While the record's start call is in flight the stop is held back and
    /// sent once the start returns, so the agent never sees them reordered.
    fn dispatch_stop(&mut self, job_id: JobId) -> SchedulerResult<()> {
        let record = record_mut(&mut self.store, &job_id)?;
        let Some(host_id) = record.host_id.clone() else {
            return Err(SchedulerError::InvariantViolation(format!(
                "stopping job {job_id} has no host"
            )));
        };
        if record.start_pending {
            debug!(job_id = %job_id, "Start in flight, deferring stop");
            return Ok(());
        }
        let address = match self.hosts.get(&host_id) {
            Some(host) if host.active => host.address.clone(),
            _ => {
                record.stop_retry = true;
                return Ok(());
            }
        };

        self.send_stop(job_id, HostTarget { host_id, address });
        Ok(())
    }

    fn send_stop(&self, job_id: JobId, target: HostTarget) {
        let agent = Arc::clone(&self.agent);
        let mailbox = self.mailbox.clone();
        let attempts = self.settings.attempts;
        tokio::spawn(async move {
            let result = with_attempts(attempts, || agent.stop_job(&target, job_id)).await;
            if let Err(error) = result {
                let failed = SchedulerMessage::StopFailed {
                    job_id,
                    host_id: target.host_id.clone(),
                    error,
                };
                if mailbox.send(failed).await.is_err() {
                    debug!(job_id = %job_id, "Scheduler gone, dropping stop failure");
                }
            }
        });
    }

    fn arm_timer(&mut self, job_id: JobId, generation: u64, delay: Duration) {
        debug!(job_id = %job_id, generation, delay_ms = delay.as_millis() as u64, "Arming backoff timer");
        let mailbox = self.mailbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox
                .send(SchedulerMessage::TimerFired { job_id, generation })
                .await;
        });
        if let Some(previous) = self.timers.insert(job_id, task) {
            previous.abort();
        }
    }

    fn cancel_timer(&mut self, job_id: &JobId) {
        if let Some(task) = self.timers.remove(job_id) {
            task.abort();
        }
    }
}

#[async_trait]
impl Actor for Scheduler {
    type Message = SchedulerMessage;

    fn name(&self) -> &str {
        "scheduler"
    }

    async fn handle(
        &mut self,
        msg: SchedulerMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        let kind = msg.kind();
        match self.process(msg) {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => {
                error!(message = kind, error = %e, "Scheduler state is inconsistent, halting");
                Err(ActorError::Permanent(e.to_string()))
            }
            Err(e) => {
                warn!(message = kind, error = %e, "Message failed");
                Ok(true)
            }
        }
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        info!(
            jobs = self.store.len(),
            last_sequence_id = %self.publisher.last_sequence_id(),
            "Scheduler stopped"
        );
    }
}

fn record_mut<'a>(store: &'a mut JobStore, job_id: &JobId) -> SchedulerResult<&'a mut JobRecord> {
    store.get_mut(job_id).map_err(|_| {
        SchedulerError::InvariantViolation(format!("decision names missing job {job_id}"))
    })
}

/// Send a reply. Fatal errors are not handed to the caller: it sees the
/// scheduler as stopped and the error halts the loop.
fn respond<T>(reply: Reply<T>, result: SchedulerResult<T>) -> SchedulerResult<()> {
    match result {
        Err(e) if e.is_fatal() => {
            let _ = reply.send(Err(SchedulerError::Stopped));
            Err(e)
        }
        result => {
            let _ = reply.send(result);
            Ok(())
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable client of the scheduler core.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    mailbox: ActorHandle<SchedulerMessage>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SchedulerMessage,
    ) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(build(tx))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    async fn notify(&self, msg: SchedulerMessage) -> SchedulerResult<()> {
        self.mailbox
            .send(msg)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Replace a formation and reconcile it.
    pub async fn put_formation(&self, formation: Formation) -> SchedulerResult<FormationReceipt> {
        self.request(|reply| SchedulerMessage::PutFormation { formation, reply })
            .await
    }

    pub async fn run_job(&self, app_id: AppId, request: RunJobRequest) -> SchedulerResult<JobView> {
        self.request(|reply| SchedulerMessage::RunJob {
            app_id,
            request,
            reply,
        })
        .await
    }

    /// Deliver an agent lifecycle report.
    pub async fn report(&self, host_id: HostId, report: AgentReport) -> SchedulerResult<()> {
        self.notify(SchedulerMessage::Report { host_id, report }).await
    }

    /// Deliver an agent's full job listing.
    pub async fn sync(&self, host_id: HostId, jobs: Vec<AgentJobStatus>) -> SchedulerResult<()> {
        self.notify(SchedulerMessage::Sync { host_id, jobs }).await
    }

    pub async fn host_event(&self, event: HostEvent) -> SchedulerResult<()> {
        self.notify(SchedulerMessage::Membership(event)).await
    }

    /// Subscribe to job events after `after`, optionally for one app.
    pub async fn subscribe(
        &self,
        after: SequenceId,
        app_id: Option<AppId>,
    ) -> SchedulerResult<mpsc::Receiver<JobStreamItem>> {
        self.request(|reply| SchedulerMessage::Subscribe {
            after,
            app_id,
            reply,
        })
        .await
    }

    pub async fn list_jobs(&self, app_id: Option<AppId>) -> SchedulerResult<Vec<JobView>> {
        self.request(|reply| SchedulerMessage::ListJobs { app_id, reply })
            .await
    }

    pub async fn get_job(&self, job_id: JobId) -> SchedulerResult<JobView> {
        self.request(|reply| SchedulerMessage::GetJob { job_id, reply })
            .await
    }

    pub async fn list_hosts(&self) -> SchedulerResult<Vec<Host>> {
        self.request(|reply| SchedulerMessage::ListHosts { reply })
            .await
    }

    pub async fn list_formations(&self) -> SchedulerResult<Vec<FormationView>> {
        self.request(|reply| SchedulerMessage::ListFormations { reply })
            .await
    }

    /// Whether the decision loop is still running.
    pub fn is_alive(&self) -> bool {
        !self.mailbox.is_closed()
    }
}
