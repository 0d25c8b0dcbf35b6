//! Host Agent client interface.
//!
//! The scheduler dials each host's agent to start and stop jobs. Calls run
//! outside the decision loop under a bounded [`AttemptStrategy`]; their
//! failures come back into the loop as messages.
//!
//! [`MockHostAgent`] simulates a fleet in-process for tests and local runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use convoy_events::{AgentJobState, AgentJobStatus, AgentReport, JobSpec};
use convoy_id::{HostId, JobId};
use convoy_reconcile::AttemptStrategy;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::scheduler::SchedulerHandle;

/// Errors from a host agent call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// Connect failure, timeout or server error. Worth retrying.
    #[error("transient agent error: {0}")]
    Transient(String),

    /// The agent refused the request. Retrying will not help.
    #[error("agent rejected request: {0}")]
    Rejected(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Where to reach a host's agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host_id: HostId,
    pub address: String,
}

/// Per-host agent operations.
#[async_trait]
pub trait HostAgent: Send + Sync + 'static {
    /// Start a job. Returns the job ID the agent accepted.
    async fn start_job(&self, host: &HostTarget, spec: &JobSpec) -> Result<JobId, AgentError>;

    /// Stop a job.
    async fn stop_job(&self, host: &HostTarget, job_id: JobId) -> Result<(), AgentError>;
}

/// Run `op` until it succeeds, fails permanently, or the strategy runs out.
pub async fn with_attempts<T, F, Fut>(strategy: AttemptStrategy, mut op: F) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };
        match strategy.next_delay(attempts, started.elapsed()) {
            Some(delay) => {
                debug!(attempts, error = %error, "Agent call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            None => {
                debug!(attempts, error = %error, "Agent call attempts exhausted");
                return Err(error);
            }
        }
    }
}

// =============================================================================
// HTTP Agent Client
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub job_id: JobId,
}

/// Agent client speaking JSON over HTTP.
pub struct HttpHostAgent {
    client: reqwest::Client,
}

impl HttpHostAgent {
    /// Create a client whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(AgentError::Rejected(format!("{status} - {body}")))
    } else {
        Err(AgentError::Transient(format!("{status} - {body}")))
    }
}

fn transport(e: reqwest::Error) -> AgentError {
    AgentError::Transient(e.to_string())
}

#[async_trait]
impl HostAgent for HttpHostAgent {
    async fn start_job(&self, host: &HostTarget, spec: &JobSpec) -> Result<JobId, AgentError> {
        let url = format!("http://{}/v1/jobs", host.address);
        debug!(url = %url, job_id = %spec.job_id, "Starting job on agent");

        let response = self
            .client
            .post(&url)
            .json(spec)
            .send()
            .await
            .map_err(transport)?;
        let response = check_status(response).await?;

        let body: StartJobResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Transient(format!("invalid start response: {e}")))?;
        Ok(body.job_id)
    }

    async fn stop_job(&self, host: &HostTarget, job_id: JobId) -> Result<(), AgentError> {
        let url = format!("http://{}/v1/jobs/{}", host.address, job_id);
        debug!(url = %url, job_id = %job_id, "Stopping job on agent");

        let response = self.client.delete(&url).send().await.map_err(transport)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Already gone; the next resync reconciles it.
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }
}

// =============================================================================
// Mock Agent
// =============================================================================

#[derive(Debug, Clone)]
struct MockJob {
    host_id: HostId,
    process_type: String,
}

#[derive(Default)]
struct MockState {
    running: BTreeMap<JobId, MockJob>,
    stop_exit_status: HashMap<String, i32>,
    failing_hosts: HashSet<HostId>,
    starts: u64,
}

/// In-process fleet of host agents.
///
/// Starts are acknowledged and reported `up` at once. Stops report `down`
/// with the exit status configured for the process type (0 by default), so
/// a type configured with a non-zero status is seen as `crashed`.
#[derive(Default)]
pub struct MockHostAgent {
    scheduler: OnceLock<SchedulerHandle>,
    state: Mutex<MockState>,
}

impl MockHostAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the mock to the scheduler it reports to.
    pub fn attach(&self, scheduler: SchedulerHandle) {
        if self.scheduler.set(scheduler).is_err() {
            error!("[MOCK] Agent already attached to a scheduler");
        }
    }

    /// Exit status reported when a job of `process_type` is stopped.
    pub async fn set_stop_exit_status(&self, process_type: &str, status: i32) {
        self.state
            .lock()
            .await
            .stop_exit_status
            .insert(process_type.to_string(), status);
    }

    /// Make every call to `host_id` fail as unreachable.
    pub async fn fail_host(&self, host_id: &HostId) {
        self.state.lock().await.failing_hosts.insert(host_id.clone());
    }

    pub async fn restore_host(&self, host_id: &HostId) {
        self.state.lock().await.failing_hosts.remove(host_id);
    }

    /// Terminate a job outside the scheduler's control.
    ///
    /// Returns false if the job is not running.
    pub async fn kill(&self, job_id: JobId, exit_status: i32) -> bool {
        let job = self.state.lock().await.running.remove(&job_id);
        let Some(job) = job else {
            return false;
        };
        info!(job_id = %job_id, host_id = %job.host_id, exit_status, "[MOCK] Killing job");
        self.report(&job.host_id, job_id, AgentJobState::Down, Some(exit_status))
            .await;
        true
    }

    /// Drop a job without reporting it, as an agent restart would.
    pub async fn forget(&self, job_id: JobId) -> bool {
        self.state.lock().await.running.remove(&job_id).is_some()
    }

    /// The listing the agent on `host_id` would send on reconnect.
    pub async fn listing(&self, host_id: &HostId) -> Vec<AgentJobStatus> {
        self.state
            .lock()
            .await
            .running
            .iter()
            .filter(|(_, job)| job.host_id == *host_id)
            .map(|(job_id, _)| AgentJobStatus {
                job_id: *job_id,
                state: AgentJobState::Up,
            })
            .collect()
    }

    /// Running job IDs of a process type, in job ID order.
    pub async fn running_of_type(&self, process_type: &str) -> Vec<JobId> {
        self.state
            .lock()
            .await
            .running
            .iter()
            .filter(|(_, job)| job.process_type == process_type)
            .map(|(job_id, _)| *job_id)
            .collect()
    }

    pub async fn running_on(&self, host_id: &HostId) -> usize {
        self.state
            .lock()
            .await
            .running
            .values()
            .filter(|job| job.host_id == *host_id)
            .count()
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    /// Start calls accepted so far.
    pub async fn start_count(&self) -> u64 {
        self.state.lock().await.starts
    }

    async fn report(
        &self,
        host_id: &HostId,
        job_id: JobId,
        state: AgentJobState,
        exit_status: Option<i32>,
    ) {
        let Some(scheduler) = self.scheduler.get() else {
            debug!(job_id = %job_id, "[MOCK] Not attached, dropping report");
            return;
        };
        let report = AgentReport {
            job_id,
            state,
            exit_status,
        };
        if let Err(e) = scheduler.report(host_id.clone(), report).await {
            debug!(job_id = %job_id, error = %e, "[MOCK] Report not delivered");
        }
    }
}

#[async_trait]
impl HostAgent for MockHostAgent {
    async fn start_job(&self, host: &HostTarget, spec: &JobSpec) -> Result<JobId, AgentError> {
        {
            let mut state = self.state.lock().await;
            if state.failing_hosts.contains(&host.host_id) {
                return Err(AgentError::Transient(format!(
                    "[MOCK] host {} unreachable",
                    host.host_id
                )));
            }
            state.starts += 1;
            state.running.insert(
                spec.job_id,
                MockJob {
                    host_id: host.host_id.clone(),
                    process_type: spec.process_type.clone().unwrap_or_default(),
                },
            );
        }

        debug!(job_id = %spec.job_id, host_id = %host.host_id, "[MOCK] Job started");
        self.report(&host.host_id, spec.job_id, AgentJobState::Up, None)
            .await;
        Ok(spec.job_id)
    }

    async fn stop_job(&self, host: &HostTarget, job_id: JobId) -> Result<(), AgentError> {
        let (job, exit_status) = {
            let mut state = self.state.lock().await;
            if state.failing_hosts.contains(&host.host_id) {
                return Err(AgentError::Transient(format!(
                    "[MOCK] host {} unreachable",
                    host.host_id
                )));
            }
            let job = state.running.remove(&job_id);
            let exit_status = job
                .as_ref()
                .and_then(|j| state.stop_exit_status.get(&j.process_type).copied())
                .unwrap_or(0);
            (job, exit_status)
        };

        if job.is_none() {
            debug!(job_id = %job_id, "[MOCK] Stop for a job that is not running");
        }
        self.report(&host.host_id, job_id, AgentJobState::Down, Some(exit_status))
            .await;
        Ok(())
    }
}
