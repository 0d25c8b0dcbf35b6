//! Record and message types exchanged with the scheduler's collaborators.

use std::collections::BTreeMap;

use convoy_id::{AppId, HostId, JobId, ReleaseId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Job State
// =============================================================================

/// Lifecycle state of a single job instantiation.
///
/// ```text
/// pending -> starting -> up -> stopping -> down
///                 |       |
///                 +-------+----> crashed / down (unplanned)
/// ```
///
/// `down` and `crashed` are terminal for the instantiation. The slot it
/// occupied may live on through a replacement job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Starting,
    Up,
    Stopping,
    Down,
    Crashed,
}

impl JobState {
    /// Counts toward a formation's running total.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Starting | Self::Up)
    }

    /// The instantiation is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Down | Self::Crashed)
    }

    /// Only `up`, `down` and `crashed` transitions are published.
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Up | Self::Down | Self::Crashed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Stopping => "stopping",
            Self::Down => "down",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "starting" => Ok(Self::Starting),
            "up" => Ok(Self::Up),
            "stopping" => Ok(Self::Stopping),
            "down" => Ok(Self::Down),
            "crashed" => Ok(Self::Crashed),
            other => Err(EventError::UnknownState(other.to_string())),
        }
    }
}

// =============================================================================
// Formations and Releases
// =============================================================================

/// Release metadata for one process type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessType {
    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Run exactly one instance on every active host.
    #[serde(default)]
    pub omni: bool,
}

/// Identity of a formation: one app running one release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FormationKey {
    pub app_id: AppId,
    pub release_id: ReleaseId,
}

impl std::fmt::Display for FormationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app_id, self.release_id)
    }
}

/// Desired process counts for an app's release, as declared by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formation {
    pub app_id: AppId,
    pub release_id: ReleaseId,

    /// Desired instance count per process type. For omni types any non-zero
    /// count means "enabled on every active host".
    #[serde(default)]
    pub processes: BTreeMap<String, u32>,

    /// Process definitions from the release.
    #[serde(default)]
    pub release_processes: BTreeMap<String, ProcessType>,
}

impl Formation {
    pub fn new(app_id: AppId, release_id: ReleaseId) -> Self {
        Self {
            app_id,
            release_id,
            processes: BTreeMap::new(),
            release_processes: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> FormationKey {
        FormationKey {
            app_id: self.app_id,
            release_id: self.release_id,
        }
    }

    /// Desired count for a process type (0 when absent).
    pub fn desired(&self, process_type: &str) -> u32 {
        self.processes.get(process_type).copied().unwrap_or(0)
    }

    /// Whether the release marks this process type as omni.
    pub fn is_omni(&self, process_type: &str) -> bool {
        self.release_processes
            .get(process_type)
            .is_some_and(|p| p.omni)
    }

    /// Omni process types that are currently enabled.
    pub fn enabled_omni_types(&self) -> impl Iterator<Item = &str> {
        self.processes
            .iter()
            .filter(|(t, n)| **n > 0 && self.is_omni(t))
            .map(|(t, _)| t.as_str())
    }

    /// Builds the agent-facing spec for a new job of `process_type`.
    pub fn job_spec(&self, job_id: JobId, process_type: &str) -> JobSpec {
        let process = self
            .release_processes
            .get(process_type)
            .cloned()
            .unwrap_or_default();
        JobSpec {
            job_id,
            app_id: self.app_id,
            release_id: self.release_id,
            process_type: Some(process_type.to_string()),
            cmd: process.cmd,
            env: process.env,
        }
    }
}

// =============================================================================
// Host Agent Messages
// =============================================================================

/// What a host agent needs to start a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: JobId,
    pub app_id: AppId,
    pub release_id: ReleaseId,

    /// `None` for one-off jobs started without a process type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_type: Option<String>,

    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Job states a host agent can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentJobState {
    Starting,
    Up,
    Down,
    Crashed,
}

/// A lifecycle transition observed by a host agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub job_id: JobId,
    pub state: AgentJobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

impl AgentReport {
    /// The job state this report moves the record to.
    ///
    /// A `down` carrying a non-zero exit status is an abnormal exit and is
    /// recorded as `crashed`.
    pub fn resulting_state(&self) -> JobState {
        match self.state {
            AgentJobState::Starting => JobState::Starting,
            AgentJobState::Up => JobState::Up,
            AgentJobState::Crashed => JobState::Crashed,
            AgentJobState::Down => match self.exit_status {
                Some(code) if code != 0 => JobState::Crashed,
                _ => JobState::Down,
            },
        }
    }
}

/// One job in a host agent's full job listing, sent on (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentJobStatus {
    pub job_id: JobId,
    pub state: AgentJobState,
}

// =============================================================================
// Discovery Messages
// =============================================================================

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventKind {
    Added,
    Removed,
}

/// A host joining or leaving the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEvent {
    pub host_id: HostId,
    pub kind: HostEventKind,

    /// Agent address (`host:port`), present on `added`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl HostEvent {
    pub fn added(host_id: HostId, address: impl Into<String>) -> Self {
        Self {
            host_id,
            kind: HostEventKind::Added,
            address: Some(address.into()),
        }
    }

    pub fn removed(host_id: HostId) -> Self {
        Self {
            host_id,
            kind: HostEventKind::Removed,
            address: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
