//! Scheduler error types.

use convoy_id::{HostId, JobId};

use crate::agent::AgentError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A host agent call failed after the attempt budget was spent.
    #[error("host agent {host_id} unavailable: {source}")]
    TransientAgent {
        host_id: HostId,
        #[source]
        source: AgentError,
    },

    /// No active host can take the job. The slot stays pending and is
    /// retried on the next membership change.
    #[error("no eligible active host")]
    Placement,

    /// The job store reached a state that correct operation never produces.
    /// Fatal: the decision loop halts.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A report or query named a job the store did not create.
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The decision loop is no longer running.
    #[error("scheduler stopped")]
    Stopped,
}

impl SchedulerError {
    /// Whether the decision loop must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
