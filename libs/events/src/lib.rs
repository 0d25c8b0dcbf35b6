//! # convoy-events
//!
//! Data model shared between the scheduler and its collaborators.
//!
//! ## Inbound
//!
//! - [`Formation`] records from the controller (desired process counts plus
//!   release metadata such as the omni flag)
//! - [`HostEvent`]s from discovery (host added / removed)
//! - [`AgentReport`]s and [`AgentJobStatus`] resyncs from host agents
//!
//! ## Outbound
//!
//! - [`JobSpec`] sent to a host agent to start a job
//! - [`JobEvent`]s published to subscribers, strictly ordered by
//!   [`SequenceId`](convoy_id::SequenceId), with a synthetic caught-up marker
//!   separating replayed history from live delivery

mod error;
mod job_event;
mod types;

pub use error::EventError;
pub use job_event::*;
pub use types::*;
