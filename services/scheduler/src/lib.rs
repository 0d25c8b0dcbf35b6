//! Convoy Scheduler Library
//!
//! The scheduler keeps a fleet of worker hosts running what the controller
//! declares: for every formation it converges the live job count of each
//! process type on the desired count, runs omni types once per host, and
//! restarts jobs that end unexpectedly with exponential backoff.
//!
//! ## Architecture
//!
//! ```text
//! HTTP API ─┐
//! Discovery ├─> SchedulerCore (one actor, one mailbox)
//! Agents ───┘     ├── JobStore       (authoritative job records)
//!                 ├── HostSet        (membership)
//!                 ├── FormationTable (desired state)
//!                 └── Publisher      (ordered job events)
//! ```
//!
//! Decisions are pure functions over a [`plan::Snapshot`]. Agent calls and
//! backoff timers run as tasks and report back as messages.
//!
//! ## Modules
//!
//! - `scheduler`: the core actor and its client handle
//! - `formation`, `omni`, `restart`, `membership`: decision functions
//! - `store`, `hosts`, `placement`, `publisher`: core-owned state
//! - `agent`, `discovery`: collaborator clients

pub mod actor;
pub mod agent;
pub mod api;
pub mod config;
pub mod discovery;
pub mod error;
pub mod formation;
pub mod hosts;
pub mod membership;
pub mod omni;
pub mod placement;
pub mod plan;
pub mod publisher;
pub mod restart;
pub mod scheduler;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use agent::{AgentError, HostAgent, HttpHostAgent, MockHostAgent};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{FormationReceipt, RunJobRequest, Scheduler, SchedulerHandle, SchedulerSettings};
pub use store::JobView;
