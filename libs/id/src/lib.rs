//! # convoy-id
//!
//! Stable ID types, parsing, and validation for the convoy scheduler.
//!
//! ## ID Format
//!
//! Scheduler-generated IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `app_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `rel_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `job_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! Host IDs are different: they are assigned by the discovery system and
//! are carried around as opaque strings (see [`HostId`]).
//!
//! Event sequence numbers are plain monotonic integers (see [`SequenceId`]).

mod error;
#[doc(hidden)]
pub mod prefixed;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
