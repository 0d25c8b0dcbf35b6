//! Published job events and their wire form.

use chrono::{DateTime, Utc};
use convoy_id::{AppId, HostId, JobId, ReleaseId, SequenceId};
use serde::{Deserialize, Serialize};

use crate::{EventError, JobState};

/// A published job state transition.
///
/// `state` is always one of `up`, `down` or `crashed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Globally monotonic position in the event stream.
    pub sequence_id: SequenceId,

    pub job_id: JobId,
    pub host_id: HostId,
    pub app_id: AppId,
    pub release_id: ReleaseId,

    /// Empty for one-off jobs started without a process type.
    pub process_type: String,

    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,

    pub timestamp: DateTime<Utc>,
}

/// One item delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStreamItem {
    Event(JobEvent),

    /// Replay of retained history is complete; everything after this is live.
    /// Carries the last sequence ID known when the subscription was taken.
    CaughtUp { sequence_id: SequenceId },
}

impl JobStreamItem {
    pub fn sequence_id(&self) -> SequenceId {
        match self {
            Self::Event(e) => e.sequence_id,
            Self::CaughtUp { sequence_id } => *sequence_id,
        }
    }

    pub fn is_caught_up(&self) -> bool {
        matches!(self, Self::CaughtUp { .. })
    }
}

/// Flat NDJSON line for the event stream.
///
/// The caught-up marker is encoded as a line whose `type`, `job_id`,
/// `host_id`, `app_id`, `release_id` and `state` are all empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEventLine {
    pub seq: u64,
    pub job_id: String,
    pub host_id: String,
    pub app_id: String,
    pub release_id: String,
    #[serde(rename = "type")]
    pub process_type: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    pub ts: DateTime<Utc>,
}

impl JobEventLine {
    fn is_marker(&self) -> bool {
        self.job_id.is_empty() && self.state.is_empty() && self.process_type.is_empty()
    }

    /// Decodes a line back into a stream item.
    pub fn into_item(self) -> Result<JobStreamItem, EventError> {
        if self.is_marker() {
            return Ok(JobStreamItem::CaughtUp {
                sequence_id: SequenceId::new(self.seq),
            });
        }

        let state: JobState = self.state.parse()?;
        if !state.is_published() {
            return Err(EventError::UnpublishedState(self.state));
        }

        Ok(JobStreamItem::Event(JobEvent {
            sequence_id: SequenceId::new(self.seq),
            job_id: self.job_id.parse()?,
            host_id: self.host_id.parse()?,
            app_id: self.app_id.parse()?,
            release_id: self.release_id.parse()?,
            process_type: self.process_type,
            state,
            exit_status: self.exit_status,
            timestamp: self.ts,
        }))
    }
}

impl From<&JobStreamItem> for JobEventLine {
    fn from(item: &JobStreamItem) -> Self {
        match item {
            JobStreamItem::Event(e) => Self {
                seq: e.sequence_id.value(),
                job_id: e.job_id.to_string(),
                host_id: e.host_id.to_string(),
                app_id: e.app_id.to_string(),
                release_id: e.release_id.to_string(),
                process_type: e.process_type.clone(),
                state: e.state.to_string(),
                exit_status: e.exit_status,
                ts: e.timestamp,
            },
            JobStreamItem::CaughtUp { sequence_id } => Self {
                seq: sequence_id.value(),
                job_id: String::new(),
                host_id: String::new(),
                app_id: String::new(),
                release_id: String::new(),
                process_type: String::new(),
                state: String::new(),
                exit_status: None,
                ts: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64, state: JobState) -> JobEvent {
        JobEvent {
            sequence_id: SequenceId::new(seq),
            job_id: JobId::new(),
            host_id: HostId::parse("host-a").unwrap(),
            app_id: AppId::new(),
            release_id: ReleaseId::new(),
            process_type: "echoer".to_string(),
            state,
            exit_status: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_event_line_decodes_to_same_event() {
        let original = JobStreamItem::Event(event(3, JobState::Up));
        let line = JobEventLine::from(&original);
        assert_eq!(line.state, "up");
        assert_eq!(line.process_type, "echoer");

        let json = serde_json::to_string(&line).unwrap();
        assert!(json.contains("\"type\":\"echoer\""));
        let decoded: JobEventLine = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.into_item().unwrap(), original);
    }

    #[test]
    fn test_caught_up_marker_is_empty_sentinel() {
        let marker = JobStreamItem::CaughtUp {
            sequence_id: SequenceId::new(9),
        };
        let line = JobEventLine::from(&marker);
        assert!(line.process_type.is_empty());
        assert!(line.job_id.is_empty());
        assert_eq!(line.seq, 9);

        let item = line.into_item().unwrap();
        assert!(item.is_caught_up());
        assert_eq!(item.sequence_id(), SequenceId::new(9));
    }

    #[test]
    fn test_unpublished_state_rejected() {
        let mut line = JobEventLine::from(&JobStreamItem::Event(event(1, JobState::Up)));
        line.state = "starting".to_string();
        assert!(matches!(
            line.into_item(),
            Err(EventError::UnpublishedState(_))
        ));
    }

    #[test]
    fn test_bad_job_id_is_invalid_payload() {
        let mut line = JobEventLine::from(&JobStreamItem::Event(event(1, JobState::Down)));
        line.job_id = "app_01HV4Z2WQXKJNM8GPQY6VBKC3D".to_string();
        assert!(matches!(line.into_item(), Err(EventError::InvalidPayload(_))));
    }
}
