//! Job Event Publisher.
//!
//! Owned by the scheduler core and driven from its loop, so sequence
//! assignment, history and fan-out happen in one serialized place. Each
//! subscriber gets one bounded queue: the replay of retained history, then
//! the caught-up marker, then live events, all through the same channel.

use std::collections::VecDeque;

use chrono::Utc;
use convoy_events::{JobEvent, JobState, JobStreamItem};
use convoy_id::{AppId, SequenceId};
use convoy_reconcile::Checkpoint;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::JobRecord;

/// Default number of events kept for replay.
pub const DEFAULT_RETENTION: usize = 10_000;

/// Live events a subscriber may fall behind by before it is dropped.
pub const SUBSCRIBER_BUFFER: usize = 1024;

struct Subscriber {
    id: u64,
    app_id: Option<AppId>,
    checkpoint: Checkpoint,
    tx: mpsc::Sender<JobStreamItem>,
}

/// Sequenced event history with live fan-out.
pub struct JobEventPublisher {
    last_sequence_id: SequenceId,
    history: VecDeque<JobEvent>,
    retention: usize,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    buffer: usize,
}

impl JobEventPublisher {
    pub fn new(retention: usize) -> Self {
        Self::with_buffer(retention, SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(retention: usize, buffer: usize) -> Self {
        Self {
            last_sequence_id: SequenceId::ZERO,
            history: VecDeque::new(),
            retention: retention.max(1),
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            buffer: buffer.max(1),
        }
    }

    pub fn last_sequence_id(&self) -> SequenceId {
        self.last_sequence_id
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Oldest retained sequence ID, if any.
    pub fn oldest_retained(&self) -> Option<SequenceId> {
        self.history.front().map(|e| e.sequence_id)
    }

    /// Subscribe from `after` (exclusive), optionally for one app.
    ///
    /// The returned queue first holds every retained event after `after`, then
    /// a [`JobStreamItem::CaughtUp`] marker, then live events as they are
    /// published.
    pub fn subscribe(
        &mut self,
        after: SequenceId,
        app_id: Option<AppId>,
    ) -> mpsc::Receiver<JobStreamItem> {
        let replay: Vec<JobEvent> = self
            .history
            .iter()
            .filter(|e| e.sequence_id > after && matches_app(app_id.as_ref(), e))
            .cloned()
            .collect();

        let (tx, rx) = mpsc::channel(replay.len() + 1 + self.buffer);
        let replayed = replay.len();
        for event in replay {
            // Capacity covers the replay and the marker.
            let _ = tx.try_send(JobStreamItem::Event(event));
        }
        let _ = tx.try_send(JobStreamItem::CaughtUp {
            sequence_id: self.last_sequence_id,
        });

        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        debug!(
            subscriber = id,
            after = %after,
            replayed,
            caught_up_at = %self.last_sequence_id,
            "Subscriber registered"
        );

        self.subscribers.push(Subscriber {
            id,
            app_id,
            checkpoint: Checkpoint::new(self.last_sequence_id.value().max(after.value())),
            tx,
        });
        rx
    }

    /// Publish a state change of `record`, assigning the next sequence ID.
    pub fn publish(&mut self, record: &JobRecord, state: JobState) -> Option<JobEvent> {
        let Some(host_id) = record.host_id.clone() else {
            warn!(job_id = %record.job_id, "Not publishing event for a job without a host");
            return None;
        };

        self.last_sequence_id = self.last_sequence_id.next();
        let event = JobEvent {
            sequence_id: self.last_sequence_id,
            job_id: record.job_id,
            host_id,
            app_id: record.app_id(),
            release_id: record.release_id(),
            process_type: record.process_type().to_string(),
            state,
            exit_status: record.exit_status,
            timestamp: Utc::now(),
        };

        self.history.push_back(event.clone());
        while self.history.len() > self.retention {
            self.history.pop_front();
        }

        self.fan_out(&event);
        Some(event)
    }

    fn fan_out(&mut self, event: &JobEvent) {
        self.subscribers.retain_mut(|sub| {
            if !matches_app(sub.app_id.as_ref(), event)
                || sub.checkpoint.is_processed(event.sequence_id.value())
            {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(JobStreamItem::Event(event.clone())) {
                Ok(()) => sub.checkpoint.advance(event.sequence_id.value()).is_ok(),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = sub.id, "Subscriber queue full, dropping subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = sub.id, "Subscriber went away");
                    false
                }
            }
        });
    }
}

fn matches_app(filter: Option<&AppId>, event: &JobEvent) -> bool {
    filter.map_or(true, |app_id| *app_id == event.app_id)
}
