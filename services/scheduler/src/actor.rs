//! Minimal single-mailbox actor runtime.
//!
//! The scheduler core runs as one actor: every inbound event is a message in
//! one bounded mailbox, handled strictly in arrival order by one task. Nothing
//! outside the actor touches its state.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of an actor.
///
/// Actors process messages one at a time and own their state exclusively.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called once before the first message.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Messages handled so far.
    pub messages_processed: u64,

    /// Current lifecycle state.
    pub state: ActorState,
}

impl ActorContext {
    fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
            state: ActorState::Starting,
        }
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// The message failed; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// The actor cannot continue safely and stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
#[derive(Debug)]
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Whether the actor has stopped taking messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Spawn an actor on the current runtime. `build` receives the actor's own
/// mailbox handle, e.g. to schedule messages to itself.
///
/// Returns the mailbox handle and the task running the actor loop.
pub fn spawn_with<A, F>(
    mailbox_size: usize,
    shutdown: watch::Receiver<bool>,
    build: F,
) -> (ActorHandle<A::Message>, JoinHandle<()>)
where
    A: Actor,
    F: FnOnce(ActorHandle<A::Message>) -> A,
{
    let (tx, rx) = mpsc::channel(mailbox_size.max(1));
    let handle = ActorHandle { tx };

    let actor = build(handle.clone());
    let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
    let task = tokio::spawn(run_actor_loop(actor, rx, shutdown, actor_id.clone()));

    info!(actor_id = %actor_id, mailbox_size, "Spawned actor");
    (handle, task)
}

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(ActorError::Permanent(reason)) => {
                        error!(actor_id = %actor_id, error = %reason, "Actor halted");
                        ctx.state = ActorState::Failed;
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    // Close the mailbox before cleanup so senders observe the stop.
    rx.close();

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopped;
    }

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        state = ?ctx.state,
        "Actor stopped"
    );
}

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
