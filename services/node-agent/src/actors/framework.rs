//! Core actor framework types and traits.
//!
//! Provides the fundamental building blocks for the actor system:
//! - `Actor` trait for defining actor behavior
//! - `Supervisor` for managing actor lifecycles
//! - `ActorHandle` for sending messages to actors

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// The Actor trait defines behavior for an actor.
///
/// Actors process messages one at a time and own state nobody else touches.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Send + 'static;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop. An `Err` stops
    /// the actor.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    /// Called when the actor starts.
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

    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,
}

impl ActorContext {
    /// Create a new actor context.
    pub fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self { actor_id, shutdown }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Actor failed and cannot continue.
    #[error("actor failed: {0}")]
    Failed(String),

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M> {
    tx: mpsc::Sender<M>,
}

impl<M> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send + 'static> ActorHandle<M> {
    /// Send a message to the actor, waiting for mailbox capacity.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }
}

/// Supervised actor task.
struct Child {
    task_handle: tokio::task::JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl Child {
    fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Supervisor for managing actor lifecycles.
///
/// Every spawned actor stops on its own stop signal or on the supervisor's
/// shutdown signal, whichever comes first.
pub struct Supervisor {
    /// Supervised actors.
    children: HashMap<String, Child>,

    /// Agent-wide shutdown signal.
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            children: HashMap::new(),
            shutdown,
        }
    }

    /// Agent-wide shutdown signal shared with non-actor loops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Spawn and supervise an actor.
    pub fn spawn<A>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
        let (tx, rx) = mpsc::channel(mailbox_size);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task_handle = tokio::spawn(run_actor_loop(
            actor,
            rx,
            stop_rx,
            self.shutdown.clone(),
            actor_id.clone(),
        ));
        self.children.insert(
            actor_id.clone(),
            Child {
                task_handle,
                stop_tx,
            },
        );

        info!(actor_id = %actor_id, "Spawned actor");

        ActorHandle { tx }
    }

    /// Stop all supervised actors.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            let _ = child.stop_tx.send(true);
        }

        // Wait for all to finish with timeout
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Force abort any remaining
        for (actor_id, child) in &self.children {
            if child.is_running() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.task_handle.abort();
            }
        }

        self.children.clear();
    }

    /// Get count of running actors.
    pub fn running_count(&self) -> usize {
        self.children.values().filter(|c| c.is_running()).count()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Resolves once `rx` carries `true` or its sender is gone.
pub async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }
    debug!(actor_id = %actor_id, "Actor started");

    let mut processed = 0u64;
    loop {
        tokio::select! {
            biased;

            // Check shutdown first
            () = stop_requested(&mut shutdown) => {
                info!(actor_id = %actor_id, "Actor received shutdown signal");
                break;
            }

            () = stop_requested(&mut stop) => {
                info!(actor_id = %actor_id, "Actor received stop signal");
                break;
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                processed += 1;
                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor failed");
                        break;
                    }
                }
            }
        }
    }

    actor.on_stop(&mut ctx).await;
    info!(actor_id = %actor_id, messages_processed = processed, "Actor stopped");
}

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    enum CounterMessage {
        Add(u64),
        Fail,
        Stop,
    }

    struct Counter {
        total: Arc<Mutex<u64>>,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(
            &mut self,
            msg: Self::Message,
            _ctx: &mut ActorContext,
        ) -> Result<bool, ActorError> {
            match msg {
                CounterMessage::Add(n) => {
                    *self.total.lock().await += n;
                    Ok(true)
                }
                CounterMessage::Fail => Err(ActorError::Failed("boom".to_string())),
                CounterMessage::Stop => Ok(false),
            }
        }
    }

    async fn wait_stopped(supervisor: &Supervisor) {
        for _ in 0..100 {
            if supervisor.running_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_actor_handles_messages_in_order_and_stops_on_request() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let total = Arc::new(Mutex::new(0));
        let handle = supervisor.spawn(
            Counter {
                total: Arc::clone(&total),
            },
            8,
        );

        handle.send(CounterMessage::Add(2)).await.unwrap();
        handle.send(CounterMessage::Add(3)).await.unwrap();
        handle.send(CounterMessage::Stop).await.unwrap();
        handle.send(CounterMessage::Add(100)).await.ok();

        wait_stopped(&supervisor).await;
        assert_eq!(supervisor.running_count(), 0);
        assert_eq!(*total.lock().await, 5);
    }

    #[tokio::test]
    async fn test_actor_error_stops_actor() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let handle = supervisor.spawn(
            Counter {
                total: Arc::new(Mutex::new(0)),
            },
            8,
        );

        handle.send(CounterMessage::Fail).await.unwrap();
        wait_stopped(&supervisor).await;
        assert_eq!(supervisor.running_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_actors() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let handle = supervisor.spawn(
            Counter {
                total: Arc::new(Mutex::new(0)),
            },
            8,
        );
        assert_eq!(supervisor.running_count(), 1);

        shutdown_tx.send(true).unwrap();
        supervisor.stop_all().await;
        assert_eq!(supervisor.running_count(), 0);
        assert!(matches!(
            handle.send(CounterMessage::Add(1)).await,
            Err(ActorError::ActorStopped)
        ));
    }
}
