//! In-process event bus.
//!
//! Producers (HTTP API, startup greeting) publish [`OwlEvent`]s; the
//! dispatcher turns them into sequencer runs and movement batches. Events are
//! fire-and-forget: publishing never waits for the owl to act.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hoot_core::types::MovementRequest;

use crate::sequencer::Sequencer;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum OwlEvent {
    /// Text to be annotated and spoken.
    TextReceived(String),
    /// Gestures to perform back to back, no speech.
    MovementBatch(Vec<MovementRequest>),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OwlEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that will see it.
    pub fn publish(&self, event: OwlEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                warn!("events: no subscribers, dropped {event:?}");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OwlEvent> {
        self.tx.subscribe()
    }
}

/// Consume events until `shutdown` fires or the bus closes.
pub fn spawn_dispatcher(
    bus: &EventBus,
    sequencer: Sequencer,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        info!("events: dispatcher started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => dispatch(&sequencer, event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("events: dispatcher lagged, {n} event(s) lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("events: dispatcher stopped");
    })
}

fn dispatch(sequencer: &Sequencer, event: OwlEvent) {
    match event {
        OwlEvent::TextReceived(text) => {
            debug!("events: text received ({} chars)", text.len());
            // The run is detached; it finishes on its own task.
            let _run = sequencer.perform_text(text);
        }
        OwlEvent::MovementBatch(batch) => {
            let Some(motion) = sequencer.motion().cloned() else {
                warn!("events: motion disabled, ignoring batch of {}", batch.len());
                return;
            };
            tokio::spawn(async move {
                motion.run_batch(&batch).await;
            });
        }
    }
}
