//! "Mirror updated" events.
//!
//! The coordinator publishes one event when a pass starts, one per kind as it finishes or
//! fails, and one when the pass completes. Downstream readers subscribe to the broadcast
//! channel; handlers started with [`spawn_handler`] run on their own task so a slow handler
//! never holds up a pass.

use crate::ledger::EntityKind;
use crate::mirror::MirrorSyncError;
use crate::mirror::sync::coordinator::TriggerSource;
use crate::mirror::sync::report::{EntityReport, PassReport};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events published while the mirror is being synchronized
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pass has begun
    PassStarted { pass: u64, trigger: TriggerSource },
    /// One kind was reconciled
    EntitySynced { pass: u64, report: EntityReport },
    /// One kind failed; its mirror was left untouched
    EntityFailed {
        pass: u64,
        kind: EntityKind,
        error: String,
    },
    /// Every kind has been visited
    PassCompleted { report: PassReport },
}

/// Trait for reacting to sync events.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), MirrorSyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Broadcast channel for sync events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            debug!("Sync event dropped: no subscribers");
        }
    }
}

/// Run a handler for every event received on a dedicated task.
///
/// Errors from the handler are logged and do not stop it. The task ends once the bus it was
/// subscribed to is dropped.
pub fn spawn_handler(
    mut receiver: broadcast::Receiver<SyncEvent>,
    mut handler: Box<dyn SyncEventHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(e) = handler.handle(&event).await {
                        error!("Handler {} failed to process event: {}", handler.name(), e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Handler {} skipped {} events", handler.name(), skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Writes pass and kind outcomes to the log
pub struct LoggingHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), MirrorSyncError> {
        match event {
            SyncEvent::PassStarted { pass, trigger } => {
                debug!("Pass {} started by {}", pass, trigger);
            }
            SyncEvent::EntitySynced { pass, report } => {
                info!("Pass {} synced {}", pass, report.summary());
                for err in &report.errors {
                    warn!("Pass {} {} record error: {}", pass, report.kind, err);
                }
            }
            SyncEvent::EntityFailed { pass, kind, error } => {
                error!("Pass {} failed to sync {}: {}", pass, kind, error);
            }
            SyncEvent::PassCompleted { report } => {
                if report.is_clean() {
                    info!("{}", report.summary());
                } else {
                    warn!("{}", report.summary());
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
