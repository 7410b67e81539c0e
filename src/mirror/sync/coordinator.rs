//! Pass scheduling for the mirror.
//!
//! The `SyncCoordinator` owns the reconciler and guarantees that passes never overlap: a
//! trigger arriving while a pass runs sets a single pending flag, and however many triggers
//! arrive, exactly one more pass runs once the current one ends. Each pass visits the kinds
//! in fixed order and publishes its progress on the coordinator's event bus.

use crate::ledger::EntityKind;
use crate::mirror::sync::cursor::SyncCursor;
use crate::mirror::sync::events::{EventBus, SyncEvent};
use crate::mirror::sync::reconciler::Reconciler;
use crate::mirror::sync::report::PassReport;

use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

const EVENT_CAPACITY: usize = 64;

/// What asked for a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Catch-up pass after a subscription was established
    Subscribed,
    /// The chain reported a change
    Notification,
    /// Fallback polling timer
    Poll,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerSource::Subscribed => "subscribed",
            TriggerSource::Notification => "notification",
            TriggerSource::Poll => "poll",
        })
    }
}

/// Result of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The coordinator was idle and a pass has started
    Started,
    /// A pass is running; a re-run is pending
    Queued,
}

#[derive(Debug, Default)]
struct PassState {
    running: bool,
    pending: Option<TriggerSource>,
}

/// Serializes sync passes and publishes their outcome
pub struct SyncCoordinator {
    reconciler: tokio::sync::Mutex<Reconciler>,
    state: Mutex<PassState>,
    busy: watch::Sender<bool>,
    events: EventBus,
    passes_started: AtomicU64,
    passes_completed: AtomicU64,
    cursors: Mutex<HashMap<EntityKind, SyncCursor>>,
}

impl SyncCoordinator {
    pub fn new(reconciler: Reconciler) -> Arc<Self> {
        let (busy, _) = watch::channel(false);

        Arc::new(Self {
            reconciler: tokio::sync::Mutex::new(reconciler),
            state: Mutex::new(PassState::default()),
            busy,
            events: EventBus::new(EVENT_CAPACITY),
            passes_started: AtomicU64::new(0),
            passes_completed: AtomicU64::new(0),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Request a pass.
    ///
    /// Starts one on a new task if the coordinator is idle, otherwise marks a re-run as
    /// pending. Never waits for the pass itself.
    pub fn trigger(self: &Arc<Self>, source: TriggerSource) -> TriggerOutcome {
        if !self.claim(source) {
            debug!("Pass already running, queued re-run ({})", source);
            return TriggerOutcome::Queued;
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.drive(source).await });
        TriggerOutcome::Started
    }

    /// "Mirror updated" events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Resolve once no pass is running or pending
    pub async fn wait_idle(&self) {
        let mut busy = self.busy.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = busy.wait_for(|running| !*running).await;
    }

    pub fn is_running(&self) -> bool {
        *self.busy.borrow()
    }

    pub fn passes_completed(&self) -> u64 {
        self.passes_completed.load(Ordering::SeqCst)
    }

    /// Cursor for a kind as of the last finished pass
    pub fn cursor(&self, kind: EntityKind) -> Option<SyncCursor> {
        self.cursor_snapshot().get(&kind).cloned()
    }

    fn pass_state(&self) -> MutexGuard<'_, PassState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cursor_snapshot(&self) -> MutexGuard<'_, HashMap<EntityKind, SyncCursor>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the coordinator running, or record a pending re-run if it already is
    fn claim(&self, source: TriggerSource) -> bool {
        let mut state = self.pass_state();
        if state.running {
            state.pending.get_or_insert(source);
            return false;
        }
        state.running = true;
        self.busy.send_replace(true);
        true
    }

    /// Take the pending re-run, or go idle if there is none
    fn next_pending(&self) -> Option<TriggerSource> {
        let mut state = self.pass_state();
        let next = state.pending.take();
        if next.is_none() {
            state.running = false;
            self.busy.send_replace(false);
        }
        next
    }

    async fn drive(self: Arc<Self>, mut source: TriggerSource) {
        loop {
            if AssertUnwindSafe(self.run_pass(source))
                .catch_unwind()
                .await
                .is_err()
            {
                error!("Sync pass triggered by {} panicked", source);
            }

            match self.next_pending() {
                Some(next) => source = next,
                None => break,
            }
        }
    }

    /// Run every kind once, in pass order. A failing kind does not stop the ones after it.
    async fn run_pass(&self, trigger: TriggerSource) -> PassReport {
        let pass = self.passes_started.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Starting sync pass {} ({})", pass, trigger);
        self.events.publish(SyncEvent::PassStarted { pass, trigger });

        let mut report = PassReport::new(pass, trigger);
        let mut reconciler = self.reconciler.lock().await;

        for kind in reconciler.kinds() {
            match reconciler.reconcile(kind).await {
                Ok(entity) => {
                    self.events.publish(SyncEvent::EntitySynced {
                        pass,
                        report: entity.clone(),
                    });
                    report.entities.push(entity);
                }
                Err(e) => {
                    self.events.publish(SyncEvent::EntityFailed {
                        pass,
                        kind,
                        error: e.to_string(),
                    });
                    report.failures.push((kind, e.to_string()));
                }
            }

            if let Some(cursor) = reconciler.cursor(kind) {
                debug!(
                    "{} cursor: {} passes, {} consecutive failures",
                    kind,
                    cursor.passes_completed(),
                    cursor.consecutive_failures()
                );
                self.cursor_snapshot().insert(kind, cursor.clone());
            }
        }
        drop(reconciler);

        report.finish();
        self.passes_completed.fetch_add(1, Ordering::SeqCst);
        self.events.publish(SyncEvent::PassCompleted {
            report: report.clone(),
        });
        report
    }
}
