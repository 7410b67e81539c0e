//! Mirror Synchronization Module
//!
//! This module holds the logic that keeps the mirror store in line with the ledger application.
//! It is composed of several submodules, each responsible for a specific aspect of the sync process:
//!
//! - `coordinator`: Serializes passes, queues at most one re-run, and publishes pass events.
//! - `reconciler`: Diffs one kind's authoritative set against the mirror and applies the changes.
//! - `strategies`: Per-kind projections of ledger records into mirror fields.
//! - `listener`: Chain notification subscription with a polling fallback.
//! - `cursor`: Per-kind bookkeeping, including the fetch gate for orphan deletion.
//! - `events`: Event types, the broadcast bus, and event handlers.
//! - `report`: Per-kind and per-pass outcome counters.
//!
//! Notifications and poll ticks reach the coordinator as triggers; every pass the coordinator
//! runs walks profiles, donations and products through the reconciler in that order.

/// Pass scheduling and serialization
pub mod coordinator;
/// Per-kind sync bookkeeping
pub mod cursor;
/// Event system for observing passes
pub mod events;
/// Notification subscription and polling fallback
pub mod listener;
/// Ledger-to-mirror diffing
pub mod reconciler;
/// Outcome counters for kinds and passes
pub mod report;
/// Per-kind projections
pub mod strategies;

pub use coordinator::SyncCoordinator;
pub use events::{LoggingHandler, spawn_handler};
pub use listener::{ListenerConfig, NotificationListener};
pub use reconciler::Reconciler;
