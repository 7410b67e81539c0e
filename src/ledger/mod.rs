//! Ledger integration module
//!
//! This module provides the client and types for reading the donations application's state
//! from a node service's GraphQL endpoint, resolving content-addressed blobs, and subscribing
//! to the chain's change notifications.

/// Content-addressed blob fetching with caching
mod blob;
/// GraphQL client for the ledger application
mod client;
/// GraphQL documents and the typed request builder
mod queries;
/// Type definitions for ledger data structures
mod types;

pub use blob::BlobFetcher;
pub use client::{BlobSource, LedgerClient, LedgerSource, NotificationSource, NotificationStream};
pub use types::*;
