//! Local mirror of the ledger application's state.
//!
//! `store` defines the record-oriented store interface and its in-process implementation,
//! `http_store` talks to a PocketBase-style record API, and `sync` keeps either one in line
//! with the ledger.

pub mod http_store;
pub mod store;
pub mod sync;
pub mod types;

pub use http_store::HttpMirrorStore;
pub use store::{InMemoryMirrorStore, MirrorStore};
pub use types::*;
