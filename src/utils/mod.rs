//!
//! Utility module for the mirror synchronizer.
//!
//! Re-exports formatting helpers shared by the ledger and mirror layers.
/// Amount formatting helpers
pub mod amount;

pub use amount::normalize_amount;
