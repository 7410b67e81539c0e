use crate::config::ConfigError;
use crate::ledger::{EntityKind, LedgerError};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Local projection of one ledger record as held by the mirror store
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRecord {
	/// Store-local record id
	pub id: String,
	pub kind: EntityKind,
	pub external_id: String,
	/// Synced fields, bookkeeping excluded
	pub fields: Map<String, Value>,
	pub created_at: DateTime<Utc>,
	pub synced_at: Option<DateTime<Utc>>,
}

impl MirrorRecord {
	/// Cached content for a blob slot, if the record holds it for exactly this hash
	pub fn cached_blob(&self, hash_field: &str, content_field: &str, hash: &str) -> Option<&Value> {
		let same_hash = self.fields.get(hash_field).and_then(Value::as_str) == Some(hash);
		let content = self
			.fields
			.get(content_field)
			.filter(|v| v.as_str().is_some_and(|s| !s.is_empty()));

		if same_hash { content } else { None }
	}
}

/// Order records newest first: most recently created, ties broken by the higher record id
pub fn sort_newest_first(records: &mut [MirrorRecord]) {
	records.sort_by(|a, b| {
		b.created_at
			.cmp(&a.created_at)
			.then_with(|| b.id.cmp(&a.id))
	});
}

/// Error types for mirror store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("Store returned {status}: {body}")]
	Status { status: u16, body: String },

	#[error("Decode error: {0}")]
	Decode(String),
}

/// Top-level error type for the synchronizer
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum MirrorSyncError {
	#[error("Ledger error: {0}")]
	LedgerError(#[from] LedgerError),

	#[error("Store error: {0}")]
	StoreError(#[from] StoreError),

	#[error("Config error: {0}")]
	ConfigError(#[from] ConfigError),

	#[error("No sync strategy registered for {0}")]
	UnsupportedKind(EntityKind),
}
