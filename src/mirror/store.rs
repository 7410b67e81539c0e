use crate::ledger::EntityKind;
use crate::mirror::types::{MirrorRecord, StoreError, sort_newest_first};

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Record-oriented access to the mirror store.
///
/// The store is not assumed to enforce uniqueness of `(kind, external_id)`; callers look up
/// before writing and clean up duplicates themselves.
#[async_trait::async_trait]
pub trait MirrorStore: Send + Sync {
	/// Every record carrying this external id, newest first
	async fn find_all_by_external_id(
		&self,
		kind: EntityKind,
		external_id: &str,
	) -> Result<Vec<MirrorRecord>, StoreError>;

	/// The newest record carrying this external id
	async fn find_by_external_id(
		&self,
		kind: EntityKind,
		external_id: &str,
	) -> Result<Option<MirrorRecord>, StoreError> {
		Ok(self
			.find_all_by_external_id(kind, external_id)
			.await?
			.into_iter()
			.next())
	}

	/// Create the record if absent, otherwise overwrite the newest one's fields in place
	async fn upsert(
		&self,
		kind: EntityKind,
		external_id: &str,
		fields: Map<String, Value>,
	) -> Result<MirrorRecord, StoreError>;

	/// Delete every record carrying this external id, returning how many were removed
	async fn delete(&self, kind: EntityKind, external_id: &str) -> Result<usize, StoreError>;

	/// Delete one record by its store-local id; absent ids are not an error
	async fn delete_record(&self, kind: EntityKind, record_id: &str) -> Result<(), StoreError>;

	async fn list_all(&self, kind: EntityKind) -> Result<Vec<MirrorRecord>, StoreError>;
}

/// Process-local store, used for dry runs and tests
#[derive(Default)]
pub struct InMemoryMirrorStore {
	inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
	records: Vec<MirrorRecord>,
	next_id: u64,
}

impl InMemoryState {
	fn allocate_id(&mut self) -> String {
		self.next_id += 1;
		format!("{:015}", self.next_id)
	}
}

impl InMemoryMirrorStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Insert a record directly, bypassing upsert. Allows seeding duplicates.
	#[cfg(test)]
	pub fn seed(
		&self,
		kind: EntityKind,
		external_id: &str,
		fields: Map<String, Value>,
		created_at: chrono::DateTime<Utc>,
	) -> MirrorRecord {
		let mut state = self.state();
		let record = MirrorRecord {
			id: state.allocate_id(),
			kind,
			external_id: external_id.to_string(),
			fields,
			created_at,
			synced_at: None,
		};
		state.records.push(record.clone());
		record
	}

	/// Number of records of a kind, duplicates included
	#[cfg(test)]
	pub fn count(&self, kind: EntityKind) -> usize {
		self.state().records.iter().filter(|r| r.kind == kind).count()
	}
}

#[async_trait::async_trait]
impl MirrorStore for InMemoryMirrorStore {
	async fn find_all_by_external_id(
		&self,
		kind: EntityKind,
		external_id: &str,
	) -> Result<Vec<MirrorRecord>, StoreError> {
		let mut found: Vec<MirrorRecord> = self
			.state()
			.records
			.iter()
			.filter(|r| r.kind == kind && r.external_id == external_id)
			.cloned()
			.collect();
		sort_newest_first(&mut found);
		Ok(found)
	}

	async fn upsert(
		&self,
		kind: EntityKind,
		external_id: &str,
		fields: Map<String, Value>,
	) -> Result<MirrorRecord, StoreError> {
		// Lookup and write happen under one lock, so repeated or racing calls never duplicate.
		let mut state = self.state();
		let now = Utc::now();

		let newest = state
			.records
			.iter()
			.enumerate()
			.filter(|(_, r)| r.kind == kind && r.external_id == external_id)
			.max_by(|(_, a), (_, b)| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
			.map(|(index, _)| index);

		if let Some(index) = newest {
			let record = &mut state.records[index];
			record.fields = fields;
			record.synced_at = Some(now);
			return Ok(record.clone());
		}

		let record = MirrorRecord {
			id: state.allocate_id(),
			kind,
			external_id: external_id.to_string(),
			fields,
			created_at: now,
			synced_at: Some(now),
		};
		debug!("Created {} record {} for {}", kind, record.id, external_id);
		state.records.push(record.clone());
		Ok(record)
	}

	async fn delete(&self, kind: EntityKind, external_id: &str) -> Result<usize, StoreError> {
		let mut state = self.state();
		let before = state.records.len();
		state
			.records
			.retain(|r| !(r.kind == kind && r.external_id == external_id));
		Ok(before - state.records.len())
	}

	async fn delete_record(&self, kind: EntityKind, record_id: &str) -> Result<(), StoreError> {
		self.state()
			.records
			.retain(|r| !(r.kind == kind && r.id == record_id));
		Ok(())
	}

	async fn list_all(&self, kind: EntityKind) -> Result<Vec<MirrorRecord>, StoreError> {
		Ok(self
			.state()
			.records
			.iter()
			.filter(|r| r.kind == kind)
			.cloned()
			.collect())
	}
}
