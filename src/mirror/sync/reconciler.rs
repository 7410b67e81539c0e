//! Diffing the ledger's authoritative sets against the mirror.
//!
//! For one kind at a time the reconciler fetches the full set, removes duplicate mirror
//! records, writes only the records whose fields changed, resolves blob slots through the
//! shared [`BlobFetcher`], and deletes mirror records the ledger no longer has. Orphan
//! deletion is gated on the kind's fetch having succeeded in the same pass.

use crate::ledger::{BlobFetcher, EntityKind, LedgerError, LedgerRecord, LedgerSource};
use crate::mirror::store::MirrorStore;
use crate::mirror::sync::cursor::SyncCursor;
use crate::mirror::sync::report::{EntityReport, RecordOutcome};
use crate::mirror::sync::strategies::{EntitySync, default_strategies};
use crate::mirror::types::{MirrorRecord, MirrorSyncError, StoreError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of syncing one ledger record
struct RecordSync {
	outcome: RecordOutcome,
	duplicates_removed: usize,
	enrichment_failures: usize,
}

pub struct Reconciler {
	ledger: Arc<dyn LedgerSource>,
	blobs: Arc<BlobFetcher>,
	store: Arc<dyn MirrorStore>,
	strategies: Vec<Box<dyn EntitySync>>,
	cursors: HashMap<EntityKind, SyncCursor>,
	record_concurrency: usize,
}

impl Reconciler {
	pub fn new(
		ledger: Arc<dyn LedgerSource>,
		blobs: Arc<BlobFetcher>,
		store: Arc<dyn MirrorStore>,
		record_concurrency: usize,
	) -> Self {
		Self {
			ledger,
			blobs,
			store,
			strategies: default_strategies(),
			cursors: HashMap::new(),
			record_concurrency: record_concurrency.max(1),
		}
	}

	/// Registered kinds in pass order
	pub fn kinds(&self) -> Vec<EntityKind> {
		EntityKind::PASS_ORDER
			.into_iter()
			.filter(|kind| self.strategies.iter().any(|s| s.kind() == *kind))
			.collect()
	}

	pub fn cursor(&self, kind: EntityKind) -> Option<&SyncCursor> {
		self.cursors.get(&kind)
	}

	/// Bring the mirror of one kind in line with the ledger.
	///
	/// A failed fetch leaves the mirror untouched and is returned as an error. Per-record
	/// store failures are collected in the report and do not stop the remaining records.
	pub async fn reconcile(&mut self, kind: EntityKind) -> Result<EntityReport, MirrorSyncError> {
		let index = self
			.strategies
			.iter()
			.position(|s| s.kind() == kind)
			.ok_or(MirrorSyncError::UnsupportedKind(kind))?;

		self.cursors.entry(kind).or_default().begin_pass();

		let records = match self.ledger.query(kind).await {
			Ok(records) => records,
			Err(e) => {
				self.cursors.entry(kind).or_default().record_failure(e.to_string());
				return Err(e.into());
			}
		};
		self.cursors.entry(kind).or_default().record_fetch();

		let records = collapse_duplicates(records);
		let mut report = EntityReport::new(kind);
		report.fetched = records.len();

		let strategy = &mut self.strategies[index];
		if let Err(e) = strategy.prepare(self.store.as_ref()).await {
			warn!("Preparing {} sync failed, continuing without it: {}", strategy.name(), e);
		}

		let this = &*self;
		let strategy = this.strategies[index].as_ref();
		let pending: Vec<_> = records
			.iter()
			.map(|record| async move {
				(record.external_id.as_str(), this.sync_record(strategy, record).await)
			})
			.collect();
		let results: Vec<(&str, Result<RecordSync, StoreError>)> = stream::iter(pending)
			.buffered(this.record_concurrency)
			.collect()
			.await;

		for (external_id, result) in results {
			match result {
				Ok(sync) => {
					report.record_outcome(sync.outcome);
					report.duplicates_removed += sync.duplicates_removed;
					report.enrichment_failures += sync.enrichment_failures;
				}
				Err(e) => {
					warn!("Skipping {} {}: {}", kind, external_id, e);
					report.record_error(format!("{} {}: {}", kind, external_id, e));
				}
			}
		}

		if self.cursors.get(&kind).is_some_and(SyncCursor::may_delete_orphans) {
			self.delete_orphans(kind, &records, &mut report).await;
		}

		self.cursors.entry(kind).or_default().record_success();
		debug!("{}", report.summary());
		Ok(report)
	}

	async fn sync_record(
		&self,
		strategy: &dyn EntitySync,
		record: &LedgerRecord,
	) -> Result<RecordSync, StoreError> {
		let kind = record.kind;
		let mut existing = self
			.store
			.find_all_by_external_id(kind, &record.external_id)
			.await?
			.into_iter();

		let kept = existing.next();
		let mut duplicates_removed = 0;
		for stale in existing {
			debug!("Removing duplicate {} record {} for {}", kind, stale.id, record.external_id);
			self.store.delete_record(kind, &stale.id).await?;
			duplicates_removed += 1;
		}

		let mut fields = strategy.project(record);
		let enrichment_failures = self.resolve_blobs(record, kept.as_ref(), &mut fields).await;

		let outcome = match &kept {
			Some(current) if fields_match(&current.fields, &fields) => {
				debug!("{} {} unchanged since {:?}", kind, record.external_id, current.synced_at);
				RecordOutcome::Unchanged
			}
			Some(_) => {
				self.store.upsert(kind, &record.external_id, fields).await?;
				RecordOutcome::Updated
			}
			None => {
				self.store.upsert(kind, &record.external_id, fields).await?;
				RecordOutcome::Created
			}
		};

		Ok(RecordSync {
			outcome,
			duplicates_removed,
			enrichment_failures,
		})
	}

	/// Fill blob content fields, reusing what the mirror already holds for an unchanged hash.
	/// Returns the number of slots left empty.
	async fn resolve_blobs(
		&self,
		record: &LedgerRecord,
		kept: Option<&MirrorRecord>,
		fields: &mut Map<String, Value>,
	) -> usize {
		let mut failures = 0;

		for slot in &record.blobs {
			let cached = kept.and_then(|k| k.cached_blob(slot.hash_field, slot.content_field, &slot.hash));
			if let Some(content) = cached {
				fields.insert(slot.content_field.to_string(), content.clone());
				continue;
			}

			match self.blobs.fetch(&slot.hash).await {
				Ok(bytes) => {
					fields.insert(
						slot.content_field.to_string(),
						Value::String(STANDARD.encode(bytes.as_slice())),
					);
				}
				Err(e @ LedgerError::BlobNotFound(_)) => {
					debug!("{} {} has no {}: {}", record.kind, record.external_id, slot.content_field, e);
					failures += 1;
				}
				Err(e) => {
					warn!(
						"Could not fetch {} for {} {} (retrying next pass: {}): {}",
						slot.content_field,
						record.kind,
						record.external_id,
						e.is_transient(),
						e
					);
					failures += 1;
				}
			}
		}

		failures
	}

	async fn delete_orphans(&self, kind: EntityKind, records: &[LedgerRecord], report: &mut EntityReport) {
		let live: HashSet<&str> = records.iter().map(|r| r.external_id.as_str()).collect();

		let mirrored = match self.store.list_all(kind).await {
			Ok(mirrored) => mirrored,
			Err(e) => {
				warn!("Skipping {} orphan cleanup, listing failed: {}", kind, e);
				report.record_error(format!("{} listing: {}", kind, e));
				return;
			}
		};
		report.orphans_checked = true;

		let orphans: HashSet<&str> = mirrored
			.iter()
			.map(|m| m.external_id.as_str())
			.filter(|id| !live.contains(id))
			.collect();

		for external_id in orphans {
			match self.store.delete(kind, external_id).await {
				Ok(removed) => {
					info!("Deleted orphaned {} {} ({} records)", kind, external_id, removed);
					report.deleted += removed;
				}
				Err(e) => {
					warn!("Failed to delete orphaned {} {}: {}", kind, external_id, e);
					report.record_error(format!("{} {}: {}", kind, external_id, e));
				}
			}
		}
	}
}

/// Keep one record per external id, the last occurrence winning, in ledger order
fn collapse_duplicates(records: Vec<LedgerRecord>) -> Vec<LedgerRecord> {
	let mut seen = HashSet::new();
	let mut unique: Vec<LedgerRecord> = records
		.into_iter()
		.rev()
		.filter(|record| seen.insert(record.external_id.clone()))
		.collect();
	unique.reverse();
	unique
}

/// Stored fields equal the desired ones. Keys the store keeps as empty or null count as absent.
fn fields_match(stored: &Map<String, Value>, desired: &Map<String, Value>) -> bool {
	let is_blank = |value: &Value| value.is_null() || value.as_str() == Some("");

	desired
		.iter()
		.all(|(key, value)| stored.get(key) == Some(value) || (is_blank(value) && stored.get(key).is_none_or(is_blank)))
		&& stored
			.iter()
			.all(|(key, value)| desired.contains_key(key) || is_blank(value))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mirror::store::InMemoryMirrorStore;
	use crate::testing::{FakeBlobs, FakeLedger, FlakyStore, product, product_with_preview, profile};
	use chrono::{Duration, Utc};
	use serde_json::json;

	const PREVIEW: &str = "9f3c1d5e7a2b4c6d8e0f1a3b5c7d9e1f2a4b6c8d0e2f4a6b8c0d2e4f6a8b0c2d";

	struct Harness {
		ledger: Arc<FakeLedger>,
		blobs: Arc<FakeBlobs>,
		store: Arc<InMemoryMirrorStore>,
		reconciler: Reconciler,
	}

	fn harness() -> Harness {
		let ledger = Arc::new(FakeLedger::default());
		let blobs = Arc::new(FakeBlobs::default());
		let store = Arc::new(InMemoryMirrorStore::new());
		let reconciler = Reconciler::new(
			ledger.clone(),
			Arc::new(BlobFetcher::new(blobs.clone())),
			store.clone(),
			4,
		);
		Harness {
			ledger,
			blobs,
			store,
			reconciler,
		}
	}

	async fn price_of(store: &InMemoryMirrorStore, id: &str) -> Option<Value> {
		store
			.find_by_external_id(EntityKind::Product, id)
			.await
			.unwrap()
			.map(|r| r.fields["price"].clone())
	}

	#[tokio::test]
	async fn price_change_and_removal_are_mirrored() {
		let mut h = harness();
		h.ledger.set(EntityKind::Product, vec![product("p1", "5"), product("p2", "3")]);
		let first = h.reconciler.reconcile(EntityKind::Product).await.unwrap();
		assert_eq!(first.created, 2);

		h.ledger.set(EntityKind::Product, vec![product("p1", "7")]);
		let second = h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(second.updated, 1);
		assert_eq!(second.deleted, 1);
		assert_eq!(price_of(&h.store, "p1").await, Some(json!("7")));
		assert_eq!(price_of(&h.store, "p2").await, None);
		assert_eq!(h.store.count(EntityKind::Product), 1);
	}

	#[tokio::test]
	async fn repeated_passes_write_nothing() {
		let mut h = harness();
		h.ledger.set(EntityKind::Product, vec![product("p1", "5"), product("p2", "3")]);
		h.reconciler.reconcile(EntityKind::Product).await.unwrap();
		let before = h.store.list_all(EntityKind::Product).await.unwrap();

		let again = h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(again.unchanged, 2);
		assert_eq!(again.writes(), 0);
		assert_eq!(h.store.list_all(EntityKind::Product).await.unwrap(), before);
	}

	#[tokio::test]
	async fn dedup_keeps_the_newest_record() {
		let mut h = harness();
		let now = Utc::now();
		let stale = product("p1", "1").fields;
		h.store.seed(EntityKind::Product, "p1", stale.clone(), now - Duration::seconds(120));
		h.store.seed(EntityKind::Product, "p1", stale.clone(), now - Duration::seconds(60));
		let newest = h.store.seed(EntityKind::Product, "p1", stale, now);

		h.ledger.set(EntityKind::Product, vec![product("p1", "9")]);
		let report = h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(report.duplicates_removed, 2);
		let remaining = h.store.list_all(EntityKind::Product).await.unwrap();
		assert_eq!(remaining.len(), 1);
		assert_eq!(remaining[0].id, newest.id);
		assert_eq!(remaining[0].fields["price"], json!("9"));
	}

	#[tokio::test]
	async fn failed_fetch_never_deletes() {
		let mut h = harness();
		h.store.seed(EntityKind::Product, "p1", product("p1", "5").fields, Utc::now());
		h.ledger.fail(EntityKind::Product, "node unreachable");

		let err = h.reconciler.reconcile(EntityKind::Product).await.unwrap_err();

		assert!(matches!(err, MirrorSyncError::LedgerError(LedgerError::NetworkError(_))));
		assert_eq!(h.store.count(EntityKind::Product), 1);
		let cursor = h.reconciler.cursor(EntityKind::Product).unwrap();
		assert!(!cursor.may_delete_orphans());
		assert_eq!(cursor.consecutive_failures(), 1);
	}

	#[tokio::test]
	async fn empty_authoritative_set_clears_the_mirror() {
		let mut h = harness();
		h.store.seed(EntityKind::Donation, "1", Map::new(), Utc::now());
		h.ledger.set(EntityKind::Donation, Vec::new());

		let report = h.reconciler.reconcile(EntityKind::Donation).await.unwrap();

		assert_eq!(report.deleted, 1);
		assert!(report.orphans_checked);
		assert_eq!(h.store.count(EntityKind::Donation), 0);
	}

	#[tokio::test]
	async fn missing_blob_does_not_block_the_record() {
		let mut h = harness();
		h.ledger.set(EntityKind::Product, vec![product_with_preview("p1", "5", PREVIEW)]);

		let report = h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(report.created, 1);
		assert_eq!(report.enrichment_failures, 1);
		let stored = h.store.find_by_external_id(EntityKind::Product, "p1").await.unwrap().unwrap();
		assert!(!stored.fields.contains_key("imagePreview"));
		assert_eq!(stored.fields["imagePreviewHash"], json!(PREVIEW));
	}

	#[tokio::test]
	async fn blob_failures_stay_with_their_own_record() {
		const FLAKY: &str = "1111111111111111111111111111111111111111111111111111111111111111";
		const GONE: &str = "2222222222222222222222222222222222222222222222222222222222222222";
		let mut h = harness();
		h.blobs.fail_network(FLAKY);
		h.blobs.insert(PREVIEW, vec![1, 2]);
		h.ledger.set(
			EntityKind::Product,
			vec![
				product_with_preview("flaky", "1", FLAKY),
				product_with_preview("gone", "2", GONE),
				product_with_preview("ok", "3", PREVIEW),
			],
		);

		let report = h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(report.created, 3);
		assert_eq!(report.enrichment_failures, 2);
		assert!(report.errors.is_empty());
		for id in ["flaky", "gone", "ok"] {
			let stored = h.store.find_by_external_id(EntityKind::Product, id).await.unwrap().unwrap();
			assert_eq!(stored.fields.contains_key("imagePreview"), id == "ok", "{}", id);
		}

		h.blobs.insert(FLAKY, vec![3]);
		let report = h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(report.updated, 1);
		assert_eq!(report.unchanged, 2);
		assert_eq!(report.enrichment_failures, 1);
		let stored = h.store.find_by_external_id(EntityKind::Product, "flaky").await.unwrap().unwrap();
		assert_eq!(stored.fields["imagePreview"], json!("Aw=="));
		assert_eq!(h.blobs.reads(GONE), 1);
		assert_eq!(h.blobs.reads(FLAKY), 2);
		assert_eq!(h.blobs.reads(PREVIEW), 1);
	}

	#[tokio::test]
	async fn blob_content_is_fetched_once_and_carried_over() {
		let mut h = harness();
		h.blobs.insert(PREVIEW, vec![1, 2]);
		h.ledger.set(EntityKind::Product, vec![product_with_preview("p1", "5", PREVIEW)]);

		h.reconciler.reconcile(EntityKind::Product).await.unwrap();
		let stored = h.store.find_by_external_id(EntityKind::Product, "p1").await.unwrap().unwrap();
		assert_eq!(stored.fields["imagePreview"], json!("AQI="));

		h.ledger.set(EntityKind::Product, vec![product_with_preview("p1", "6", PREVIEW)]);
		let report = h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(report.updated, 1);
		assert_eq!(h.blobs.reads(PREVIEW), 1);
		let stored = h.store.find_by_external_id(EntityKind::Product, "p1").await.unwrap().unwrap();
		assert_eq!(stored.fields["imagePreview"], json!("AQI="));
	}

	#[tokio::test]
	async fn store_errors_skip_only_the_affected_record() {
		let ledger = Arc::new(FakeLedger::default());
		let store = Arc::new(FlakyStore::default());
		store.fail_upserts_for("p2");
		let mut reconciler = Reconciler::new(
			ledger.clone(),
			Arc::new(BlobFetcher::new(Arc::new(FakeBlobs::default()))),
			store.clone(),
			2,
		);
		ledger.set(
			EntityKind::Product,
			vec![product("p1", "1"), product("p2", "2"), product("p3", "3")],
		);

		let report = reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(report.created, 2);
		assert_eq!(report.errors.len(), 1);
		assert!(report.errors[0].contains("p2"));
		assert_eq!(store.inner().count(EntityKind::Product), 2);
	}

	#[tokio::test]
	async fn listing_failure_skips_orphan_cleanup() {
		let ledger = Arc::new(FakeLedger::default());
		let store = Arc::new(FlakyStore::default());
		store
			.inner()
			.seed(EntityKind::Product, "gone", Map::new(), Utc::now());
		store.fail_listing(true);
		let mut reconciler = Reconciler::new(
			ledger.clone(),
			Arc::new(BlobFetcher::new(Arc::new(FakeBlobs::default()))),
			store.clone(),
			2,
		);
		ledger.set(EntityKind::Product, vec![product("p1", "1")]);

		let report = reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert!(!report.orphans_checked);
		assert_eq!(report.deleted, 0);
		assert_eq!(store.inner().count(EntityKind::Product), 2);
	}

	#[tokio::test]
	async fn ledger_duplicates_collapse_to_the_last_occurrence() {
		let mut h = harness();
		h.ledger.set(
			EntityKind::Product,
			vec![product("p1", "1"), product("p2", "2"), product("p1", "4")],
		);

		let report = h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		assert_eq!(report.fetched, 2);
		assert_eq!(h.store.count(EntityKind::Product), 2);
		assert_eq!(price_of(&h.store, "p1").await, Some(json!("4")));
	}

	#[tokio::test]
	async fn products_carry_author_names_from_synced_profiles() {
		let mut h = harness();
		h.ledger.set(EntityKind::Profile, vec![profile("0xauthor", "")]);
		let mut record = product("p1", "5");
		record.fields.insert("author".into(), json!("0xauthor"));
		h.ledger.set(EntityKind::Product, vec![record]);

		h.reconciler.reconcile(EntityKind::Profile).await.unwrap();
		h.reconciler.reconcile(EntityKind::Product).await.unwrap();

		let stored = h.store.find_by_external_id(EntityKind::Product, "p1").await.unwrap().unwrap();
		assert_eq!(stored.fields["authorName"], json!("anon"));
	}

	#[test]
	fn blank_store_values_match_absent_fields() {
		let stored = json!({ "price": "5", "imagePreview": "" }).as_object().cloned().unwrap();
		let desired = json!({ "price": "5", "message": null }).as_object().cloned().unwrap();
		assert!(fields_match(&stored, &desired));

		let changed = json!({ "price": "6" }).as_object().cloned().unwrap();
		assert!(!fields_match(&stored, &changed));
	}
}
