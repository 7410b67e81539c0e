//! In-process fakes of the seam traits and record builders shared by the unit tests.

use crate::ledger::{
	BlobSource, ChainNotification, DonationView, EntityKind, LedgerError, LedgerRecord, LedgerSource,
	NotificationSource, NotificationStream, ProductView, ProfileView,
};
use crate::mirror::store::{InMemoryMirrorStore, MirrorStore};
use crate::mirror::types::{MirrorRecord, StoreError};

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Semaphore, mpsc};

pub fn profile(owner: &str, name: &str) -> LedgerRecord {
	ProfileView {
		owner: owner.to_string(),
		chain_id: "chain-a".to_string(),
		name: name.to_string(),
		bio: String::new(),
		socials: Vec::new(),
	}
	.into()
}

pub fn donation(id: u64, amount: &str) -> LedgerRecord {
	DonationView {
		id,
		timestamp: 1_700_000_000_000_000,
		from_owner: "0xfrom".to_string(),
		from_chain_id: "chain-a".to_string(),
		to_owner: "0xto".to_string(),
		to_chain_id: "chain-b".to_string(),
		amount: amount.to_string(),
		message: None,
	}
	.into()
}

fn product_view(id: &str, price: &str) -> ProductView {
	ProductView {
		id: id.to_string(),
		author: "0xauthor".to_string(),
		author_chain_id: "chain-a".to_string(),
		name: format!("Product {}", id),
		description: String::new(),
		link: String::new(),
		data_blob_hash: String::new(),
		image_preview_hash: None,
		price: price.to_string(),
		created_at: 1,
	}
}

pub fn product(id: &str, price: &str) -> LedgerRecord {
	product_view(id, price).into()
}

pub fn product_with_preview(id: &str, price: &str, preview_hash: &str) -> LedgerRecord {
	ProductView {
		image_preview_hash: Some(preview_hash.to_string()),
		..product_view(id, price)
	}
	.into()
}

/// Ledger with per-kind canned results. Unset kinds return an empty set.
#[derive(Default)]
pub struct FakeLedger {
	sets: Mutex<HashMap<EntityKind, Result<Vec<LedgerRecord>, String>>>,
	queries: Mutex<HashMap<EntityKind, usize>>,
	gate: Option<Semaphore>,
}

impl FakeLedger {
	/// Every query blocks until [`FakeLedger::open_gate`] is called
	pub fn gated() -> Self {
		Self {
			gate: Some(Semaphore::new(0)),
			..Self::default()
		}
	}

	pub fn open_gate(&self) {
		if let Some(gate) = &self.gate {
			gate.close();
		}
	}

	pub fn set(&self, kind: EntityKind, records: Vec<LedgerRecord>) {
		self.sets.lock().unwrap().insert(kind, Ok(records));
	}

	pub fn fail(&self, kind: EntityKind, message: &str) {
		self.sets.lock().unwrap().insert(kind, Err(message.to_string()));
	}

	pub fn queries(&self, kind: EntityKind) -> usize {
		self.queries.lock().unwrap().get(&kind).copied().unwrap_or(0)
	}
}

#[async_trait::async_trait]
impl LedgerSource for FakeLedger {
	async fn query(&self, kind: EntityKind) -> Result<Vec<LedgerRecord>, LedgerError> {
		if let Some(gate) = &self.gate {
			// A closed gate fails every acquire, which lets all queries through.
			let _ = gate.acquire().await;
		}

		*self.queries.lock().unwrap().entry(kind).or_default() += 1;
		match self.sets.lock().unwrap().get(&kind) {
			None => Ok(Vec::new()),
			Some(Ok(records)) => Ok(records.clone()),
			Some(Err(message)) => Err(LedgerError::NetworkError(message.clone())),
		}
	}
}

/// Blob source backed by a map. Unknown hashes are not found.
#[derive(Default)]
pub struct FakeBlobs {
	blobs: Mutex<HashMap<String, Vec<u8>>>,
	failing: Mutex<HashSet<String>>,
	reads: Mutex<HashMap<String, usize>>,
}

impl FakeBlobs {
	pub fn insert(&self, hash: &str, bytes: Vec<u8>) {
		self.failing.lock().unwrap().remove(hash);
		self.blobs.lock().unwrap().insert(hash.to_string(), bytes);
	}

	/// Reads of this hash fail with a network error until it is inserted
	pub fn fail_network(&self, hash: &str) {
		self.failing.lock().unwrap().insert(hash.to_string());
	}

	pub fn reads(&self, hash: &str) -> usize {
		self.reads.lock().unwrap().get(hash).copied().unwrap_or(0)
	}
}

#[async_trait::async_trait]
impl BlobSource for FakeBlobs {
	async fn read_blob(&self, hash: &str) -> Result<Vec<u8>, LedgerError> {
		*self.reads.lock().unwrap().entry(hash.to_string()).or_default() += 1;
		tokio::task::yield_now().await;

		if self.failing.lock().unwrap().contains(hash) {
			return Err(LedgerError::NetworkError("connection reset".into()));
		}
		self.blobs
			.lock()
			.unwrap()
			.get(hash)
			.cloned()
			.ok_or_else(|| LedgerError::BlobNotFound(hash.to_string()))
	}
}

/// In-memory store that fails selected operations
#[derive(Default)]
pub struct FlakyStore {
	inner: InMemoryMirrorStore,
	failing_upserts: Mutex<HashSet<String>>,
	failing_listing: AtomicBool,
}

impl FlakyStore {
	pub fn inner(&self) -> &InMemoryMirrorStore {
		&self.inner
	}

	pub fn fail_upserts_for(&self, external_id: &str) {
		self.failing_upserts.lock().unwrap().insert(external_id.to_string());
	}

	pub fn fail_listing(&self, fail: bool) {
		self.failing_listing.store(fail, Ordering::SeqCst);
	}
}

fn unavailable() -> StoreError {
	StoreError::Status {
		status: 503,
		body: "store unavailable".into(),
	}
}

#[async_trait::async_trait]
impl MirrorStore for FlakyStore {
	async fn find_all_by_external_id(
		&self,
		kind: EntityKind,
		external_id: &str,
	) -> Result<Vec<MirrorRecord>, StoreError> {
		self.inner.find_all_by_external_id(kind, external_id).await
	}

	async fn upsert(
		&self,
		kind: EntityKind,
		external_id: &str,
		fields: Map<String, Value>,
	) -> Result<MirrorRecord, StoreError> {
		if self.failing_upserts.lock().unwrap().contains(external_id) {
			return Err(unavailable());
		}
		self.inner.upsert(kind, external_id, fields).await
	}

	async fn delete(&self, kind: EntityKind, external_id: &str) -> Result<usize, StoreError> {
		self.inner.delete(kind, external_id).await
	}

	async fn delete_record(&self, kind: EntityKind, record_id: &str) -> Result<(), StoreError> {
		self.inner.delete_record(kind, record_id).await
	}

	async fn list_all(&self, kind: EntityKind) -> Result<Vec<MirrorRecord>, StoreError> {
		if self.failing_listing.load(Ordering::SeqCst) {
			return Err(unavailable());
		}
		self.inner.list_all(kind).await
	}
}

/// Notification source replaying a scripted sequence of subscribe outcomes.
/// Once the script runs out every subscribe fails.
#[derive(Default)]
pub struct FakeNotifications {
	script: Mutex<VecDeque<Option<mpsc::UnboundedReceiver<ChainNotification>>>>,
	attempts: AtomicUsize,
	silent: Mutex<Vec<mpsc::UnboundedSender<ChainNotification>>>,
}

impl FakeNotifications {
	pub fn push_failure(&self) {
		self.script.lock().unwrap().push_back(None);
	}

	/// Next subscribe succeeds; the stream yields what the sender sends and ends when it drops
	pub fn push_stream(&self, receiver: mpsc::UnboundedReceiver<ChainNotification>) {
		self.script.lock().unwrap().push_back(Some(receiver));
	}

	/// Next subscribe succeeds with a stream that never yields and never closes
	pub fn push_silent(&self) {
		let (sender, receiver) = mpsc::unbounded_channel();
		self.silent.lock().unwrap().push(sender);
		self.push_stream(receiver);
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl NotificationSource for FakeNotifications {
	async fn subscribe(&self) -> Result<NotificationStream, LedgerError> {
		self.attempts.fetch_add(1, Ordering::SeqCst);

		match self.script.lock().unwrap().pop_front().flatten() {
			Some(receiver) => Ok(Box::pin(futures_util::stream::unfold(
				receiver,
				|mut receiver| async move {
					receiver
						.recv()
						.await
						.map(|notification| (Ok::<_, LedgerError>(notification), receiver))
				},
			))),
			None => Err(LedgerError::SubscriptionError("connection refused".into())),
		}
	}
}
