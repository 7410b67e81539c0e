//! Mirror store adapter for a PocketBase-style record API.
//!
//! Each entity kind lives in its own collection. Records carry the ledger identifier in an
//! `externalId` field and the time of the last write in `syncedAt`; everything else the
//! collection returns beyond the store's own bookkeeping is treated as synced data.

use crate::ledger::EntityKind;
use crate::mirror::store::MirrorStore;
use crate::mirror::types::{MirrorRecord, StoreError, sort_newest_first};

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_PAGE_SIZE: u32 = 200;

/// Keys owned by the store or by the adapter, never part of a record's synced fields
const BOOKKEEPING_KEYS: [&str; 7] = [
	"id",
	"collectionId",
	"collectionName",
	"created",
	"updated",
	"externalId",
	"syncedAt",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordPage {
	page: u32,
	total_pages: u32,
	items: Vec<Value>,
}

/// HTTP client for the record store
#[derive(Clone)]
pub struct HttpMirrorStore {
	http_client: Client,
	base_url: String,
	token: Option<String>,
	page_size: u32,
}

impl HttpMirrorStore {
	pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self, StoreError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			base_url: base_url.trim_end_matches('/').to_string(),
			token,
			page_size: DEFAULT_PAGE_SIZE,
		})
	}

	#[cfg(test)]
	fn with_page_size(mut self, page_size: u32) -> Self {
		self.page_size = page_size;
		self
	}

	fn records_url(&self, kind: EntityKind) -> String {
		format!("{}/api/collections/{}/records", self.base_url, kind.collection())
	}

	fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
		match &self.token {
			Some(token) => request.bearer_auth(token),
			None => request,
		}
	}

	/// Fetch every page of a listing, optionally filtered
	async fn list(&self, kind: EntityKind, filter: Option<String>) -> Result<Vec<MirrorRecord>, StoreError> {
		let mut records = Vec::new();
		let mut page = 1u32;

		loop {
			let mut query = vec![
				("page", page.to_string()),
				("perPage", self.page_size.to_string()),
				("sort", "-created,-id".to_string()),
			];
			if let Some(filter) = &filter {
				query.push(("filter", filter.clone()));
			}

			let response = self
				.authorize(self.http_client.get(self.records_url(kind)))
				.query(&query)
				.send()
				.await?;
			let listing: RecordPage = decode(check_status(response).await?).await?;

			for item in listing.items {
				records.push(record_from_json(kind, item)?);
			}

			if listing.page >= listing.total_pages {
				break;
			}
			page = listing.page + 1;
		}

		Ok(records)
	}
}

#[async_trait::async_trait]
impl MirrorStore for HttpMirrorStore {
	async fn find_all_by_external_id(
		&self,
		kind: EntityKind,
		external_id: &str,
	) -> Result<Vec<MirrorRecord>, StoreError> {
		let filter = format!("externalId='{}'", escape_filter_literal(external_id));
		let mut records = self.list(kind, Some(filter)).await?;
		sort_newest_first(&mut records);
		Ok(records)
	}

	async fn upsert(
		&self,
		kind: EntityKind,
		external_id: &str,
		fields: Map<String, Value>,
	) -> Result<MirrorRecord, StoreError> {
		let existing = self.find_by_external_id(kind, external_id).await?;

		let mut body = fields;
		body.insert("externalId".into(), Value::String(external_id.to_string()));
		body.insert("syncedAt".into(), Value::String(Utc::now().to_rfc3339()));

		let request = match &existing {
			Some(record) => {
				// A PATCH only touches the keys it names; clear the ones no longer synced.
				for stale in record.fields.keys() {
					if !body.contains_key(stale) {
						body.insert(stale.clone(), Value::Null);
					}
				}
				debug!("Updating {} record {} for {}", kind, record.id, external_id);
				self.http_client
					.patch(format!("{}/{}", self.records_url(kind), record.id))
			}
			None => {
				debug!("Creating {} record for {}", kind, external_id);
				self.http_client.post(self.records_url(kind))
			}
		};

		let response = self.authorize(request).json(&body).send().await?;
		let saved: Value = decode(check_status(response).await?).await?;
		record_from_json(kind, saved)
	}

	async fn delete(&self, kind: EntityKind, external_id: &str) -> Result<usize, StoreError> {
		let records = self.find_all_by_external_id(kind, external_id).await?;
		for record in &records {
			self.delete_record(kind, &record.id).await?;
		}
		Ok(records.len())
	}

	async fn delete_record(&self, kind: EntityKind, record_id: &str) -> Result<(), StoreError> {
		let response = self
			.authorize(
				self.http_client
					.delete(format!("{}/{}", self.records_url(kind), record_id)),
			)
			.send()
			.await?;

		if response.status() == StatusCode::NOT_FOUND {
			debug!("{} record {} already gone", kind, record_id);
			return Ok(());
		}
		check_status(response).await?;
		Ok(())
	}

	async fn list_all(&self, kind: EntityKind) -> Result<Vec<MirrorRecord>, StoreError> {
		self.list(kind, None).await
	}
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}
	let body = response.text().await.unwrap_or_default();
	Err(StoreError::Status {
		status: status.as_u16(),
		body,
	})
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, StoreError> {
	let bytes = response.bytes().await?;
	serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Escape a value for use inside a single-quoted filter literal
fn escape_filter_literal(value: &str) -> String {
	value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Store timestamps look like `2024-05-01 10:00:00.123Z`; RFC 3339 is accepted as well
fn parse_store_time(raw: &str) -> Option<DateTime<Utc>> {
	NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%d %H:%M:%S%.f")
		.map(|naive| naive.and_utc())
		.ok()
		.or_else(|| {
			DateTime::parse_from_rfc3339(raw)
				.ok()
				.map(|dt| dt.with_timezone(&Utc))
		})
}

fn record_from_json(kind: EntityKind, value: Value) -> Result<MirrorRecord, StoreError> {
	let Value::Object(mut object) = value else {
		return Err(StoreError::Decode("record is not a JSON object".into()));
	};

	let text = |object: &Map<String, Value>, key: &str| {
		object.get(key).and_then(Value::as_str).map(str::to_string)
	};

	let id = text(&object, "id").ok_or_else(|| StoreError::Decode("record without id".into()))?;
	let external_id = text(&object, "externalId").unwrap_or_default();
	let created_at = text(&object, "created")
		.as_deref()
		.and_then(parse_store_time)
		.ok_or_else(|| StoreError::Decode(format!("record {} has no valid created time", id)))?;
	let synced_at = text(&object, "syncedAt").as_deref().and_then(parse_store_time);

	for key in BOOKKEEPING_KEYS {
		object.remove(key);
	}

	Ok(MirrorRecord {
		id,
		kind,
		external_id,
		fields: object,
		created_at,
		synced_at,
	})
}
