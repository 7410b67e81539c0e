use crate::ledger::{EntityKind, LedgerRecord};
use crate::mirror::store::MirrorStore;
use crate::mirror::types::StoreError;

use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Display name used for profiles registered without one
pub const ANONYMOUS_NAME: &str = "anon";

/// Per-kind projection of ledger records into mirror fields
#[async_trait::async_trait]
pub trait EntitySync: Send + Sync {
	fn kind(&self) -> EntityKind;

	/// Get the name of this strategy
	fn name(&self) -> &'static str;

	/// Load whatever the projection needs from the mirror before a pass over this kind
	async fn prepare(&mut self, _store: &dyn MirrorStore) -> Result<(), StoreError> {
		Ok(())
	}

	/// Mirror fields for one record, blob content excluded
	fn project(&self, record: &LedgerRecord) -> Map<String, Value>;
}

fn display_name(raw: Option<&str>) -> String {
	match raw.map(str::trim) {
		Some(name) if !name.is_empty() => name.to_string(),
		_ => ANONYMOUS_NAME.to_string(),
	}
}

pub struct ProfileSync;

#[async_trait::async_trait]
impl EntitySync for ProfileSync {
	fn kind(&self) -> EntityKind {
		EntityKind::Profile
	}

	fn name(&self) -> &'static str {
		"profiles"
	}

	fn project(&self, record: &LedgerRecord) -> Map<String, Value> {
		let mut fields = record.fields.clone();
		let name = display_name(fields.get("name").and_then(Value::as_str));
		fields.insert("name".into(), Value::String(name));
		fields
	}
}

pub struct DonationSync;

#[async_trait::async_trait]
impl EntitySync for DonationSync {
	fn kind(&self) -> EntityKind {
		EntityKind::Donation
	}

	fn name(&self) -> &'static str {
		"donations"
	}

	fn project(&self, record: &LedgerRecord) -> Map<String, Value> {
		let mut fields = record.fields.clone();
		let blank = fields
			.get("message")
			.and_then(Value::as_str)
			.is_some_and(|m| m.trim().is_empty());
		if blank {
			fields.insert("message".into(), Value::Null);
		}
		fields
	}
}

/// Products additionally carry the author's display name from the profile mirror
#[derive(Default)]
pub struct ProductSync {
	author_names: HashMap<String, String>,
}

#[async_trait::async_trait]
impl EntitySync for ProductSync {
	fn kind(&self) -> EntityKind {
		EntityKind::Product
	}

	fn name(&self) -> &'static str {
		"products"
	}

	async fn prepare(&mut self, store: &dyn MirrorStore) -> Result<(), StoreError> {
		self.author_names.clear();

		let profiles = store.list_all(EntityKind::Profile).await?;
		self.author_names = profiles
			.into_iter()
			.map(|profile| {
				let name = display_name(profile.fields.get("name").and_then(Value::as_str));
				(profile.external_id, name)
			})
			.collect();

		debug!("Loaded {} author names", self.author_names.len());
		Ok(())
	}

	fn project(&self, record: &LedgerRecord) -> Map<String, Value> {
		let mut fields = record.fields.clone();
		let author_name = fields
			.get("author")
			.and_then(Value::as_str)
			.and_then(|author| self.author_names.get(author));
		if let Some(name) = author_name {
			fields.insert("authorName".into(), Value::String(name.clone()));
		}
		fields
	}
}

/// One strategy per kind, in pass order
pub fn default_strategies() -> Vec<Box<dyn EntitySync>> {
	vec![
		Box::new(ProfileSync),
		Box::new(DonationSync),
		Box::new(ProductSync::default()),
	]
}
