//! Types for the ledger application's GraphQL surface and the records the mirror is built from

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

use crate::utils::normalize_amount;

/// Entity kinds mirrored from the ledger application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Profile,
    Donation,
    Product,
}

impl EntityKind {
    /// Order in which a pass visits the kinds. Later kinds may read the
    /// mirror of earlier ones (products look up author profiles).
    pub const PASS_ORDER: [EntityKind; 3] =
        [EntityKind::Profile, EntityKind::Donation, EntityKind::Product];

    /// Name of the mirror store collection holding this kind
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Profile => "profiles",
            EntityKind::Donation => "donations",
            EntityKind::Product => "products",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Profile => "profile",
            EntityKind::Donation => "donation",
            EntityKind::Product => "product",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A social link attached to a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLink {
    pub name: String,
    pub url: String,
}

/// Profile as returned by `allProfilesView`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    /// Account owner; the profile's external identifier.
    pub owner: String,
    /// Chain the owner registered from.
    pub chain_id: String,
    pub name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub socials: Vec<SocialLink>,
}

/// Donation as returned by `allDonationsView`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationView {
    /// Sequential donation counter value assigned by the application.
    pub id: u64,
    /// Block timestamp in microseconds.
    pub timestamp: u64,
    pub from_owner: String,
    pub from_chain_id: String,
    pub to_owner: String,
    pub to_chain_id: String,
    /// Decimal amount string as rendered by the ledger (e.g. `"5."`).
    pub amount: String,
    pub message: Option<String>,
}

/// Marketplace product as returned by `allProducts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    pub id: String,
    pub author: String,
    pub author_chain_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: String,
    /// Hash of the paid content blob. Never resolved into the mirror.
    #[serde(default)]
    pub data_blob_hash: String,
    /// Hash of the public preview image blob, if any.
    #[serde(default)]
    pub image_preview_hash: Option<String>,
    pub price: String,
    pub created_at: u64,
}

/// A content hash referenced by a record whose bytes may be cached in the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSlot {
    /// Field holding the hash.
    pub hash_field: &'static str,
    /// Field the resolved bytes are cached under (base64).
    pub content_field: &'static str,
    pub hash: String,
}

/// Authoritative representation of one entity as read from the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub kind: EntityKind,
    pub external_id: String,
    pub fields: Map<String, Value>,
    pub blobs: Vec<BlobSlot>,
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl From<ProfileView> for LedgerRecord {
    fn from(profile: ProfileView) -> Self {
        let fields = object(json!({
            "owner": profile.owner,
            "chainId": profile.chain_id,
            "name": profile.name,
            "bio": profile.bio,
            "socials": profile.socials,
        }));

        Self {
            kind: EntityKind::Profile,
            external_id: profile.owner,
            fields,
            blobs: Vec::new(),
        }
    }
}

impl From<DonationView> for LedgerRecord {
    fn from(donation: DonationView) -> Self {
        let fields = object(json!({
            "donationId": donation.id,
            "timestamp": donation.timestamp,
            "fromOwner": donation.from_owner,
            "fromChainId": donation.from_chain_id,
            "toOwner": donation.to_owner,
            "toChainId": donation.to_chain_id,
            "amount": normalize_amount(&donation.amount),
            "message": donation.message,
        }));

        Self {
            kind: EntityKind::Donation,
            external_id: donation.id.to_string(),
            fields,
            blobs: Vec::new(),
        }
    }
}

impl From<ProductView> for LedgerRecord {
    fn from(product: ProductView) -> Self {
        let preview_hash = product
            .image_preview_hash
            .filter(|hash| !hash.trim().is_empty());

        let fields = object(json!({
            "author": product.author,
            "authorChainId": product.author_chain_id,
            "name": product.name,
            "description": product.description,
            "link": product.link,
            "dataBlobHash": product.data_blob_hash,
            "imagePreviewHash": preview_hash,
            "price": normalize_amount(&product.price),
            "createdAt": product.created_at,
        }));

        let blobs = preview_hash
            .map(|hash| BlobSlot {
                hash_field: "imagePreviewHash",
                content_field: "imagePreview",
                hash,
            })
            .into_iter()
            .collect();

        Self {
            kind: EntityKind::Product,
            external_id: product.id,
            fields,
            blobs,
        }
    }
}

/// Change notification delivered by the node's subscription stream.
///
/// The payload is kept only for logging; the listener always refetches full state.
#[derive(Debug, Clone)]
pub struct ChainNotification {
    pub payload: Value,
}

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphQLErrorEntry {
    pub message: String,
}

/// GraphQL response envelope. Both members may be present at once.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphQLEnvelope {
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQLErrorEntry>>,
}

impl GraphQLEnvelope {
    /// Reduce the envelope to its data payload.
    ///
    /// Any non-empty error list is a failure, even when data is also present.
    pub fn into_data(self) -> Result<Value, LedgerError> {
        if let Some(errors) = self.errors.filter(|errors| !errors.is_empty()) {
            let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            return Err(LedgerError::QueryError(messages.join("; ")));
        }

        match self.data {
            Some(Value::Null) | None => Err(LedgerError::NoData),
            Some(data) => Ok(data),
        }
    }
}

/// Error types for ledger queries, blob reads and the notification stream
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("GraphQL error: {0}")]
    QueryError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("No data returned")]
    NoData,

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Subscription error: {0}")]
    SubscriptionError(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LedgerError::MalformedResponse(err.to_string())
        } else {
            // Timeouts, connect failures and status errors are all transient.
            LedgerError::NetworkError(err.to_string())
        }
    }
}

impl LedgerError {
    /// Whether the next scheduled pass may succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LedgerError::BlobNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_with_errors_and_data_is_a_query_error() {
        let envelope: GraphQLEnvelope = serde_json::from_value(json!({
            "data": { "allProducts": [] },
            "errors": [{ "message": "boom" }, { "message": "again" }]
        }))
        .unwrap();

        match envelope.into_data() {
            Err(LedgerError::QueryError(msg)) => assert_eq!(msg, "boom; again"),
            other => panic!("expected QueryError, got {:?}", other),
        }
    }

    #[test]
    fn envelope_with_empty_error_list_yields_data() {
        let envelope: GraphQLEnvelope = serde_json::from_value(json!({
            "data": { "allProducts": [] },
            "errors": []
        }))
        .unwrap();

        assert!(envelope.into_data().is_ok());
    }

    #[test]
    fn envelope_without_data_is_no_data() {
        let envelope: GraphQLEnvelope = serde_json::from_value(json!({ "data": null })).unwrap();
        assert!(matches!(envelope.into_data(), Err(LedgerError::NoData)));
    }

    #[test]
    fn product_with_preview_declares_a_blob_slot() {
        let product: ProductView = serde_json::from_value(json!({
            "id": "p1",
            "author": "0xabc",
            "authorChainId": "chain-a",
            "name": "Sticker pack",
            "description": "",
            "link": "",
            "dataBlobHash": "ff",
            "imagePreviewHash": "aa",
            "price": "5.",
            "createdAt": 17
        }))
        .unwrap();

        let record = LedgerRecord::from(product);
        assert_eq!(record.external_id, "p1");
        assert_eq!(record.fields["price"], json!("5"));
        assert_eq!(
            record.blobs,
            vec![BlobSlot {
                hash_field: "imagePreviewHash",
                content_field: "imagePreview",
                hash: "aa".to_string(),
            }]
        );
    }

    #[test]
    fn blank_preview_hash_is_treated_as_absent() {
        let product: ProductView = serde_json::from_value(json!({
            "id": "p2",
            "author": "0xabc",
            "authorChainId": "chain-a",
            "name": "Zine",
            "imagePreviewHash": "  ",
            "price": "1",
            "createdAt": 1
        }))
        .unwrap();

        let record = LedgerRecord::from(product);
        assert!(record.blobs.is_empty());
        assert_eq!(record.fields["imagePreviewHash"], Value::Null);
    }

    #[test]
    fn donation_external_id_is_the_counter() {
        let donation: DonationView = serde_json::from_value(json!({
            "id": 42,
            "timestamp": 1_700_000_000_000_000u64,
            "fromOwner": "0x1",
            "fromChainId": "c1",
            "toOwner": "0x2",
            "toChainId": "c2",
            "amount": "0.500",
            "message": null
        }))
        .unwrap();

        let record = LedgerRecord::from(donation);
        assert_eq!(record.external_id, "42");
        assert_eq!(record.fields["amount"], json!("0.5"));
        assert_eq!(record.fields["donationId"], json!(42));
    }
}
