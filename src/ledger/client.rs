//!
//! GraphQL client for the ledger application served by a node service.
//!
//! This module provides an async client for reading the application's authoritative state,
//! resolving data blobs by content hash, and subscribing to the chain's change notifications
//! over a `graphql-transport-ws` websocket. All methods are async and designed for use with Tokio.

use super::queries::{
	AllDonationsData, AllProductsData, AllProfilesData, DataBlobData, GraphQLRequest,
};
use super::types::*;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::{
	connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, info, warn};

/// Stream of change notifications from one subscription.
pub type NotificationStream =
	Pin<Box<dyn Stream<Item = Result<ChainNotification, LedgerError>> + Send>>;

/// Read access to the authoritative entity sets
#[async_trait::async_trait]
pub trait LedgerSource: Send + Sync {
	/// Fetch the full current set for one entity kind
	async fn query(&self, kind: EntityKind) -> Result<Vec<LedgerRecord>, LedgerError>;
}

/// Raw access to content-addressed blobs
#[async_trait::async_trait]
pub trait BlobSource: Send + Sync {
	async fn read_blob(&self, hash: &str) -> Result<Vec<u8>, LedgerError>;
}

/// Source of "something changed" signals for the application's chain
#[async_trait::async_trait]
pub trait NotificationSource: Send + Sync {
	async fn subscribe(&self) -> Result<NotificationStream, LedgerError>;
}

/// Ledger application GraphQL client
#[derive(Clone)]
pub struct LedgerClient {
	/// The underlying HTTP client for GraphQL queries.
	http_client: Client,
	/// Application endpoint: `{node}/chains/{chain}/applications/{app}`.
	application_url: String,
	/// The WebSocket URL for notification subscriptions.
	ws_url: String,
	/// Chain whose notifications are subscribed to.
	chain_id: String,
	/// Bound applied to websocket connect, handshake and keepalive.
	timeout: Duration,
}

impl LedgerClient {
	/// Create a new ledger client.
	///
	/// # Arguments
	/// * `application_url` - The HTTP endpoint of the application's GraphQL service.
	/// * `ws_url` - The node's WebSocket endpoint for subscriptions.
	/// * `chain_id` - The chain hosting the application.
	/// * `timeout` - Per-call timeout; expiry is reported as a network error.
	pub fn new(
		application_url: String,
		ws_url: String,
		chain_id: String,
		timeout: Duration,
	) -> Result<Self, LedgerError> {
		let http_client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| LedgerError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

		Ok(Self {
			http_client,
			application_url,
			ws_url,
			chain_id,
			timeout,
		})
	}

	/// Execute a GraphQL request and decode its data payload.
	///
	/// A non-success status is a network error; a non-empty `errors` list is a query error
	/// even when `data` is present as well.
	pub async fn execute_query<T: DeserializeOwned>(
		&self,
		request: &GraphQLRequest,
	) -> Result<T, LedgerError> {
		let response = self
			.http_client
			.post(&self.application_url)
			.json(request)
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			return Err(LedgerError::NetworkError(format!("HTTP error: {}", status)));
		}

		let envelope: GraphQLEnvelope = response.json().await?;
		let data = envelope.into_data()?;

		serde_json::from_value(data).map_err(|e| LedgerError::MalformedResponse(e.to_string()))
	}

	/// Open a notification subscription for the configured chain.
	///
	/// Performs the `graphql-transport-ws` handshake and returns a stream yielding one item
	/// per `next` message. The stream ends when the server completes or closes the connection.
	pub async fn subscribe_notifications(&self) -> Result<NotificationStream, LedgerError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		// Create WebSocket request with required subprotocol
		let mut request = self.ws_url.clone().into_client_request()?;
		request.headers_mut().insert(
			"Sec-WebSocket-Protocol",
			"graphql-transport-ws".parse().map_err(|_| {
				LedgerError::SubscriptionError(
					"Invalid WebSocket subprotocol header value".to_string(),
				)
			})?,
		);

		let (ws_stream, response) = tokio::time::timeout(self.timeout, connect_async(request))
			.await
			.map_err(|_| LedgerError::NetworkError("WebSocket connect timed out".to_string()))??;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		ws_sender
			.send(Message::Text(json!({ "type": "connection_init" }).to_string()))
			.await?;

		// Wait for connection ack, answering keep-alive pings in the meantime
		let handshake = async {
			loop {
				let Some(msg) = ws_receiver.next().await else {
					return Err(LedgerError::SubscriptionError(
						"Connection closed during handshake".to_string(),
					));
				};
				let msg = match msg {
					Ok(msg) => msg,
					Err(e) => return Err(LedgerError::from(e)),
				};
				match classify_frame(msg) {
					ProtocolFrame::Ack => return Ok(()),
					ProtocolFrame::Ping => {
						let pong = Message::Text(json!({ "type": "pong" }).to_string());
						if let Err(e) = ws_sender.send(pong).await {
							return Err(LedgerError::from(e));
						}
					}
					ProtocolFrame::Ignored => {}
					ProtocolFrame::Failed(e) => return Err(e),
					_ => {
						return Err(LedgerError::SubscriptionError(
							"Connection not acknowledged".to_string(),
						));
					}
				}
			}
		};
		tokio::time::timeout(self.timeout, handshake)
			.await
			.map_err(|_| LedgerError::NetworkError("Subscription handshake timed out".to_string()))??;

		let start_message = json!({
			"id": "notifications",
			"type": "subscribe",
			"payload": GraphQLRequest::notifications(&self.chain_id),
		});
		ws_sender
			.send(Message::Text(start_message.to_string()))
			.await?;

		info!("Subscribed to notifications for chain {}", self.chain_id);

		// The sender rides along with the stream so pings can be answered and the
		// connection lives exactly as long as the subscription. A quiet socket is pinged,
		// and one that stays silent past the idle limit is reported as lost.
		let keepalive = self.timeout;
		let idle_limit = self.timeout * 2;
		let stream = futures_util::stream::unfold(
			(ws_sender, ws_receiver, Instant::now()),
			move |(mut sender, mut receiver, mut last_frame)| async move {
				loop {
					let next = tokio::select! {
						next = receiver.next() => Some(next),
						_ = tokio::time::sleep(keepalive) => None,
					};

					let Some(next) = next else {
						if last_frame.elapsed() >= idle_limit {
							warn!("No frame from the node for {:?}", idle_limit);
							let idle = LedgerError::NetworkError("Subscription idle".to_string());
							return Some((Err(idle), (sender, receiver, last_frame)));
						}
						let ping = Message::Text(json!({ "type": "ping" }).to_string());
						if let Err(e) = sender.send(ping).await {
							return Some((Err(LedgerError::from(e)), (sender, receiver, last_frame)));
						}
						continue;
					};

					let msg = match next {
						Some(Ok(msg)) => msg,
						Some(Err(e)) => {
							return Some((Err(LedgerError::from(e)), (sender, receiver, last_frame)));
						}
						None => return None,
					};
					last_frame = Instant::now();

					match classify_frame(msg) {
						ProtocolFrame::Next(payload) => {
							return Some((
								Ok(ChainNotification { payload }),
								(sender, receiver, last_frame),
							));
						}
						ProtocolFrame::Ping => {
							let pong = Message::Text(json!({ "type": "pong" }).to_string());
							if let Err(e) = sender.send(pong).await {
								return Some((Err(LedgerError::from(e)), (sender, receiver, last_frame)));
							}
						}
						ProtocolFrame::Failed(e) => {
							return Some((Err(e), (sender, receiver, last_frame)));
						}
						ProtocolFrame::Complete | ProtocolFrame::Closed => {
							debug!("Notification subscription completed");
							return None;
						}
						ProtocolFrame::Ack | ProtocolFrame::Ignored => {}
					}
				}
			},
		);

		Ok(Box::pin(stream))
	}
}

/// A server frame of the `graphql-transport-ws` protocol, reduced to what the client acts on
#[derive(Debug)]
enum ProtocolFrame {
	Ack,
	Ping,
	Next(Value),
	Failed(LedgerError),
	Complete,
	Closed,
	Ignored,
}

fn classify_frame(message: Message) -> ProtocolFrame {
	let text = match message {
		Message::Text(text) => text,
		Message::Close(_) => return ProtocolFrame::Closed,
		// Transport-level pings are answered by tungstenite itself
		_ => return ProtocolFrame::Ignored,
	};

	let parsed: Value = match serde_json::from_str(&text) {
		Ok(parsed) => parsed,
		Err(e) => return ProtocolFrame::Failed(LedgerError::JsonError(e)),
	};

	let Some(msg_type) = parsed.get("type").and_then(|t| t.as_str()) else {
		return ProtocolFrame::Failed(LedgerError::SubscriptionError(
			"Message missing type field".to_string(),
		));
	};

	match msg_type {
		"connection_ack" => ProtocolFrame::Ack,
		"ping" => ProtocolFrame::Ping,
		"pong" => ProtocolFrame::Ignored,
		"next" => {
			let payload = parsed.get("payload").cloned().unwrap_or(Value::Null);
			let envelope: GraphQLEnvelope = match serde_json::from_value(payload) {
				Ok(envelope) => envelope,
				Err(e) => return ProtocolFrame::Failed(LedgerError::JsonError(e)),
			};
			match envelope.into_data() {
				Ok(data) => ProtocolFrame::Next(
					data.get("notifications").cloned().unwrap_or(data),
				),
				Err(e) => ProtocolFrame::Failed(e),
			}
		}
		"error" => {
			let messages: Vec<&str> = parsed
				.get("payload")
				.and_then(|p| p.as_array())
				.map(|errors| {
					errors
						.iter()
						.filter_map(|e| e.get("message").and_then(|m| m.as_str()))
						.collect()
				})
				.unwrap_or_default();
			let message = if messages.is_empty() {
				"Unknown subscription error".to_string()
			} else {
				messages.join("; ")
			};
			ProtocolFrame::Failed(LedgerError::SubscriptionError(message))
		}
		"complete" => ProtocolFrame::Complete,
		other => {
			debug!("Ignoring message type: {}", other);
			ProtocolFrame::Ignored
		}
	}
}

/// Content hashes are 32-byte digests rendered as 64 hex characters.
fn is_valid_blob_hash(hash: &str) -> bool {
	hash.len() == 64 && hex::decode(hash).is_ok()
}

#[async_trait::async_trait]
impl LedgerSource for LedgerClient {
	async fn query(&self, kind: EntityKind) -> Result<Vec<LedgerRecord>, LedgerError> {
		let request = GraphQLRequest::entity_set(kind);

		let records: Vec<LedgerRecord> = match kind {
			EntityKind::Profile => self
				.execute_query::<AllProfilesData>(&request)
				.await?
				.all_profiles_view
				.into_iter()
				.map(LedgerRecord::from)
				.collect(),
			EntityKind::Donation => self
				.execute_query::<AllDonationsData>(&request)
				.await?
				.all_donations_view
				.into_iter()
				.map(LedgerRecord::from)
				.collect(),
			EntityKind::Product => self
				.execute_query::<AllProductsData>(&request)
				.await?
				.all_products
				.into_iter()
				.map(LedgerRecord::from)
				.collect(),
		};

		debug!("Fetched {} {} records from ledger", records.len(), kind);
		Ok(records)
	}
}

#[async_trait::async_trait]
impl BlobSource for LedgerClient {
	async fn read_blob(&self, hash: &str) -> Result<Vec<u8>, LedgerError> {
		if !is_valid_blob_hash(hash) {
			warn!("Refusing to query malformed blob hash {:?}", hash);
			return Err(LedgerError::BlobNotFound(hash.to_string()));
		}

		let data: DataBlobData = self
			.execute_query(&GraphQLRequest::data_blob(hash))
			.await?;

		data.data_blob
			.ok_or_else(|| LedgerError::BlobNotFound(hash.to_string()))
	}
}

#[async_trait::async_trait]
impl NotificationSource for LedgerClient {
	async fn subscribe(&self) -> Result<NotificationStream, LedgerError> {
		self.subscribe_notifications().await
	}
}
