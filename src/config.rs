//! Synchronizer configuration

use std::str::FromStr;
use std::time::Duration;

/// Store URL selecting the process-local store instead of a remote one
pub const MEMORY_STORE_URL: &str = "memory:";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
	#[error("{0} must be set")]
	Missing(&'static str),

	#[error("{name} must be {expected}, got {value:?}")]
	Invalid {
		name: &'static str,
		expected: &'static str,
		value: String,
	},
}

/// Synchronizer configuration, read once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
	/// Node service base URL, `http(s)://host:port`
	pub ledger_url: String,
	pub chain_id: String,
	pub application_id: String,
	/// Record store base URL, or `memory:` for a process-local store
	pub store_url: String,
	pub store_token: Option<String>,
	pub poll_interval: Duration,
	pub request_timeout: Duration,
	pub resubscribe_max: Duration,
	pub record_concurrency: usize,
	/// Resubscribe after this long without a notification
	pub notification_idle: Duration,
}

impl AppConfig {
	/// Load configuration from environment variables
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
		let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
		let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

		let ledger_url = require("LEDGER_URL")?.trim_end_matches('/').to_string();
		if !ledger_url.starts_with("http://") && !ledger_url.starts_with("https://") {
			return Err(ConfigError::Invalid {
				name: "LEDGER_URL",
				expected: "an http(s) URL",
				value: ledger_url,
			});
		}

		let record_concurrency: usize = parse_or(get("RECORD_CONCURRENCY"), "RECORD_CONCURRENCY", 4)?;
		if record_concurrency == 0 {
			return Err(ConfigError::Invalid {
				name: "RECORD_CONCURRENCY",
				expected: "at least 1",
				value: "0".into(),
			});
		}

		Ok(Self {
			ledger_url,
			chain_id: require("CHAIN_ID")?,
			application_id: require("APPLICATION_ID")?,
			store_url: require("STORE_URL")?.trim_end_matches('/').to_string(),
			store_token: get("STORE_TOKEN"),
			poll_interval: secs(get("POLL_INTERVAL_SECS"), "POLL_INTERVAL_SECS", 10)?,
			request_timeout: secs(get("REQUEST_TIMEOUT_SECS"), "REQUEST_TIMEOUT_SECS", 30)?,
			resubscribe_max: secs(get("RESUBSCRIBE_MAX_SECS"), "RESUBSCRIBE_MAX_SECS", 60)?,
			record_concurrency,
			notification_idle: secs(get("NOTIFICATION_IDLE_SECS"), "NOTIFICATION_IDLE_SECS", 600)?,
		})
	}

	/// GraphQL endpoint of the application
	pub fn application_url(&self) -> String {
		format!(
			"{}/chains/{}/applications/{}",
			self.ledger_url, self.chain_id, self.application_id
		)
	}

	/// Websocket endpoint for notification subscriptions
	pub fn notifications_url(&self) -> String {
		let base = match self.ledger_url.strip_prefix("https://") {
			Some(rest) => format!("wss://{}", rest),
			None => format!(
				"ws://{}",
				self.ledger_url.trim_start_matches("http://")
			),
		};
		format!("{}/ws", base)
	}

	pub fn uses_memory_store(&self) -> bool {
		self.store_url == MEMORY_STORE_URL
	}
}

fn parse_or<T: FromStr>(raw: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
	match raw {
		None => Ok(default),
		Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
			name,
			expected: "a non-negative integer",
			value,
		}),
	}
}

fn secs(raw: Option<String>, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
	let secs = parse_or(raw, name, default)?;
	if secs == 0 {
		return Err(ConfigError::Invalid {
			name,
			expected: "a positive number of seconds",
			value: "0".into(),
		});
	}
	Ok(Duration::from_secs(secs))
}
