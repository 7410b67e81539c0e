//! Change notifications and the polling fallback.
//!
//! The listener keeps a subscription to the chain's notifications open and turns every
//! notification into a trigger. Notification payloads are not trusted; each one only causes
//! a full pass. When the subscription cannot be opened or is lost, the listener polls on a
//! fixed interval and retries the subscription on an exponential backoff schedule until it
//! succeeds. A subscription that stays silent for longer than the idle timeout is treated as
//! lost, so a half-open connection cannot stall the mirror.

use crate::config::AppConfig;
use crate::ledger::{NotificationSource, NotificationStream};
use crate::mirror::sync::coordinator::{SyncCoordinator, TriggerSource};

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection state of the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
	Disconnected,
	Connecting,
	Subscribed,
	/// Subscription unavailable; passes run on the poll timer
	Polling,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
	pub poll_interval: Duration,
	/// First delay before a resubscribe attempt
	pub resubscribe_initial: Duration,
	/// Ceiling for the resubscribe delay
	pub resubscribe_max: Duration,
	/// Randomization factor applied to resubscribe delays, 0.0 to disable
	pub jitter: f64,
	/// Drop the subscription after this long without a notification
	pub idle_timeout: Duration,
}

impl Default for ListenerConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(10),
			resubscribe_initial: Duration::from_secs(1),
			resubscribe_max: Duration::from_secs(60),
			jitter: 0.5,
			idle_timeout: Duration::from_secs(600),
		}
	}
}

impl From<&AppConfig> for ListenerConfig {
	fn from(config: &AppConfig) -> Self {
		Self {
			poll_interval: config.poll_interval,
			resubscribe_max: config.resubscribe_max,
			idle_timeout: config.notification_idle,
			..Self::default()
		}
	}
}

pub struct NotificationListener {
	source: Arc<dyn NotificationSource>,
	coordinator: Arc<SyncCoordinator>,
	config: ListenerConfig,
	state: watch::Sender<ListenerState>,
}

impl NotificationListener {
	pub fn new(
		source: Arc<dyn NotificationSource>,
		coordinator: Arc<SyncCoordinator>,
		config: ListenerConfig,
	) -> Self {
		let (state, _) = watch::channel(ListenerState::Disconnected);
		Self {
			source,
			coordinator,
			config,
			state,
		}
	}

	/// Observe state transitions
	pub fn state(&self) -> watch::Receiver<ListenerState> {
		self.state.subscribe()
	}

	fn set_state(&self, state: ListenerState) {
		let previous = self.state.send_replace(state);
		if previous != state {
			debug!("Listener state {:?} -> {:?}", previous, state);
		}
	}

	/// Run until cancelled
	pub async fn run(self, shutdown: CancellationToken) {
		let mut subscription = self.connect(&shutdown).await;

		loop {
			if let Some(stream) = subscription.take() {
				if !self.listen(stream, &shutdown).await {
					break;
				}
				self.set_state(ListenerState::Disconnected);
			}

			match self.poll(&shutdown).await {
				Some(stream) => subscription = Some(stream),
				None => break,
			}
		}

		self.set_state(ListenerState::Disconnected);
		info!("Notification listener stopped");
	}

	/// Initial subscribe attempt
	async fn connect(&self, shutdown: &CancellationToken) -> Option<NotificationStream> {
		self.set_state(ListenerState::Connecting);

		let result = tokio::select! {
			_ = shutdown.cancelled() => return None,
			result = self.source.subscribe() => result,
		};

		match result {
			Ok(stream) => {
				self.on_subscribed();
				Some(stream)
			}
			Err(e) => {
				warn!("Could not subscribe to notifications: {}", e);
				self.set_state(ListenerState::Disconnected);
				None
			}
		}
	}

	fn on_subscribed(&self) {
		info!("Subscribed to chain notifications");
		self.set_state(ListenerState::Subscribed);
		self.coordinator.trigger(TriggerSource::Subscribed);
	}

	/// Trigger a pass per notification. Returns false if cancelled, true if the stream was lost.
	async fn listen(&self, mut stream: NotificationStream, shutdown: &CancellationToken) -> bool {
		let mut last_event_time = Instant::now();

		loop {
			let idle = tokio::time::sleep_until(last_event_time + self.config.idle_timeout);
			tokio::pin!(idle);

			let item = tokio::select! {
				_ = shutdown.cancelled() => return false,
				_ = &mut idle => {
					warn!(
						"No notification for {:?}, dropping the subscription",
						self.config.idle_timeout
					);
					return true;
				}
				item = stream.next() => item,
			};

			match item {
				Some(Ok(notification)) => {
					last_event_time = Instant::now();
					debug!("Chain notification: {}", notification.payload);
					self.coordinator.trigger(TriggerSource::Notification);
				}
				Some(Err(e)) => {
					warn!("Notification stream failed: {}", e);
					return true;
				}
				None => {
					warn!("Notification stream closed by the node");
					return true;
				}
			}
		}
	}

	/// Poll on a fixed interval while retrying the subscription. Returns the new stream, or
	/// None if cancelled.
	async fn poll(&self, shutdown: &CancellationToken) -> Option<NotificationStream> {
		self.set_state(ListenerState::Polling);
		info!(
			"Falling back to polling every {:?}",
			self.config.poll_interval
		);

		let mut ticker = tokio::time::interval(self.config.poll_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut schedule = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.config.resubscribe_initial)
			.with_max_interval(self.config.resubscribe_max)
			.with_randomization_factor(self.config.jitter)
			.with_max_elapsed_time(None)
			.build();
		let retry = tokio::time::sleep(self.next_delay(&mut schedule));
		tokio::pin!(retry);

		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return None,
				_ = ticker.tick() => {
					self.coordinator.trigger(TriggerSource::Poll);
				}
				_ = &mut retry => {
					let attempt = tokio::select! {
						_ = shutdown.cancelled() => return None,
						attempt = self.source.subscribe() => attempt,
					};

					match attempt {
						Ok(stream) => {
							self.on_subscribed();
							return Some(stream);
						}
						Err(e) => {
							let delay = self.next_delay(&mut schedule);
							debug!("Resubscribe failed ({}), next attempt in {:?}", e, delay);
							retry.as_mut().reset(Instant::now() + delay);
						}
					}
				}
			}
		}
	}

	fn next_delay(&self, schedule: &mut impl Backoff) -> Duration {
		schedule.next_backoff().unwrap_or(self.config.resubscribe_max)
	}
}
