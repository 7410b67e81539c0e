mod config;
mod ledger;
mod mirror;
mod utils;

#[cfg(test)]
mod testing;

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::ledger::{BlobFetcher, EntityKind, LedgerClient};
use crate::mirror::sync::{
	ListenerConfig, LoggingHandler, NotificationListener, Reconciler, SyncCoordinator,
	spawn_handler,
};
use crate::mirror::{HttpMirrorStore, InMemoryMirrorStore, MirrorStore, MirrorSyncError};

#[tokio::main]
async fn main() {
	if let Err(e) = dotenvy::dotenv() {
		// A missing .env file is normal; settings then come from the environment alone.
		if !e.not_found() {
			eprintln!("Ignoring unreadable .env file: {}", e);
		}
	}

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::builder()
				.with_default_directive(tracing::Level::INFO.into())
				.from_env_lossy(),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.compact()
		.init();

	if let Err(e) = run().await {
		error!("Mirror sync failed to start: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), MirrorSyncError> {
	let config = AppConfig::from_env()?;
	info!("Starting ledger mirror sync for application {} on chain {}", config.application_id, config.chain_id);

	let client = Arc::new(LedgerClient::new(
		config.application_url(),
		config.notifications_url(),
		config.chain_id.clone(),
		config.request_timeout,
	)?);
	info!("Created ledger client for {}", config.application_url());

	let store: Arc<dyn MirrorStore> = if config.uses_memory_store() {
		warn!("Using an in-process store; the mirror is discarded on exit");
		Arc::new(InMemoryMirrorStore::new())
	} else {
		info!("Mirroring into {}", config.store_url);
		Arc::new(HttpMirrorStore::new(
			config.store_url.clone(),
			config.store_token.clone(),
			config.request_timeout,
		)?)
	};

	let blobs = Arc::new(BlobFetcher::new(client.clone()));
	let reconciler = Reconciler::new(client.clone(), blobs.clone(), store, config.record_concurrency);
	let coordinator = SyncCoordinator::new(reconciler);
	let event_log = spawn_handler(coordinator.subscribe(), Box::new(LoggingHandler));

	let shutdown = CancellationToken::new();
	let listener = NotificationListener::new(client, coordinator.clone(), ListenerConfig::from(&config));
	let listener_state = listener.state();
	let listener_task = tokio::spawn(listener.run(shutdown.clone()));

	wait_for_shutdown(tokio::signal::ctrl_c()).await;

	info!("Listener was {:?}", *listener_state.borrow());
	shutdown.cancel();
	if let Err(e) = listener_task.await {
		error!("Notification listener task failed: {}", e);
	}

	// Passes are never cut short; let the current one and any queued re-run finish.
	if coordinator.is_running() {
		info!("Waiting for the running pass to finish");
	}
	coordinator.wait_idle().await;

	for kind in EntityKind::PASS_ORDER {
		match coordinator.cursor(kind) {
			Some(cursor) => info!(
				"{}: {} passes since {:?}, last success {:?}, last error {:?}",
				kind,
				cursor.passes_completed(),
				cursor.first_full_pass_at(),
				cursor.last_success_at(),
				cursor.last_error()
			),
			None => info!("{}: never synced", kind),
		}
	}
	info!(
		"Stopped after {} passes, {} blob reads",
		coordinator.passes_completed(),
		blobs.network_reads()
	);

	drop(coordinator);
	if let Err(e) = event_log.await {
		error!("Event log task failed: {}", e);
	}
	Ok(())
}

/// Resolve once the shutdown signal fires. If the signal cannot be observed the process keeps
/// syncing and has to be stopped from outside.
async fn wait_for_shutdown(signal: impl Future<Output = std::io::Result<()>>) {
	match signal.await {
		Ok(()) => info!("Shutdown requested"),
		Err(e) => {
			error!("Failed to listen for shutdown signal, running until killed: {}", e);
			std::future::pending::<()>().await;
		}
	}
}
