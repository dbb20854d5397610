//! Starts, restarts, and stops the resource watchers.

// std
use std::sync::Mutex;
// crates.io
use futures::future::BoxFuture;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
// self
use crate::_prelude::*;

/// A long-running task the supervisor can restart.
pub trait Supervised: Send + Sync + 'static {
	/// Label used in logs.
	fn kind(&self) -> &'static str;

	/// Run until `cancel` fires.
	fn run(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()>;
}

/// Owns one task per watcher and restarts watchers that crash.
pub struct ReconciliationSupervisor {
	parent: CancellationToken,
	watchers: Vec<Arc<dyn Supervised>>,
	restart_delay: Duration,
	running: Mutex<Option<Running>>,
}
impl ReconciliationSupervisor {
	/// Supervise `watchers`; their tasks are children of `parent`.
	pub fn new(
		parent: CancellationToken,
		watchers: Vec<Arc<dyn Supervised>>,
		restart_delay: Duration,
	) -> Self {
		Self { parent, watchers, restart_delay, running: Mutex::new(None) }
	}

	/// Spawn every watcher; a no-op while they are already running.
	pub fn observe(&self) {
		let mut running = self.lock();

		if running.as_ref().is_some_and(|running| !running.cancel.is_cancelled()) {
			tracing::debug!("watchers already running");

			return;
		}

		let cancel = self.parent.child_token();
		let tasks = self
			.watchers
			.iter()
			.map(|watcher| tokio::spawn(guard(watcher.clone(), cancel.clone(), self.restart_delay)))
			.collect();

		tracing::info!(watchers = self.watchers.len(), "reconciliation started");

		*running = Some(Running { cancel, tasks });
	}

	/// Whether watcher tasks are currently running.
	pub fn is_running(&self) -> bool {
		self.lock().as_ref().is_some_and(|running| !running.cancel.is_cancelled())
	}

	/// Cancel every watcher without waiting for them to stop.
	pub fn abort(&self) {
		if let Some(running) = self.lock().take() {
			running.cancel.cancel();

			tracing::info!("reconciliation aborted");
		}
	}

	/// Cancel every watcher and wait until all of them have stopped.
	pub async fn shutdown(&self) {
		let Some(running) = self.lock().take() else {
			return;
		};

		running.cancel.cancel();

		for task in running.tasks {
			if let Err(err) = task.await {
				tracing::warn!(error = %err, "watcher supervisor task ended abnormally");
			}
		}

		tracing::info!("reconciliation stopped");
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
		self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}
impl std::fmt::Debug for ReconciliationSupervisor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ReconciliationSupervisor")
			.field("watchers", &self.watchers.iter().map(|w| w.kind()).collect::<Vec<_>>())
			.field("restart_delay", &self.restart_delay)
			.field("running", &self.is_running())
			.finish()
	}
}

struct Running {
	cancel: CancellationToken,
	tasks: Vec<JoinHandle<()>>,
}

/// Run one watcher, restarting it after a panic until cancelled.
async fn guard(watcher: Arc<dyn Supervised>, cancel: CancellationToken, restart_delay: Duration) {
	let kind = watcher.kind();
	let mut restarts = 0_u32;

	loop {
		let outcome = tokio::spawn(watcher.clone().run(cancel.clone())).await;

		match outcome {
			Ok(()) => break,
			Err(err) if err.is_panic() && !cancel.is_cancelled() => {
				restarts = restarts.saturating_add(1);

				tracing::error!(kind, restarts, retry_in = ?restart_delay, "watcher crashed; restarting");

				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = time::sleep(restart_delay) => {},
				}
			},
			Err(err) => {
				tracing::debug!(kind, error = %err, "watcher task ended");

				break;
			},
		}
	}
}
