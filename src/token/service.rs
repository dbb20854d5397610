//! Continuously refreshed service-level access token.
//!
//! The token lives inside a dedicated task and is published through a `watch` channel, so
//! readers only ever see a complete token and never wait on network I/O.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	config::{MIN_REFRESH_INTERVAL, RefreshConfig},
	identity::IdentityProvider,
	metrics,
};

/// Access token held for server-to-server calls.
#[derive(Clone)]
pub struct ServiceToken {
	/// Opaque bearer value.
	pub access_token: String,
	/// Monotonic instant after which the token is no longer accepted.
	pub expires_at: Instant,
	/// Client identity the token was granted to.
	pub issued_for: String,
}
impl ServiceToken {
	/// Whether the token has passed its expiry.
	pub fn is_expired(&self, now: Instant) -> bool {
		now >= self.expires_at
	}

	/// Remaining lifetime at `now`.
	pub fn remaining(&self, now: Instant) -> Duration {
		self.expires_at.saturating_duration_since(now)
	}
}
impl Debug for ServiceToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("ServiceToken")
			.field("expires_at", &self.expires_at)
			.field("issued_for", &self.issued_for)
			.finish_non_exhaustive()
	}
}

/// Read-only accessor to the current service token.
#[derive(Clone, Debug)]
pub struct ServiceTokenHandle {
	rx: watch::Receiver<Arc<ServiceToken>>,
}
impl ServiceTokenHandle {
	/// Current token snapshot.
	pub fn token(&self) -> Arc<ServiceToken> {
		self.rx.borrow().clone()
	}

	/// Current bearer value; never performs network I/O.
	pub fn access_token(&self) -> String {
		self.rx.borrow().access_token.clone()
	}

	/// Wait until the refresh task publishes a new token.
	pub async fn changed(&mut self) -> Result<Arc<ServiceToken>> {
		self.rx
			.changed()
			.await
			.map_err(|_| Error::UpstreamUnavailable("service token refresher stopped".into()))?;

		Ok(self.token())
	}
}

/// Maintains one continuously refreshed service token.
pub struct ServiceTokenSyncer {
	provider: Arc<dyn IdentityProvider>,
	client_id: String,
	client_secret: String,
	config: RefreshConfig,
}
impl ServiceTokenSyncer {
	/// Create a syncer for the given client credentials.
	pub fn new(
		provider: Arc<dyn IdentityProvider>,
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
		config: RefreshConfig,
	) -> Self {
		Self { provider, client_id: client_id.into(), client_secret: client_secret.into(), config }
	}

	/// Perform the initial grant and spawn the refresh task.
	///
	/// Fails when the initial grant fails; the task runs until `shutdown` is cancelled or
	/// every handle is dropped.
	#[tracing::instrument(skip_all, fields(client_id = %self.client_id))]
	pub async fn start(self, shutdown: CancellationToken) -> Result<ServiceTokenHandle> {
		let initial = self.grant().await.inspect_err(|err| {
			tracing::error!(error = %err, "initial service token grant failed");
		})?;

		tracing::info!(expires_in = ?initial.remaining(Instant::now()), "service token acquired");

		let (tx, rx) = watch::channel(Arc::new(initial));

		tokio::spawn(self.refresh_forever(tx, shutdown));

		Ok(ServiceTokenHandle { rx })
	}

	async fn grant(&self) -> Result<ServiceToken> {
		let requested_at = Instant::now();
		let grant = self.provider.grant_service_token(&self.client_id, &self.client_secret).await;

		metrics::record_token_refresh(&self.client_id, grant.is_ok());

		let grant = grant?;

		Ok(ServiceToken {
			access_token: grant.access_token,
			expires_at: requested_at + grant.expires_in,
			issued_for: self.client_id.clone(),
		})
	}

	fn next_refresh(&self, token: &ServiceToken, now: Instant) -> Instant {
		let lifetime = token.remaining(now);
		let lead = if self.config.refresh_margin >= lifetime {
			// Short-lived token; re-grant halfway through instead.
			lifetime / 2
		} else {
			lifetime - self.config.refresh_margin
		};

		now + lead.max(MIN_REFRESH_INTERVAL.min(lifetime))
	}

	async fn refresh_forever(
		self,
		tx: watch::Sender<Arc<ServiceToken>>,
		shutdown: CancellationToken,
	) {
		loop {
			let current = tx.borrow().clone();
			let wake_at = self.next_refresh(&current, Instant::now());

			tracing::trace!(
				in_ = ?wake_at.saturating_duration_since(Instant::now()),
				"next service token refresh scheduled"
			);

			tokio::select! {
				_ = shutdown.cancelled() => break,
				_ = tx.closed() => break,
				_ = time::sleep_until(wake_at) => {},
			}

			let mut failures = 0;

			loop {
				match self.grant().await {
					Ok(token) => {
						tracing::debug!(expires_in = ?token.remaining(Instant::now()), "service token refreshed");

						if tx.send(Arc::new(token)).is_err() {
							return;
						}

						break;
					},
					Err(err) => {
						let delay = self.config.grant_backoff.delay(failures);

						failures = failures.saturating_add(1);

						tracing::warn!(
							error = %err,
							failures,
							retry_in = ?delay,
							remaining = ?current.remaining(Instant::now()),
							"service token refresh failed; keeping current token"
						);

						tokio::select! {
							_ = shutdown.cancelled() => return,
							_ = time::sleep(delay) => {},
						}
					},
				}
			}
		}

		tracing::info!(client_id = %self.client_id, "service token refresher stopped");
	}
}
impl Debug for ServiceTokenSyncer {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("ServiceTokenSyncer")
			.field("client_id", &self.client_id)
			.field("config", &self.config)
			.finish_non_exhaustive()
	}
}
