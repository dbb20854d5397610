//! Memoized exchange of end-user offline tokens for short-lived access tokens.
//!
//! Entries are keyed by [`TokenFingerprint`]; the raw offline token is only held for the
//! duration of the upstream call. Concurrent callers presenting the same token share one
//! upstream exchange, and its outcome, through a per-fingerprint flight. Failures are shared
//! with the callers already waiting but never cached for later ones.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::{Mutex, RwLock};
// self
use crate::{_prelude::*, identity::IdentityProvider, metrics, security::TokenFingerprint};

/// Cached result of one offline-token exchange.
#[derive(Clone)]
pub struct ExchangeCacheEntry {
	/// Fingerprint of the offline token the entry was produced from.
	pub fingerprint: TokenFingerprint,
	/// Exchanged access token.
	pub access_token: Arc<str>,
	/// Instant after which the entry is never served.
	pub expires_at: Instant,
}
impl ExchangeCacheEntry {
	fn is_fresh(&self, now: Instant) -> bool {
		now < self.expires_at
	}
}
impl std::fmt::Debug for ExchangeCacheEntry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExchangeCacheEntry")
			.field("fingerprint", &self.fingerprint)
			.field("expires_at", &self.expires_at)
			.finish_non_exhaustive()
	}
}

/// Exchanges offline tokens, collapsing concurrent identical requests into one call.
pub struct OfflineTokenExchangeCache {
	provider: Arc<dyn IdentityProvider>,
	skew: Duration,
	entries: RwLock<HashMap<TokenFingerprint, ExchangeCacheEntry>>,
	flights: Mutex<HashMap<TokenFingerprint, Arc<Flight>>>,
}
impl OfflineTokenExchangeCache {
	/// Create an empty cache; `skew` is subtracted from every exchanged lifetime.
	pub fn new(provider: Arc<dyn IdentityProvider>, skew: Duration) -> Self {
		Self {
			provider,
			skew,
			entries: RwLock::new(HashMap::new()),
			flights: Mutex::new(HashMap::new()),
		}
	}

	/// Return a currently valid access token for `offline_token`.
	///
	/// Rejections from the identity provider purge the entry and surface as
	/// [`Error::AuthRejected`].
	pub async fn exchange(&self, offline_token: &str) -> Result<Arc<str>> {
		let fingerprint = TokenFingerprint::of(offline_token);

		if let Some(token) = self.lookup(&fingerprint).await {
			metrics::record_exchange("hit");

			return Ok(token);
		}

		let flight = self.flight(&fingerprint).await;
		let result = {
			let mut outcome = flight.outcome.lock().await;

			match outcome.clone() {
				Some(shared) => {
					metrics::record_exchange("coalesced");

					shared.replay()
				},
				None => {
					let result = match self.lookup(&fingerprint).await {
						Some(token) => {
							metrics::record_exchange("coalesced");

							Ok(token)
						},
						None => self.exchange_upstream(&fingerprint, offline_token).await,
					};

					*outcome = Some(Outcome::of(&result));

					result
				},
			}
		};

		drop(flight);
		self.release_flight(&fingerprint).await;

		result
	}

	/// Drop the cached entry for `offline_token`, e.g. after its access token failed verification.
	pub async fn invalidate(&self, offline_token: &str) {
		let fingerprint = TokenFingerprint::of(offline_token);

		if self.entries.write().await.remove(&fingerprint).is_some() {
			tracing::debug!(fingerprint = %fingerprint.short(), "exchange cache entry invalidated");
		}
	}

	/// Number of cached entries, expired ones included until their next lookup.
	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	/// Whether the cache holds no entries.
	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	async fn lookup(&self, fingerprint: &TokenFingerprint) -> Option<Arc<str>> {
		let now = Instant::now();
		let expired = {
			let entries = self.entries.read().await;

			match entries.get(fingerprint) {
				Some(entry) if entry.is_fresh(now) => return Some(entry.access_token.clone()),
				Some(_) => true,
				None => false,
			}
		};

		if expired {
			let mut entries = self.entries.write().await;

			if entries.get(fingerprint).is_some_and(|entry| !entry.is_fresh(now)) {
				entries.remove(fingerprint);

				tracing::trace!(fingerprint = %fingerprint.short(), "expired exchange entry evicted");
			}
		}

		None
	}

	#[tracing::instrument(skip_all, fields(fingerprint = %fingerprint.short()))]
	async fn exchange_upstream(
		&self,
		fingerprint: &TokenFingerprint,
		offline_token: &str,
	) -> Result<Arc<str>> {
		let requested_at = Instant::now();

		match self.provider.exchange_offline_token(offline_token).await {
			Ok(grant) => {
				let lifetime = grant.expires_in.saturating_sub(self.skew);
				let entry = ExchangeCacheEntry {
					fingerprint: fingerprint.clone(),
					access_token: Arc::from(grant.access_token),
					expires_at: requested_at + lifetime,
				};
				let token = entry.access_token.clone();

				self.entries.write().await.insert(fingerprint.clone(), entry);
				metrics::record_exchange("miss");

				tracing::debug!(?lifetime, "offline token exchanged");

				Ok(token)
			},
			Err(err) => {
				self.entries.write().await.remove(fingerprint);

				if err.is_auth_failure() {
					metrics::record_exchange("rejected");

					tracing::info!(error = %err, "offline token rejected");

					Err(err)
				} else {
					metrics::record_exchange("error");

					tracing::warn!(error = %err, "offline token exchange failed");

					Err(err)
				}
			},
		}
	}

	async fn flight(&self, fingerprint: &TokenFingerprint) -> Arc<Flight> {
		self.flights.lock().await.entry(fingerprint.clone()).or_default().clone()
	}

	async fn release_flight(&self, fingerprint: &TokenFingerprint) {
		let mut flights = self.flights.lock().await;

		// Only the map still references the flight once every caller is done.
		if flights.get(fingerprint).is_some_and(|flight| Arc::strong_count(flight) == 1) {
			flights.remove(fingerprint);
		}
	}
}
impl std::fmt::Debug for OfflineTokenExchangeCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OfflineTokenExchangeCache").field("skew", &self.skew).finish_non_exhaustive()
	}
}

/// One upstream exchange shared by every caller that queued on it.
#[derive(Default)]
struct Flight {
	outcome: Mutex<Option<Outcome>>,
}

#[derive(Clone)]
enum Outcome {
	Exchanged(Arc<str>),
	Rejected(String),
	Failed(String),
}
impl Outcome {
	fn of(result: &Result<Arc<str>>) -> Self {
		match result {
			Ok(token) => Self::Exchanged(token.clone()),
			Err(Error::AuthRejected(reason)) => Self::Rejected(reason.clone()),
			Err(err) if err.is_auth_failure() => Self::Rejected(err.to_string()),
			Err(err) => Self::Failed(err.to_string()),
		}
	}

	fn replay(self) -> Result<Arc<str>> {
		match self {
			Self::Exchanged(token) => Ok(token),
			Self::Rejected(reason) => Err(Error::AuthRejected(reason)),
			Self::Failed(reason) => Err(Error::UpstreamUnavailable(reason)),
		}
	}
}
