//! Client-side timer that keeps a user session's token pair fresh.

// std
use std::sync::Mutex;
// crates.io
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	clock::{Clock, SystemClock},
	config::SessionConfig,
	metrics,
	session::{SessionNotifier, SessionStorage, SessionTokenPair, TokenPairEndpoint},
};

/// Exchange progress of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
	/// No exchange running; the next tick may start one.
	Idle,
	/// An exchange is in flight.
	Exchanging,
	/// The server stopped extending the access token; no further exchanges are attempted.
	Exhausted,
}

/// What a single tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
	/// The refresh token had expired; the application was asked to reload.
	Reloaded,
	/// Nothing to do yet.
	Idle,
	/// Another tick's exchange is still running.
	InFlight,
	/// Exchanges are exhausted for this session.
	Exhausted,
	/// A new pair was adopted.
	Exchanged {
		/// Whether the one-time re-login prompt fired during this exchange.
		prompted: bool,
		/// Whether the access token stopped being extended.
		exhausted: bool,
	},
	/// The server signalled sign-out.
	SignedOut,
	/// The exchange failed and will be retried on the next tick.
	ExchangeFailed,
}

#[derive(Debug)]
struct SessionState {
	pair: SessionTokenPair,
	exchange: ExchangeState,
	relogin_prompted: bool,
}

/// Drives [`TokenPairEndpoint`] exchanges ahead of access-token expiry.
pub struct SessionRefresher<E, St, N, C = SystemClock> {
	endpoint: E,
	storage: St,
	notifier: N,
	clock: C,
	config: SessionConfig,
	state: Mutex<SessionState>,
}
impl<E, St, N> SessionRefresher<E, St, N, SystemClock>
where
	E: TokenPairEndpoint,
	St: SessionStorage,
	N: SessionNotifier,
{
	/// Refresher for the given initial pair using the system clock.
	pub fn new(endpoint: E, storage: St, notifier: N, config: SessionConfig, pair: SessionTokenPair) -> Self {
		Self::with_clock(endpoint, storage, notifier, SystemClock, config, pair)
	}
}
impl<E, St, N, C> SessionRefresher<E, St, N, C>
where
	E: TokenPairEndpoint,
	St: SessionStorage,
	N: SessionNotifier,
	C: Clock,
{
	/// Refresher using the supplied clock.
	pub fn with_clock(
		endpoint: E,
		storage: St,
		notifier: N,
		clock: C,
		config: SessionConfig,
		pair: SessionTokenPair,
	) -> Self {
		Self {
			endpoint,
			storage,
			notifier,
			clock,
			config,
			state: Mutex::new(SessionState {
				pair,
				exchange: ExchangeState::Idle,
				relogin_prompted: false,
			}),
		}
	}

	/// Current expiries.
	pub fn pair(&self) -> SessionTokenPair {
		self.lock().pair
	}

	/// Current exchange state.
	pub fn exchange_state(&self) -> ExchangeState {
		self.lock().exchange
	}

	/// Tick on the configured interval until cancelled.
	pub async fn run(self: Arc<Self>, cancel: CancellationToken)
	where
		E: 'static,
		St: 'static,
		N: 'static,
		C: 'static,
	{
		let mut interval = tokio::time::interval(self.config.tick_interval);

		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = interval.tick() => {
					let outcome = self.tick().await;

					tracing::trace!(?outcome, "session tick");
				},
			}
		}

		tracing::debug!("session refresher stopped");
	}

	/// Run one timer tick.
	pub async fn tick(&self) -> TickOutcome {
		let now = self.clock.now();
		let threshold = TimeDelta::from_std(self.config.threshold).unwrap_or(TimeDelta::MAX);

		{
			let mut state = self.lock();

			if state.pair.refresh_token_expires_at <= now {
				drop(state);
				tracing::info!("session refresh token expired; reloading");
				self.notifier.reload();

				return TickOutcome::Reloaded;
			}
			if state.pair.access_token_expires_at - now > threshold {
				return TickOutcome::Idle;
			}

			match state.exchange {
				ExchangeState::Exchanging => return TickOutcome::InFlight,
				ExchangeState::Exhausted => return TickOutcome::Exhausted,
				ExchangeState::Idle => state.exchange = ExchangeState::Exchanging,
			}
		}

		let response = match self.endpoint.exchange().await {
			Ok(response) => response,
			Err(err) => {
				tracing::warn!(error = %err, "session token exchange failed");
				metrics::record_session_exchange("error");
				self.lock().exchange = ExchangeState::Idle;

				return TickOutcome::ExchangeFailed;
			},
		};

		if !response.has_expiry() {
			tracing::info!("session token exchange returned no expiry; signing out");
			metrics::record_session_exchange("signed_out");

			if let Err(err) = self.storage.clear().await {
				tracing::warn!(error = %err, "failed to clear session storage");
			}

			self.lock().exchange = ExchangeState::Idle;
			self.notifier.logout(&self.config.logout_path());

			return TickOutcome::SignedOut;
		}

		let Some(access_token_exp) = response.access_token_exp else {
			tracing::warn!("session token exchange returned no access expiry");
			metrics::record_session_exchange("error");
			self.lock().exchange = ExchangeState::Idle;

			return TickOutcome::ExchangeFailed;
		};
		// Without a new refresh expiry the current one still holds.
		let refresh_token_exp = response
			.refresh_token_exp
			.unwrap_or_else(|| self.lock().pair.refresh_token_expires_at.timestamp());
		let Some(next) = SessionTokenPair::from_timestamps(access_token_exp, refresh_token_exp) else {
			tracing::warn!(access_token_exp, refresh_token_exp, "session expiry out of range");
			metrics::record_session_exchange("error");
			self.lock().exchange = ExchangeState::Idle;

			return TickOutcome::ExchangeFailed;
		};

		if let Some(access_token) = response.access_token.as_deref()
			&& let Err(err) = self.storage.store_access_token(access_token).await
		{
			tracing::warn!(error = %err, "failed to persist session access token");
		}

		let now = self.clock.now();
		let (prompted, exhausted) = {
			let mut state = self.lock();
			let current = state.pair;
			let prompt = !state.relogin_prompted
				&& next.refresh_token_expires_at <= current.refresh_token_expires_at
				&& current.refresh_token_expires_at - now <= threshold;
			let exhausted = next.access_token_expires_at <= current.access_token_expires_at;

			if prompt {
				state.relogin_prompted = true;
			}

			state.pair = next;
			state.exchange = if exhausted { ExchangeState::Exhausted } else { ExchangeState::Idle };

			(prompt, exhausted)
		};

		if prompted {
			tracing::info!("session nearing its end; prompting re-login");
			self.notifier.prompt_relogin(response.redirect_url.as_deref());
		}
		if exhausted {
			tracing::info!("access token can no longer be extended");
		}

		metrics::record_session_exchange(if exhausted { "exhausted" } else { "exchanged" });

		TickOutcome::Exchanged { prompted, exhausted }
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}
impl<E, St, N, C> std::fmt::Debug for SessionRefresher<E, St, N, C> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionRefresher").field("config", &self.config).finish_non_exhaustive()
	}
}
