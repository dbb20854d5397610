//! Server half of the session token-pair endpoint.

// crates.io
use url::Url;
// self
use crate::{
	_prelude::*,
	clock::{Clock, SystemClock},
	identity::IdentityProvider,
	session::TokenPairResponse,
};

/// Result of one issue call.
#[derive(Debug)]
pub struct IssuedPair {
	/// Body returned to the session.
	pub response: TokenPairResponse,
	/// Rotated refresh token to store server-side, when the provider issued one.
	pub refresh_token: Option<String>,
}

/// Refreshes a session's token pair against the identity provider.
pub struct TokenPairIssuer<C = SystemClock> {
	provider: Arc<dyn IdentityProvider>,
	login_url: Url,
	clock: C,
}
impl TokenPairIssuer<SystemClock> {
	/// Issuer using the system clock.
	pub fn new(provider: Arc<dyn IdentityProvider>, login_url: Url) -> Self {
		Self::with_clock(provider, login_url, SystemClock)
	}
}
impl<C> TokenPairIssuer<C>
where
	C: Clock,
{
	/// Issuer using the supplied clock.
	pub fn with_clock(provider: Arc<dyn IdentityProvider>, login_url: Url, clock: C) -> Self {
		Self { provider, login_url, clock }
	}

	/// Refresh the pair.
	///
	/// A rejected refresh token yields a response without expiries (the sign-out signal).
	/// Any other failure is returned so the session keeps its pair and asks again later.
	#[tracing::instrument(skip_all)]
	pub async fn issue(&self, refresh_token: &str) -> Result<IssuedPair> {
		let redirect_url = Some(self.login_url.to_string());
		let now = self.clock.now();

		match self.provider.refresh_token_pair(refresh_token).await {
			Ok(grant) => {
				let access_token_exp = expiry(now, grant.expires_in);
				let refresh_token_exp = grant.refresh_expires_in.and_then(|lifetime| expiry(now, lifetime));

				tracing::debug!(access_token_exp, refresh_token_exp, "session token pair refreshed");

				Ok(IssuedPair {
					response: TokenPairResponse {
						access_token: Some(grant.access_token),
						access_token_exp,
						refresh_token_exp,
						redirect_url,
					},
					refresh_token: grant.refresh_token,
				})
			},
			Err(err) if err.is_auth_failure() => {
				tracing::warn!(error = %err, "session token pair refresh rejected; signing out");

				Ok(IssuedPair {
					response: TokenPairResponse::signed_out(redirect_url),
					refresh_token: None,
				})
			},
			Err(err) => {
				tracing::warn!(error = %err, "session token pair refresh failed");

				Err(err)
			},
		}
	}
}
impl<C> std::fmt::Debug for TokenPairIssuer<C> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenPairIssuer").field("login_url", &self.login_url.as_str()).finish_non_exhaustive()
	}
}

fn expiry(now: DateTime<Utc>, lifetime: Duration) -> Option<i64> {
	let lifetime = TimeDelta::from_std(lifetime).ok()?;

	now.checked_add_signed(lifetime).map(|at| at.timestamp())
}
