//! End-user session token-pair refresh: the client-side refresher, its seams, and the server
//! half that issues token pairs.

pub mod endpoint;
pub mod issuer;
pub mod refresher;
pub mod storage;

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Storage key under which the session access token is persisted.
pub const ACCESS_TOKEN_STORAGE_KEY: &str = "canner.accessToken";

/// Body of the session token-pair endpoint.
///
/// A response carrying neither expiry is the server's sign-out signal.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPairResponse {
	/// Fresh access token.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub access_token: Option<String>,
	/// Access-token expiry, seconds since the epoch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub access_token_exp: Option<i64>,
	/// Refresh-token expiry, seconds since the epoch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub refresh_token_exp: Option<i64>,
	/// Where to send the user to log in again.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub redirect_url: Option<String>,
}
impl TokenPairResponse {
	/// Response telling the client to sign out.
	pub fn signed_out(redirect_url: Option<String>) -> Self {
		Self { redirect_url, ..Default::default() }
	}

	/// Whether any expiry is present.
	pub fn has_expiry(&self) -> bool {
		self.access_token_exp.is_some() || self.refresh_token_exp.is_some()
	}
}
impl Debug for TokenPairResponse {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("TokenPairResponse")
			.field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
			.field("access_token_exp", &self.access_token_exp)
			.field("refresh_token_exp", &self.refresh_token_exp)
			.field("redirect_url", &self.redirect_url)
			.finish()
	}
}

/// Expiries of the session's current token pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionTokenPair {
	/// Access-token expiry.
	pub access_token_expires_at: DateTime<Utc>,
	/// Refresh-token expiry.
	pub refresh_token_expires_at: DateTime<Utc>,
}
impl SessionTokenPair {
	/// Pair from epoch-second expiries; `None` when either is out of range.
	pub fn from_timestamps(access_token_exp: i64, refresh_token_exp: i64) -> Option<Self> {
		Some(Self {
			access_token_expires_at: DateTime::from_timestamp(access_token_exp, 0)?,
			refresh_token_expires_at: DateTime::from_timestamp(refresh_token_exp, 0)?,
		})
	}
}

/// Asks the server for a new token pair.
#[async_trait]
pub trait TokenPairEndpoint: Send + Sync {
	/// Exchange the session's refresh token for a new pair.
	async fn exchange(&self) -> Result<TokenPairResponse>;
}

/// Persists the session's access token.
#[async_trait]
pub trait SessionStorage: Send + Sync {
	/// Store the current access token.
	async fn store_access_token(&self, access_token: &str) -> Result<()>;

	/// Load the stored access token, if any.
	async fn load_access_token(&self) -> Result<Option<String>>;

	/// Remove the stored token.
	async fn clear(&self) -> Result<()>;
}

/// User-facing side effects of the refresher.
pub trait SessionNotifier: Send + Sync {
	/// Reload the application to re-establish the session.
	fn reload(&self);

	/// Leave the application through the given logout location.
	fn logout(&self, location: &str);

	/// Offer the user a re-login before the session runs out.
	fn prompt_relogin(&self, login_url: Option<&str>);
}
