//! Identity-provider seams: token grants, signing keys, and the role directory.

pub mod admin;
pub mod oidc;

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use url::Url;
// self
use crate::_prelude::*;

/// Tokens returned by a successful grant, with relative lifetimes.
#[derive(Clone)]
pub struct TokenGrant {
	/// Short-lived access token.
	pub access_token: String,
	/// Access-token lifetime from the moment of issue.
	pub expires_in: Duration,
	/// Refresh token, when the grant issued one.
	pub refresh_token: Option<String>,
	/// Refresh-token lifetime, when advertised.
	pub refresh_expires_in: Option<Duration>,
}
impl TokenGrant {
	/// Grant carrying only an access token.
	pub fn access_only(access_token: impl Into<String>, expires_in: Duration) -> Self {
		Self {
			access_token: access_token.into(),
			expires_in,
			refresh_token: None,
			refresh_expires_in: None,
		}
	}
}
impl Debug for TokenGrant {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("TokenGrant")
			.field("expires_in", &self.expires_in)
			.field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
			.field("refresh_expires_in", &self.refresh_expires_in)
			.finish_non_exhaustive()
	}
}

/// Outcome of an idempotent role creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleOutcome {
	/// The role did not exist and was created by this call.
	Created,
	/// The role already existed; treated as success.
	AlreadyExists,
}

/// Token and key operations of the identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	/// Client-credentials grant for the backend's own identity.
	async fn grant_service_token(&self, client_id: &str, client_secret: &str) -> Result<TokenGrant>;

	/// Exchange a long-lived offline token for a short-lived access token.
	///
	/// A rejected token must surface as [`Error::AuthRejected`].
	async fn exchange_offline_token(&self, offline_token: &str) -> Result<TokenGrant>;

	/// Refresh an end-user session's token pair.
	async fn refresh_token_pair(&self, refresh_token: &str) -> Result<TokenGrant>;

	/// Fetch the full public signing key set.
	async fn fetch_signing_keys(&self) -> Result<JwkSet>;
}

/// Role and grant operations of the authorization directory.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
	/// Create a role, reporting an existing one as [`RoleOutcome::AlreadyExists`].
	async fn create_role(&self, name: &str) -> Result<RoleOutcome>;

	/// Delete a role; deleting an absent role succeeds.
	async fn delete_role(&self, name: &str) -> Result<()>;

	/// Grant a role to a group; repeating the grant is harmless.
	async fn add_role_to_group(&self, role: &str, group_id: &str) -> Result<()>;

	/// Revoke a role from a group; revoking an absent grant succeeds.
	async fn remove_role_from_group(&self, role: &str, group_id: &str) -> Result<()>;

	/// Groups currently holding the role.
	async fn groups_with_role(&self, role: &str) -> Result<Vec<String>>;

	/// Names of every role starting with `prefix`.
	async fn list_roles(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Append path segments to a base URL, percent-encoding each segment.
pub(crate) fn endpoint<'a, I>(base: &Url, segments: I) -> Result<Url>
where
	I: IntoIterator<Item = &'a str>,
{
	let mut url = base.clone();

	url.path_segments_mut()
		.map_err(|_| Error::Validation {
			field: "base_url",
			reason: format!("URL {base} cannot be used as a base."),
		})?
		.pop_if_empty()
		.extend(segments);

	Ok(url)
}
