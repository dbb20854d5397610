//! Request authentication: shared-secret clients, bearer tokens, and offline API tokens.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// self
use crate::{
	_prelude::*,
	security::{self, TokenFingerprint},
	token::{exchange::OfflineTokenExchangeCache, service::ServiceTokenHandle},
	verify::{Claims, SigningKeyVerifier},
};

/// Identity recorded for in-cluster clients presenting the shared secret.
pub const SHARED_SECRET_CLIENT: &str = "jupyterHub";

/// Authorization level of a caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
	/// Realm administrator.
	Admin,
	/// Ordinary user.
	User,
	/// Trusted in-cluster client; read-only.
	Client,
}

/// Authenticated caller.
#[derive(Clone)]
pub struct Principal {
	/// Subject id.
	pub user_id: String,
	/// Login name.
	pub username: String,
	/// Authorization level.
	pub role: Role,
	/// Bearer to use for directory calls made on the caller's behalf.
	pub access_token: String,
}
impl Principal {
	/// Whether the caller may only read.
	pub fn is_read_only(&self) -> bool {
		self.role == Role::Client
	}
}
impl Debug for Principal {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("Principal")
			.field("user_id", &self.user_id)
			.field("username", &self.username)
			.field("role", &self.role)
			.finish_non_exhaustive()
	}
}

/// Turns an `Authorization` header into a [`Principal`].
pub struct Authenticator {
	verifier: Arc<SigningKeyVerifier>,
	exchange: Arc<OfflineTokenExchangeCache>,
	service_token: ServiceTokenHandle,
	shared_secret: Option<String>,
}
impl Authenticator {
	/// Create an authenticator; an empty `shared_secret` disables the client path.
	pub fn new(
		verifier: Arc<SigningKeyVerifier>,
		exchange: Arc<OfflineTokenExchangeCache>,
		service_token: ServiceTokenHandle,
		shared_secret: Option<String>,
	) -> Self {
		let shared_secret = shared_secret.filter(|secret| !secret.is_empty());

		Self { verifier, exchange, service_token, shared_secret }
	}

	/// Authenticate a raw `Authorization` header value.
	#[tracing::instrument(skip_all)]
	pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Principal> {
		let bearer = authorization
			.and_then(|value| value.strip_prefix("Bearer "))
			.map(str::trim)
			.filter(|token| !token.is_empty())
			.ok_or_else(|| Error::AuthRejected("Missing bearer credentials.".into()))?;

		if let Some(secret) = &self.shared_secret
			&& security::secrets_match(bearer, secret)
		{
			tracing::debug!("shared-secret client authenticated");

			return Ok(Principal {
				user_id: SHARED_SECRET_CLIENT.into(),
				username: SHARED_SECRET_CLIENT.into(),
				role: Role::Client,
				access_token: self.service_token.access_token(),
			});
		}

		let (token, claims) = self.resolve(bearer).await?;
		let username = claims.preferred_username.clone().unwrap_or_else(|| claims.sub.clone());

		if claims.is_realm_admin() {
			return Ok(Principal { user_id: claims.sub, username, role: Role::Admin, access_token: token });
		}

		Ok(Principal {
			user_id: claims.sub,
			username,
			role: Role::User,
			access_token: self.service_token.access_token(),
		})
	}

	/// Verify the bearer directly, exchanging it first when it is an offline token.
	async fn resolve(&self, bearer: &str) -> Result<(String, Claims)> {
		match self.verifier.verify(bearer).await {
			Ok(claims) if !claims.is_offline() => return Ok((bearer.to_owned(), claims)),
			Ok(_) => tracing::debug!("offline token presented; exchanging"),
			Err(err) => tracing::debug!(error = %err, "bearer not directly verifiable; exchanging"),
		}

		let exchanged = self.exchange.exchange(bearer).await.map_err(|err| {
			tracing::info!(
				fingerprint = %TokenFingerprint::of(bearer).short(),
				error = %err,
				"offline token exchange failed"
			);

			if err.is_auth_failure() || err.is_transient() {
				err
			} else {
				Error::AuthRejected(err.to_string())
			}
		})?;

		match self.verifier.verify(&exchanged).await {
			Ok(claims) => Ok((exchanged.to_string(), claims)),
			Err(err) => {
				self.exchange.invalidate(bearer).await;

				Err(Error::AuthRejected(format!("Exchanged token failed verification: {err}")))
			},
		}
	}
}
impl Debug for Authenticator {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("Authenticator")
			.field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
			.finish_non_exhaustive()
	}
}
