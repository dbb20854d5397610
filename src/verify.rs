//! Bearer-token verification against the identity provider's rotating signing keys.
//!
//! The key set is held as an immutable [`SigningKeySet`] snapshot behind an `RwLock<Arc<_>>`.
//! A token naming an unknown `kid` triggers exactly one refetch; concurrent callers that
//! observed the same snapshot share that refetch instead of issuing their own. Refetches are
//! spaced by a cooldown so unknown key ids cannot force a fetch per request.

// std
use std::{
	collections::HashMap,
	fmt::{Debug, Formatter, Result as FmtResult},
};
// crates.io
use jsonwebtoken::{
	Algorithm, DecodingKey, Validation,
	errors::ErrorKind,
	jwk::{JwkSet, PublicKeyUse},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
// self
use crate::{_prelude::*, config::IdentityConfig, identity::IdentityProvider, metrics};

/// Client that carries the realm-administration roles.
pub const REALM_MANAGEMENT_CLIENT: &str = "realm-management";
/// Role granting full administrative access.
pub const REALM_ADMIN_ROLE: &str = "realm-admin";

/// Claims extracted from a verified bearer token.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Claims {
	/// Subject (user id).
	#[serde(default)]
	pub sub: String,
	/// Expiry, seconds since the epoch.
	pub exp: i64,
	/// Not-before, seconds since the epoch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nbf: Option<i64>,
	/// Issued-at, seconds since the epoch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iat: Option<i64>,
	/// Token type as labelled by the identity provider (`Bearer`, `Offline`, ...).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub typ: Option<String>,
	/// Human-readable login name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub preferred_username: Option<String>,
	/// Client roles keyed by client id.
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub resource_access: HashMap<String, ClientRoles>,
	/// Every other claim, untouched.
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}
impl Claims {
	/// Whether the token is an offline token that must be exchanged before use.
	pub fn is_offline(&self) -> bool {
		self.typ.as_deref().is_some_and(|typ| typ.eq_ignore_ascii_case("offline"))
	}

	/// Whether the subject holds the realm administration role.
	pub fn is_realm_admin(&self) -> bool {
		self.resource_access
			.get(REALM_MANAGEMENT_CLIENT)
			.is_some_and(|access| access.roles.iter().any(|role| role == REALM_ADMIN_ROLE))
	}
}

/// Roles granted to the subject on one client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRoles {
	/// Role names.
	#[serde(default)]
	pub roles: Vec<String>,
}

/// Immutable snapshot of the provider's signing keys.
#[derive(Clone)]
pub struct SigningKeySet {
	/// Decoding keys indexed by `kid`.
	pub keys: HashMap<String, DecodingKey>,
	/// Wall-clock time of the fetch that produced this set.
	pub fetched_at: DateTime<Utc>,
	/// Monotonically increasing fetch counter; `0` means never fetched.
	pub generation: u64,
}
impl SigningKeySet {
	fn empty() -> Self {
		Self { keys: HashMap::new(), fetched_at: DateTime::<Utc>::UNIX_EPOCH, generation: 0 }
	}

	fn from_jwks(jwks: &JwkSet, generation: u64) -> Self {
		let mut keys = HashMap::with_capacity(jwks.keys.len());

		for jwk in &jwks.keys {
			let Some(kid) = jwk.common.key_id.as_deref() else {
				tracing::debug!("skipping signing key without kid");

				continue;
			};

			if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
				continue;
			}

			match DecodingKey::from_jwk(jwk) {
				Ok(key) => {
					keys.insert(kid.to_owned(), key);
				},
				Err(err) => tracing::warn!(kid, error = %err, "unusable signing key skipped"),
			}
		}

		Self { keys, fetched_at: Utc::now(), generation }
	}

	/// Whether a key with the given id is present.
	pub fn contains(&self, kid: &str) -> bool {
		self.keys.contains_key(kid)
	}
}
impl Debug for SigningKeySet {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		let mut kids = self.keys.keys().collect::<Vec<_>>();

		kids.sort_unstable();

		f.debug_struct("SigningKeySet")
			.field("kids", &kids)
			.field("fetched_at", &self.fetched_at)
			.field("generation", &self.generation)
			.finish()
	}
}

/// Verifies bearer tokens, tolerating signing-key rotation.
pub struct SigningKeyVerifier {
	provider: Arc<dyn IdentityProvider>,
	keys: RwLock<Arc<SigningKeySet>>,
	/// When the last unknown-kid refetch was attempted.
	refetch: Mutex<Option<Instant>>,
	refetch_cooldown: Duration,
	clock_tolerance: Duration,
	allowed_algorithms: Vec<Algorithm>,
	audience: Option<String>,
	issuer: Option<String>,
}
impl SigningKeyVerifier {
	/// Create a verifier with an empty key set; call [`Self::init_key_set`] before serving.
	pub fn new(provider: Arc<dyn IdentityProvider>, config: &IdentityConfig) -> Self {
		Self {
			provider,
			keys: RwLock::new(Arc::new(SigningKeySet::empty())),
			refetch: Mutex::new(None),
			refetch_cooldown: config.key_refetch_cooldown,
			clock_tolerance: config.clock_tolerance,
			allowed_algorithms: config.allowed_algorithms.clone(),
			audience: config.audience.clone(),
			issuer: config.issuer.clone(),
		}
	}

	/// Fetch the full key set; failing here must prevent the process from serving.
	#[tracing::instrument(skip(self))]
	pub async fn init_key_set(&self) -> Result<Arc<SigningKeySet>> {
		let _guard = self.refetch.lock().await;
		let generation = self.snapshot().await.generation;

		self.fetch(generation).await
	}

	/// Current key-set snapshot.
	pub async fn snapshot(&self) -> Arc<SigningKeySet> {
		self.keys.read().await.clone()
	}

	/// Verify `token` and return its claims.
	pub async fn verify(&self, token: &str) -> Result<Claims> {
		let result = self.verify_inner(token).await;

		metrics::record_verification(match &result {
			Ok(_) => "valid",
			Err(Error::Expired) => "expired",
			Err(Error::UnknownKey { .. }) => "unknown_key",
			Err(Error::MalformedToken(_)) => "malformed",
			Err(_) => "invalid",
		});

		result
	}

	async fn verify_inner(&self, token: &str) -> Result<Claims> {
		let header = jsonwebtoken::decode_header(token)
			.map_err(|err| Error::MalformedToken(err.to_string()))?;

		if !self.allowed_algorithms.contains(&header.alg) {
			return Err(Error::InvalidSignature(format!(
				"Algorithm {:?} is not accepted.",
				header.alg
			)));
		}

		let kid = header.kid.ok_or_else(|| Error::MalformedToken("Token has no kid.".into()))?;
		let set = self.snapshot().await;

		if let Some(key) = set.keys.get(&kid) {
			return self.decode(token, key, header.alg);
		}

		tracing::debug!(%kid, generation = set.generation, "unknown kid; refetching signing keys");

		let set = self.refetch_after(set.generation).await?;
		let key = set.keys.get(&kid).ok_or(Error::UnknownKey { kid })?;

		self.decode(token, key, header.alg)
	}

	/// Refetch unless another caller already did so after `seen` was observed, or the last
	/// refetch is within the cooldown.
	async fn refetch_after(&self, seen: u64) -> Result<Arc<SigningKeySet>> {
		let mut last = self.refetch.lock().await;
		let current = self.snapshot().await;

		if current.generation > seen {
			metrics::record_key_refetch("coalesced");

			return Ok(current);
		}
		if let Some(at) = *last
			&& at.elapsed() < self.refetch_cooldown
		{
			metrics::record_key_refetch("throttled");

			tracing::debug!(since = ?at.elapsed(), "signing key refetch within cooldown; skipped");

			return Ok(current);
		}

		*last = Some(Instant::now());

		self.fetch(current.generation).await
	}

	async fn fetch(&self, generation: u64) -> Result<Arc<SigningKeySet>> {
		let jwks = match self.provider.fetch_signing_keys().await {
			Ok(jwks) => jwks,
			Err(err) => {
				metrics::record_key_refetch("error");

				tracing::warn!(error = %err, "signing key fetch failed");

				return Err(err);
			},
		};
		let set = Arc::new(SigningKeySet::from_jwks(&jwks, generation + 1));

		*self.keys.write().await = set.clone();
		metrics::record_key_refetch("fetched");

		tracing::info!(keys = set.keys.len(), generation = set.generation, "signing key set replaced");

		Ok(set)
	}

	fn decode(&self, token: &str, key: &DecodingKey, alg: Algorithm) -> Result<Claims> {
		let mut validation = Validation::new(alg);

		validation.leeway = self.clock_tolerance.as_secs();
		validation.validate_nbf = true;

		match &self.audience {
			Some(audience) => validation.set_audience(&[audience]),
			None => validation.validate_aud = false,
		}
		if let Some(issuer) = &self.issuer {
			validation.set_issuer(&[issuer]);
		}

		jsonwebtoken::decode::<Claims>(token, key, &validation)
			.map(|data| data.claims)
			.map_err(map_jwt_error)
	}
}
impl Debug for SigningKeyVerifier {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("SigningKeyVerifier")
			.field("clock_tolerance", &self.clock_tolerance)
			.field("allowed_algorithms", &self.allowed_algorithms)
			.finish_non_exhaustive()
	}
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> Error {
	match err.kind() {
		ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => Error::Expired,
		ErrorKind::InvalidToken
		| ErrorKind::Base64(_)
		| ErrorKind::Json(_)
		| ErrorKind::Utf8(_)
		| ErrorKind::MissingRequiredClaim(_) => Error::MalformedToken(err.to_string()),
		ErrorKind::InvalidAudience | ErrorKind::InvalidIssuer =>
			Error::AuthRejected(err.to_string()),
		_ => Error::InvalidSignature(err.to_string()),
	}
}
