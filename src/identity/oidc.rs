//! OpenID Connect token and key endpoints of a Keycloak-style realm.

// crates.io
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;
// self
use crate::{
	_prelude::*,
	config::{IdentityConfig, RetryPolicy},
	http::client::{self, send_with_retry},
	identity::{IdentityProvider, TokenGrant, endpoint},
};

/// Client for `/realms/{realm}/protocol/openid-connect/{token,certs}`.
#[derive(Clone, Debug)]
pub struct OidcClient {
	client: Client,
	token_url: Url,
	certs_url: Url,
	client_id: String,
	client_secret: String,
	retry_policy: RetryPolicy,
}
impl OidcClient {
	/// Build a client for the configured realm.
	pub fn new(client: Client, config: &IdentityConfig, retry_policy: RetryPolicy) -> Result<Self> {
		let base = ["realms", config.realm.as_str(), "protocol", "openid-connect"];
		let token_url = endpoint(&config.oidc_base_url, base.into_iter().chain(["token"]))?;
		let certs_url = endpoint(&config.oidc_base_url, base.into_iter().chain(["certs"]))?;

		Ok(Self {
			client,
			token_url,
			certs_url,
			client_id: config.client_id.clone(),
			client_secret: config.client_secret.clone(),
			retry_policy,
		})
	}

	/// Token endpoint URL.
	pub fn token_url(&self) -> &Url {
		&self.token_url
	}

	async fn token_request(
		&self,
		operation: &'static str,
		form: &[(&str, &str)],
	) -> Result<TokenGrant> {
		let response = send_with_retry(&self.retry_policy, operation, |_| {
			self.client.post(self.token_url.clone()).form(form)
		})
		.await?;
		let status = response.status();

		if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
			let body = response.text().await.unwrap_or_default();
			let reason = serde_json::from_str::<OidcErrorBody>(&body)
				.map(|err| err.describe())
				.unwrap_or_else(|_| format!("token endpoint answered {status}"));

			tracing::debug!(operation, %status, %reason, "token grant rejected");

			return Err(Error::AuthRejected(reason));
		}

		let body: TokenResponse = client::read_json(response).await?;

		Ok(body.into())
	}
}
#[async_trait]
impl IdentityProvider for OidcClient {
	#[tracing::instrument(skip(self, client_secret))]
	async fn grant_service_token(&self, client_id: &str, client_secret: &str) -> Result<TokenGrant> {
		self.token_request(
			"grant_service_token",
			&[
				("grant_type", "client_credentials"),
				("client_id", client_id),
				("client_secret", client_secret),
			],
		)
		.await
	}

	#[tracing::instrument(skip_all)]
	async fn exchange_offline_token(&self, offline_token: &str) -> Result<TokenGrant> {
		self.token_request(
			"exchange_offline_token",
			&[
				("grant_type", "refresh_token"),
				("refresh_token", offline_token),
				("client_id", &self.client_id),
				("client_secret", &self.client_secret),
			],
		)
		.await
	}

	#[tracing::instrument(skip_all)]
	async fn refresh_token_pair(&self, refresh_token: &str) -> Result<TokenGrant> {
		self.token_request(
			"refresh_token_pair",
			&[
				("grant_type", "refresh_token"),
				("refresh_token", refresh_token),
				("client_id", &self.client_id),
				("client_secret", &self.client_secret),
			],
		)
		.await
	}

	#[tracing::instrument(skip(self), fields(url = %self.certs_url))]
	async fn fetch_signing_keys(&self) -> Result<JwkSet> {
		let response = send_with_retry(&self.retry_policy, "fetch_signing_keys", |_| {
			self.client.get(self.certs_url.clone()).header(http::header::ACCEPT, "application/json")
		})
		.await?;
		let jwks: JwkSet = client::read_json(response).await?;

		tracing::debug!(keys = jwks.keys.len(), "signing keys fetched");

		Ok(jwks)
	}
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	expires_in: u64,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	refresh_expires_in: Option<u64>,
}
impl From<TokenResponse> for TokenGrant {
	fn from(value: TokenResponse) -> Self {
		Self {
			access_token: value.access_token,
			expires_in: Duration::from_secs(value.expires_in),
			refresh_token: value.refresh_token,
			// Offline tokens advertise a zero refresh lifetime.
			refresh_expires_in: value
				.refresh_expires_in
				.filter(|secs| *secs > 0)
				.map(Duration::from_secs),
		}
	}
}

#[derive(Debug, Deserialize)]
struct OidcErrorBody {
	error: String,
	#[serde(default)]
	error_description: Option<String>,
}
impl OidcErrorBody {
	fn describe(&self) -> String {
		match &self.error_description {
			Some(description) => format!("{}: {description}", self.error),
			None => self.error.clone(),
		}
	}
}
