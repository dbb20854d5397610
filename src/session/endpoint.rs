//! HTTP [`TokenPairEndpoint`] calling the application's session endpoint.

// crates.io
use async_trait::async_trait;
use reqwest::{Client, header::COOKIE};
use url::Url;
// self
use crate::{
	_prelude::*,
	config::RetryPolicy,
	http::client::{self, send_with_retry},
	session::{TokenPairEndpoint, TokenPairResponse},
};

/// Path, relative to the application prefix, of the token-pair endpoint.
pub const REFRESH_TOKEN_SET_PATH: &str = "oidc/refresh-token-set";

/// Posts to the session endpoint with the session cookie attached.
#[derive(Clone)]
pub struct HttpTokenPairEndpoint {
	client: Client,
	url: Url,
	session_cookie: Option<String>,
	retry_policy: RetryPolicy,
}
impl HttpTokenPairEndpoint {
	/// Endpoint at `{app_base}oidc/refresh-token-set`.
	pub fn new(client: Client, app_base: &Url, retry_policy: RetryPolicy) -> Result<Self> {
		let url = app_base.join(REFRESH_TOKEN_SET_PATH)?;

		Ok(Self { client, url, session_cookie: None, retry_policy })
	}

	/// Attach the cookie identifying the session.
	pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
		self.session_cookie = Some(cookie.into());

		self
	}

	/// Endpoint URL.
	pub fn url(&self) -> &Url {
		&self.url
	}
}
#[async_trait]
impl TokenPairEndpoint for HttpTokenPairEndpoint {
	#[tracing::instrument(skip(self), fields(url = %self.url))]
	async fn exchange(&self) -> Result<TokenPairResponse> {
		let response = send_with_retry(&self.retry_policy, "exchange_token_pair", |_| {
			let builder = self.client.post(self.url.clone());

			match &self.session_cookie {
				Some(cookie) => builder.header(COOKIE, cookie),
				None => builder,
			}
		})
		.await?;

		client::read_json(response).await
	}
}
impl std::fmt::Debug for HttpTokenPairEndpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HttpTokenPairEndpoint")
			.field("url", &self.url.as_str())
			.field("session_cookie", &self.session_cookie.as_ref().map(|_| "<redacted>"))
			.finish_non_exhaustive()
	}
}
