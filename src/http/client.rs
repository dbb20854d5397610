//! Shared `reqwest` client construction and request execution.

// crates.io
use reqwest::{Client, RequestBuilder, Response, StatusCode, redirect::Policy};
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	config::RetryPolicy,
	http::retry::{AttemptBudget, RetryExecutor},
};

/// Build the HTTP client used by every adapter.
pub fn build_client() -> Result<Client> {
	let client = Client::builder()
		.redirect(Policy::limited(3))
		.user_agent(format!("authsync/{}", env!("CARGO_PKG_VERSION")))
		.connect_timeout(Duration::from_secs(5))
		.build()?;

	Ok(client)
}

/// Send a request built by `build`, retrying transport failures and retryable statuses.
///
/// `build` receives the per-attempt timeout and must produce a fresh request each time.
/// Non-retryable responses (including 4xx) are returned to the caller untouched.
pub async fn send_with_retry<F>(
	policy: &RetryPolicy,
	operation: &'static str,
	mut build: F,
) -> Result<Response>
where
	F: FnMut(Duration) -> RequestBuilder,
{
	let mut executor = RetryExecutor::new(policy);
	let mut last_error = None;

	while let AttemptBudget::Granted { timeout } = executor.attempt_budget() {
		let started = Instant::now();

		match build(timeout).timeout(timeout).send().await {
			Ok(response) if is_retryable(response.status()) => {
				tracing::debug!(operation, status = %response.status(), "retryable upstream status");

				last_error = Some(status_error(response).await);
			},
			Ok(response) => {
				tracing::trace!(operation, status = %response.status(), elapsed = ?started.elapsed(), "upstream call complete");

				return Ok(response);
			},
			Err(err) => {
				tracing::debug!(operation, error = %err, "upstream call failed");

				last_error = Some(err.into());
			},
		}

		if !executor.backoff().await {
			break;
		}
	}

	Err(last_error
		.unwrap_or_else(|| Error::UpstreamUnavailable(format!("{operation}: retry budget spent."))))
}

/// Turn a non-success response into [`Error::HttpStatus`].
pub async fn error_for_status(response: Response) -> Result<Response> {
	if response.status().is_success() { Ok(response) } else { Err(status_error(response).await) }
}

/// Decode a successful JSON response body.
pub async fn read_json<T>(response: Response) -> Result<T>
where
	T: DeserializeOwned,
{
	let response = error_for_status(response).await?;
	let bytes = response.bytes().await?;

	Ok(serde_json::from_slice(&bytes)?)
}

/// Capture status, URL, and body of a failed response.
pub async fn status_error(response: Response) -> Error {
	let status = response.status();
	let url = response.url().clone();
	let body = response.text().await.ok().filter(|body| !body.is_empty());

	Error::HttpStatus { status, url, body }
}

fn is_retryable(status: StatusCode) -> bool {
	status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
