//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the synchronization crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Jsonwebtoken(#[from] jsonwebtoken::errors::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Refresh token has expired; the session must be re-established.")]
	AuthExpired,
	#[error("Identity provider refused to extend the session.")]
	AuthUnextendable,
	#[error("Authentication rejected: {0}")]
	AuthRejected(String),
	#[error("Token signature is invalid: {0}")]
	InvalidSignature(String),
	#[error("Token is outside its validity window.")]
	Expired,
	#[error("No signing key is known for key id '{kid}'.")]
	UnknownKey { kid: String },
	#[error("Malformed token: {0}")]
	MalformedToken(String),
	#[error("Watch marker is too old to resume from.")]
	Gone,
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: http::StatusCode, url: url::Url, body: Option<String> },
	#[error("Upstream unavailable: {0}")]
	UpstreamUnavailable(String),
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Security violation: {0}")]
	Security(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Whether a background loop should absorb the error and retry later.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Io(_) | Self::Reqwest(_) | Self::UpstreamUnavailable(_) | Self::Gone => true,
			Self::HttpStatus { status, .. } =>
				status.is_server_error() || *status == http::StatusCode::TOO_MANY_REQUESTS,
			_ => false,
		}
	}

	/// Whether the error is an authentication outcome that must reach the caller.
	pub fn is_auth_failure(&self) -> bool {
		matches!(
			self,
			Self::AuthExpired
				| Self::AuthUnextendable
				| Self::AuthRejected(_)
				| Self::InvalidSignature(_)
				| Self::Expired
				| Self::UnknownKey { .. }
				| Self::MalformedToken(_)
		)
	}
}
#[cfg(feature = "prometheus")]
impl<T> From<metrics::SetRecorderError<T>> for Error
where
	T: std::fmt::Display,
{
	fn from(value: metrics::SetRecorderError<T>) -> Self {
		Self::Metrics(value.to_string())
	}
}
