//! Security utilities covering token fingerprints, HTTPS enforcement, and secret comparison.
//!
//! Raw bearer and offline tokens never become map keys or log fields; they are reduced to a
//! SHA-256 [`TokenFingerprint`] first.

// std
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
// crates.io
use base64::prelude::*;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use url::Url;
// self
use crate::_prelude::*;

/// SHA-256 fingerprint of a token, safe to use as a cache key and in logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenFingerprint {
	bytes: Arc<[u8; 32]>,
}
impl TokenFingerprint {
	/// Fingerprint the given raw token.
	pub fn of(token: &str) -> Self {
		Self { bytes: Arc::new(digest(token.as_bytes())) }
	}

	/// Raw fingerprint bytes.
	pub fn as_bytes(&self) -> &[u8; 32] {
		self.bytes.as_ref()
	}

	/// Shortened base64url form used in log fields.
	pub fn short(&self) -> String {
		let mut encoded = BASE64_URL_SAFE_NO_PAD.encode(self.bytes.as_ref());

		encoded.truncate(12);

		encoded
	}
}
impl Debug for TokenFingerprint {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		write!(f, "TokenFingerprint({})", self.short())
	}
}
impl Display for TokenFingerprint {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.write_str(&BASE64_URL_SAFE_NO_PAD.encode(self.bytes.as_ref()))
	}
}

/// Ensure the provided URL uses HTTPS.
pub fn enforce_https(url: &Url) -> Result<()> {
	if url.scheme() == "https" {
		Ok(())
	} else {
		Err(Error::Security(format!("Upstream URL {url} must use HTTPS.")))
	}
}

/// Compare a presented secret against the expected one without early exit.
pub fn secrets_match(presented: &str, expected: &str) -> bool {
	// Digests first so differing lengths do not short-circuit.
	let presented = digest(presented.as_bytes());
	let expected = digest(expected.as_bytes());

	presented.ct_eq(&expected).into()
}

fn digest(input: &[u8]) -> [u8; 32] {
	let digest = Sha256::digest(input);
	let mut bytes = [0u8; 32];

	bytes.copy_from_slice(&digest);

	bytes
}
