//! Configuration types and validation.
//!
//! Values are plain `serde` structures with defaults; loading them from the environment or a
//! file is left to the embedding binary.

// std
use std::{cell::RefCell, path::PathBuf};
// crates.io
use jsonwebtoken::Algorithm;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{_prelude::*, security};

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Default lead time before service-token expiry at which a re-grant is attempted.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);
/// Lower bound on the interval between two scheduled service-token re-grants.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
/// Default clock tolerance applied to `exp`/`nbf` checks.
pub const DEFAULT_CLOCK_TOLERANCE: Duration = Duration::from_secs(5 * 60);
/// Default minimum spacing between signing-key refetches caused by unknown key ids.
pub const DEFAULT_KEY_REFETCH_COOLDOWN: Duration = Duration::from_secs(10);
/// Default margin subtracted from exchanged access-token lifetimes.
pub const DEFAULT_EXCHANGE_SKEW: Duration = Duration::from_secs(10);
/// Default session refresher tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Default remaining-lifetime threshold below which the session exchanges tokens.
pub const DEFAULT_SESSION_THRESHOLD: Duration = Duration::from_secs(60);
/// Default custom-resource API group.
pub const DEFAULT_RESOURCE_GROUP: &str = "primehub.io";
/// Default custom-resource API version.
pub const DEFAULT_RESOURCE_VERSION: &str = "v1alpha1";

/// Supported jitter strategies for backoff schedules.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
	/// No jitter; deterministic backoff schedule.
	None,
	/// Full jitter; randomize delay between 80% and 100% of the current backoff.
	#[default]
	Full,
	/// Decorrelated jitter per AWS architecture guidance.
	Decorrelated,
}

/// Exponential backoff with a cap, used by the long-lived background loops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
	/// Delay after the first failure.
	pub initial: Duration,
	/// Upper bound applied to exponential growth.
	pub max: Duration,
	/// Strategy used to randomize the computed delay.
	#[serde(default)]
	pub jitter: JitterStrategy,
}
impl Backoff {
	/// Construct a backoff schedule.
	pub fn new(initial: Duration, max: Duration, jitter: JitterStrategy) -> Self {
		Self { initial, max, jitter }
	}

	/// Delay to wait after `attempt` consecutive failures (zero-based).
	pub fn delay(&self, attempt: u32) -> Duration {
		exponential(self.initial, self.max, attempt, self.jitter)
	}

	fn validate(&self, field: &'static str) -> Result<()> {
		if self.initial.is_zero() {
			return Err(Error::Validation {
				field,
				reason: "Initial delay must be greater than zero.".into(),
			});
		}
		if self.max < self.initial {
			return Err(Error::Validation {
				field,
				reason: "Maximum delay must be greater than or equal to the initial delay.".into(),
			});
		}

		Ok(())
	}
}

/// Retry configuration for individual HTTP calls against the identity provider and store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Maximum number of retry attempts to perform after the initial request.
	pub max_retries: u32,
	/// Timeout applied to each individual HTTP attempt.
	pub attempt_timeout: Duration,
	/// Initial delay before retrying after a failure.
	pub initial_backoff: Duration,
	/// Upper bound applied to exponential backoff growth.
	pub max_backoff: Duration,
	/// Overall deadline that bounds the entire retry sequence.
	pub deadline: Duration,
	/// Strategy used to randomize the computed backoff.
	#[serde(default)]
	pub jitter: JitterStrategy,
}
impl RetryPolicy {
	/// Validate invariants for retry configuration.
	pub fn validate(&self) -> Result<()> {
		if self.attempt_timeout < Duration::from_millis(100) {
			return Err(Error::Validation {
				field: "retry_policy.attempt_timeout",
				reason: "Must be at least 100 ms.".into(),
			});
		}
		if self.initial_backoff.is_zero() {
			return Err(Error::Validation {
				field: "retry_policy.initial_backoff",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_backoff < self.initial_backoff {
			return Err(Error::Validation {
				field: "retry_policy.max_backoff",
				reason: "Must be greater than or equal to initial_backoff.".into(),
			});
		}
		if self.deadline < self.attempt_timeout {
			return Err(Error::Validation {
				field: "retry_policy.deadline",
				reason: "Must be greater than or equal to attempt_timeout.".into(),
			});
		}

		Ok(())
	}

	/// Compute backoff for a retry attempt using the selected jitter strategy.
	pub fn compute_backoff(&self, attempt: u32) -> Duration {
		exponential(self.initial_backoff, self.max_backoff, attempt, self.jitter)
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 2,
			attempt_timeout: Duration::from_secs(5),
			initial_backoff: Duration::from_millis(250),
			max_backoff: Duration::from_secs(2),
			deadline: Duration::from_secs(12),
			jitter: JitterStrategy::Full,
		}
	}
}

/// Identity provider (OIDC + admin directory) settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityConfig {
	/// Base URL serving `/realms/{realm}/protocol/openid-connect/*`.
	pub oidc_base_url: Url,
	/// Base URL serving `/admin/realms/{realm}/*`.
	pub admin_base_url: Url,
	/// Realm holding clients, groups, and roles.
	pub realm: String,
	/// Client identity used for the service credential grant.
	pub client_id: String,
	/// Client secret used for the service credential grant.
	pub client_secret: String,
	/// Group receiving default grants for globally accessible resources.
	pub everyone_group_id: String,
	/// Optional prefix namespacing role names across clusters.
	#[serde(default)]
	pub role_prefix: Option<String>,
	/// Shared secret accepted from trusted in-cluster clients.
	#[serde(default)]
	pub shared_secret: Option<String>,
	/// Whether HTTPS is required for identity-provider URLs.
	#[serde(default = "default_true")]
	pub require_https: bool,
	/// Clock tolerance applied to temporal claims.
	#[serde(default = "default_clock_tolerance")]
	pub clock_tolerance: Duration,
	/// Signature algorithms accepted from bearer tokens.
	#[serde(default = "default_algorithms")]
	pub allowed_algorithms: Vec<Algorithm>,
	/// Minimum spacing between refetches triggered by unknown key ids; zero disables it.
	#[serde(default = "default_key_refetch_cooldown")]
	pub key_refetch_cooldown: Duration,
	/// Expected `aud` claim, when audience validation is wanted.
	#[serde(default)]
	pub audience: Option<String>,
	/// Expected `iss` claim, when issuer validation is wanted.
	#[serde(default)]
	pub issuer: Option<String>,
}
impl IdentityConfig {
	/// Construct identity settings with defaults for the optional knobs.
	pub fn new(
		base_url: impl AsRef<str>,
		realm: impl Into<String>,
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
		everyone_group_id: impl Into<String>,
	) -> Result<Self> {
		let base = Url::parse(base_url.as_ref())?;

		Ok(Self {
			oidc_base_url: base.clone(),
			admin_base_url: base,
			realm: realm.into(),
			client_id: client_id.into(),
			client_secret: client_secret.into(),
			everyone_group_id: everyone_group_id.into(),
			role_prefix: None,
			shared_secret: None,
			require_https: true,
			clock_tolerance: DEFAULT_CLOCK_TOLERANCE,
			allowed_algorithms: default_algorithms(),
			key_refetch_cooldown: DEFAULT_KEY_REFETCH_COOLDOWN,
			audience: None,
			issuer: None,
		})
	}

	/// Set HTTPS requirement to the desired value.
	pub fn with_require_https(mut self, require_https: bool) -> Self {
		self.require_https = require_https;

		self
	}

	/// Validate identity settings.
	pub fn validate(&self) -> Result<()> {
		if self.require_https {
			security::enforce_https(&self.oidc_base_url)?;
			security::enforce_https(&self.admin_base_url)?;
		}

		non_empty("identity.realm", &self.realm)?;
		non_empty("identity.client_id", &self.client_id)?;
		non_empty("identity.client_secret", &self.client_secret)?;
		non_empty("identity.everyone_group_id", &self.everyone_group_id)?;

		if let Some(prefix) = &self.role_prefix
			&& (prefix.is_empty() || prefix.contains(':'))
		{
			return Err(Error::Validation {
				field: "identity.role_prefix",
				reason: "Must be non-empty and must not contain ':'.".into(),
			});
		}
		if self.allowed_algorithms.is_empty() {
			return Err(Error::Validation {
				field: "identity.allowed_algorithms",
				reason: "At least one algorithm must be accepted.".into(),
			});
		}

		Ok(())
	}
}

/// Cluster resource store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
	/// API server base URL.
	pub api_server: Url,
	/// Namespace holding the watched resources.
	pub namespace: String,
	/// Custom-resource API group.
	#[serde(default = "default_resource_group")]
	pub group: String,
	/// Custom-resource API version.
	#[serde(default = "default_resource_version")]
	pub version: String,
	/// File holding the bearer token for the API server, if any.
	#[serde(default)]
	pub token_path: Option<PathBuf>,
	/// Server-side timeout requested for a single watch call.
	#[serde(default = "default_watch_timeout")]
	pub watch_timeout: Duration,
}
impl StoreConfig {
	/// Construct store settings with default group/version.
	pub fn new(api_server: impl AsRef<str>, namespace: impl Into<String>) -> Result<Self> {
		Ok(Self {
			api_server: Url::parse(api_server.as_ref())?,
			namespace: namespace.into(),
			group: default_resource_group(),
			version: default_resource_version(),
			token_path: None,
			watch_timeout: default_watch_timeout(),
		})
	}

	/// Validate store settings.
	pub fn validate(&self) -> Result<()> {
		non_empty("store.namespace", &self.namespace)?;
		non_empty("store.group", &self.group)?;
		non_empty("store.version", &self.version)?;

		if self.watch_timeout < Duration::from_secs(1) {
			return Err(Error::Validation {
				field: "store.watch_timeout",
				reason: "Must be at least 1 second.".into(),
			});
		}

		Ok(())
	}
}

/// Schedules of the server-side background loops.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshConfig {
	/// Lead time before service-token expiry at which a re-grant is attempted.
	#[serde(default = "default_refresh_margin")]
	pub refresh_margin: Duration,
	/// Backoff applied between failed service-token re-grants.
	#[serde(default = "default_grant_backoff")]
	pub grant_backoff: Backoff,
	/// Margin subtracted from exchanged access-token lifetimes.
	#[serde(default = "default_exchange_skew")]
	pub exchange_skew: Duration,
	/// Backoff applied between watch reconnect attempts.
	#[serde(default = "default_watch_backoff")]
	pub watch_backoff: Backoff,
	/// Delay before a crashed watcher task is started again.
	#[serde(default = "default_restart_delay")]
	pub restart_delay: Duration,
}
impl RefreshConfig {
	/// Validate refresh schedules.
	pub fn validate(&self) -> Result<()> {
		if self.refresh_margin < Duration::from_secs(1) {
			return Err(Error::Validation {
				field: "refresh.refresh_margin",
				reason: "Must be at least 1 second.".into(),
			});
		}

		self.grant_backoff.validate("refresh.grant_backoff")?;
		self.watch_backoff.validate("refresh.watch_backoff")?;

		Ok(())
	}
}
impl Default for RefreshConfig {
	fn default() -> Self {
		Self {
			refresh_margin: default_refresh_margin(),
			grant_backoff: default_grant_backoff(),
			exchange_skew: default_exchange_skew(),
			watch_backoff: default_watch_backoff(),
			restart_delay: default_restart_delay(),
		}
	}
}

/// Session refresher settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
	/// Timer tick.
	#[serde(default = "default_tick_interval")]
	pub tick_interval: Duration,
	/// Remaining access-token lifetime below which an exchange is requested.
	#[serde(default = "default_session_threshold")]
	pub threshold: Duration,
	/// Application path prefix used to build the logout location.
	#[serde(default = "default_app_prefix")]
	pub app_prefix: String,
}
impl SessionConfig {
	/// Location of the identity provider logout flow for this application.
	pub fn logout_path(&self) -> String {
		format!("{}oidc/logout", self.app_prefix)
	}

	/// Validate session settings.
	pub fn validate(&self) -> Result<()> {
		if self.tick_interval.is_zero() {
			return Err(Error::Validation {
				field: "session.tick_interval",
				reason: "Must be greater than zero.".into(),
			});
		}
		if !self.app_prefix.ends_with('/') {
			return Err(Error::Validation {
				field: "session.app_prefix",
				reason: "Must end with '/'.".into(),
			});
		}

		Ok(())
	}
}
impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			tick_interval: default_tick_interval(),
			threshold: default_session_threshold(),
			app_prefix: default_app_prefix(),
		}
	}
}

/// Top-level configuration consumed by [`crate::Services`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Identity provider settings.
	pub identity: IdentityConfig,
	/// Resource store settings.
	pub store: StoreConfig,
	/// Background loop schedules.
	#[serde(default)]
	pub refresh: RefreshConfig,
	/// Session refresher settings.
	#[serde(default)]
	pub session: SessionConfig,
	/// Per-call HTTP retry policy.
	#[serde(default)]
	pub retry_policy: RetryPolicy,
}
impl SyncConfig {
	/// Validate every section.
	pub fn validate(&self) -> Result<()> {
		self.identity.validate()?;
		self.store.validate()?;
		self.refresh.validate()?;
		self.session.validate()?;
		self.retry_policy.validate()?;

		Ok(())
	}
}

fn exponential(initial: Duration, max: Duration, attempt: u32, jitter: JitterStrategy) -> Duration {
	let exponent = attempt.min(32);
	let base = initial.mul_f64(2f64.powi(exponent as i32));
	let bounded = base.min(max).max(initial);

	match jitter {
		JitterStrategy::None => bounded,
		JitterStrategy::Full => {
			let lower = bounded.mul_f64(0.8).max(initial);
			let upper = bounded.min(max);

			random_within(lower, upper)
		},
		JitterStrategy::Decorrelated => {
			let prev = if attempt == 0 { initial } else { bounded };
			let ceiling = max.min(prev.mul_f64(3.0));

			random_within(initial, ceiling.max(initial))
		},
	}
}

fn random_within(min: Duration, max: Duration) -> Duration {
	if max <= min {
		return max;
	}
	SMALL_RNG.with(|cell| {
		let mut rng = cell.borrow_mut();
		let nanos = max.as_nanos() - min.as_nanos();
		let jitter = rng.random_range(0..=nanos.min(u64::MAX as u128));

		min + Duration::from_nanos(jitter as u64)
	})
}

fn non_empty(field: &'static str, value: &str) -> Result<()> {
	if value.trim().is_empty() {
		return Err(Error::Validation { field, reason: "Must not be empty.".into() });
	}

	Ok(())
}

fn default_true() -> bool {
	true
}

fn default_clock_tolerance() -> Duration {
	DEFAULT_CLOCK_TOLERANCE
}

fn default_key_refetch_cooldown() -> Duration {
	DEFAULT_KEY_REFETCH_COOLDOWN
}

fn default_algorithms() -> Vec<Algorithm> {
	vec![Algorithm::RS256]
}

fn default_resource_group() -> String {
	DEFAULT_RESOURCE_GROUP.into()
}

fn default_resource_version() -> String {
	DEFAULT_RESOURCE_VERSION.into()
}

fn default_watch_timeout() -> Duration {
	Duration::from_secs(300)
}

fn default_refresh_margin() -> Duration {
	DEFAULT_REFRESH_MARGIN
}

fn default_grant_backoff() -> Backoff {
	Backoff::new(Duration::from_secs(1), Duration::from_secs(30), JitterStrategy::Full)
}

fn default_exchange_skew() -> Duration {
	DEFAULT_EXCHANGE_SKEW
}

fn default_watch_backoff() -> Backoff {
	Backoff::new(Duration::from_secs(1), Duration::from_secs(60), JitterStrategy::Full)
}

fn default_restart_delay() -> Duration {
	Duration::from_secs(5)
}

fn default_tick_interval() -> Duration {
	DEFAULT_TICK_INTERVAL
}

fn default_session_threshold() -> Duration {
	DEFAULT_SESSION_THRESHOLD
}

fn default_app_prefix() -> String {
	"/".into()
}
