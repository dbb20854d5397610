//! Metrics helpers and per-cache telemetry bookkeeping.

// std
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 4]>;

const METRIC_TOKEN_REFRESH_TOTAL: &str = "authsync_service_token_refresh_total";
const METRIC_EXCHANGE_TOTAL: &str = "authsync_offline_exchange_total";
const METRIC_KEY_REFETCH_TOTAL: &str = "authsync_signing_key_refetch_total";
const METRIC_VERIFICATION_TOTAL: &str = "authsync_token_verification_total";
const METRIC_CACHE_LOOKUPS_TOTAL: &str = "authsync_resource_cache_lookups_total";
const METRIC_CACHE_REFETCH_TOTAL: &str = "authsync_resource_cache_refetch_total";
const METRIC_CACHE_REFETCH_DURATION: &str = "authsync_resource_cache_refetch_duration_seconds";
const METRIC_WATCH_EVENTS_TOTAL: &str = "authsync_watch_events_total";
const METRIC_WATCH_RECONNECTS_TOTAL: &str = "authsync_watch_reconnects_total";
const METRIC_ROLE_ACTIONS_TOTAL: &str = "authsync_role_actions_total";
const METRIC_SESSION_EXCHANGE_TOTAL: &str = "authsync_session_exchange_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe counters for a single resource cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
	lookups: AtomicU64,
	hits: AtomicU64,
	misses: AtomicU64,
	stale_serves: AtomicU64,
	refetches: AtomicU64,
	refetch_errors: AtomicU64,
	last_refetch_micros: AtomicU64,
}
impl CacheMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a lookup outcome (`hit`, `coalesced`, `miss`, or `stale`).
	pub fn record_lookup(&self, outcome: &str) {
		self.lookups.fetch_add(1, Ordering::Relaxed);

		match outcome {
			"hit" | "coalesced" => self.hits.fetch_add(1, Ordering::Relaxed),
			"stale" => self.stale_serves.fetch_add(1, Ordering::Relaxed),
			_ => self.misses.fetch_add(1, Ordering::Relaxed),
		};
	}

	/// Record a successful reload and its latency.
	pub fn record_refetch_success(&self, duration: Duration) {
		self.refetches.fetch_add(1, Ordering::Relaxed);
		self.last_refetch_micros.store(duration.as_micros() as u64, Ordering::Relaxed);
	}

	/// Record a failed reload.
	pub fn record_refetch_error(&self) {
		self.refetch_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot.
	pub fn snapshot(&self) -> CacheStats {
		CacheStats {
			lookups: self.lookups.load(Ordering::Relaxed),
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			stale_serves: self.stale_serves.load(Ordering::Relaxed),
			refetches: self.refetches.load(Ordering::Relaxed),
			refetch_errors: self.refetch_errors.load(Ordering::Relaxed),
			last_refetch_micros: match self.last_refetch_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of cache counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
	/// Total lookups observed.
	pub lookups: u64,
	/// Lookups answered from a valid snapshot.
	pub hits: u64,
	/// Lookups that had to wait for a reload.
	pub misses: u64,
	/// Lookups answered from an invalidated snapshot after a failed reload.
	pub stale_serves: u64,
	/// Successful reloads.
	pub refetches: u64,
	/// Failed reloads.
	pub refetch_errors: u64,
	/// Microsecond latency of the most recent reload.
	pub last_refetch_micros: Option<u64>,
}
impl CacheStats {
	/// Share of lookups answered without waiting on the store.
	pub fn hit_rate(&self) -> f64 {
		if self.lookups == 0 { 0.0 } else { self.hits as f64 / self.lookups as f64 }
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record one service-token grant attempt.
pub fn record_token_refresh(client_id: &str, ok: bool) {
	let mut labels = LabelSet::new();

	labels.push(Label::new("client", client_id.to_owned()));
	labels.push(status_label(ok));

	metrics::counter!(METRIC_TOKEN_REFRESH_TOTAL, labels.iter()).increment(1);
}

/// Record an offline-token exchange outcome.
pub fn record_exchange(outcome: &'static str) {
	metrics::counter!(METRIC_EXCHANGE_TOTAL, outcome_labels(outcome).iter()).increment(1);
}

/// Record a signing-key refetch outcome (`fetched`, `coalesced`, or `error`).
pub fn record_key_refetch(outcome: &'static str) {
	metrics::counter!(METRIC_KEY_REFETCH_TOTAL, outcome_labels(outcome).iter()).increment(1);
}

/// Record a bearer verification outcome.
pub fn record_verification(outcome: &'static str) {
	metrics::counter!(METRIC_VERIFICATION_TOTAL, outcome_labels(outcome).iter()).increment(1);
}

/// Record a resource cache lookup.
pub fn record_cache_lookup(kind: &str, outcome: &'static str) {
	let mut labels = kind_labels(kind);

	labels.push(Label::new("outcome", outcome));

	metrics::counter!(METRIC_CACHE_LOOKUPS_TOTAL, labels.iter()).increment(1);
}

/// Record a resource cache reload along with its latency.
pub fn record_cache_refetch(kind: &str, ok: bool, duration: Duration) {
	let mut labels = kind_labels(kind);

	labels.push(status_label(ok));

	metrics::counter!(METRIC_CACHE_REFETCH_TOTAL, labels.iter()).increment(1);
	metrics::histogram!(METRIC_CACHE_REFETCH_DURATION, kind_labels(kind).iter())
		.record(duration.as_secs_f64());
}

/// Record one applied watch event.
pub fn record_watch_event(kind: &str, event: &'static str) {
	let mut labels = kind_labels(kind);

	labels.push(Label::new("event", event));

	metrics::counter!(METRIC_WATCH_EVENTS_TOTAL, labels.iter()).increment(1);
}

/// Record a watch reconnect and its cause (`end`, `gone`, or `error`).
pub fn record_watch_reconnect(kind: &str, reason: &'static str) {
	let mut labels = kind_labels(kind);

	labels.push(Label::new("reason", reason));

	metrics::counter!(METRIC_WATCH_RECONNECTS_TOTAL, labels.iter()).increment(1);
}

/// Record a role-directory mutation performed by reconciliation.
pub fn record_role_action(kind: &str, action: &'static str) {
	let mut labels = kind_labels(kind);

	labels.push(Label::new("action", action));

	metrics::counter!(METRIC_ROLE_ACTIONS_TOTAL, labels.iter()).increment(1);
}

/// Record a session token-pair exchange outcome.
pub fn record_session_exchange(outcome: &'static str) {
	metrics::counter!(METRIC_SESSION_EXCHANGE_TOTAL, outcome_labels(outcome).iter()).increment(1);
}

fn kind_labels(kind: &str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(2);

	labels.push(Label::new("kind", kind.to_owned()));

	labels
}

fn outcome_labels(outcome: &'static str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(1);

	labels.push(Label::new("outcome", outcome));

	labels
}

fn status_label(ok: bool) -> Label {
	Label::new("status", if ok { "success" } else { "error" })
}
