//! Wall-clock abstraction for components that compare against absolute expiry timestamps.
//!
//! Monotonic deadlines use `tokio::time::Instant` directly so tests can pause the runtime;
//! absolute timestamps coming from the wire go through a [`Clock`].

// std
use std::sync::Mutex;
// self
use crate::_prelude::*;

/// Represents a clock, which can tell the current time.
pub trait Clock: Send + Sync {
	/// Current time according to this clock.
	fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// A manually driven clock.
#[derive(Clone, Debug)]
pub struct ManualClock {
	now: Arc<Mutex<DateTime<Utc>>>,
}
impl ManualClock {
	/// Start the clock at the given time.
	pub fn new(start: DateTime<Utc>) -> Self {
		Self { now: Arc::new(Mutex::new(start)) }
	}

	/// Move the clock forward.
	pub fn advance(&self, by: Duration) {
		let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
		let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

		*now = now.checked_add_signed(delta).unwrap_or(*now);
	}

	/// Jump the clock to the given time.
	pub fn set(&self, to: DateTime<Utc>) {
		*self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
	}
}
impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}
impl<C> Clock for Arc<C>
where
	C: Clock + ?Sized,
{
	fn now(&self) -> DateTime<Utc> {
		(**self).now()
	}
}
