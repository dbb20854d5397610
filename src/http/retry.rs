//! Bounded retry budgeting for single upstream calls.

// crates.io
use tokio::time;
// self
use crate::{_prelude::*, config::RetryPolicy};

/// Result of budgeting a retry attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptBudget {
	/// Additional attempt is permitted with the provided per-attempt timeout.
	Granted {
		/// Timeout window allocated for the upcoming attempt.
		timeout: Duration,
	},
	/// Retry window exhausted; no further attempts allowed.
	Exhausted,
}

/// Controls retry backoff progression and attempt budgeting for one logical call.
#[derive(Debug)]
pub struct RetryExecutor<'a> {
	policy: &'a RetryPolicy,
	deadline: Instant,
	retries_used: u32,
	exhausted: bool,
}
impl<'a> RetryExecutor<'a> {
	/// Create a new executor respecting the supplied retry policy.
	pub fn new(policy: &'a RetryPolicy) -> Self {
		Self {
			policy,
			deadline: Instant::now() + policy.deadline,
			retries_used: 0,
			exhausted: false,
		}
	}

	/// Budget the next attempt, returning either the permitted timeout or exhaustion.
	pub fn attempt_budget(&self) -> AttemptBudget {
		if self.exhausted {
			return AttemptBudget::Exhausted;
		}

		match self.remaining_budget().min(self.policy.attempt_timeout) {
			timeout if timeout.is_zero() => AttemptBudget::Exhausted,
			timeout => AttemptBudget::Granted { timeout },
		}
	}

	/// Remaining wall-clock budget for the overall retry window.
	pub fn remaining_budget(&self) -> Duration {
		self.deadline.saturating_duration_since(Instant::now())
	}

	/// Number of retries that have already been consumed.
	pub fn attempts_used(&self) -> u32 {
		self.retries_used
	}

	/// Record a failed attempt and sleep before the next one.
	///
	/// Returns `false` once the retry count is spent, after which
	/// [`attempt_budget`](Self::attempt_budget) reports exhaustion.
	pub async fn backoff(&mut self) -> bool {
		if self.retries_used >= self.policy.max_retries {
			tracing::debug!(attempt = self.retries_used, "retry budget exhausted");

			self.exhausted = true;

			return false;
		}

		let delay = self.policy.compute_backoff(self.retries_used).min(self.remaining_budget());

		self.retries_used = self.retries_used.saturating_add(1);

		tracing::debug!(attempt = self.retries_used, ?delay, "retrying upstream call");

		if !delay.is_zero() {
			time::sleep(delay).await;
		}

		true
	}
}
