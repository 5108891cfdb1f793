// SPDX-License-Identifier: GPL-3.0

//! Retry with exponential backoff.
//!
//! Every backend operation that may fail transiently (reachability probes, collection reads,
//! schema provisioning) goes through [`with_retry`], parameterised by a [`RetryPolicy`].
//! Errors opt out of retrying through [`Retryable`], so that e.g. a missing table is reported
//! immediately instead of being retried. Attempts are driven by `backon`; [`backoff_delay`]
//! remains for callers that schedule on their own, like the refresh scheduler.

use backon::{ExponentialBuilder, Retryable as _};
use std::{fmt::Display, future::Future, time::Duration};

/// Default number of attempts for a single operation.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default upper bound for the delay between two attempts.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Computes an exponential backoff delay.
///
/// Returns `min(base * 2^retries, max)`, saturating instead of overflowing.
///
/// # Arguments
/// * `base` - The delay used when no failures have been recorded.
/// * `retries` - The number of consecutive failures.
/// * `max` - The upper bound for the returned delay.
pub fn backoff_delay(base: Duration, retries: u32, max: Duration) -> Duration {
	2u32.checked_pow(retries)
		.and_then(|factor| base.checked_mul(factor))
		.map_or(max, |delay| delay.min(max))
}

/// Bounds for retrying an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	/// The total number of attempts, including the first one.
	pub max_attempts: u32,
	/// The delay before the first retry; doubled for each further retry.
	pub initial_delay: Duration,
	/// The upper bound for the delay between two attempts.
	pub max_delay: Duration,
}

impl RetryPolicy {
	/// A new retry policy.
	///
	/// # Arguments
	/// * `max_attempts` - The total number of attempts. Values below one are treated as one.
	/// * `initial_delay` - The delay before the first retry.
	/// * `max_delay` - The upper bound for any delay.
	pub const fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
		Self { max_attempts, initial_delay, max_delay }
	}

	/// A policy which never retries.
	pub const fn none() -> Self {
		Self::new(1, Duration::ZERO, Duration::ZERO)
	}

	/// The backoff between attempts: starts at `initial_delay`, doubles and is capped at
	/// `max_delay`.
	fn backoff(&self) -> ExponentialBuilder {
		ExponentialBuilder::default()
			.with_min_delay(self.initial_delay)
			.with_max_delay(self.max_delay)
			.with_factor(2.0)
			.with_max_times(self.max_attempts.saturating_sub(1) as usize)
	}

	/// The delay to wait after `failures` consecutive failed attempts.
	pub fn delay_for(&self, failures: u32) -> Duration {
		backoff_delay(self.initial_delay, failures.saturating_sub(1), self.max_delay)
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
	}
}

/// Classifies errors as worth retrying or not.
pub trait Retryable {
	/// Whether the failed operation may succeed if attempted again.
	fn is_retryable(&self) -> bool {
		true
	}
}

/// Runs `operation` until it succeeds, fails with a non-retryable error or the policy's
/// attempts are exhausted.
///
/// # Arguments
/// * `policy` - The retry bounds.
/// * `label` - A description of the operation, used for logging.
/// * `operation` - Produces a new attempt each time it is called.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, operation: F) -> Result<T, E>
where
	E: Retryable + Display,
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	let max_attempts = policy.max_attempts.max(1);
	let mut retries = 0u32;
	let result = operation
		.retry(policy.backoff())
		.when(|error: &E| error.is_retryable())
		.notify(|error: &E, delay: Duration| {
			retries += 1;
			log::warn!("{label} failed (attempt {retries}/{max_attempts}), retrying in {delay:?}: {error}");
		})
		.await;
	if let Err(error) = &result {
		if error.is_retryable() {
			log::error!("{label} failed after {} attempt(s): {error}", retries + 1);
		}
	}
	result
}

/// Consecutive failure bookkeeping for a connection.
///
/// Reset on any success, incremented on failure and consulted to compute the next backoff
/// delay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
	attempt_count: u32,
	last_error: Option<String>,
}

impl RetryState {
	/// The number of consecutive failures.
	pub fn attempt_count(&self) -> u32 {
		self.attempt_count
	}

	/// The most recent failure, if the last operation failed.
	pub fn last_error(&self) -> Option<&str> {
		self.last_error.as_deref()
	}

	/// Records a successful operation, resetting the state.
	pub fn record_success(&mut self) {
		self.attempt_count = 0;
		self.last_error = None;
	}

	/// Records a failed operation.
	pub fn record_failure(&mut self, error: impl Display) {
		self.attempt_count = self.attempt_count.saturating_add(1);
		self.last_error = Some(error.to_string());
	}
}
