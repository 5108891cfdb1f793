// SPDX-License-Identifier: GPL-3.0

//! Tunables of the sync layer.

use crate::schema::SchemaSpec;
use starklytics_common::RetryPolicy;
use std::time::Duration;

/// Default base interval of the silent refresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Default upper bound of the refresh interval once backed off.
pub const DEFAULT_MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
/// Default interval between realtime heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default maximum number of concurrent HTTP requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// Options shared by every session of a [`SyncContext`](crate::SyncContext).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOptions {
	/// Retry bounds for probes, reads and schema provisioning.
	pub retry: RetryPolicy,
	/// Base interval of the silent refresh.
	pub refresh_interval: Duration,
	/// Upper bound of the refresh interval after consecutive failures.
	pub max_refresh_interval: Duration,
	/// Interval between realtime heartbeats.
	pub heartbeat_interval: Duration,
	/// Maximum number of HTTP requests in flight.
	pub max_concurrent_requests: usize,
	/// The schema sessions depend on.
	pub schema: SchemaSpec,
}

impl Default for SyncOptions {
	fn default() -> Self {
		Self {
			retry: RetryPolicy::default(),
			refresh_interval: DEFAULT_REFRESH_INTERVAL,
			max_refresh_interval: DEFAULT_MAX_REFRESH_INTERVAL,
			heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
			max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
			schema: SchemaSpec::default(),
		}
	}
}

impl SyncOptions {
	/// Replaces the retry bounds.
	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Replaces the refresh interval bounds.
	pub fn with_refresh(mut self, interval: Duration, max_interval: Duration) -> Self {
		self.refresh_interval = interval;
		self.max_refresh_interval = max_interval;
		self
	}

	/// Replaces the schema.
	pub fn with_schema(mut self, schema: SchemaSpec) -> Self {
		self.schema = schema;
		self
	}
}
