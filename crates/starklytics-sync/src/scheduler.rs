// SPDX-License-Identifier: GPL-3.0

//! Periodic silent refresh.
//!
//! The scheduler is the pull half of the push/pull sync: it runs a tick on an interval as a
//! safety net for missed change events. Before every tick the delay is recomputed as
//! `min(base * 2^failures, max)` from the shared [`RetryState`], so a failing backend is
//! polled less and less often until it recovers.

use futures::future::BoxFuture;
use starklytics_common::{RetryState, backoff_delay};
use std::{
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The work run on every tick.
pub type Tick = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Schedule {
	base: Duration,
	tick: Option<Tick>,
	running: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Runs a tick periodically, backing off while the connection keeps failing.
pub struct RefreshScheduler {
	max: Duration,
	retry: Arc<Mutex<RetryState>>,
	schedule: Mutex<Schedule>,
}

impl RefreshScheduler {
	/// Creates a stopped scheduler.
	///
	/// # Arguments
	/// * `base` - The interval while nothing fails.
	/// * `max` - The upper bound of the backed-off interval.
	/// * `retry` - The failure count of the connection, shared with whoever records failures.
	pub fn new(base: Duration, max: Duration, retry: Arc<Mutex<RetryState>>) -> Self {
		Self { max, retry, schedule: Mutex::new(Schedule { base, tick: None, running: None }) }
	}

	/// Starts ticking every `interval`, replacing any previous schedule.
	pub fn start(&self, interval: Duration, on_tick: Tick) {
		let mut schedule = self.schedule();
		schedule.base = interval;
		schedule.tick = Some(on_tick);
		self.restart(&mut schedule);
	}

	/// Stops ticking. A tick in progress is cancelled.
	pub fn stop(&self) {
		let mut schedule = self.schedule();
		schedule.tick = None;
		Self::cancel(&mut schedule);
	}

	/// Changes the base interval, restarting the schedule if it is running.
	pub fn set_interval(&self, interval: Duration) {
		let mut schedule = self.schedule();
		schedule.base = interval;
		if schedule.running.is_some() {
			self.restart(&mut schedule);
		}
	}

	/// The base interval.
	pub fn interval(&self) -> Duration {
		self.schedule().base
	}

	/// Whether the scheduler is ticking.
	pub fn is_running(&self) -> bool {
		self.schedule().running.as_ref().is_some_and(|(_, task)| !task.is_finished())
	}

	/// The delay before the next tick, given the current failure count.
	pub fn current_delay(&self) -> Duration {
		let base = self.schedule().base;
		next_delay(base, self.max, &self.retry)
	}

	fn restart(&self, schedule: &mut Schedule) {
		Self::cancel(schedule);
		let Some(tick) = schedule.tick.clone() else { return };
		let token = CancellationToken::new();
		let cancelled = token.clone();
		let (base, max, retry) = (schedule.base, self.max, self.retry.clone());
		let task = tokio::spawn(async move {
			loop {
				let delay = next_delay(base, max, &retry);
				tokio::select! {
					_ = cancelled.cancelled() => break,
					_ = tokio::time::sleep(delay) => {},
				}
				tokio::select! {
					_ = cancelled.cancelled() => break,
					_ = tick() => {},
				}
			}
		});
		schedule.running = Some((token, task));
	}

	fn cancel(schedule: &mut Schedule) {
		if let Some((token, task)) = schedule.running.take() {
			token.cancel();
			task.abort();
		}
	}

	fn schedule(&self) -> MutexGuard<'_, Schedule> {
		self.schedule.lock().unwrap_or_else(|e| e.into_inner())
	}
}

impl Drop for RefreshScheduler {
	fn drop(&mut self) {
		Self::cancel(&mut self.schedule());
	}
}

fn next_delay(base: Duration, max: Duration, retry: &Mutex<RetryState>) -> Duration {
	let failures = retry.lock().unwrap_or_else(|e| e.into_inner()).attempt_count();
	backoff_delay(base, failures, max)
}
