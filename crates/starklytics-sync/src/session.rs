// SPDX-License-Identifier: GPL-3.0

//! Sync sessions.
//!
//! A [`SyncSession`] drives one consumer's view of a set of resources through the
//! connection state machine:
//!
//! ```text
//! Idle ──► Probing ──► Ready ◄──► Fetching
//!             │  ▲      ▲
//!             │  │      └── Bootstrapping ◄── SchemaMissing / FunctionsMissing
//!             │  └── retry ── Error
//!             └──► SchemaMissing / FunctionsMissing / Error
//!
//! Disposed is reachable from every state and final.
//! ```
//!
//! Missing schema is never provisioned implicitly: [`SyncSession::bootstrap`] must be called.
//! Network work runs on detached tasks, so a disposal never aborts a request; its result is
//! simply discarded.

use crate::{
	SyncContext,
	backend::ChangeEvent,
	bootstrap::BootstrapOutcome,
	collection::{ResourceCollection, ResourceSpec},
	error::SessionError,
	fetcher::DataFetcher,
	lifecycle::LifecycleGuard,
	probe::{ConnectionStatus, SetupStep},
	scheduler::{RefreshScheduler, Tick},
};
use futures::FutureExt;
use serde_json::Value;
use starklytics_common::{RetryState, Status};
use std::{
	collections::BTreeMap,
	future::Future,
	sync::{Arc, Mutex, MutexGuard},
	time::{Duration, SystemTime},
};
use tokio::sync::watch;

/// The connection state of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
	/// Created, not mounted yet.
	#[default]
	Idle,
	/// Checking the backend.
	Probing,
	/// Reachable, helper procedures installed, data tables missing.
	SchemaMissing,
	/// Reachable, helper procedures missing.
	FunctionsMissing,
	/// Fully operational.
	Ready,
	/// Loading collections with a visible loading indicator.
	Fetching,
	/// Creating the data tables.
	Bootstrapping,
	/// The backend could not be reached.
	Error,
	/// Disposed. Final.
	Disposed,
}

/// Everything a consumer renders, as of the last committed update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
	/// Collections by resource name.
	pub collections: BTreeMap<String, ResourceCollection>,
	/// Whether a visible load is in progress.
	pub loading: bool,
	/// The error to show, if any.
	pub error: Option<String>,
	/// The connection state.
	pub state: SessionState,
	/// The last probe result.
	pub status: ConnectionStatus,
	/// When collection data last changed.
	pub last_updated: Option<SystemTime>,
}

impl SessionSnapshot {
	/// The collection of `resource`.
	pub fn collection(&self, resource: &str) -> Option<&ResourceCollection> {
		self.collections.get(resource)
	}

	/// The rows of `resource`; empty for unknown resources.
	pub fn rows(&self, resource: &str) -> &[Value] {
		self.collection(resource).map(ResourceCollection::rows).unwrap_or_default()
	}
}

/// One consumer's synchronized view of a set of resources.
pub struct SyncSession {
	inner: Arc<Inner>,
}

struct Inner {
	context: Arc<SyncContext>,
	resources: Vec<ResourceSpec>,
	fetcher: DataFetcher,
	guard: LifecycleGuard<SessionSnapshot>,
	scheduler: RefreshScheduler,
	retry: Arc<Mutex<RetryState>>,
	snapshots: watch::Sender<SessionSnapshot>,
}

impl SyncSession {
	/// Creates an idle session over `resources`.
	///
	/// # Arguments
	/// * `context` - The shared backend state.
	/// * `resources` - The collections to keep in sync. Names must be unique.
	pub fn new(context: Arc<SyncContext>, resources: Vec<ResourceSpec>) -> Self {
		let collections = resources
			.iter()
			.map(|spec| (spec.name.clone(), ResourceCollection::new(spec)))
			.collect();
		let initial = SessionSnapshot { collections, ..Default::default() };
		let retry = Arc::new(Mutex::new(RetryState::default()));
		let options = context.options();
		let scheduler =
			RefreshScheduler::new(options.refresh_interval, options.max_refresh_interval, retry.clone());
		let (snapshots, _) = watch::channel(initial.clone());
		Self {
			inner: Arc::new(Inner {
				fetcher: context.fetcher(),
				context,
				resources,
				guard: LifecycleGuard::new(initial),
				scheduler,
				retry,
				snapshots,
			}),
		}
	}

	/// Probes the backend and, when it is ready, loads the collections, opens their change
	/// channels and starts the silent refresh.
	///
	/// Returns the state the session settled in.
	pub async fn mount(&self) -> Result<SessionState, SessionError> {
		match self.state() {
			SessionState::Idle => self.inner.connect().await,
			SessionState::Disposed => Err(SessionError::Disposed),
			state => Err(SessionError::InvalidTransition { action: "mount", state }),
		}
	}

	/// Reloads the collections with a visible loading indicator.
	///
	/// An idle or failed session is probed first.
	pub async fn refresh(&self) -> Result<(), SessionError> {
		match self.state() {
			SessionState::Idle | SessionState::Error => self.inner.connect().await.map(|_| ()),
			SessionState::Ready |
			SessionState::Fetching |
			SessionState::SchemaMissing |
			SessionState::FunctionsMissing => self.inner.load(false).await,
			SessionState::Disposed => Err(SessionError::Disposed),
			state => Err(SessionError::InvalidTransition { action: "refresh", state }),
		}
	}

	/// Probes the backend again, e.g. after an error.
	pub async fn retry(&self) -> Result<SessionState, SessionError> {
		match self.state() {
			SessionState::Disposed => Err(SessionError::Disposed),
			state @ (SessionState::Probing | SessionState::Bootstrapping | SessionState::Fetching) => {
				Err(SessionError::InvalidTransition { action: "retry", state })
			},
			_ => self.inner.connect().await,
		}
	}

	/// Provisions the missing data tables, then continues as if freshly mounted.
	///
	/// The provisioning is destructive and shared by every session of the context: a
	/// bootstrap already in progress is joined rather than repeated.
	///
	/// # Arguments
	/// * `status` - Observer receiving progress updates.
	pub async fn bootstrap(
		&self,
		status: impl Status + Send + Sync + 'static,
	) -> Result<BootstrapOutcome, SessionError> {
		let previous = self.state();
		match previous {
			SessionState::SchemaMissing | SessionState::FunctionsMissing => {},
			SessionState::Disposed => return Err(SessionError::Disposed),
			state => return Err(SessionError::InvalidTransition { action: "bootstrap", state }),
		}
		self.inner.bootstrap(previous, Arc::new(status)).await
	}

	/// Closes and reopens every change channel.
	///
	/// Returns the number of channels open afterwards.
	pub async fn resubscribe(&self) -> Result<usize, SessionError> {
		match self.state() {
			SessionState::Ready | SessionState::Fetching => self.inner.resubscribe().await,
			SessionState::Disposed => Err(SessionError::Disposed),
			state => Err(SessionError::InvalidTransition { action: "resubscribe", state }),
		}
	}

	/// Changes the base interval of the silent refresh.
	pub fn set_refresh_interval(&self, interval: Duration) {
		self.inner.scheduler.set_interval(interval);
	}

	/// Tears the session down: no further updates are committed, change channels are closed
	/// and the refresh stops.
	///
	/// Returns `false` if the session was already disposed.
	pub async fn dispose(&self) -> bool {
		let inner = &self.inner;
		let disposed = inner
			.guard
			.dispose(|snapshot| {
				snapshot.state = SessionState::Disposed;
				snapshot.loading = false;
				inner.snapshots.send_replace(snapshot.clone());
			})
			.await;
		inner.scheduler.stop();
		if disposed {
			log::debug!("session disposed");
		}
		disposed
	}

	/// The current state.
	pub fn state(&self) -> SessionState {
		self.inner.state()
	}

	/// A copy of the current snapshot.
	pub fn snapshot(&self) -> SessionSnapshot {
		self.inner.guard.read(Clone::clone)
	}

	/// A receiver notified of every committed snapshot.
	pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
		self.inner.snapshots.subscribe()
	}

	/// The consecutive failure bookkeeping driving the refresh backoff.
	pub fn retry_state(&self) -> RetryState {
		self.inner.retry_state().clone()
	}

	/// The resources whose change channel still delivers events.
	///
	/// Channels closed by the backend are reopened on the next silent refresh.
	pub async fn active_subscriptions(&self) -> Vec<String> {
		self.inner.guard.active_resources().await
	}

	/// Whether the silent refresh is scheduled.
	pub fn is_refreshing(&self) -> bool {
		self.inner.scheduler.is_running()
	}
}

impl Inner {
	fn state(&self) -> SessionState {
		self.guard.read(|snapshot| snapshot.state)
	}

	fn retry_state(&self) -> MutexGuard<'_, RetryState> {
		self.retry.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Commits `change` and publishes the result. Returns `false` once disposed.
	fn update(&self, change: impl FnOnce(&mut SessionSnapshot)) -> bool {
		self.guard
			.commit(|snapshot| {
				change(snapshot);
				self.snapshots.send_replace(snapshot.clone());
			})
			.is_some()
	}

	fn commit(&self, change: impl FnOnce(&mut SessionSnapshot)) -> Result<(), SessionError> {
		if self.update(change) { Ok(()) } else { Err(SessionError::Disposed) }
	}

	/// Runs `work` on its own task and waits for it unless the session is disposed first.
	async fn detached<T: Send + 'static>(
		&self,
		work: impl Future<Output = T> + Send + 'static,
	) -> Result<T, SessionError> {
		match self.guard.run(tokio::spawn(work)).await {
			Some(Ok(output)) => Ok(output),
			Some(Err(error)) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
			Some(Err(_)) | None => Err(SessionError::Disposed),
		}
	}

	async fn connect(self: &Arc<Self>) -> Result<SessionState, SessionError> {
		self.commit(|snapshot| {
			snapshot.state = SessionState::Probing;
			snapshot.loading = true;
			snapshot.error = None;
		})?;
		let context = self.context.clone();
		let status = self.detached(async move { context.probe().probe().await }).await?;
		self.settle(status).await
	}

	/// Moves to the state `status` calls for and starts what that state runs.
	async fn settle(self: &Arc<Self>, status: ConnectionStatus) -> Result<SessionState, SessionError> {
		let state = match (status.connected, status.setup_step) {
			(false, _) => SessionState::Error,
			(true, SetupStep::Functions) => SessionState::FunctionsMissing,
			(true, SetupStep::Tables) => SessionState::SchemaMissing,
			(true, SetupStep::Complete) => SessionState::Ready,
		};
		let error = status.error_detail.clone();
		self.commit(|snapshot| {
			snapshot.status = status;
			snapshot.state = state;
			snapshot.loading = false;
			snapshot.error = error;
		})?;

		match state {
			SessionState::Ready => {
				self.load(false).await?;
				self.resubscribe().await?;
				self.start_refresh()?;
			},
			SessionState::SchemaMissing | SessionState::FunctionsMissing => {
				self.scheduler.stop();
				// Missing tables read as empty collections.
				self.load(true).await?;
			},
			_ => {
				self.scheduler.stop();
				log::warn!("backend unavailable");
			},
		}
		Ok(self.state())
	}

	/// Loads every collection. A silent load leaves the loading indicator and state alone.
	async fn load(self: &Arc<Self>, silent: bool) -> Result<(), SessionError> {
		if !silent {
			self.commit(|snapshot| {
				snapshot.loading = true;
				if snapshot.state == SessionState::Ready {
					snapshot.state = SessionState::Fetching;
				}
			})?;
		}
		let inner = self.clone();
		let outcome = self.detached(async move { inner.fetcher.fetch_all(&inner.resources).await }).await?;

		let finish = |snapshot: &mut SessionSnapshot| {
			if !silent {
				snapshot.loading = false;
				if snapshot.state == SessionState::Fetching {
					snapshot.state = SessionState::Ready;
				}
			}
		};
		match outcome {
			Ok(results) => {
				self.retry_state().record_success();
				self.commit(|snapshot| {
					// Failed resources keep their rows, including changes pushed since.
					for (name, rows) in results.results {
						if results.failures.contains(&name) {
							continue;
						}
						if let (Some(collection), Some(rows)) = (snapshot.collections.get_mut(&name), rows) {
							collection.replace(rows);
						}
					}
					snapshot.error = None;
					snapshot.last_updated = Some(SystemTime::now());
					finish(snapshot);
				})
			},
			Err(error) => {
				log::warn!("refresh failed: {error}");
				self.retry_state().record_failure(&error);
				self.commit(|snapshot| {
					snapshot.error = Some(error.to_string());
					finish(snapshot);
				})
			},
		}
	}

	async fn resubscribe(self: &Arc<Self>) -> Result<usize, SessionError> {
		let mut active = 0;
		for spec in self.resources.iter().filter(|spec| spec.live) {
			if self.subscribe(spec).await? {
				active += 1;
			}
		}
		Ok(active)
	}

	/// (Re)opens the channel of `spec`. Returns whether it is open.
	async fn subscribe(self: &Arc<Self>, spec: &ResourceSpec) -> Result<bool, SessionError> {
		let weak = Arc::downgrade(self);
		let resource = spec.name.clone();
		let on_change = move |event: ChangeEvent| {
			if let Some(inner) = weak.upgrade() {
				inner.apply_change(&resource, &event);
			}
		};
		let subscriber = self.context.subscriber();
		match self.guard.replace(&spec.name, || subscriber.subscribe(spec, on_change)).await {
			Ok(true) => Ok(true),
			Ok(false) => Err(SessionError::Disposed),
			Err(error) => {
				log::warn!("live updates for {} unavailable, relying on refresh: {error}", spec.name);
				Ok(false)
			},
		}
	}

	/// Reopens channels the backend closed, while the schema is complete.
	async fn revive(self: &Arc<Self>) -> Result<(), SessionError> {
		if !matches!(self.state(), SessionState::Ready | SessionState::Fetching) {
			return Ok(());
		}
		let closed = self.guard.prune_inactive().await;
		if closed.is_empty() {
			return Ok(());
		}
		log::debug!("reopening change channels: {}", closed.join(", "));
		for spec in self.resources.iter().filter(|spec| closed.contains(&spec.name)) {
			self.subscribe(spec).await?;
		}
		Ok(())
	}

	fn apply_change(&self, resource: &str, event: &ChangeEvent) {
		self.update(|snapshot| {
			if let Some(collection) = snapshot.collections.get_mut(resource) {
				collection.apply(event);
				snapshot.last_updated = Some(SystemTime::now());
			}
		});
	}

	fn start_refresh(self: &Arc<Self>) -> Result<(), SessionError> {
		let weak = Arc::downgrade(self);
		let tick: Tick = Arc::new(move || {
			let weak = weak.clone();
			async move {
				if let Some(inner) = weak.upgrade() {
					if let Err(error) = inner.revive().await {
						log::debug!("reopening channels skipped: {error}");
					}
					if let Err(error) = inner.load(true).await {
						log::debug!("silent refresh skipped: {error}");
					}
				}
			}
			.boxed()
		});
		// Started inside a commit so that a concurrent disposal stops it afterwards.
		self.commit(|_| self.scheduler.start(self.scheduler.interval(), tick))
	}

	async fn bootstrap(
		self: &Arc<Self>,
		previous: SessionState,
		status: Arc<dyn Status + Send + Sync>,
	) -> Result<BootstrapOutcome, SessionError> {
		self.commit(|snapshot| {
			snapshot.state = SessionState::Bootstrapping;
			snapshot.loading = true;
		})?;
		let context = self.context.clone();
		let outcome = self
			.detached(async move { context.bootstrapper().ensure_schema(status).await })
			.await?;

		if outcome.success {
			self.settle(outcome.status.clone()).await?;
		} else {
			log::error!("schema bootstrap failed: {}", outcome.detail);
			let state = if outcome.status.connected { previous } else { SessionState::Error };
			self.commit(|snapshot| {
				snapshot.state = state;
				snapshot.loading = false;
				snapshot.status = outcome.status.clone();
				snapshot.error = Some(outcome.detail.clone());
			})?;
		}
		Ok(outcome)
	}
}
