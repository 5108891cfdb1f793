// SPDX-License-Identifier: GPL-3.0

//! Liveness gating and subscription ownership.
//!
//! A [`LifecycleGuard`] sits between asynchronous work and the state it updates. Once
//! disposed it refuses every commit, cancels pending continuations and has closed every
//! subscription it owned. It also owns the resource to subscription table, so that a
//! resource never has more than one open channel.

use crate::subscriber::SubscriptionHandle;
use futures::future::join_all;
use std::{
	collections::HashMap,
	future::Future,
	sync::{Mutex, MutexGuard},
};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

struct Slot<S> {
	mounted: bool,
	state: S,
}

/// Guards state of type `S` against updates after disposal.
pub struct LifecycleGuard<S> {
	slot: Mutex<Slot<S>>,
	cancelled: CancellationToken,
	handles: AsyncMutex<HashMap<String, SubscriptionHandle>>,
}

impl<S> LifecycleGuard<S> {
	/// A mounted guard around `state`.
	pub fn new(state: S) -> Self {
		Self {
			slot: Mutex::new(Slot { mounted: true, state }),
			cancelled: CancellationToken::new(),
			handles: AsyncMutex::new(HashMap::new()),
		}
	}

	/// Whether the guard still accepts commits.
	pub fn is_mounted(&self) -> bool {
		self.slot().mounted
	}

	/// Applies `update` to the state, unless the guard has been disposed.
	///
	/// Returns `None` when the update was discarded.
	pub fn commit<R>(&self, update: impl FnOnce(&mut S) -> R) -> Option<R> {
		let mut slot = self.slot();
		if !slot.mounted {
			return None;
		}
		Some(update(&mut slot.state))
	}

	/// Reads the state. Works after disposal too.
	pub fn read<R>(&self, read: impl FnOnce(&S) -> R) -> R {
		read(&self.slot().state)
	}

	/// Runs `work` until it completes or the guard is disposed, whichever comes first.
	///
	/// Returns `None` if the guard was disposed before or during `work`.
	pub async fn run<F: Future>(&self, work: F) -> Option<F::Output> {
		if !self.is_mounted() {
			return None;
		}
		tokio::select! {
			_ = self.cancelled.cancelled() => None,
			output = work => Some(output),
		}
	}

	/// Replaces the subscription of `resource`.
	///
	/// The previous handle, if any, is closed before `establish` opens the new one. Returns
	/// `Ok(false)` without calling `establish` if the guard has been disposed.
	pub async fn replace<E, F, Fut>(&self, resource: &str, establish: F) -> Result<bool, E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<SubscriptionHandle, E>>,
	{
		let mut handles = self.handles.lock().await;
		if !self.is_mounted() {
			return Ok(false);
		}
		if let Some(previous) = handles.remove(resource) {
			if let Err(error) = previous.unsubscribe().await {
				log::warn!("failed to close the previous {resource} channel: {error}");
			}
		}
		let handle = establish().await?;
		handles.insert(resource.to_string(), handle);
		Ok(true)
	}

	/// Closes the subscription of `resource`. Returns whether there was one.
	pub async fn release(&self, resource: &str) -> bool {
		let Some(handle) = self.handles.lock().await.remove(resource) else {
			return false;
		};
		if let Err(error) = handle.unsubscribe().await {
			log::warn!("failed to close the {resource} channel: {error}");
		}
		true
	}

	/// The resources whose subscription still delivers events, sorted.
	pub async fn active_resources(&self) -> Vec<String> {
		let handles = self.handles.lock().await;
		let mut resources: Vec<_> = handles
			.iter()
			.filter(|(_, handle)| handle.is_active())
			.map(|(resource, _)| resource.clone())
			.collect();
		resources.sort();
		resources
	}

	/// Forgets subscriptions whose channel was closed by the backend and returns their
	/// resources, sorted.
	pub async fn prune_inactive(&self) -> Vec<String> {
		let mut handles = self.handles.lock().await;
		let mut closed: Vec<_> = handles
			.iter()
			.filter(|(_, handle)| !handle.is_active())
			.map(|(resource, _)| resource.clone())
			.collect();
		closed.sort();
		for resource in &closed {
			handles.remove(resource);
		}
		closed
	}

	/// Disposes the guard.
	///
	/// `last` is applied to the state as the final commit, atomically with marking the guard
	/// unmounted. Then pending continuations are cancelled and every subscription is closed.
	/// Returns `false` if the guard was already disposed.
	pub async fn dispose(&self, last: impl FnOnce(&mut S)) -> bool {
		{
			let mut slot = self.slot();
			if !slot.mounted {
				return false;
			}
			last(&mut slot.state);
			slot.mounted = false;
		}
		self.cancelled.cancel();

		let handles: Vec<_> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
		for result in join_all(handles.into_iter().map(SubscriptionHandle::unsubscribe)).await {
			if let Err(error) = result {
				log::warn!("failed to close a channel while disposing: {error}");
			}
		}
		true
	}

	fn slot(&self) -> MutexGuard<'_, Slot<S>> {
		self.slot.lock().unwrap_or_else(|e| e.into_inner())
	}
}
