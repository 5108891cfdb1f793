// SPDX-License-Identifier: GPL-3.0

//! Live change channels per resource.
//!
//! Each subscription opens one channel on the resource's table and forwards its events to a
//! callback from a background task. Channel names are `<resource>-changes-<n>`, where `n`
//! comes from a counter owned by the [`ChangeSubscriber`], so that sessions mounted side by
//! side never collide and names are reproducible.

use crate::{
	backend::{Backend, ChangeEvent, ChannelSpec},
	collection::ResourceSpec,
	error::BackendError,
	strings::realtime::DEFAULT_SCHEMA,
};
use std::sync::{
	Arc,
	atomic::{AtomicU64, Ordering},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens change channels with unique names.
pub struct ChangeSubscriber {
	backend: Arc<dyn Backend>,
	next_id: AtomicU64,
}

impl ChangeSubscriber {
	/// Creates a subscriber whose channel counter starts at 1.
	pub fn new(backend: Arc<dyn Backend>) -> Self {
		Self { backend, next_id: AtomicU64::new(1) }
	}

	/// Reserves the next channel name for `resource`.
	pub fn channel_name(&self, resource: &str) -> String {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		format!("{resource}-changes-{id}")
	}

	/// Opens a channel on the table of `spec` and calls `on_change` for every event.
	///
	/// The channel is filtered server-side with the resource's equality filter, if any.
	///
	/// # Arguments
	/// * `spec` - The resource to follow.
	/// * `on_change` - Receives each change. Runs on a background task.
	pub async fn subscribe<F>(
		&self,
		spec: &ResourceSpec,
		on_change: F,
	) -> Result<SubscriptionHandle, BackendError>
	where
		F: Fn(ChangeEvent) + Send + Sync + 'static,
	{
		let channel = self.channel_name(&spec.name);
		let mut stream = self
			.backend
			.subscribe(ChannelSpec {
				name: channel.clone(),
				schema: DEFAULT_SCHEMA.to_string(),
				table: spec.table.clone(),
				filter: spec.channel_filter(),
			})
			.await?;
		log::debug!("subscribed to {} as {channel}", spec.table);

		let token = CancellationToken::new();
		let cancelled = token.clone();
		let name = channel.clone();
		let task = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = cancelled.cancelled() => break,
					event = stream.recv() => match event {
						Some(event) => on_change(event),
						None => {
							log::warn!("{name} was closed by the backend");
							break;
						},
					},
				}
			}
		});

		Ok(SubscriptionHandle {
			resource: spec.name.clone(),
			channel,
			backend: self.backend.clone(),
			token,
			task,
			closed: false,
		})
	}
}

/// One open change channel.
///
/// Call [`unsubscribe`](Self::unsubscribe) to close it. Dropping the handle stops event
/// delivery and closes the channel in the background.
pub struct SubscriptionHandle {
	resource: String,
	channel: String,
	backend: Arc<dyn Backend>,
	token: CancellationToken,
	task: JoinHandle<()>,
	closed: bool,
}

impl SubscriptionHandle {
	/// The resource the channel follows.
	pub fn resource(&self) -> &str {
		&self.resource
	}

	/// The channel name.
	pub fn channel(&self) -> &str {
		&self.channel
	}

	/// Whether events are still being delivered.
	pub fn is_active(&self) -> bool {
		!self.task.is_finished()
	}

	/// Stops event delivery and closes the channel on the backend.
	pub async fn unsubscribe(mut self) -> Result<(), BackendError> {
		self.closed = true;
		self.token.cancel();
		self.task.abort();
		log::debug!("unsubscribing from {}", self.channel);
		self.backend.unsubscribe(&self.channel).await
	}
}

impl Drop for SubscriptionHandle {
	fn drop(&mut self) {
		self.token.cancel();
		if self.closed {
			return;
		}
		if let Ok(runtime) = tokio::runtime::Handle::try_current() {
			let backend = self.backend.clone();
			let channel = std::mem::take(&mut self.channel);
			runtime.spawn(async move {
				if let Err(error) = backend.unsubscribe(&channel).await {
					log::warn!("failed to close {channel}: {error}");
				}
			});
		}
	}
}
