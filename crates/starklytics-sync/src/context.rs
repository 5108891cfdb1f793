// SPDX-License-Identifier: GPL-3.0

//! Process-wide sync state.

use crate::{
	SyncOptions, backend::Backend, bootstrap::SchemaBootstrapper, fetcher::DataFetcher,
	probe::ConnectionProbe, subscriber::ChangeSubscriber,
};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Everything sessions share: the backend client, the options, the single-flight schema
/// bootstrapper and the channel name counter.
///
/// Build one per process (or per isolated backend) and hand it to every
/// [`SyncSession`](crate::SyncSession).
pub struct SyncContext {
	backend: Arc<dyn Backend>,
	options: SyncOptions,
	probe: ConnectionProbe,
	bootstrapper: SchemaBootstrapper,
	subscriber: ChangeSubscriber,
	// Fetches hold the shared side, bootstraps the exclusive side.
	schema_gate: Arc<RwLock<()>>,
}

impl SyncContext {
	/// Creates the shared state.
	///
	/// # Arguments
	/// * `backend` - The backend client.
	/// * `options` - Retry, refresh and schema settings.
	pub fn new(backend: Arc<dyn Backend>, options: SyncOptions) -> Arc<Self> {
		let schema_gate = Arc::new(RwLock::new(()));
		let probe = ConnectionProbe::new(backend.clone(), options.schema.clone(), options.retry);
		let bootstrapper = SchemaBootstrapper::new(
			backend.clone(),
			probe.clone(),
			options.retry,
			schema_gate.clone(),
		);
		let subscriber = ChangeSubscriber::new(backend.clone());
		Arc::new(Self { backend, options, probe, bootstrapper, subscriber, schema_gate })
	}

	/// The backend client.
	pub fn backend(&self) -> &Arc<dyn Backend> {
		&self.backend
	}

	/// The sync options.
	pub fn options(&self) -> &SyncOptions {
		&self.options
	}

	/// The connection probe.
	pub fn probe(&self) -> &ConnectionProbe {
		&self.probe
	}

	/// The schema bootstrapper, single-flight across all sessions of this context.
	pub fn bootstrapper(&self) -> &SchemaBootstrapper {
		&self.bootstrapper
	}

	/// The change subscriber, whose counter keeps channel names unique.
	pub fn subscriber(&self) -> &ChangeSubscriber {
		&self.subscriber
	}

	/// A new fetcher with an empty cache, serialized against schema bootstraps.
	pub fn fetcher(&self) -> DataFetcher {
		DataFetcher::new(self.backend.clone(), self.options.retry, self.schema_gate.clone())
	}
}
