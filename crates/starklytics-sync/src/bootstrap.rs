// SPDX-License-Identifier: GPL-3.0

//! Schema provisioning.
//!
//! Creating the data tables is destructive: the provisioning procedure drops and recreates
//! them along with their indexes and seed rows. Two rules follow:
//!
//! - Only one bootstrap runs at a time. Callers arriving while one is in progress join it and
//!   receive its outcome.
//! - No fetch overlaps a bootstrap. Fetches hold the shared side of the schema gate, the
//!   bootstrap takes the exclusive side around the procedure call.

use crate::{
	backend::Backend,
	probe::{ConnectionProbe, ConnectionStatus, SetupStep},
};
use futures::{
	FutureExt,
	future::{BoxFuture, Shared},
};
use serde_json::json;
use starklytics_common::{RetryPolicy, Status, with_retry};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

type Flight = Shared<BoxFuture<'static, BootstrapOutcome>>;

/// The result of a bootstrap attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapOutcome {
	/// Whether the schema is complete afterwards.
	pub success: bool,
	/// A human readable summary.
	pub detail: String,
	/// The last probe taken during the attempt.
	pub status: ConnectionStatus,
}

impl BootstrapOutcome {
	fn failure(detail: impl Into<String>, status: ConnectionStatus) -> Self {
		Self { success: false, detail: detail.into(), status }
	}
}

/// Provisions the data tables through the schema's creation procedure.
pub struct SchemaBootstrapper {
	backend: Arc<dyn Backend>,
	probe: ConnectionProbe,
	retry: RetryPolicy,
	gate: Arc<RwLock<()>>,
	flight: Mutex<Option<Flight>>,
}

impl SchemaBootstrapper {
	/// Creates a bootstrapper.
	///
	/// # Arguments
	/// * `backend` - The backend to provision.
	/// * `probe` - Verifies preconditions and the result.
	/// * `retry` - Retry bounds for the creation procedure.
	/// * `gate` - The schema gate shared with every fetcher.
	pub fn new(
		backend: Arc<dyn Backend>,
		probe: ConnectionProbe,
		retry: RetryPolicy,
		gate: Arc<RwLock<()>>,
	) -> Self {
		Self { backend, probe, retry, gate, flight: Mutex::new(None) }
	}

	/// Whether a bootstrap is in progress.
	pub fn in_progress(&self) -> bool {
		self.slot().is_some()
	}

	/// Makes sure the data tables exist, creating them if needed.
	///
	/// Requires the helper procedures to be installed. When another bootstrap is already in
	/// progress, waits for it instead of starting a new one; only the caller that started the
	/// attempt receives progress updates.
	///
	/// # Arguments
	/// * `status` - Observer receiving progress updates.
	pub async fn ensure_schema(&self, status: Arc<dyn Status + Send + Sync>) -> BootstrapOutcome {
		let flight = {
			let mut slot = self.slot();
			match slot.as_ref() {
				Some(flight) => {
					log::debug!("joining the bootstrap in progress");
					flight.clone()
				},
				None => {
					let flight = bootstrap(
						self.backend.clone(),
						self.probe.clone(),
						self.retry,
						self.gate.clone(),
						status,
					)
					.boxed()
					.shared();
					*slot = Some(flight.clone());
					flight
				},
			}
		};

		let outcome = flight.clone().await;
		let mut slot = self.slot();
		if slot.as_ref().is_some_and(|current| current.ptr_eq(&flight)) {
			*slot = None;
		}
		outcome
	}

	fn slot(&self) -> std::sync::MutexGuard<'_, Option<Flight>> {
		self.flight.lock().unwrap_or_else(|e| e.into_inner())
	}
}

async fn bootstrap(
	backend: Arc<dyn Backend>,
	probe: ConnectionProbe,
	retry: RetryPolicy,
	gate: Arc<RwLock<()>>,
	status: Arc<dyn Status + Send + Sync>,
) -> BootstrapOutcome {
	let schema = probe.schema();
	let Some(function) = schema.create_tables.as_deref() else {
		return BootstrapOutcome::failure(
			"No provisioning procedure is configured for this schema",
			probe.probe().await,
		);
	};

	status.update("Checking helper functions...");
	let before = probe.probe().await;
	if !before.connected {
		let detail = before.error_detail.clone().unwrap_or_else(|| "backend unreachable".into());
		return BootstrapOutcome::failure(detail, before);
	}
	if !before.functions_ready {
		return BootstrapOutcome::failure(
			"Helper functions are missing; install them before creating tables",
			before,
		);
	}

	status.update("Creating tables...");
	{
		let _exclusive = gate.write().await;
		if let Err(error) =
			with_retry(&retry, function, || backend.rpc(function, json!({}))).await
		{
			log::error!("schema bootstrap failed: {error}");
			return BootstrapOutcome::failure(format!("Failed to create tables: {error}"), before);
		}
	}

	status.update("Verifying tables...");
	let after = probe.probe().await;
	if after.schema_ready && after.setup_step == SetupStep::Complete {
		let detail = format!("Created {} tables", schema.expected_tables());
		status.update(&detail);
		log::debug!("{detail}");
		BootstrapOutcome { success: true, detail, status: after }
	} else {
		let detail = format!(
			"Expected {} tables after bootstrap: {}",
			schema.expected_tables(),
			after.error_detail.as_deref().unwrap_or("some are still missing")
		);
		log::error!("{detail}");
		BootstrapOutcome::failure(detail, after)
	}
}
