// SPDX-License-Identifier: GPL-3.0

//! Connection and schema probing.
//!
//! A probe answers three questions in order: can the backend be reached, are the helper
//! procedures installed, and do the data tables exist. The answer is a fresh
//! [`ConnectionStatus`] on every call. Probing never fails; problems are reported through
//! the status instead.

use crate::{
	backend::{Backend, SelectQuery},
	error::BackendError,
	schema::SchemaSpec,
};
use futures::future::join_all;
use serde_json::{Value, json};
use starklytics_common::{RetryPolicy, with_retry};
use std::sync::Arc;

/// The next provisioning step a backend needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetupStep {
	/// The helper procedures must be installed.
	#[default]
	Functions,
	/// The data tables must be created.
	Tables,
	/// Nothing is missing.
	Complete,
}

/// The outcome of a probe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
	/// Whether the backend answered.
	pub connected: bool,
	/// Whether every data table exists.
	pub schema_ready: bool,
	/// Whether the helper procedures are installed.
	pub functions_ready: bool,
	/// Why the probe could not complete, if it could not.
	pub error_detail: Option<String>,
	/// What to provision next.
	pub setup_step: SetupStep,
}

impl ConnectionStatus {
	fn disconnected(error: BackendError) -> Self {
		Self { error_detail: Some(error.to_string()), ..Default::default() }
	}
}

/// Checks backend reachability and schema presence.
#[derive(Clone)]
pub struct ConnectionProbe {
	backend: Arc<dyn Backend>,
	schema: SchemaSpec,
	retry: RetryPolicy,
}

impl ConnectionProbe {
	/// Creates a probe.
	///
	/// # Arguments
	/// * `backend` - The backend to probe.
	/// * `schema` - The procedures and tables expected to exist.
	/// * `retry` - Retry bounds for each request.
	pub fn new(backend: Arc<dyn Backend>, schema: SchemaSpec, retry: RetryPolicy) -> Self {
		Self { backend, schema, retry }
	}

	/// The expected schema.
	pub fn schema(&self) -> &SchemaSpec {
		&self.schema
	}

	/// Probes the backend.
	pub async fn probe(&self) -> ConnectionStatus {
		match self.check().await {
			Ok(status) => {
				log::debug!("probe finished: {status:?}");
				status
			},
			Err(error) => {
				log::warn!("backend probe failed: {error}");
				ConnectionStatus::disconnected(error)
			},
		}
	}

	async fn check(&self) -> Result<ConnectionStatus, BackendError> {
		self.check_reachable().await?;
		let functions_ready = match &self.schema.check_functions {
			Some(function) => self.check_functions(function).await?,
			None => true,
		};
		let schema_ready = match (&self.schema.check_tables, functions_ready) {
			(Some(function), true) => self.count_tables(function).await?,
			_ => self.check_tables_directly().await?,
		};
		let setup_step = match (functions_ready, schema_ready) {
			(false, _) => SetupStep::Functions,
			(true, false) => SetupStep::Tables,
			(true, true) => SetupStep::Complete,
		};
		Ok(ConnectionStatus {
			connected: true,
			schema_ready,
			functions_ready,
			error_detail: None,
			setup_step,
		})
	}

	/// A one-row read. A missing table still proves the backend answered.
	async fn check_reachable(&self) -> Result<(), BackendError> {
		let table = self.schema.probe_table();
		let query = SelectQuery::new().limit(1);
		match with_retry(&self.retry, "reachability check", || self.backend.select(table, &query)).await {
			Ok(_) => Ok(()),
			Err(error) if error.proves_connectivity() => Ok(()),
			Err(error) => Err(error),
		}
	}

	async fn check_functions(&self, function: &str) -> Result<bool, BackendError> {
		match with_retry(&self.retry, function, || self.backend.rpc(function, json!({}))).await {
			Ok(value) => Ok(truthy(&value)),
			Err(BackendError::FunctionMissing(_)) => Ok(false),
			Err(error) => Err(error),
		}
	}

	/// Asks the helper procedure how many data tables exist.
	async fn count_tables(&self, function: &str) -> Result<bool, BackendError> {
		match with_retry(&self.retry, function, || self.backend.rpc(function, json!({}))).await {
			Ok(value) => {
				let expected = self.schema.expected_tables() as u64;
				let present = count(&value);
				match present {
					Some(present) => log::debug!("{present}/{expected} data tables present"),
					None => log::warn!("{function} returned {value}, expected a table count"),
				}
				Ok(present == Some(expected))
			},
			Err(BackendError::FunctionMissing(_)) => Ok(false),
			Err(error) => Err(error),
		}
	}

	/// Reads one row of every table, for backends without helper procedures.
	async fn check_tables_directly(&self) -> Result<bool, BackendError> {
		let query = SelectQuery::new().limit(1);
		let results = join_all(
			self.schema.tables.iter().map(|table| self.backend.select(table, &query)),
		)
		.await;
		let mut present = true;
		for result in results {
			match result {
				Ok(_) => {},
				Err(BackendError::RelationMissing(_)) => present = false,
				Err(error) => return Err(error),
			}
		}
		Ok(present)
	}
}

fn truthy(value: &Value) -> bool {
	match value {
		Value::Bool(b) => *b,
		Value::String(s) => s.eq_ignore_ascii_case("true"),
		Value::Number(n) => n.as_u64().is_some_and(|n| n > 0),
		_ => false,
	}
}

fn count(value: &Value) -> Option<u64> {
	match value {
		Value::Number(n) => n.as_u64(),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}
