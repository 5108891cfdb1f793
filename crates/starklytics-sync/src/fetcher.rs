// SPDX-License-Identifier: GPL-3.0

//! Batched collection loading.
//!
//! [`DataFetcher::fetch_all`] loads every requested resource concurrently and waits for all
//! of them, so one slow or failing resource never blocks or fails its siblings. Failed
//! resources fall back to the rows of their last successful load.

use crate::{
	backend::Backend,
	collection::ResourceSpec,
	error::{BackendError, FetchError},
};
use futures::future::join_all;
use serde_json::Value;
use starklytics_common::{RetryPolicy, with_retry};
use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};
use tokio::sync::RwLock;

/// The outcome of a batched fetch in which at least one resource succeeded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchResults {
	/// Rows per resource. Failed resources map to their cached rows, or `None` if they were
	/// never loaded.
	pub results: HashMap<String, Option<Vec<Value>>>,
	/// The resources that failed.
	pub failures: Vec<String>,
}

impl FetchResults {
	/// The rows of `resource`, fresh or cached.
	pub fn rows(&self, resource: &str) -> Option<&[Value]> {
		self.results.get(resource)?.as_deref()
	}

	/// Whether some resources failed.
	pub fn is_partial(&self) -> bool {
		!self.failures.is_empty()
	}
}

/// Loads resource collections, keeping the last good rows of each.
pub struct DataFetcher {
	backend: Arc<dyn Backend>,
	retry: RetryPolicy,
	gate: Arc<RwLock<()>>,
	cache: Mutex<HashMap<String, Vec<Value>>>,
}

impl DataFetcher {
	/// Creates a fetcher with an empty cache.
	///
	/// # Arguments
	/// * `backend` - The backend to read from.
	/// * `retry` - Retry bounds for each resource.
	/// * `gate` - The schema gate; held shared while fetching.
	pub fn new(backend: Arc<dyn Backend>, retry: RetryPolicy, gate: Arc<RwLock<()>>) -> Self {
		Self { backend, retry, gate, cache: Mutex::new(HashMap::new()) }
	}

	/// Loads every resource in `specs`.
	///
	/// Fails only when every resource failed. A table that does not exist yields an empty
	/// collection.
	pub async fn fetch_all(&self, specs: &[ResourceSpec]) -> Result<FetchResults, FetchError> {
		if specs.is_empty() {
			return Ok(FetchResults::default());
		}
		let outcomes = {
			let _shared = self.gate.read().await;
			join_all(specs.iter().map(|spec| self.fetch(spec))).await
		};

		let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
		let mut results = FetchResults::default();
		let mut failures = Vec::new();
		for (spec, outcome) in specs.iter().zip(outcomes) {
			match outcome {
				Ok(rows) => {
					cache.insert(spec.name.clone(), rows.clone());
					results.results.insert(spec.name.clone(), Some(rows));
				},
				Err(error) => {
					log::warn!("fetching {} failed, keeping cached rows: {error}", spec.name);
					results.results.insert(spec.name.clone(), cache.get(&spec.name).cloned());
					results.failures.push(spec.name.clone());
					failures.push((spec.name.clone(), error.to_string()));
				},
			}
		}
		if failures.len() == specs.len() {
			return Err(FetchError::AllFailed { failures });
		}
		Ok(results)
	}

	/// The cached rows of `resource`.
	pub fn cached(&self, resource: &str) -> Option<Vec<Value>> {
		self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(resource).cloned()
	}

	async fn fetch(&self, spec: &ResourceSpec) -> Result<Vec<Value>, BackendError> {
		let query = spec.select_query();
		let label = format!("fetching {}", spec.name);
		match with_retry(&self.retry, &label, || self.backend.select(&spec.table, &query)).await {
			Err(BackendError::RelationMissing(table)) => {
				log::debug!("{table} does not exist yet, treating it as empty");
				Ok(Vec::new())
			},
			outcome => outcome,
		}
	}
}
