// SPDX-License-Identifier: GPL-3.0

//! In-memory backend for tests.
//!
//! [`MemoryBackend`] keeps tables as vectors of JSON rows and remote procedures as Rust
//! closures. Writes are pushed to matching change channels, just like a hosted instance
//! would. It also offers knobs to make the backend unreachable, fail reads of a table, or
//! delay every request, plus counters to observe what the sync layer did.

use super::{Backend, ChangeEvent, ChangeKind, ChangeStream, ChannelSpec, Filter, SelectQuery};
use crate::{
	collection::compare_values,
	error::BackendError,
	strings::schema::{functions, tables},
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};
use tokio::sync::mpsc;

/// Tables of a [`MemoryBackend`], keyed by name.
pub type Tables = HashMap<String, Vec<Value>>;

/// A remote procedure of a [`MemoryBackend`].
pub type Procedure = Arc<dyn Fn(&mut Tables, &Value) -> Result<Value, BackendError> + Send + Sync>;

const CHANNEL_BUFFER: usize = 64;

/// The data tables provisioned by [`MemoryBackend::starknet`]'s schema procedure.
const STARKNET_TABLES: [&str; 4] =
	[tables::BLOCKS, tables::TRANSACTIONS, tables::CONTRACTS, tables::TOKENS];

struct State {
	reachable: bool,
	tables: Tables,
	procedures: HashMap<String, Procedure>,
	// Procedures that must not run alongside reads.
	exclusive: HashSet<String>,
	// Remaining injected failures per table; `None` fails forever.
	failures: HashMap<String, Option<u32>>,
	channels: HashMap<String, (ChannelSpec, mpsc::Sender<ChangeEvent>)>,
	select_calls: HashMap<String, usize>,
	rpc_calls: HashMap<String, usize>,
	reads_in_flight: usize,
	exclusive_in_flight: usize,
	overlaps: usize,
}

/// An in-process [`Backend`].
pub struct MemoryBackend {
	state: Mutex<State>,
	latency: Duration,
}

impl Default for MemoryBackend {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryBackend {
	/// An empty, reachable backend without tables or procedures.
	pub fn new() -> Self {
		Self {
			state: Mutex::new(State {
				reachable: true,
				tables: Tables::new(),
				procedures: HashMap::new(),
				exclusive: HashSet::new(),
				failures: HashMap::new(),
				channels: HashMap::new(),
				select_calls: HashMap::new(),
				rpc_calls: HashMap::new(),
				reads_in_flight: 0,
				exclusive_in_flight: 0,
				overlaps: 0,
			}),
			latency: Duration::ZERO,
		}
	}

	/// A backend with the analytics helper procedures installed but no data tables.
	///
	/// - `check_starknet_functions_exist` returns `true`.
	/// - `check_starknet_tables_exist` returns the number of data tables present.
	/// - `create_starknet_tables` (re)creates the data tables with one seed row each. It is
	///   exclusive: reads running alongside it are counted by [`Self::overlaps`].
	pub fn starknet() -> Self {
		Self::new()
			.with_procedure(functions::CHECK_FUNCTIONS, |_, _| Ok(Value::Bool(true)))
			.with_procedure(functions::CHECK_TABLES, |tables, _| {
				let present = STARKNET_TABLES.iter().filter(|t| tables.contains_key(**t)).count();
				Ok(json!(present))
			})
			.with_procedure(functions::CREATE_TABLES, |tables, _| {
				for (table, seed) in STARKNET_TABLES.iter().zip(seed_rows()) {
					tables.insert(table.to_string(), vec![seed]);
				}
				Ok(Value::String("tables created".into()))
			})
			.exclusive(functions::CREATE_TABLES)
	}

	/// Delays every request by `latency`.
	pub fn with_latency(mut self, latency: Duration) -> Self {
		self.latency = latency;
		self
	}

	/// Adds (or replaces) a table.
	pub fn with_table(self, table: &str, rows: Vec<Value>) -> Self {
		self.state().tables.insert(table.to_string(), rows);
		self
	}

	/// Installs a remote procedure.
	pub fn with_procedure<F>(self, name: &str, procedure: F) -> Self
	where
		F: Fn(&mut Tables, &Value) -> Result<Value, BackendError> + Send + Sync + 'static,
	{
		self.state().procedures.insert(name.to_string(), Arc::new(procedure));
		self
	}

	/// Marks a procedure as one that must not run while tables are read.
	pub fn exclusive(self, name: &str) -> Self {
		self.state().exclusive.insert(name.to_string());
		self
	}

	/// Makes every request fail as if the backend could not be reached.
	pub fn set_reachable(&self, reachable: bool) {
		self.state().reachable = reachable;
	}

	/// Makes the next `times` reads of `table` fail with a server error, or all of them
	/// when `times` is `None`.
	pub fn fail_table(&self, table: &str, times: Option<u32>) {
		self.state().failures.insert(table.to_string(), times);
	}

	/// Stops failing reads of `table`.
	pub fn heal_table(&self, table: &str) {
		self.state().failures.remove(table);
	}

	/// Removes a table.
	pub fn drop_table(&self, table: &str) {
		self.state().tables.remove(table);
	}

	/// The current rows of a table.
	pub fn rows(&self, table: &str) -> Option<Vec<Value>> {
		self.state().tables.get(table).cloned()
	}

	/// Deletes all rows of `table` matching `filters` and notifies subscribers.
	pub fn delete(&self, table: &str, filters: &[Filter]) -> Vec<Value> {
		let mut state = self.state();
		let Some(rows) = state.tables.get_mut(table) else { return Vec::new() };
		let (deleted, kept): (Vec<_>, Vec<_>) =
			rows.drain(..).partition(|row| filters.iter().all(|f| f.matches(row)));
		*rows = kept;
		for row in &deleted {
			state.emit(ChangeKind::Delete, table, Value::Null, row.clone());
		}
		deleted
	}

	/// The number of reads issued against `table`.
	pub fn select_calls(&self, table: &str) -> usize {
		self.state().select_calls.get(table).copied().unwrap_or_default()
	}

	/// The number of calls issued to the remote procedure `name`.
	pub fn rpc_calls(&self, name: &str) -> usize {
		self.state().rpc_calls.get(name).copied().unwrap_or_default()
	}

	/// Ends every change stream, as a dropped realtime connection would.
	pub fn close_channels(&self) {
		self.state().channels.clear();
	}

	/// The names of the open change channels, sorted.
	pub fn active_channels(&self) -> Vec<String> {
		let mut state = self.state();
		state.channels.retain(|_, (_, events)| !events.is_closed());
		let mut names: Vec<_> = state.channels.keys().cloned().collect();
		names.sort();
		names
	}

	/// How often a read and an exclusive procedure were in flight at the same time.
	pub fn overlaps(&self) -> usize {
		self.state().overlaps
	}

	fn state(&self) -> MutexGuard<'_, State> {
		// A poisoned lock only means a test panicked while holding it.
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	async fn delay(&self) {
		if !self.latency.is_zero() {
			tokio::time::sleep(self.latency).await;
		}
	}
}

impl State {
	fn ensure_reachable(&self) -> Result<(), BackendError> {
		if self.reachable {
			Ok(())
		} else {
			Err(BackendError::Unreachable("connection refused".into()))
		}
	}

	fn emit(&mut self, kind: ChangeKind, table: &str, record: Value, old_record: Value) {
		let event = ChangeEvent { kind, table: table.to_string(), record, old_record };
		self.channels.retain(|_, (spec, events)| {
			if spec.table == table &&
				spec.filter.as_ref().is_none_or(|f| f.matches(event.row()))
			{
				// A full buffer drops the event, like a lagging realtime socket would.
				let _ = events.try_send(event.clone());
			}
			!events.is_closed()
		});
	}
}

#[async_trait]
impl Backend for MemoryBackend {
	async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>, BackendError> {
		{
			let mut state = self.state();
			state.ensure_reachable()?;
			*state.select_calls.entry(table.to_string()).or_default() += 1;
			state.reads_in_flight += 1;
			if state.exclusive_in_flight > 0 {
				state.overlaps += 1;
			}
		}
		self.delay().await;

		let mut state = self.state();
		state.reads_in_flight -= 1;
		if let Some(remaining) = state.failures.get_mut(table) {
			match remaining {
				None => return Err(BackendError::Http { status: 503, message: "injected".into() }),
				Some(0) => {},
				Some(n) => {
					*n -= 1;
					return Err(BackendError::Http { status: 503, message: "injected".into() });
				},
			}
		}
		let rows = state
			.tables
			.get(table)
			.ok_or_else(|| BackendError::RelationMissing(table.to_string()))?;
		let mut selected: Vec<Value> = rows
			.iter()
			.filter(|row| query.filters.iter().all(|f| f.matches(row)))
			.cloned()
			.collect();
		if let Some(order) = &query.order {
			selected.sort_by(|a, b| {
				let ordering = compare_values(&a[&order.column], &b[&order.column]);
				if order.descending { ordering.reverse() } else { ordering }
			});
		}
		if let Some(limit) = query.limit {
			selected.truncate(limit);
		}
		if let Some(columns) = query.columns.as_deref().filter(|c| *c != "*") {
			let wanted: Vec<&str> = columns.split(',').map(str::trim).collect();
			for row in selected.iter_mut() {
				if let Value::Object(fields) = row {
					fields.retain(|name, _| wanted.contains(&name.as_str()));
				}
			}
		}
		Ok(selected)
	}

	async fn insert(&self, table: &str, row: Value) -> Result<Vec<Value>, BackendError> {
		self.delay().await;
		let mut state = self.state();
		state.ensure_reachable()?;
		state
			.tables
			.get_mut(table)
			.ok_or_else(|| BackendError::RelationMissing(table.to_string()))?
			.push(row.clone());
		state.emit(ChangeKind::Insert, table, row.clone(), Value::Null);
		Ok(vec![row])
	}

	async fn update(
		&self,
		table: &str,
		filters: &[Filter],
		changes: Value,
	) -> Result<Vec<Value>, BackendError> {
		self.delay().await;
		let mut state = self.state();
		state.ensure_reachable()?;
		let rows = state
			.tables
			.get_mut(table)
			.ok_or_else(|| BackendError::RelationMissing(table.to_string()))?;
		let mut updated = Vec::new();
		for row in rows.iter_mut().filter(|row| filters.iter().all(|f| f.matches(row))) {
			let old = row.clone();
			if let (Value::Object(fields), Value::Object(new)) = (&mut *row, &changes) {
				for (name, value) in new {
					fields.insert(name.clone(), value.clone());
				}
			}
			updated.push((row.clone(), old));
		}
		for (row, old) in &updated {
			state.emit(ChangeKind::Update, table, row.clone(), old.clone());
		}
		Ok(updated.into_iter().map(|(row, _)| row).collect())
	}

	async fn rpc(&self, function: &str, params: Value) -> Result<Value, BackendError> {
		let exclusive = {
			let mut state = self.state();
			state.ensure_reachable()?;
			*state.rpc_calls.entry(function.to_string()).or_default() += 1;
			let exclusive = state.exclusive.contains(function);
			if exclusive {
				state.exclusive_in_flight += 1;
				if state.reads_in_flight > 0 {
					state.overlaps += 1;
				}
			}
			exclusive
		};
		self.delay().await;

		let mut state = self.state();
		if exclusive {
			state.exclusive_in_flight -= 1;
		}
		let procedure = state
			.procedures
			.get(function)
			.cloned()
			.ok_or_else(|| BackendError::FunctionMissing(function.to_string()))?;
		procedure(&mut state.tables, &params)
	}

	async fn subscribe(&self, channel: ChannelSpec) -> Result<ChangeStream, BackendError> {
		let mut state = self.state();
		state.ensure_reachable().map_err(|e| BackendError::Realtime(e.to_string()))?;
		state.channels.retain(|_, (_, events)| !events.is_closed());
		if state.channels.contains_key(&channel.name) {
			return Err(BackendError::Realtime(format!("channel {} already joined", channel.name)));
		}
		let (events, stream) = mpsc::channel(CHANNEL_BUFFER);
		state.channels.insert(channel.name.clone(), (channel, events));
		Ok(stream)
	}

	async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError> {
		self.state().channels.remove(channel);
		Ok(())
	}
}

fn seed_rows() -> [Value; 4] {
	[
		json!({
			"id": 1,
			"block_number": 1,
			"block_hash": "0x01",
			"timestamp": "2024-01-01T00:00:00Z",
			"transaction_count": 1,
		}),
		json!({
			"id": 1,
			"transaction_hash": "0x0a",
			"block_number": 1,
			"from_address": "0x0b",
			"to_address": "0x0c",
			"status": "ACCEPTED_ON_L2",
			"timestamp": "2024-01-01T00:00:00Z",
		}),
		json!({
			"id": 1,
			"address": "0x0c",
			"name": "Account",
			"created_at": "2024-01-01T00:00:00Z",
		}),
		json!({
			"id": 1,
			"address": "0x049d36570d4e46f48e99674bd3fcc84644ddd6b96f7c741b1562b82f9e004dc7",
			"symbol": "ETH",
			"name": "Ether",
			"decimals": 18,
			"created_at": "2024-01-01T00:00:00Z",
		}),
	]
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::{FilterOp, Order};

	fn backend() -> MemoryBackend {
		MemoryBackend::new().with_table(
			"blocks",
			vec![
				json!({ "id": 1, "block_number": 10, "miner": "a" }),
				json!({ "id": 2, "block_number": 30, "miner": "b" }),
				json!({ "id": 3, "block_number": 20, "miner": "a" }),
			],
		)
	}

	#[tokio::test]
	async fn select_filters_orders_and_limits() -> Result<(), BackendError> {
		let query = SelectQuery::new()
			.filter(Filter::new("block_number", FilterOp::Gte, 20))
			.order(Order::desc("block_number"))
			.limit(1)
			.columns("id");
		assert_eq!(backend().select("blocks", &query).await?, vec![json!({ "id": 2 })]);
		Ok(())
	}

	#[tokio::test]
	async fn select_from_missing_table_fails() {
		let result = MemoryBackend::new().select("blocks", &SelectQuery::new()).await;
		assert!(matches!(result, Err(BackendError::RelationMissing(_))));
	}

	#[tokio::test]
	async fn injected_failures_run_out() {
		let backend = backend();
		backend.fail_table("blocks", Some(1));
		assert!(backend.select("blocks", &SelectQuery::new()).await.is_err());
		assert!(backend.select("blocks", &SelectQuery::new()).await.is_ok());
		assert_eq!(backend.select_calls("blocks"), 2);
	}

	#[tokio::test]
	async fn unreachable_backend_fails_everything() {
		let backend = MemoryBackend::starknet();
		backend.set_reachable(false);
		assert!(matches!(
			backend.rpc(functions::CHECK_FUNCTIONS, json!({})).await,
			Err(BackendError::Unreachable(_))
		));
	}

	#[tokio::test]
	async fn starknet_procedures_provision_tables() -> Result<(), BackendError> {
		let backend = MemoryBackend::starknet();
		assert_eq!(backend.rpc(functions::CHECK_TABLES, json!({})).await?, json!(0));
		backend.rpc(functions::CREATE_TABLES, json!({})).await?;
		assert_eq!(backend.rpc(functions::CHECK_TABLES, json!({})).await?, json!(4));
		assert_eq!(backend.rows(tables::BLOCKS).map(|r| r.len()), Some(1));
		assert!(matches!(
			MemoryBackend::new().rpc(functions::CREATE_TABLES, json!({})).await,
			Err(BackendError::FunctionMissing(_))
		));
		Ok(())
	}

	#[tokio::test]
	async fn writes_reach_matching_channels() -> Result<(), BackendError> {
		let backend = MemoryBackend::new().with_table("notifications", vec![]);
		let mut mine = backend
			.subscribe(ChannelSpec {
				name: "mine".into(),
				schema: "public".into(),
				table: "notifications".into(),
				filter: Some(Filter::eq("user_id", "abc")),
			})
			.await?;

		backend.insert("notifications", json!({ "id": 1, "user_id": "other" })).await?;
		backend.insert("notifications", json!({ "id": 2, "user_id": "abc" })).await?;
		backend
			.update("notifications", &[Filter::eq("id", 2)], json!({ "read": true }))
			.await?;
		backend.delete("notifications", &[Filter::eq("id", 2)]);

		let insert = mine.recv().await.unwrap();
		assert_eq!((insert.kind, insert.record["id"].clone()), (ChangeKind::Insert, json!(2)));
		let update = mine.recv().await.unwrap();
		assert_eq!(update.kind, ChangeKind::Update);
		assert_eq!(update.record["read"], json!(true));
		assert_eq!(update.old_record.get("read"), None);
		assert_eq!(mine.recv().await.unwrap().kind, ChangeKind::Delete);
		assert!(mine.try_recv().is_err());
		Ok(())
	}

	#[tokio::test]
	async fn channels_are_unique_until_closed() -> Result<(), BackendError> {
		let backend = backend();
		let spec = ChannelSpec {
			name: "blocks-changes-1".into(),
			schema: "public".into(),
			table: "blocks".into(),
			filter: None,
		};
		let stream = backend.subscribe(spec.clone()).await?;
		assert!(backend.subscribe(spec.clone()).await.is_err());
		assert_eq!(backend.active_channels(), vec!["blocks-changes-1".to_string()]);

		drop(stream);
		assert!(backend.active_channels().is_empty());
		backend.subscribe(spec).await?;
		backend.unsubscribe("blocks-changes-1").await?;
		assert!(backend.active_channels().is_empty());
		Ok(())
	}

	#[tokio::test]
	async fn closing_channels_ends_streams() -> Result<(), BackendError> {
		let backend = backend();
		let mut stream = backend
			.subscribe(ChannelSpec {
				name: "blocks-changes-1".into(),
				schema: "public".into(),
				table: "blocks".into(),
				filter: None,
			})
			.await?;
		backend.close_channels();
		assert!(stream.recv().await.is_none());
		assert!(backend.active_channels().is_empty());
		Ok(())
	}

	#[tokio::test(start_paused = true)]
	async fn only_exclusive_procedures_count_as_overlaps() -> Result<(), BackendError> {
		let backend = MemoryBackend::starknet()
			.with_table("blocks", vec![])
			.with_latency(Duration::from_millis(10));
		let query = SelectQuery::new();
		let (read, check) = tokio::join!(
			backend.select("blocks", &query),
			backend.rpc(functions::CHECK_TABLES, json!({})),
		);
		read?;
		check?;
		assert_eq!(backend.overlaps(), 0);

		let (read, create) = tokio::join!(
			backend.select("blocks", &query),
			backend.rpc(functions::CREATE_TABLES, json!({})),
		);
		read?;
		create?;
		assert_eq!(backend.overlaps(), 1);
		Ok(())
	}
}
