// SPDX-License-Identifier: GPL-3.0

//! Backend abstraction.
//!
//! The sync layer talks to its hosted database through the [`Backend`] trait: parameterized
//! row reads and writes, remote procedure calls and per-table change channels. The client is
//! constructed once and shared as an `Arc<dyn Backend>`, so that tests can swap in the
//! in-memory implementation.
//!
//! - [`rest::RestBackend`] - REST interface plus realtime websocket of a hosted instance.
//! - `memory::MemoryBackend` - In-process double, available with the `test-utils` feature.

use crate::error::BackendError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod realtime;
pub mod rest;

/// Stream of change events delivered by a channel.
///
/// The stream ends when the channel is closed, either locally or by the backend.
pub type ChangeStream = mpsc::Receiver<ChangeEvent>;

/// Comparison operators supported by row filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
	/// Equal.
	Eq,
	/// Not equal.
	Neq,
	/// Greater than.
	Gt,
	/// Greater than or equal.
	Gte,
	/// Less than.
	Lt,
	/// Less than or equal.
	Lte,
}

impl FilterOp {
	/// The operator's wire name.
	pub fn as_str(&self) -> &'static str {
		match self {
			FilterOp::Eq => "eq",
			FilterOp::Neq => "neq",
			FilterOp::Gt => "gt",
			FilterOp::Gte => "gte",
			FilterOp::Lt => "lt",
			FilterOp::Lte => "lte",
		}
	}
}

/// A single `column <op> value` row filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
	/// The filtered column.
	pub column: String,
	/// The comparison.
	pub op: FilterOp,
	/// The value compared against, in its textual form.
	pub value: String,
}

impl Filter {
	/// A new filter.
	pub fn new(column: impl Into<String>, op: FilterOp, value: impl ToString) -> Self {
		Self { column: column.into(), op, value: value.to_string() }
	}

	/// A filter matching rows whose `column` equals `value`.
	pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
		Self::new(column, FilterOp::Eq, value)
	}

	/// The filter as a query parameter value, e.g. `eq.42`.
	pub fn param_value(&self) -> String {
		format!("{}.{}", self.op.as_str(), self.value)
	}

	/// Whether `row` satisfies the filter.
	///
	/// Numbers are compared numerically, everything else by its textual form. Rows lacking
	/// the column never match.
	pub fn matches(&self, row: &Value) -> bool {
		use std::cmp::Ordering::*;
		let ordering = match row.get(&self.column) {
			Some(Value::Number(n)) => n
				.as_f64()
				.zip(self.value.parse::<f64>().ok())
				.and_then(|(field, value)| field.partial_cmp(&value)),
			Some(Value::String(s)) => Some(s.as_str().cmp(self.value.as_str())),
			Some(Value::Bool(b)) => Some(b.to_string().as_str().cmp(self.value.as_str())),
			Some(Value::Null) | Some(Value::Array(_)) | Some(Value::Object(_)) | None => None,
		};
		let Some(ordering) = ordering else { return false };
		match self.op {
			FilterOp::Eq => ordering == Equal,
			FilterOp::Neq => ordering != Equal,
			FilterOp::Gt => ordering == Greater,
			FilterOp::Gte => ordering != Less,
			FilterOp::Lt => ordering == Less,
			FilterOp::Lte => ordering != Greater,
		}
	}
}

/// Formats the filter the way change channels expect it, e.g. `user_id=eq.42`.
impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}={}", self.column, self.param_value())
	}
}

/// Ordering of a selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
	/// The column to sort by.
	pub column: String,
	/// Whether to sort largest first.
	pub descending: bool,
}

impl Order {
	/// Most recent (largest) values first.
	pub fn desc(column: impl Into<String>) -> Self {
		Self { column: column.into(), descending: true }
	}

	/// Smallest values first.
	pub fn asc(column: impl Into<String>) -> Self {
		Self { column: column.into(), descending: false }
	}

	/// The order as a query parameter value, e.g. `block_number.desc`.
	pub fn param_value(&self) -> String {
		format!("{}.{}", self.column, if self.descending { "desc" } else { "asc" })
	}
}

/// A parameterized row selection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectQuery {
	/// The selected columns; all columns when `None`.
	pub columns: Option<String>,
	/// Filters all selected rows must satisfy.
	pub filters: Vec<Filter>,
	/// The ordering of the result.
	pub order: Option<Order>,
	/// The maximum number of rows returned.
	pub limit: Option<usize>,
}

impl SelectQuery {
	/// A selection of all columns of all rows.
	pub fn new() -> Self {
		Self::default()
	}

	/// Restricts the selected columns, e.g. `"id"` or `"id,block_number"`.
	pub fn columns(mut self, columns: impl Into<String>) -> Self {
		self.columns = Some(columns.into());
		self
	}

	/// Adds a filter.
	pub fn filter(mut self, filter: Filter) -> Self {
		self.filters.push(filter);
		self
	}

	/// Sets the ordering.
	pub fn order(mut self, order: Order) -> Self {
		self.order = Some(order);
		self
	}

	/// Limits the number of returned rows.
	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}
}

/// The kind of row change a channel reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
	/// A row was inserted.
	Insert,
	/// A row was updated.
	Update,
	/// A row was deleted.
	Delete,
}

impl ChangeKind {
	/// Parses the kind from its wire name (`INSERT`, `UPDATE` or `DELETE`).
	pub fn parse(name: &str) -> Option<Self> {
		match name.to_ascii_uppercase().as_str() {
			"INSERT" => Some(ChangeKind::Insert),
			"UPDATE" => Some(ChangeKind::Update),
			"DELETE" => Some(ChangeKind::Delete),
			_ => None,
		}
	}
}

/// A row change pushed by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
	/// What happened to the row.
	pub kind: ChangeKind,
	/// The table the row belongs to.
	pub table: String,
	/// The row after the change. `Null` for deletions.
	pub record: Value,
	/// The row before the change, when the backend reports it.
	pub old_record: Value,
}

impl ChangeEvent {
	/// The row the event is about: the new record, or the old one for deletions.
	pub fn row(&self) -> &Value {
		match self.kind {
			ChangeKind::Delete => &self.old_record,
			ChangeKind::Insert | ChangeKind::Update => &self.record,
		}
	}
}

/// Describes a change channel to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
	/// The channel name. Must be unique among open channels.
	pub name: String,
	/// The database schema of the table.
	pub schema: String,
	/// The table whose changes are streamed.
	pub table: String,
	/// An optional server-side filter on the changed rows.
	pub filter: Option<Filter>,
}

/// A hosted relational database, as seen by the sync layer.
#[async_trait]
pub trait Backend: Send + Sync {
	/// Selects rows from a table.
	///
	/// # Arguments
	/// * `table` - The table to read.
	/// * `query` - Columns, filters, ordering and limit of the selection.
	async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>, BackendError>;

	/// Inserts a row, returning the stored row(s).
	///
	/// # Arguments
	/// * `table` - The table to write.
	/// * `row` - The row, as a JSON object.
	async fn insert(&self, table: &str, row: Value) -> Result<Vec<Value>, BackendError>;

	/// Updates all rows matching `filters`, returning the updated rows.
	///
	/// # Arguments
	/// * `table` - The table to write.
	/// * `filters` - Selects the rows to update.
	/// * `changes` - The columns to set, as a JSON object.
	async fn update(
		&self,
		table: &str,
		filters: &[Filter],
		changes: Value,
	) -> Result<Vec<Value>, BackendError>;

	/// Invokes a remote procedure.
	///
	/// # Arguments
	/// * `function` - The procedure name.
	/// * `params` - Named arguments, as a JSON object.
	async fn rpc(&self, function: &str, params: Value) -> Result<Value, BackendError>;

	/// Opens a change channel.
	async fn subscribe(&self, channel: ChannelSpec) -> Result<ChangeStream, BackendError>;

	/// Closes a change channel. Closing an unknown channel is not an error.
	async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError>;
}
