// SPDX-License-Identifier: GPL-3.0

//! Resource collections and their descriptions.
//!
//! A [`ResourceSpec`] describes what to load for one resource: the table, the filters, the
//! recency ordering and a row limit. A [`ResourceCollection`] holds the loaded rows and
//! applies local deltas from change channels while preserving that ordering.

use crate::{
	backend::{ChangeEvent, ChangeKind, Filter, FilterOp, Order, SelectQuery},
	strings::schema::columns,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cmp::Ordering;

/// Describes one resource collection of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceSpec {
	/// The resource name. Unique within a session.
	pub name: String,
	/// The backing table.
	pub table: String,
	/// The column holding each row's unique identifier.
	pub key: String,
	/// The recency ordering of the collection.
	pub order: Option<Order>,
	/// The maximum number of rows kept.
	pub limit: Option<usize>,
	/// Server-side filters on the rows.
	pub filters: Vec<Filter>,
	/// Whether to keep the collection up to date through a change channel.
	pub live: bool,
}

impl ResourceSpec {
	/// A live resource over all rows of `table`, keyed by `id`.
	pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			table: table.into(),
			key: columns::ID.to_string(),
			order: None,
			limit: None,
			filters: Vec::new(),
			live: true,
		}
	}

	/// Sets the identifier column.
	pub fn key(mut self, key: impl Into<String>) -> Self {
		self.key = key.into();
		self
	}

	/// Orders the collection by `column`, most recent (largest) first.
	pub fn newest_first(mut self, column: impl Into<String>) -> Self {
		self.order = Some(Order::desc(column));
		self
	}

	/// Sets the ordering.
	pub fn order(mut self, order: Order) -> Self {
		self.order = Some(order);
		self
	}

	/// Keeps at most `limit` rows.
	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}

	/// Adds a server-side filter.
	pub fn filter(mut self, filter: Filter) -> Self {
		self.filters.push(filter);
		self
	}

	/// Enables or disables the change channel.
	pub fn live(mut self, live: bool) -> Self {
		self.live = live;
		self
	}

	/// The selection loading this resource.
	pub fn select_query(&self) -> SelectQuery {
		SelectQuery {
			columns: None,
			filters: self.filters.clone(),
			order: self.order.clone(),
			limit: self.limit,
		}
	}

	/// The filter applied to the change channel.
	///
	/// Channels accept a single filter, so the first equality filter is used.
	pub fn channel_filter(&self) -> Option<Filter> {
		self.filters.iter().find(|f| f.op == FilterOp::Eq).cloned()
	}
}

/// The loaded rows of one resource, in recency order.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceCollection {
	name: String,
	key: String,
	order: Option<Order>,
	limit: Option<usize>,
	rows: Vec<Value>,
}

impl ResourceCollection {
	/// An empty collection for `spec`.
	pub fn new(spec: &ResourceSpec) -> Self {
		Self {
			name: spec.name.clone(),
			key: spec.key.clone(),
			order: spec.order.clone(),
			limit: spec.limit,
			rows: Vec::new(),
		}
	}

	/// The resource name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The rows, in recency order.
	pub fn rows(&self) -> &[Value] {
		&self.rows
	}

	/// The number of rows held.
	pub fn len(&self) -> usize {
		self.rows.len()
	}

	/// Whether no rows are held.
	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	/// The row with identifier `id`.
	pub fn get(&self, id: &Value) -> Option<&Value> {
		self.position(id).map(|i| &self.rows[i])
	}

	/// Swaps in a freshly loaded set of rows.
	pub fn replace(&mut self, rows: Vec<Value>) {
		self.rows = rows;
		self.sort();
		self.truncate();
	}

	/// Inserts `row`, or replaces the row with the same identifier in place.
	///
	/// Returns `true` when the row was new.
	pub fn upsert(&mut self, row: Value) -> bool {
		let existing = row.get(&self.key).and_then(|id| self.position(id));
		match existing {
			Some(index) => {
				let reorder = self.order.as_ref().is_some_and(|order| {
					compare_values(&self.rows[index][&order.column], &row[&order.column]) !=
						Ordering::Equal
				});
				self.rows[index] = row;
				if reorder {
					self.sort();
				}
				false
			},
			None => {
				let index = self
					.rows
					.iter()
					.position(|other| self.compare(&row, other) != Ordering::Greater)
					.unwrap_or(self.rows.len());
				self.rows.insert(index, row);
				self.truncate();
				true
			},
		}
	}

	/// Removes the row with identifier `id`.
	pub fn remove(&mut self, id: &Value) -> Option<Value> {
		self.position(id).map(|i| self.rows.remove(i))
	}

	/// Applies a pushed change.
	pub fn apply(&mut self, event: &ChangeEvent) {
		match event.kind {
			ChangeKind::Insert | ChangeKind::Update => {
				self.upsert(event.record.clone());
			},
			ChangeKind::Delete => {
				if let Some(id) = event.old_record.get(&self.key) {
					self.remove(id);
				}
			},
		}
	}

	/// Decodes every row into a typed model.
	pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, serde_json::Error> {
		self.rows.iter().map(|row| serde_json::from_value(row.clone())).collect()
	}

	fn position(&self, id: &Value) -> Option<usize> {
		self.rows.iter().position(|row| row.get(&self.key) == Some(id))
	}

	/// Compares two rows in display order. Without an ordering every row is equal, so new
	/// rows are prepended.
	fn compare(&self, a: &Value, b: &Value) -> Ordering {
		match &self.order {
			Some(order) => {
				let ordering = compare_values(&a[&order.column], &b[&order.column]);
				if order.descending { ordering.reverse() } else { ordering }
			},
			None => Ordering::Equal,
		}
	}

	fn sort(&mut self) {
		if self.order.is_some() {
			let mut rows = std::mem::take(&mut self.rows);
			rows.sort_by(|a, b| self.compare(a, b));
			self.rows = rows;
		}
	}

	fn truncate(&mut self) {
		if let Some(limit) = self.limit {
			self.rows.truncate(limit);
		}
	}
}

/// Orders JSON values: numbers numerically, strings lexicographically, `null` first.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
	match (a, b) {
		(Value::Number(a), Value::Number(b)) => a
			.as_f64()
			.zip(b.as_f64())
			.and_then(|(a, b)| a.partial_cmp(&b))
			.unwrap_or(Ordering::Equal),
		(Value::String(a), Value::String(b)) => a.cmp(b),
		(Value::Null, Value::Null) => Ordering::Equal,
		(Value::Null, _) => Ordering::Less,
		(_, Value::Null) => Ordering::Greater,
		(a, b) => a.to_string().cmp(&b.to_string()),
	}
}
