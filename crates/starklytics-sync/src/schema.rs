// SPDX-License-Identifier: GPL-3.0

//! The server-side schema a session depends on.

use crate::strings::schema::{functions, tables};

/// Names the data tables and helper procedures of a schema.
///
/// Helper procedures are optional. Without them, tables are checked by reading each one
/// and the schema cannot be provisioned from the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaSpec {
	/// The data tables. The first one is read to check reachability.
	pub tables: Vec<String>,
	/// Procedure returning `true` once the helper procedures are installed.
	pub check_functions: Option<String>,
	/// Procedure returning the number of data tables present.
	pub check_tables: Option<String>,
	/// Procedure dropping and recreating the data tables, their indexes and seed rows.
	pub create_tables: Option<String>,
}

impl SchemaSpec {
	/// The Starknet analytics schema.
	pub fn starknet() -> Self {
		Self {
			tables: [tables::BLOCKS, tables::TRANSACTIONS, tables::CONTRACTS, tables::TOKENS]
				.map(String::from)
				.to_vec(),
			check_functions: Some(functions::CHECK_FUNCTIONS.into()),
			check_tables: Some(functions::CHECK_TABLES.into()),
			create_tables: Some(functions::CREATE_TABLES.into()),
		}
	}

	/// A schema of plain tables, without helper procedures.
	pub fn tables_only<I, T>(tables: I) -> Self
	where
		I: IntoIterator<Item = T>,
		T: Into<String>,
	{
		Self {
			tables: tables.into_iter().map(Into::into).collect(),
			check_functions: None,
			check_tables: None,
			create_tables: None,
		}
	}

	/// The number of data tables a complete schema has.
	pub fn expected_tables(&self) -> usize {
		self.tables.len()
	}

	/// The table read to check reachability.
	pub fn probe_table(&self) -> &str {
		self.tables.first().map_or(tables::BLOCKS, String::as_str)
	}
}

impl Default for SchemaSpec {
	fn default() -> Self {
		Self::starknet()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tables_only_schema_has_no_procedures() {
		let schema = SchemaSpec::tables_only([tables::NOTIFICATIONS]);
		assert_eq!(schema.probe_table(), "notifications");
		assert_eq!(schema.expected_tables(), 1);
		assert_eq!((schema.check_functions, schema.check_tables, schema.create_tables), (None, None, None));
	}
}
