// SPDX-License-Identifier: GPL-3.0

//! Table and remote procedure names of the analytics schema.

/// Data tables.
pub mod tables {
	pub const BLOCKS: &str = "starknet_blocks";
	pub const TRANSACTIONS: &str = "starknet_transactions";
	pub const CONTRACTS: &str = "starknet_contracts";
	pub const TOKENS: &str = "starknet_tokens";
	pub const HACKATHONS: &str = "hackathons";
	pub const NOTIFICATIONS: &str = "notifications";
}

/// Helper functions installed alongside the tables.
pub mod functions {
	/// Returns `true` once the helper functions are installed.
	pub const CHECK_FUNCTIONS: &str = "check_starknet_functions_exist";
	/// Returns the number of data tables present.
	pub const CHECK_TABLES: &str = "check_starknet_tables_exist";
	/// Drops and recreates the data tables, their indexes and seed rows.
	pub const CREATE_TABLES: &str = "create_starknet_tables";
}

/// Columns shared by several tables.
pub mod columns {
	pub const ID: &str = "id";
	pub const BLOCK_NUMBER: &str = "block_number";
	pub const TIMESTAMP: &str = "timestamp";
	pub const CREATED_AT: &str = "created_at";
	pub const START_DATE: &str = "start_date";
	pub const USER_ID: &str = "user_id";
}
