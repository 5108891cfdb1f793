// SPDX-License-Identifier: GPL-3.0

//! String constants for the REST backend.

/// Endpoint paths, relative to the backend base URL.
pub mod paths {
	/// Prefix for table endpoints.
	pub const TABLES: &str = "rest/v1/";
	/// Prefix for remote procedure endpoints.
	pub const RPC: &str = "rest/v1/rpc/";
}

/// Request headers and values.
pub mod headers {
	pub const PREFER: &str = "Prefer";
	/// Asks the server to echo the affected rows.
	pub const RETURN_REPRESENTATION: &str = "return=representation";
}

/// Query parameters understood by the REST interface.
pub mod params {
	pub const SELECT: &str = "select";
	pub const ORDER: &str = "order";
	pub const LIMIT: &str = "limit";
}

/// Error codes reported in REST error bodies.
pub mod error_codes {
	/// PostgreSQL `undefined_table`.
	pub const UNDEFINED_TABLE: &str = "42P01";
	/// PostgreSQL `undefined_function`.
	pub const UNDEFINED_FUNCTION: &str = "42883";
	/// Table missing from the REST schema cache.
	pub const TABLE_NOT_IN_SCHEMA_CACHE: &str = "PGRST205";
	/// Function missing from the REST schema cache.
	pub const FUNCTION_NOT_IN_SCHEMA_CACHE: &str = "PGRST202";
}

/// Message fragments used to classify errors without a code.
pub mod error_patterns {
	pub const DOES_NOT_EXIST: &str = "does not exist";
	pub const RELATION: &str = "relation";
	pub const FUNCTION: &str = "function";
}
