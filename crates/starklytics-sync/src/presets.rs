// SPDX-License-Identifier: GPL-3.0

//! Resource sets of the dashboard views.

use crate::{
	backend::Filter,
	collection::ResourceSpec,
	schema::SchemaSpec,
	strings::schema::{columns, tables},
};

/// Rows loaded per Starknet resource unless stated otherwise.
pub const DEFAULT_STARKNET_LIMIT: usize = 20;
/// Notifications loaded per user.
pub const DEFAULT_NOTIFICATION_LIMIT: usize = 50;

/// Latest blocks, transactions, contracts and tokens.
///
/// # Arguments
/// * `limit` - The number of rows kept per resource.
pub fn starknet_resources(limit: usize) -> Vec<ResourceSpec> {
	vec![
		ResourceSpec::new("blocks", tables::BLOCKS).newest_first(columns::BLOCK_NUMBER).limit(limit),
		ResourceSpec::new("transactions", tables::TRANSACTIONS)
			.newest_first(columns::TIMESTAMP)
			.limit(limit),
		ResourceSpec::new("contracts", tables::CONTRACTS)
			.newest_first(columns::CREATED_AT)
			.limit(limit),
		ResourceSpec::new("tokens", tables::TOKENS).newest_first(columns::CREATED_AT).limit(limit),
	]
}

/// The schema behind [`starknet_resources`], provisioned by its helper procedures.
pub fn starknet_schema() -> SchemaSpec {
	SchemaSpec::starknet()
}

/// Every hackathon, latest start first.
pub fn hackathon_resources() -> Vec<ResourceSpec> {
	vec![ResourceSpec::new("hackathons", tables::HACKATHONS).newest_first(columns::START_DATE)]
}

/// The schema behind [`hackathon_resources`].
pub fn hackathon_schema() -> SchemaSpec {
	SchemaSpec::tables_only([tables::HACKATHONS])
}

/// The notifications of `user_id`, newest first.
///
/// The change channel is filtered server-side, so other users' notifications never reach the
/// session.
pub fn notification_resources(user_id: &str, limit: usize) -> Vec<ResourceSpec> {
	vec![
		ResourceSpec::new("notifications", tables::NOTIFICATIONS)
			.filter(Filter::eq(columns::USER_ID, user_id))
			.newest_first(columns::CREATED_AT)
			.limit(limit),
	]
}

/// The schema behind [`notification_resources`].
pub fn notification_schema() -> SchemaSpec {
	SchemaSpec::tables_only([tables::NOTIFICATIONS])
}
