// SPDX-License-Identifier: GPL-3.0

//! Row types of the analytics tables.
//!
//! Collections hold raw JSON rows; these types are the typed view obtained through
//! [`ResourceCollection::decode`](crate::ResourceCollection::decode). Columns that may be
//! absent or null are optional.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Block {
	pub id: i64,
	pub block_number: u64,
	pub block_hash: String,
	#[serde(default)]
	pub parent_hash: Option<String>,
	pub timestamp: String,
	#[serde(default)]
	pub transaction_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Transaction {
	pub id: i64,
	pub transaction_hash: String,
	pub block_number: u64,
	#[serde(default)]
	pub from_address: Option<String>,
	#[serde(default)]
	pub to_address: Option<String>,
	#[serde(default)]
	pub status: Option<String>,
	pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Contract {
	pub id: i64,
	pub address: String,
	#[serde(default)]
	pub name: Option<String>,
	pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Token {
	pub id: i64,
	pub address: String,
	pub symbol: String,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub decimals: u8,
	pub created_at: String,
}

/// A hackathon listing.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Hackathon {
	pub id: String,
	pub title: String,
	#[serde(default)]
	pub description: Option<String>,
	pub start_date: String,
	#[serde(default)]
	pub end_date: Option<String>,
	#[serde(default)]
	pub prize_pool: Option<String>,
	#[serde(default)]
	pub status: Option<String>,
}

/// A notification addressed to one user.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Notification {
	pub id: String,
	pub user_id: String,
	pub title: String,
	#[serde(default)]
	pub message: Option<String>,
	/// Whether the user has seen it.
	#[serde(default)]
	pub read: bool,
	pub created_at: String,
}
