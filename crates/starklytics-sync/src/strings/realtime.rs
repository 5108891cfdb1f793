// SPDX-License-Identifier: GPL-3.0

//! String constants for the realtime client.

/// Websocket endpoint path, relative to the backend base URL.
pub const WEBSOCKET_PATH: &str = "realtime/v1/websocket";
/// Protocol version advertised when connecting.
pub const PROTOCOL_VERSION: &str = "1.0.0";
/// Prefix of every channel topic.
pub const TOPIC_PREFIX: &str = "realtime:";
/// Topic used for connection-level heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";
/// Database schema whose changes are streamed.
pub const DEFAULT_SCHEMA: &str = "public";

/// Channel event names.
pub mod events {
	pub const JOIN: &str = "phx_join";
	pub const LEAVE: &str = "phx_leave";
	pub const REPLY: &str = "phx_reply";
	pub const ERROR: &str = "phx_error";
	pub const CLOSE: &str = "phx_close";
	pub const HEARTBEAT: &str = "heartbeat";
	pub const POSTGRES_CHANGES: &str = "postgres_changes";
	/// Subscribes to inserts, updates and deletes alike.
	pub const ALL_CHANGES: &str = "*";
}

/// Reply statuses.
pub mod status {
	pub const OK: &str = "ok";
}
