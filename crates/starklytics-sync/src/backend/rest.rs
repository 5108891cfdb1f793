// SPDX-License-Identifier: GPL-3.0

//! REST backend for a hosted instance.
//!
//! Rows are read and written through the instance's REST interface (`rest/v1/<table>`),
//! remote procedures are invoked through `rest/v1/rpc/<function>` and change channels are
//! served by the shared [`RealtimeClient`]. Error bodies are classified so that callers can
//! tell a missing table or procedure apart from an unreachable backend.

use super::{Backend, ChangeStream, ChannelSpec, Filter, SelectQuery, realtime::RealtimeClient};
use crate::{
	SyncOptions,
	error::BackendError,
	strings::rest::{error_codes, error_patterns, headers, params, paths},
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use starklytics_common::{ApiClient, ApiResponse, BackendConfig, api};
use url::Url;

/// Error body returned by the REST interface.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
	code: Option<String>,
	message: Option<String>,
}

/// A [`Backend`] speaking to a hosted instance over HTTPS and websockets.
#[derive(Debug)]
pub struct RestBackend {
	config: BackendConfig,
	api: ApiClient,
	realtime: RealtimeClient,
}

impl RestBackend {
	/// Creates a backend client. No connection is made until the first request.
	///
	/// # Arguments
	/// * `config` - Where the instance lives and the public key to use.
	/// * `options` - Request concurrency and realtime heartbeat settings.
	pub fn new(config: BackendConfig, options: &SyncOptions) -> Result<Self, BackendError> {
		let api =
			ApiClient::new(options.max_concurrent_requests, Some(config.anon_key().to_string()))?;
		let realtime = RealtimeClient::new(&config, options.heartbeat_interval)?;
		Ok(Self { config, api, realtime })
	}

	/// Creates a backend client from the environment. See [`BackendConfig::from_env`].
	pub fn from_env(options: &SyncOptions) -> Result<Self, BackendError> {
		Self::new(BackendConfig::from_env()?, options)
	}

	/// The connection settings in use.
	pub fn config(&self) -> &BackendConfig {
		&self.config
	}

	fn table_url(&self, table: &str, filters: &[Filter]) -> Result<Url, BackendError> {
		let mut url = self.config.endpoint(&format!("{}{table}", paths::TABLES))?;
		if !filters.is_empty() {
			let mut query = url.query_pairs_mut();
			for filter in filters {
				query.append_pair(&filter.column, &filter.param_value());
			}
		}
		Ok(url)
	}

	fn rows(response: ApiResponse) -> Result<Vec<Value>, BackendError> {
		if response.is_empty() {
			return Ok(Vec::new());
		}
		Ok(response.json()?)
	}
}

#[async_trait]
impl Backend for RestBackend {
	async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>, BackendError> {
		let mut url = self.table_url(table, &query.filters)?;
		{
			let mut pairs = url.query_pairs_mut();
			pairs.append_pair(params::SELECT, query.columns.as_deref().unwrap_or("*"));
			if let Some(order) = &query.order {
				pairs.append_pair(params::ORDER, &order.param_value());
			}
			if let Some(limit) = query.limit {
				pairs.append_pair(params::LIMIT, &limit.to_string());
			}
		}
		let response = self.api.get(url).await.map_err(|e| classify(table, e))?;
		Self::rows(response)
	}

	async fn insert(&self, table: &str, row: Value) -> Result<Vec<Value>, BackendError> {
		let url = self.table_url(table, &[])?;
		let response = self
			.api
			.post(url, &row, &[(headers::PREFER, headers::RETURN_REPRESENTATION)])
			.await
			.map_err(|e| classify(table, e))?;
		Self::rows(response)
	}

	async fn update(
		&self,
		table: &str,
		filters: &[Filter],
		changes: Value,
	) -> Result<Vec<Value>, BackendError> {
		let url = self.table_url(table, filters)?;
		let response = self
			.api
			.patch(url, &changes, &[(headers::PREFER, headers::RETURN_REPRESENTATION)])
			.await
			.map_err(|e| classify(table, e))?;
		Self::rows(response)
	}

	async fn rpc(&self, function: &str, params: Value) -> Result<Value, BackendError> {
		let url = self.config.endpoint(&format!("{}{function}", paths::RPC))?;
		let response = self.api.post(url, &params, &[]).await.map_err(|e| classify(function, e))?;
		if response.is_empty() {
			return Ok(Value::Null);
		}
		Ok(response.json()?)
	}

	async fn subscribe(&self, channel: ChannelSpec) -> Result<ChangeStream, BackendError> {
		self.realtime.subscribe(channel).await
	}

	async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError> {
		self.realtime.unsubscribe(channel).await
	}
}

/// Maps a failed request against `target` (a table or procedure) to a [`BackendError`].
fn classify(target: &str, error: api::Error) -> BackendError {
	let api::Error::Status { status, body } = error else {
		return error.into();
	};
	let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
	match parsed.code.as_deref() {
		Some(error_codes::UNDEFINED_TABLE | error_codes::TABLE_NOT_IN_SCHEMA_CACHE) => {
			return BackendError::RelationMissing(target.to_string());
		},
		Some(error_codes::UNDEFINED_FUNCTION | error_codes::FUNCTION_NOT_IN_SCHEMA_CACHE) => {
			return BackendError::FunctionMissing(target.to_string());
		},
		_ => {},
	}
	let message = parsed.message.unwrap_or(body);
	let lower = message.to_lowercase();
	if lower.contains(error_patterns::DOES_NOT_EXIST) {
		if lower.contains(error_patterns::RELATION) {
			return BackendError::RelationMissing(target.to_string());
		}
		if lower.contains(error_patterns::FUNCTION) {
			return BackendError::FunctionMissing(target.to_string());
		}
	}
	BackendError::Http { status, message }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::{FilterOp, Order};
	use mockito::{Matcher, Server};
	use serde_json::json;
	use starklytics_common::Retryable;

	const KEY: &str = "<ANON_KEY>";

	fn backend(server: &Server) -> RestBackend {
		let config = BackendConfig::new(&server.url(), KEY).unwrap();
		RestBackend::new(config, &SyncOptions::default()).unwrap()
	}

	#[tokio::test]
	async fn select_encodes_query() -> Result<(), BackendError> {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("GET", "/rest/v1/notifications")
			.match_header("apikey", KEY)
			.match_header("Authorization", format!("Bearer {KEY}").as_str())
			.match_query(Matcher::AllOf(vec![
				Matcher::UrlEncoded("select".into(), "*".into()),
				Matcher::UrlEncoded("user_id".into(), "eq.abc".into()),
				Matcher::UrlEncoded("order".into(), "created_at.desc".into()),
				Matcher::UrlEncoded("limit".into(), "5".into()),
			]))
			.with_status(200)
			.with_body(r#"[{"id": 2}, {"id": 1}]"#)
			.create_async()
			.await;

		let query = SelectQuery::new()
			.filter(Filter::eq("user_id", "abc"))
			.order(Order::desc("created_at"))
			.limit(5);
		let rows = backend(&server).select("notifications", &query).await?;
		assert_eq!(rows, vec![json!({ "id": 2 }), json!({ "id": 1 })]);

		mock.assert_async().await;
		Ok(())
	}

	#[tokio::test]
	async fn select_from_missing_table_is_classified() {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("GET", "/rest/v1/starknet_blocks")
			.match_query(Matcher::Any)
			.with_status(404)
			.with_body(
				r#"{"code":"PGRST205","message":"Could not find the table 'public.starknet_blocks' in the schema cache"}"#,
			)
			.create_async()
			.await;

		let result = backend(&server).select("starknet_blocks", &SelectQuery::new()).await;
		assert!(matches!(result, Err(BackendError::RelationMissing(t)) if t == "starknet_blocks"));

		mock.assert_async().await;
	}

	#[tokio::test]
	async fn relation_message_without_code_is_classified() {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("GET", "/rest/v1/starknet_tokens")
			.match_query(Matcher::Any)
			.with_status(400)
			.with_body(r#"{"message":"relation \"public.starknet_tokens\" does not exist"}"#)
			.create_async()
			.await;

		let result = backend(&server).select("starknet_tokens", &SelectQuery::new()).await;
		assert!(matches!(result, Err(BackendError::RelationMissing(_))));

		mock.assert_async().await;
	}

	#[tokio::test]
	async fn rpc_returns_value() -> Result<(), BackendError> {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("POST", "/rest/v1/rpc/check_starknet_tables_exist")
			.match_body(Matcher::Json(json!({})))
			.with_status(200)
			.with_body("4")
			.create_async()
			.await;

		let count = backend(&server).rpc("check_starknet_tables_exist", json!({})).await?;
		assert_eq!(count, json!(4));

		mock.assert_async().await;
		Ok(())
	}

	#[tokio::test]
	async fn rpc_to_missing_function_is_classified() {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("POST", "/rest/v1/rpc/check_starknet_functions_exist")
			.with_status(404)
			.with_body(r#"{"code":"PGRST202","message":"Could not find the function"}"#)
			.create_async()
			.await;

		let result = backend(&server).rpc("check_starknet_functions_exist", json!({})).await;
		assert!(matches!(result, Err(BackendError::FunctionMissing(_))));

		mock.assert_async().await;
	}

	#[tokio::test]
	async fn rpc_without_body_returns_null() -> Result<(), BackendError> {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("POST", "/rest/v1/rpc/create_starknet_tables")
			.with_status(204)
			.create_async()
			.await;

		assert_eq!(backend(&server).rpc("create_starknet_tables", json!({})).await?, Value::Null);

		mock.assert_async().await;
		Ok(())
	}

	#[tokio::test]
	async fn unfiltered_table_urls_have_no_query() -> Result<(), BackendError> {
		let server = Server::new_async().await;
		let backend = backend(&server);
		let url = backend.table_url("hackathons", &[])?;
		assert_eq!(url.query(), None);
		assert!(!url.as_str().ends_with('?'));
		let url = backend.table_url("hackathons", &[Filter::eq("id", 1)])?;
		assert_eq!(url.query(), Some("id=eq.1"));
		Ok(())
	}

	#[tokio::test]
	async fn insert_requests_representation() -> Result<(), BackendError> {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("POST", "/rest/v1/hackathons")
			.match_header("Prefer", "return=representation")
			.match_body(Matcher::Json(json!({ "title": "Starknet Winter" })))
			.with_status(201)
			.with_body(r#"[{"id": 1, "title": "Starknet Winter"}]"#)
			.create_async()
			.await;

		let rows = backend(&server).insert("hackathons", json!({ "title": "Starknet Winter" })).await?;
		assert_eq!(rows[0]["id"], json!(1));

		mock.assert_async().await;
		Ok(())
	}

	#[tokio::test]
	async fn update_filters_rows() -> Result<(), BackendError> {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("PATCH", "/rest/v1/notifications")
			.match_query(Matcher::UrlEncoded("id".into(), "gte.3".into()))
			.match_body(Matcher::Json(json!({ "read": true })))
			.with_status(200)
			.with_body(r#"[{"id": 3, "read": true}]"#)
			.create_async()
			.await;

		let rows = backend(&server)
			.update("notifications", &[Filter::new("id", FilterOp::Gte, 3)], json!({ "read": true }))
			.await?;
		assert_eq!(rows.len(), 1);

		mock.assert_async().await;
		Ok(())
	}

	#[tokio::test]
	async fn server_errors_stay_retryable() {
		let mut server = Server::new_async().await;
		let mock = server
			.mock("GET", "/rest/v1/starknet_contracts")
			.match_query(Matcher::Any)
			.with_status(503)
			.with_body("upstream unavailable")
			.create_async()
			.await;

		let error = backend(&server)
			.select("starknet_contracts", &SelectQuery::new())
			.await
			.unwrap_err();
		assert!(matches!(&error, BackendError::Http { status: 503, message } if message == "upstream unavailable"));
		assert!(error.is_retryable());

		mock.assert_async().await;
	}

	#[tokio::test]
	async fn refused_connection_is_unreachable() {
		let config = BackendConfig::new("http://127.0.0.1:1", KEY).unwrap();
		let backend = RestBackend::new(config, &SyncOptions::default()).unwrap();
		let result = backend.select("starknet_blocks", &SelectQuery::new()).await;
		assert!(matches!(result, Err(BackendError::Unreachable(_))));
	}
}
