// SPDX-License-Identifier: GPL-3.0

use crate::{APP_USER_AGENT, retry::Retryable};
use bytes::Bytes;
use reqwest::{IntoUrl, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use std::{error::Error as _, ops::Deref, sync::Arc};
use thiserror::Error;
use tokio::sync::{AcquireError, Semaphore};

/// An API client for the hosted backend.
///
/// Every request carries the public API key both as the `apikey` header and as a bearer
/// token, and the number of requests in flight is bounded.
#[derive(Clone, Debug)]
pub struct ApiClient {
	client: reqwest::Client,
	permits: Arc<Semaphore>,
	api_key: Option<String>,
}

impl ApiClient {
	/// A new API Client.
	///
	/// # Arguments
	/// * `max_concurrent` - The maximum number of concurrent requests.
	/// * `api_key` - An optional API key. If provided, the client will include an `apikey`
	///   header and an `Authorization` header with the value `Bearer <api_key>`.
	pub fn new(max_concurrent: usize, api_key: Option<String>) -> Result<Self, Error> {
		let client = reqwest::Client::builder().user_agent(APP_USER_AGENT).build()?;
		Ok(Self { client, permits: Arc::new(Semaphore::new(max_concurrent.max(1))), api_key })
	}

	/// Sends a GET request to the provided URL.
	///
	/// # Arguments
	/// * `url` - The URL of the API endpoint to request.
	pub async fn get(&self, url: impl IntoUrl) -> Result<ApiResponse, Error> {
		self.send::<()>(Method::GET, url, None, &[]).await
	}

	/// Sends a POST request with a JSON body to the provided URL.
	///
	/// # Arguments
	/// * `url` - The URL of the API endpoint to request.
	/// * `body` - The request body, serialized as JSON.
	/// * `headers` - Additional headers to include.
	pub async fn post<B: Serialize + ?Sized>(
		&self,
		url: impl IntoUrl,
		body: &B,
		headers: &[(&str, &str)],
	) -> Result<ApiResponse, Error> {
		self.send(Method::POST, url, Some(body), headers).await
	}

	/// Sends a PATCH request with a JSON body to the provided URL.
	///
	/// # Arguments
	/// * `url` - The URL of the API endpoint to request.
	/// * `body` - The request body, serialized as JSON.
	/// * `headers` - Additional headers to include.
	pub async fn patch<B: Serialize + ?Sized>(
		&self,
		url: impl IntoUrl,
		body: &B,
		headers: &[(&str, &str)],
	) -> Result<ApiResponse, Error> {
		self.send(Method::PATCH, url, Some(body), headers).await
	}

	async fn send<B: Serialize + ?Sized>(
		&self,
		method: Method,
		url: impl IntoUrl,
		body: Option<&B>,
		headers: &[(&str, &str)],
	) -> Result<ApiResponse, Error> {
		let url = url.into_url()?;

		// Acquire a permit based on the concurrency control
		let _permit = self.permits.acquire().await?;

		let mut request = self.client.request(method.clone(), url.clone());
		if let Some(key) = &self.api_key {
			request = request.header("apikey", key).bearer_auth(key);
		}
		for (name, value) in headers {
			request = request.header(*name, *value);
		}
		if let Some(body) = body {
			request = request.json(body);
		}

		log::debug!("{method} {}", url.path());
		let response = request.send().await?;
		let status = response.status();

		if status == StatusCode::TOO_MANY_REQUESTS {
			let retry_after = response
				.headers()
				.get("retry-after")
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.parse::<u64>().ok());
			return Err(Error::RateLimited { retry_after });
		}

		let bytes = response.bytes().await?;
		if !status.is_success() {
			return Err(Error::Status {
				status: status.as_u16(),
				body: String::from_utf8_lossy(&bytes).into_owned(),
			});
		}
		Ok(ApiResponse(bytes))
	}
}

/// An API response.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse(Bytes);

impl ApiResponse {
	/// Attempts to deserialize the API response as JSON.
	pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
		serde_json::from_slice(&self.0).map_err(|e| e.into())
	}

	/// Whether the response has no body.
	pub fn is_empty(&self) -> bool {
		self.0.iter().all(|b| b.is_ascii_whitespace())
	}
}

impl Deref for ApiResponse {
	type Target = [u8];

	#[inline]
	fn deref(&self) -> &[u8] {
		self.0.deref()
	}
}

/// An error returned by the API client.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
	/// A decoding error occurred.
	#[error("Decoding error: {0}")]
	DecodeError(#[from] serde_json::Error),
	/// A HTTP error occurred.
	#[error("HTTP error: {0} caused by {:?}", reqwest::Error::source(.0))]
	HttpError(#[from] reqwest::Error),
	/// The server answered with a non-success status.
	#[error("Request failed with status {status}: {body}")]
	Status {
		/// The HTTP status code.
		status: u16,
		/// The response body, usually a JSON error object.
		body: String,
	},
	/// An API call failed due to rate limiting.
	#[error("Rate limited: retry after {retry_after:?}")]
	RateLimited {
		/// If present, the number of seconds to wait until retrying the request.
		retry_after: Option<u64>,
	},
	/// A synchronization error occurred.
	#[error("Synchronization error: {0}")]
	SynchronizationError(#[from] AcquireError),
}

impl Retryable for Error {
	fn is_retryable(&self) -> bool {
		match self {
			Error::DecodeError(_) | Error::SynchronizationError(_) => false,
			Error::Status { status, .. } => *status >= 500 || *status == 408,
			Error::HttpError(_) | Error::RateLimited { .. } => true,
		}
	}
}
