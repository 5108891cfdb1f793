// SPDX-License-Identifier: GPL-3.0

//! Backend error types.

use starklytics_common::{Retryable, api};
use thiserror::Error;

/// Errors that can occur when talking to the backend.
#[derive(Debug, Error)]
pub enum BackendError {
	/// The requested table does not exist. The backend answered, so it is reachable.
	#[error("Relation does not exist: {0}")]
	RelationMissing(String),
	/// The requested remote procedure does not exist.
	#[error("Function does not exist: {0}")]
	FunctionMissing(String),
	/// The backend could not be reached at all.
	#[error("Backend unreachable: {0}")]
	Unreachable(String),
	/// The backend answered with an error status.
	#[error("Request failed with status {status}: {message}")]
	Http {
		/// The HTTP status code.
		status: u16,
		/// The error message reported by the backend.
		message: String,
	},
	/// The backend answered with something that could not be interpreted.
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	/// A realtime channel could not be joined or used.
	#[error("Realtime error: {0}")]
	Realtime(String),
	/// The client could not be configured.
	#[error("Configuration error: {0}")]
	Config(#[from] starklytics_common::Error),
}

impl BackendError {
	/// Whether the error shows that the backend is reachable even though the request failed.
	pub fn proves_connectivity(&self) -> bool {
		matches!(self, BackendError::RelationMissing(_) | BackendError::FunctionMissing(_))
	}
}

impl Retryable for BackendError {
	fn is_retryable(&self) -> bool {
		match self {
			BackendError::Unreachable(_) | BackendError::Realtime(_) => true,
			BackendError::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
			BackendError::RelationMissing(_) |
			BackendError::FunctionMissing(_) |
			BackendError::InvalidResponse(_) |
			BackendError::Config(_) => false,
		}
	}
}

impl From<api::Error> for BackendError {
	fn from(error: api::Error) -> Self {
		match error {
			api::Error::HttpError(e) => BackendError::Unreachable(e.to_string()),
			api::Error::DecodeError(e) => BackendError::InvalidResponse(e.to_string()),
			api::Error::Status { status, body } => BackendError::Http { status, message: body },
			api::Error::RateLimited { retry_after } => BackendError::Http {
				status: 429,
				message: format!("rate limited, retry after {retry_after:?}s"),
			},
			api::Error::SynchronizationError(e) => BackendError::Unreachable(e.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_schema_is_not_retried() {
		assert!(!BackendError::RelationMissing("blocks".into()).is_retryable());
		assert!(!BackendError::FunctionMissing("check".into()).is_retryable());
	}

	#[test]
	fn transient_failures_are_retried() {
		assert!(BackendError::Unreachable("reset".into()).is_retryable());
		assert!(BackendError::Http { status: 503, message: String::new() }.is_retryable());
		assert!(!BackendError::Http { status: 401, message: String::new() }.is_retryable());
	}

	#[test]
	fn missing_schema_proves_connectivity() {
		assert!(BackendError::RelationMissing("blocks".into()).proves_connectivity());
		assert!(!BackendError::Unreachable("refused".into()).proves_connectivity());
	}

	#[test]
	fn status_errors_convert_to_http() {
		let error: BackendError =
			api::Error::Status { status: 500, body: "boom".into() }.into();
		assert!(matches!(error, BackendError::Http { status: 500, message } if message == "boom"));
	}
}
