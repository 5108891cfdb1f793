// SPDX-License-Identifier: GPL-3.0

pub mod api;
pub mod config;
pub mod errors;
pub mod retry;
pub mod status;

pub use api::{ApiClient, ApiResponse};
pub use config::BackendConfig;
pub use errors::Error;
pub use retry::{RetryPolicy, RetryState, Retryable, backoff_delay, with_retry};
pub use status::Status;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
