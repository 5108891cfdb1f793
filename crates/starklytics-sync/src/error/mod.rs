// SPDX-License-Identifier: GPL-3.0

//! Error types for sync operations.
//!
//! This module contains all error types used throughout the `starklytics-sync` crate,
//! organized by context:
//!
//! - [`backend::BackendError`] - Errors from backend reads, writes, procedures and channels.
//! - [`ConfigError`] - Missing or malformed backend settings.
//! - [`fetch::FetchError`] - Errors from batched collection fetches.
//! - [`session::SessionError`] - Errors from driving a sync session.

pub mod backend;
pub mod fetch;
pub mod session;

pub use backend::BackendError;
pub use fetch::FetchError;
pub use session::SessionError;
pub use starklytics_common::Error as ConfigError;
