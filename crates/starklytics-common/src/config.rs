// SPDX-License-Identifier: GPL-3.0

//! Backend connection settings.
//!
//! The backend is addressed by two values: its base URL and a public (anonymous) API key.
//! Both are read once at startup, and their absence is a fatal configuration error.

use crate::Error;
use std::{env, fmt};
use url::Url;

/// Environment variables holding the backend base URL, in order of precedence.
pub const URL_VARIABLES: &[&str] = &["SUPABASE_URL", "NEXT_PUBLIC_SUPABASE_URL"];
/// Environment variables holding the public API key, in order of precedence.
pub const KEY_VARIABLES: &[&str] = &["SUPABASE_ANON_KEY", "NEXT_PUBLIC_SUPABASE_ANON_KEY"];

/// Connection settings for the hosted backend.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendConfig {
	url: Url,
	anon_key: String,
}

impl BackendConfig {
	/// Creates a new configuration.
	///
	/// # Arguments
	/// * `url` - The base URL of the backend, e.g. `https://project.supabase.co`.
	/// * `anon_key` - The public API key sent with every request.
	pub fn new(url: &str, anon_key: impl Into<String>) -> Result<Self, Error> {
		let mut url = Url::parse(url)?;
		match url.scheme() {
			"http" | "https" => {},
			scheme => return Err(Error::UnsupportedScheme(scheme.to_string())),
		}
		// Endpoints are resolved relative to the base, which must therefore be a directory.
		if !url.path().ends_with('/') {
			let path = format!("{}/", url.path());
			url.set_path(&path);
		}
		let anon_key = anon_key.into();
		if anon_key.trim().is_empty() {
			return Err(Error::Config("the API key must not be empty".into()));
		}
		Ok(Self { url, anon_key })
	}

	/// Reads the configuration from the environment.
	///
	/// See [`URL_VARIABLES`] and [`KEY_VARIABLES`] for the recognised variable names.
	pub fn from_env() -> Result<Self, Error> {
		let url = first_present(URL_VARIABLES).ok_or(Error::MissingVariable(URL_VARIABLES))?;
		let key = first_present(KEY_VARIABLES).ok_or(Error::MissingVariable(KEY_VARIABLES))?;
		Self::new(&url, key)
	}

	/// The base URL of the backend.
	pub fn url(&self) -> &Url {
		&self.url
	}

	/// The public API key.
	pub fn anon_key(&self) -> &str {
		&self.anon_key
	}

	/// Resolves an endpoint path against the base URL.
	///
	/// # Arguments
	/// * `path` - A relative path such as `rest/v1/blocks`.
	pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
		Ok(self.url.join(path.trim_start_matches('/'))?)
	}

	/// Resolves a websocket endpoint, swapping `http(s)` for `ws(s)`.
	///
	/// # Arguments
	/// * `path` - A relative path such as `realtime/v1/websocket`.
	pub fn websocket_endpoint(&self, path: &str) -> Result<Url, Error> {
		let mut url = self.endpoint(path)?;
		let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
		url.set_scheme(scheme)
			.map_err(|_| Error::UnsupportedScheme(url.scheme().to_string()))?;
		Ok(url)
	}
}

// The API key is kept out of debug output.
impl fmt::Debug for BackendConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BackendConfig")
			.field("url", &self.url.as_str())
			.field("anon_key", &"<redacted>")
			.finish()
	}
}

fn first_present(names: &[&str]) -> Option<String> {
	names
		.iter()
		.filter_map(|name| env::var(name).ok())
		.find(|value| !value.trim().is_empty())
}
