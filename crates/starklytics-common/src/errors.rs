// SPDX-License-Identifier: GPL-3.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing environment variable: one of {0:?} must be set")]
	MissingVariable(&'static [&'static str]),
	#[error("ParseError error: {0}")]
	ParseError(#[from] url::ParseError),
	#[error("Unsupported URL scheme: {0}")]
	UnsupportedScheme(String),
}
