// SPDX-License-Identifier: GPL-3.0

//! Batched fetch error types.

use thiserror::Error;

/// Errors that can occur when fetching several resource collections at once.
#[derive(Debug, Error)]
pub enum FetchError {
	/// Every requested resource failed. Partial failures are not errors.
	#[error("All {} resource fetches failed: {}", .failures.len(), summarize(.failures))]
	AllFailed {
		/// The failing resources with their error messages.
		failures: Vec<(String, String)>,
	},
}

fn summarize(failures: &[(String, String)]) -> String {
	failures
		.iter()
		.map(|(name, error)| format!("{name}: {error}"))
		.collect::<Vec<_>>()
		.join("; ")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn all_failed_lists_every_resource() {
		let error = FetchError::AllFailed {
			failures: vec![
				("blocks".into(), "timeout".into()),
				("tokens".into(), "reset".into()),
			],
		};
		assert_eq!(
			error.to_string(),
			"All 2 resource fetches failed: blocks: timeout; tokens: reset"
		);
	}
}
