// SPDX-License-Identifier: GPL-3.0

/// Trait for observing progress of long-running backend operations, such as schema
/// provisioning.
pub trait Status {
	/// Update the observer with the provided `status`.
	fn update(&self, status: &str);
}

impl Status for () {
	// no-op: status updates are ignored
	fn update(&self, _: &str) {}
}

impl<F: Fn(&str)> Status for F {
	fn update(&self, status: &str) {
		self(status)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	#[test]
	fn closures_observe_updates() {
		let seen = Mutex::new(Vec::new());
		let observer = |status: &str| seen.lock().unwrap().push(status.to_string());
		observer.update("probing");
		observer.update("creating tables");
		assert_eq!(*seen.lock().unwrap(), vec!["probing", "creating tables"]);
	}

	#[test]
	fn unit_ignores_updates() {
		().update("ignored");
	}
}
