// SPDX-License-Identifier: GPL-3.0

//! Sync session error types.

use crate::session::SessionState;
use thiserror::Error;

/// Errors that can occur when driving a sync session.
#[derive(Debug, Error)]
pub enum SessionError {
	/// The session has been disposed and accepts no further operations.
	#[error("Session has been disposed")]
	Disposed,
	/// The requested transition is not available from the current state.
	#[error("Cannot {action} while {state:?}")]
	InvalidTransition {
		/// The attempted operation.
		action: &'static str,
		/// The state the session was in.
		state: SessionState,
	},
}
