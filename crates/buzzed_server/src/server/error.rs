#![forbid(unsafe_code)]

use buzzed_protocol::ServerEvent;
use thiserror::Error;

use crate::store::StoreError;

/// Why a client command was refused.
///
/// Everything except infrastructure failures is the client's problem and is
/// answered with `command_error`; infrastructure failures get `error`.
#[derive(Debug, Error)]
pub enum CommandError {
	#[error("{0}")]
	Validation(String),

	#[error("{0}")]
	Unauthorized(String),

	#[error("{0}")]
	Conflict(String),

	#[error("{0}")]
	NotFound(String),

	#[error("{0}")]
	RateLimited(String),

	#[error("{message}")]
	Store {
		message: String,
		#[source]
		source: StoreError,
	},

	#[error("{message}")]
	Internal {
		message: String,
		#[source]
		source: anyhow::Error,
	},
}

impl CommandError {
	pub fn kind(&self) -> &'static str {
		match self {
			CommandError::Validation(_) => "validation",
			CommandError::Unauthorized(_) => "unauthorized",
			CommandError::Conflict(_) => "conflict",
			CommandError::NotFound(_) => "not_found",
			CommandError::RateLimited(_) => "rate_limited",
			CommandError::Store { .. } => "store",
			CommandError::Internal { .. } => "internal",
		}
	}

	pub fn is_infrastructure(&self) -> bool {
		matches!(self, CommandError::Store { .. } | CommandError::Internal { .. })
	}

	pub fn into_event(self) -> ServerEvent {
		if self.is_infrastructure() {
			ServerEvent::error(self.to_string())
		} else {
			ServerEvent::command_error(self.to_string())
		}
	}
}

/// Turns store failures into the `error` reply a handler wants to show.
pub trait StoreContext<T> {
	fn or_fail(self, message: &str) -> Result<T, CommandError>;
}

impl<T> StoreContext<T> for Result<T, StoreError> {
	fn or_fail(self, message: &str) -> Result<T, CommandError> {
		self.map_err(|source| CommandError::Store {
			message: message.to_string(),
			source,
		})
	}
}

impl<T> StoreContext<T> for anyhow::Result<T> {
	fn or_fail(self, message: &str) -> Result<T, CommandError> {
		self.map_err(|source| CommandError::Internal {
			message: message.to_string(),
			source,
		})
	}
}

#[cfg(test)]
mod tests {
	use anyhow::anyhow;

	use super::*;

	#[test]
	fn client_errors_become_command_error() {
		let ev = CommandError::Conflict("Username \"bob\" is already registered.".into()).into_event();
		match ev {
			ServerEvent::CommandError(body) => assert_eq!(body.message, "Username \"bob\" is already registered."),
			other => panic!("expected command_error, got: {other:?}"),
		}
	}

	#[test]
	fn store_failures_become_error() {
		let res: Result<(), StoreError> = Err(StoreError::Backend(anyhow!("disk on fire")));
		let err = res.or_fail("Failed to send message").expect_err("store failure");
		assert!(err.is_infrastructure());
		assert_eq!(err.kind(), "store");
		match err.into_event() {
			ServerEvent::Error(body) => assert_eq!(body.message, "Failed to send message"),
			other => panic!("expected error, got: {other:?}"),
		}
	}
}
