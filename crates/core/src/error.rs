//! Error types shared by the scheduling engine.

use thiserror::Error;

/// Errors surfaced by queue, pool, gate, and capability operations.
#[derive(Debug, Error)]
pub enum FleetError {
	#[error("Account not found: {0}")]
	AccountNotFound(String),

	#[error("Failed to acquire session for {key}: {message}")]
	ResourceAcquisition { key: String, message: String },

	#[error("Authentication rejected for account {0}")]
	AuthenticationRejected(String),

	#[error("Challenge detected for account {account}: {kind}")]
	ChallengeDetected { account: String, kind: String },

	#[error("Task failed: {0}")]
	Transient(String),

	#[error("Session driver error: {0}")]
	Driver(String),

	#[error("Task '{label}' timed out after {timeout_ms}ms")]
	Timeout { label: String, timeout_ms: u64 },

	#[error("Task '{0}' panicked")]
	TaskPanicked(String),

	#[error("Task '{0}' was discarded before it started")]
	Discarded(String),

	#[error("Resource pool is shutting down")]
	ShuttingDown,

	#[error("Manual surface error: {0}")]
	Surface(String),

	#[error("Account store error: {0}")]
	Store(String),

	#[error("Invalid configuration: {0}")]
	Config(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

/// How the orchestrator reacts to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Retried by the next natural loop cycle.
	Transient,
	/// Host or context could not be obtained; retried after backoff.
	Acquisition,
	/// Account must be suspended and handed to an operator.
	Escalate,
	/// Process is stopping; nothing to retry.
	Shutdown,
}

impl FleetError {
	pub fn class(&self) -> ErrorClass {
		match self {
			FleetError::AuthenticationRejected(_) | FleetError::ChallengeDetected { .. } => ErrorClass::Escalate,
			FleetError::ResourceAcquisition { .. } => ErrorClass::Acquisition,
			FleetError::ShuttingDown | FleetError::Discarded(_) => ErrorClass::Shutdown,
			_ => ErrorClass::Transient,
		}
	}

	pub(crate) fn acquisition(key: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
		FleetError::ResourceAcquisition {
			key: key.to_string(),
			message: err.to_string(),
		}
	}
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn challenge_and_auth_failures_escalate() {
		assert_eq!(FleetError::AuthenticationRejected("a".into()).class(), ErrorClass::Escalate);
		assert_eq!(
			FleetError::ChallengeDetected {
				account: "a".into(),
				kind: "captcha".into()
			}
			.class(),
			ErrorClass::Escalate
		);
	}

	#[test]
	fn navigation_failures_are_transient() {
		assert_eq!(FleetError::Transient("net::ERR_TIMED_OUT".into()).class(), ErrorClass::Transient);
		assert_eq!(
			FleetError::Timeout {
				label: "feed:a".into(),
				timeout_ms: 10
			}
			.class(),
			ErrorClass::Transient
		);
	}

	#[test]
	fn acquisition_message_names_the_key() {
		let err = FleetError::acquisition("proxy:10.0.0.1:8080", "spawn failed");
		assert_eq!(err.class(), ErrorClass::Acquisition);
		assert_eq!(err.to_string(), "Failed to acquire session for proxy:10.0.0.1:8080: spawn failed");
	}
}
