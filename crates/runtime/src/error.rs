use fleet::FleetError;
use thiserror::Error;

/// Errors raised while launching or talking to a Chromium session host.
#[derive(Debug, Error)]
pub enum RuntimeError {
	#[error("Could not find a Chrome/Chromium executable. Install one or set the executable path explicitly.")]
	BrowserNotFound,

	#[error("Browser executable does not exist: {0}")]
	ExecutableMissing(String),

	#[error("Failed to launch browser: {0}")]
	Launch(String),

	#[error("DevTools endpoint not reachable on port {port}: {message}")]
	Probe { port: u16, message: String },

	#[error("CDP connection error: {0}")]
	Connection(String),

	#[error("CDP command {method} failed ({code}): {message}")]
	Protocol { method: String, code: i64, message: String },

	#[error("CDP command {0} timed out")]
	Timeout(String),

	#[error("CDP connection closed")]
	ChannelClosed,

	#[error("Unexpected CDP payload for {method}: {message}")]
	Payload { method: String, message: String },

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("WebSocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<RuntimeError> for FleetError {
	fn from(err: RuntimeError) -> Self {
		FleetError::Driver(err.to_string())
	}
}
