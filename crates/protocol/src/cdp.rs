//! Chrome DevTools Protocol frames.
//!
//! Requests carry a numeric `id`; the browser answers with a response that
//! echoes it. Events have no `id` and are distinguished by its absence.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command sent to the browser endpoint.
///
/// ```json
/// { "id": 7, "method": "Target.createBrowserContext", "params": {} }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpRequest {
	pub id: u64,
	pub method: String,
	#[serde(default)]
	pub params: Value,
	/// Target session the command is routed to, when attached to a page.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

/// Protocol error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpErrorPayload {
	pub code: i64,
	pub message: String,
}

/// Response correlated to a [`CdpRequest`] by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpResponse {
	pub id: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<CdpErrorPayload>,
}

/// Unsolicited event from the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpEvent {
	pub method: String,
	#[serde(default)]
	pub params: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

/// Any inbound frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CdpMessage {
	Response(CdpResponse),
	Event(CdpEvent),
}
