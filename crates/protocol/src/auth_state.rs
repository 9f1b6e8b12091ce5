//! Persisted authentication state in Playwright storage-state shape.

use serde::{Deserialize, Serialize};

/// Same-site policy attached to a cookie.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SameSite {
	Strict,
	Lax,
	None,
}

/// A single browser cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
	pub name: String,
	pub value: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub domain: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	/// Unix timestamp in seconds; `-1` marks a session cookie.
	#[serde(default = "session_expiry")]
	pub expires: f64,
	#[serde(default)]
	pub http_only: bool,
	#[serde(default)]
	pub secure: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub same_site: Option<SameSite>,
}

fn session_expiry() -> f64 {
	-1.0
}

impl Cookie {
	/// Returns `true` when the cookie carries an absolute expiry earlier than `now_secs`.
	pub fn is_expired_at(&self, now_secs: f64) -> bool {
		self.expires >= 0.0 && self.expires < now_secs
	}
}

/// A `localStorage` key/value pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameValue {
	pub name: String,
	pub value: String,
}

/// `localStorage` entries for a single origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
	pub origin: String,
	#[serde(default)]
	pub local_storage: Vec<NameValue>,
}

/// Authentication state captured from, or injected into, an isolated session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthState {
	#[serde(default)]
	pub cookies: Vec<Cookie>,
	#[serde(default)]
	pub origins: Vec<OriginState>,
}

impl AuthState {
	/// Returns `true` when there is nothing worth injecting.
	pub fn is_empty(&self) -> bool {
		self.cookies.is_empty() && self.origins.iter().all(|o| o.local_storage.is_empty())
	}

	/// Drops cookies that expired before `now_secs`.
	pub fn without_expired(mut self, now_secs: f64) -> Self {
		self.cookies.retain(|c| !c.is_expired_at(now_secs));
		self
	}
}
