//! Accounts, egress identities, and the persistence collaborator.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use pw_fleet_protocol::AuthState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Outbound proxy an account's traffic is routed through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
	/// `scheme://host:port`, or bare `host:port` for HTTP proxies.
	pub server: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub password: Option<String>,
}

impl ProxySpec {
	/// True when the proxy expects a username or password.
	pub fn has_credentials(&self) -> bool {
		[&self.username, &self.password]
			.into_iter()
			.any(|field| field.as_deref().is_some_and(|v| !v.is_empty()))
	}
}

/// Login credentials for the automated application.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
	pub username: String,
	#[serde(default)]
	pub password: String,
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("username", &self.username)
			.field("password", &"<redacted>")
			.finish()
	}
}

/// Per-account switch and template for one capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySettings {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub template: Option<String>,
}

/// An external account driven by the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
	pub id: String,
	#[serde(default)]
	pub credentials: Credentials,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub proxy: Option<ProxySpec>,
	#[serde(default = "default_active")]
	pub active: bool,
	#[serde(default)]
	pub capabilities: HashMap<String, CapabilitySettings>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth_state: Option<AuthState>,
	/// Free-form fields written back by capabilities.
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub info: Map<String, Value>,
}

fn default_active() -> bool {
	true
}

impl Account {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			credentials: Credentials::default(),
			proxy: None,
			active: true,
			capabilities: HashMap::new(),
			auth_state: None,
			info: Map::new(),
		}
	}

	pub fn with_proxy(mut self, proxy: ProxySpec) -> Self {
		self.proxy = Some(proxy);
		self
	}

	pub fn with_capability(mut self, name: impl Into<String>, settings: CapabilitySettings) -> Self {
		self.capabilities.insert(name.into(), settings);
		self
	}

	pub fn capability_enabled(&self, name: &str) -> bool {
		self.capabilities.get(name).is_some_and(|s| s.enabled)
	}

	pub fn resource_key(&self) -> ResourceKey {
		ResourceKey::for_egress(self.proxy.as_ref())
	}
}

/// Grouping key for session hosts: one host per distinct egress identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
	/// Sentinel key for accounts without a proxy.
	pub const DIRECT: &'static str = "direct";

	pub fn for_egress(proxy: Option<&ProxySpec>) -> Self {
		let Some(proxy) = proxy else {
			return Self(Self::DIRECT.to_string());
		};
		let server = proxy.server.trim().to_ascii_lowercase();
		match proxy.username.as_deref().filter(|u| !u.is_empty()) {
			Some(user) => Self(format!("proxy:{}@{}", user, server)),
			None => Self(format!("proxy:{}", server)),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn is_direct(&self) -> bool {
		self.0 == Self::DIRECT
	}
}

impl fmt::Display for ResourceKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Query/update interface to wherever accounts are persisted.
#[async_trait]
pub trait AccountStore: Send + Sync {
	async fn get_account(&self, id: &str) -> Result<Option<Account>>;

	/// Accounts the scheduler may consider at all (active ones).
	async fn eligible_accounts(&self) -> Result<Vec<Account>>;

	async fn capability_settings(&self, id: &str, capability: &str) -> Result<Option<CapabilitySettings>>;

	/// Stores refreshed auth state; `None` invalidates what was stored.
	async fn update_auth_state(&self, id: &str, state: Option<AuthState>) -> Result<()>;

	async fn update_account_info(&self, id: &str, fields: Map<String, Value>) -> Result<()>;
}
