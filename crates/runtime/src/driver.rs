//! Chromium-backed [`HostDriver`]: one browser per egress identity, one
//! CDP browser context per checked-out session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet::{AuthState, ContextHandle, HostDriver, HostHandle, ProxySpec, ResourceKey};
use parking_lot::Mutex;
use pw_fleet_protocol::{Cookie, NameValue, OriginState};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::connection::CdpConnection;
use crate::error::{Result, RuntimeError};
use crate::launcher::{BrowserProcess, LaunchOptions, ProfileDir};
use crate::page::{CdpPage, string_field};

const CLOSE_GRACE: Duration = Duration::from_secs(5);

const READ_LOCAL_STORAGE: &str = "JSON.stringify(Object.entries(window.localStorage))";

pub struct ChromiumDriver {
	options: LaunchOptions,
}

impl ChromiumDriver {
	pub fn new(options: LaunchOptions) -> Self {
		Self { options }
	}
}

#[async_trait]
impl HostDriver for ChromiumDriver {
	async fn launch(&self, key: &ResourceKey, proxy: Option<&ProxySpec>) -> fleet::Result<Arc<dyn HostHandle>> {
		let profile = ProfileDir::temp()?;
		let process = BrowserProcess::launch(&self.options, profile, proxy, None).await?;
		let connection = CdpConnection::connect(process.ws_url()).await?;
		info!(target = "pw.fleet.cdp", %key, port = process.port(), "session host launched");
		Ok(Arc::new(ChromiumHost::new(key.clone(), connection, Some(process))))
	}
}

/// A browser shared by every account behind one egress identity.
pub struct ChromiumHost {
	key: ResourceKey,
	connection: Arc<CdpConnection>,
	process: Mutex<Option<BrowserProcess>>,
}

impl ChromiumHost {
	pub fn new(key: ResourceKey, connection: Arc<CdpConnection>, process: Option<BrowserProcess>) -> Self {
		Self {
			key,
			connection,
			process: Mutex::new(process),
		}
	}

	/// Wraps a browser someone else launched; closing it only drops the connection.
	pub fn attach(key: ResourceKey, connection: Arc<CdpConnection>) -> Self {
		Self::new(key, connection, None)
	}

	pub fn connection(&self) -> &Arc<CdpConnection> {
		&self.connection
	}
}

#[async_trait]
impl HostHandle for ChromiumHost {
	async fn new_context(&self) -> fleet::Result<Arc<dyn ContextHandle>> {
		let created = self.connection.call("Target.createBrowserContext", json!({})).await?;
		let id = string_field(&created, "browserContextId", "Target.createBrowserContext")?;
		debug!(target = "pw.fleet.cdp", key = %self.key, context = %id, "browser context created");
		Ok(Arc::new(CdpContext::new(id, Arc::clone(&self.connection))))
	}

	async fn close(&self) -> fleet::Result<()> {
		let process = self.process.lock().take();
		if let Some(process) = process {
			if let Err(err) = self.connection.call("Browser.close", json!({})).await {
				debug!(target = "pw.fleet.cdp", key = %self.key, error = %err, "Browser.close failed");
			}
			self.connection.close();
			process.shutdown(CLOSE_GRACE).await;
		} else {
			self.connection.close();
		}
		debug!(target = "pw.fleet.cdp", key = %self.key, "session host closed");
		Ok(())
	}
}

/// An isolated CDP browser context.
///
/// Capabilities downcast the session's [`ContextHandle`] to this type to open
/// pages or hand the endpoint to an external driver.
pub struct CdpContext {
	browser_context_id: String,
	connection: Arc<CdpConnection>,
	/// Origins whose `localStorage` was injected, re-read on extraction.
	origins: Mutex<Vec<String>>,
}

impl CdpContext {
	pub fn new(browser_context_id: String, connection: Arc<CdpConnection>) -> Self {
		Self {
			browser_context_id,
			connection,
			origins: Mutex::new(Vec::new()),
		}
	}

	pub fn browser_context_id(&self) -> &str {
		&self.browser_context_id
	}

	/// Browser-level WebSocket URL this context lives on.
	pub fn endpoint(&self) -> &str {
		self.connection.endpoint()
	}

	/// Opens a tab in this context and navigates it to `url`.
	pub async fn new_page(&self, url: &str) -> Result<CdpPage> {
		let page = CdpPage::open(Arc::clone(&self.connection), &self.browser_context_id).await?;
		if url != "about:blank" {
			if let Err(err) = page.navigate(url).await {
				let _ = page.close().await;
				return Err(err);
			}
		}
		Ok(page)
	}

	async fn write_local_storage(&self, origin: &OriginState) -> Result<()> {
		let entries: Vec<(&str, &str)> = origin
			.local_storage
			.iter()
			.map(|nv| (nv.name.as_str(), nv.value.as_str()))
			.collect();
		let script = format!(
			"(() => {{ for (const [k, v] of {}) window.localStorage.setItem(k, v); return true; }})()",
			serde_json::to_string(&entries)?
		);
		let page = self.new_page(&origin.origin).await?;
		let result = page.evaluate(&script).await;
		let _ = page.close().await;
		result.map(|_| ())
	}

	async fn read_local_storage(&self, origin: &str) -> Result<OriginState> {
		let page = self.new_page(origin).await?;
		let result = page.evaluate(READ_LOCAL_STORAGE).await;
		let _ = page.close().await;
		let entries: Vec<(String, String)> = match result? {
			Value::String(raw) => serde_json::from_str(&raw)?,
			_ => Vec::new(),
		};
		Ok(OriginState {
			origin: origin.to_string(),
			local_storage: entries
				.into_iter()
				.map(|(name, value)| NameValue { name, value })
				.collect(),
		})
	}
}

#[async_trait]
impl ContextHandle for CdpContext {
	fn id(&self) -> &str {
		&self.browser_context_id
	}

	async fn apply_auth_state(&self, state: &AuthState) -> fleet::Result<()> {
		let cookies: Vec<Value> = state.cookies.iter().filter_map(cookie_param).collect();
		if !cookies.is_empty() {
			self.connection
				.call(
					"Storage.setCookies",
					json!({"cookies": cookies, "browserContextId": self.browser_context_id}),
				)
				.await?;
		}

		for origin in state.origins.iter().filter(|o| !o.local_storage.is_empty()) {
			self.write_local_storage(origin).await?;
			self.origins.lock().push(origin.origin.clone());
		}
		debug!(
			target = "pw.fleet.cdp",
			context = %self.browser_context_id,
			cookies = cookies.len(),
			origins = state.origins.len(),
			"auth state applied"
		);
		Ok(())
	}

	async fn auth_state(&self) -> fleet::Result<AuthState> {
		let result = self
			.connection
			.call("Storage.getCookies", json!({"browserContextId": self.browser_context_id}))
			.await?;
		let cookies: Vec<Cookie> = serde_json::from_value(result.get("cookies").cloned().unwrap_or(Value::Null))
			.map_err(|e| RuntimeError::Payload {
				method: "Storage.getCookies".into(),
				message: e.to_string(),
			})?;

		let origins_to_read = self.origins.lock().clone();
		let mut origins = Vec::with_capacity(origins_to_read.len());
		for origin in origins_to_read {
			origins.push(self.read_local_storage(&origin).await?);
		}
		Ok(AuthState { cookies, origins })
	}

	async fn close(&self) -> fleet::Result<()> {
		self.connection
			.call(
				"Target.disposeBrowserContext",
				json!({"browserContextId": self.browser_context_id}),
			)
			.await?;
		Ok(())
	}
}

/// `Network.CookieParam` for a stored cookie; `None` when it has no domain to scope it to.
fn cookie_param(cookie: &Cookie) -> Option<Value> {
	cookie.domain.as_ref()?;
	let mut param = serde_json::to_value(cookie).ok()?;
	if cookie.expires < 0.0 {
		if let Some(map) = param.as_object_mut() {
			map.remove("expires");
		}
	}
	Some(param)
}
