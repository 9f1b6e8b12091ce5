//! A page target attached through a flattened CDP session.

use std::sync::Arc;
use std::time::Duration;

use fleet::RenderedPage;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;

use crate::connection::CdpConnection;
use crate::error::{Result, RuntimeError};

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CdpPage {
	connection: Arc<CdpConnection>,
	target_id: String,
	session_id: String,
	navigation_timeout: Duration,
}

impl CdpPage {
	/// Opens a blank tab in `browser_context_id` and attaches to it.
	pub(crate) async fn open(connection: Arc<CdpConnection>, browser_context_id: &str) -> Result<Self> {
		let created = connection
			.call(
				"Target.createTarget",
				json!({"url": "about:blank", "browserContextId": browser_context_id}),
			)
			.await?;
		let target_id = string_field(&created, "targetId", "Target.createTarget")?;

		let attached = connection
			.call("Target.attachToTarget", json!({"targetId": target_id, "flatten": true}))
			.await?;
		let session_id = string_field(&attached, "sessionId", "Target.attachToTarget")?;

		let page = Self {
			connection,
			target_id,
			session_id,
			navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
		};
		page.send("Page.enable", json!({})).await?;
		Ok(page)
	}

	pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
		self.navigation_timeout = timeout;
		self
	}

	pub fn target_id(&self) -> &str {
		&self.target_id
	}

	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	/// Sends a command to this page's session.
	pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
		self.connection.send(method, params, Some(&self.session_id)).await
	}

	/// Navigates and waits for the load event.
	pub async fn navigate(&self, url: &str) -> Result<()> {
		let mut events = self.connection.subscribe();
		let result = self.send("Page.navigate", json!({"url": url})).await?;
		if let Some(error) = result.get("errorText").and_then(Value::as_str).filter(|e| !e.is_empty()) {
			return Err(RuntimeError::Payload {
				method: "Page.navigate".into(),
				message: format!("{}: {}", url, error),
			});
		}

		let wait = async {
			loop {
				match events.recv().await {
					Ok(event)
						if event.method == "Page.loadEventFired"
							&& event.session_id.as_deref() == Some(self.session_id.as_str()) =>
					{
						return Ok(());
					}
					Ok(_) | Err(RecvError::Lagged(_)) => continue,
					Err(RecvError::Closed) => return Err(RuntimeError::ChannelClosed),
				}
			}
		};
		tokio::time::timeout(self.navigation_timeout, wait)
			.await
			.map_err(|_| RuntimeError::Timeout(format!("Page.navigate {}", url)))?
	}

	/// Evaluates `expression` and returns its JSON value.
	pub async fn evaluate(&self, expression: &str) -> Result<Value> {
		let result = self
			.send(
				"Runtime.evaluate",
				json!({"expression": expression, "returnByValue": true, "awaitPromise": true}),
			)
			.await?;
		if let Some(details) = result.get("exceptionDetails") {
			let message = details
				.pointer("/exception/description")
				.or_else(|| details.get("text"))
				.and_then(Value::as_str)
				.unwrap_or("script threw")
				.to_string();
			return Err(RuntimeError::Payload {
				method: "Runtime.evaluate".into(),
				message,
			});
		}
		Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
	}

	async fn evaluate_string(&self, expression: &str) -> Result<String> {
		Ok(self.evaluate(expression).await?.as_str().unwrap_or_default().to_string())
	}

	/// URL, title, and markup, as seen by challenge detectors.
	pub async fn rendered(&self) -> Result<RenderedPage> {
		Ok(RenderedPage {
			url: self.evaluate_string("location.href").await?,
			title: self.evaluate_string("document.title").await?,
			content: self
				.evaluate_string("document.documentElement ? document.documentElement.outerHTML : ''")
				.await?,
		})
	}

	pub async fn close(&self) -> Result<()> {
		self.connection
			.call("Target.closeTarget", json!({"targetId": self.target_id}))
			.await?;
		Ok(())
	}
}

pub(crate) fn string_field(value: &Value, field: &str, method: &str) -> Result<String> {
	value
		.get(field)
		.and_then(Value::as_str)
		.map(str::to_string)
		.ok_or_else(|| RuntimeError::Payload {
			method: method.to_string(),
			message: format!("missing {}", field),
		})
}
