//! DevTools HTTP endpoint probing.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RuntimeError};

/// `/json/version` response subset.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpVersionInfo {
	#[serde(rename = "webSocketDebuggerUrl")]
	pub web_socket_debugger_url: String,
	#[serde(rename = "Browser")]
	pub browser: Option<String>,
}

/// Resolves the browser-level WebSocket URL from `/json/version` on `port`.
pub async fn fetch_cdp_endpoint(port: u16) -> Result<CdpVersionInfo> {
	let probe = |message: String| RuntimeError::Probe { port, message };
	let client = reqwest::Client::builder()
		.timeout(Duration::from_millis(400))
		.build()
		.map_err(|e| probe(format!("failed to create HTTP client: {}", e)))?;
	let mut last_error = "no response".to_string();

	for url in [
		format!("http://127.0.0.1:{}/json/version", port),
		format!("http://localhost:{}/json/version", port),
	] {
		let response = match client.get(&url).send().await {
			Ok(response) => response,
			Err(e) => {
				last_error = e.to_string();
				continue;
			}
		};

		if !response.status().is_success() {
			last_error = format!("unexpected status {}", response.status());
			continue;
		}

		return response
			.json::<CdpVersionInfo>()
			.await
			.map_err(|e| probe(format!("failed to parse /json/version: {}", e)));
	}

	Err(probe(last_error))
}
