//! Headful Chromium windows for operator intervention.
//!
//! Each surface runs in a persistent per-account profile so an operator's
//! login survives between escalations. While the window is open a watcher
//! polls the browser's cookies; when the process exits (or the engine closes
//! the surface) the last snapshot is handed back as the captured auth state.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet::{Account, AuthState, ManualSurface, SurfaceClosed, SurfaceControl, SurfaceFactory};
use pw_fleet_protocol::Cookie;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::CdpConnection;
use crate::error::{Result, RuntimeError};
use crate::launcher::{BrowserProcess, LaunchOptions, ProfileDir};

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Where surfaces start and what marks a successful login.
#[derive(Debug, Clone)]
pub struct SurfaceOptions {
	pub launch: LaunchOptions,
	/// Parent of the per-account profile directories.
	pub profile_root: PathBuf,
	pub start_url: Option<String>,
	/// Substring of a page URL that means the operator got through.
	pub success_url: Option<String>,
	pub poll_interval: Duration,
}

impl Default for SurfaceOptions {
	fn default() -> Self {
		Self {
			launch: LaunchOptions {
				headless: false,
				..LaunchOptions::default()
			},
			profile_root: default_profile_root(),
			start_url: None,
			success_url: None,
			poll_interval: Duration::from_secs(2),
		}
	}
}

fn default_profile_root() -> PathBuf {
	dirs::data_local_dir()
		.unwrap_or_else(std::env::temp_dir)
		.join("pw-fleet")
		.join("surfaces")
}

pub struct ChromiumSurfaceFactory {
	options: SurfaceOptions,
}

impl ChromiumSurfaceFactory {
	pub fn new(mut options: SurfaceOptions) -> Self {
		options.launch.headless = false;
		Self { options }
	}

	pub fn profile_dir(&self, account_id: &str) -> PathBuf {
		profile_path(&self.options.profile_root, account_id)
	}
}

/// Account ids become directory names; anything outside `[A-Za-z0-9._-]` is replaced.
fn profile_path(root: &Path, account_id: &str) -> PathBuf {
	let safe: String = account_id
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
		.collect();
	let safe = if safe.is_empty() || safe.chars().all(|c| c == '.') {
		"_".to_string()
	} else {
		safe
	};
	root.join(safe)
}

#[async_trait]
impl SurfaceFactory for ChromiumSurfaceFactory {
	async fn open(&self, account: &Account, auto_close_on_success: bool) -> fleet::Result<ManualSurface> {
		let profile = ProfileDir::persistent(self.profile_dir(&account.id))?;
		let process = BrowserProcess::launch(
			&self.options.launch,
			profile,
			account.proxy.as_ref(),
			self.options.start_url.as_deref(),
		)
		.await?;
		let connection = CdpConnection::connect(process.ws_url()).await?;

		let token = CancellationToken::new();
		let (tx, closed) = oneshot::channel();
		let watcher = SurfaceWatcher {
			account_id: account.id.clone(),
			process,
			connection,
			token: token.clone(),
			success_url: self.options.success_url.clone().filter(|_| auto_close_on_success),
			poll_interval: self.options.poll_interval,
		};
		let control = ChromiumSurfaceControl::spawn(token, async move {
			let auth_state = watcher.run().await;
			let _ = tx.send(SurfaceClosed { auth_state });
		});

		info!(target = "pw.fleet.gate", account = %account.id, "surface browser opened");
		Ok(ManualSurface {
			control: Arc::new(control),
			closed,
		})
	}
}

struct ChromiumSurfaceControl {
	token: CancellationToken,
	/// Cancelled once the watcher has closed and reaped the browser.
	finished: CancellationToken,
}

impl ChromiumSurfaceControl {
	fn spawn<F>(token: CancellationToken, watcher: F) -> Self
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let finished = CancellationToken::new();
		let done = finished.clone().drop_guard();
		tokio::spawn(async move {
			let _done = done;
			watcher.await;
		});
		Self { token, finished }
	}
}

#[async_trait]
impl SurfaceControl for ChromiumSurfaceControl {
	/// Returns after the browser process is gone.
	async fn close(&self) -> fleet::Result<()> {
		self.token.cancel();
		self.finished.cancelled().await;
		Ok(())
	}
}

struct SurfaceWatcher {
	account_id: String,
	process: BrowserProcess,
	connection: Arc<CdpConnection>,
	token: CancellationToken,
	success_url: Option<String>,
	poll_interval: Duration,
}

impl SurfaceWatcher {
	/// Runs until the window goes away and returns the last cookies seen.
	async fn run(mut self) -> Option<AuthState> {
		let mut snapshot: Option<AuthState> = None;
		let mut ticker = tokio::time::interval(self.poll_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		let exited_by_itself = loop {
			tokio::select! {
				_ = self.token.cancelled() => break false,
				status = self.process.wait() => {
					debug!(target = "pw.fleet.gate", account = %self.account_id, ?status, "surface browser exited");
					break true;
				}
				_ = ticker.tick() => {
					match read_cookies(&self.connection).await {
						Ok(state) => snapshot = Some(state),
						Err(err) => debug!(target = "pw.fleet.gate", account = %self.account_id, error = %err, "cookie poll failed"),
					}
					if let Some(pattern) = self.success_url.as_deref() {
						match reached(&self.connection, pattern).await {
							Ok(true) => {
								info!(target = "pw.fleet.gate", account = %self.account_id, "success page reached; closing surface");
								break false;
							}
							Ok(false) => {}
							Err(err) => debug!(target = "pw.fleet.gate", account = %self.account_id, error = %err, "target poll failed"),
						}
					}
				}
			}
		};

		if !exited_by_itself {
			if let Ok(state) = read_cookies(&self.connection).await {
				snapshot = Some(state);
			}
			if let Err(err) = self.connection.call("Browser.close", json!({})).await {
				debug!(target = "pw.fleet.gate", account = %self.account_id, error = %err, "Browser.close failed");
			}
			self.connection.close();
			self.process.shutdown(CLOSE_GRACE).await;
		} else {
			self.connection.close();
		}

		let snapshot = snapshot.filter(|s| !s.is_empty());
		if snapshot.is_none() {
			warn!(target = "pw.fleet.gate", account = %self.account_id, "surface closed without capturing cookies");
		}
		snapshot
	}
}

/// Cookies of the browser's default context, where the operator works.
async fn read_cookies(connection: &CdpConnection) -> Result<AuthState> {
	let result = connection.call("Storage.getCookies", json!({})).await?;
	let cookies: Vec<Cookie> =
		serde_json::from_value(result.get("cookies").cloned().unwrap_or(Value::Null)).map_err(|e| RuntimeError::Payload {
			method: "Storage.getCookies".into(),
			message: e.to_string(),
		})?;
	Ok(AuthState {
		cookies,
		origins: Vec::new(),
	})
}

/// Whether any open page's URL contains `pattern`.
async fn reached(connection: &CdpConnection, pattern: &str) -> Result<bool> {
	let result = connection.call("Target.getTargets", json!({})).await?;
	let infos = result.get("targetInfos").and_then(Value::as_array);
	Ok(infos.is_some_and(|infos| {
		infos.iter().any(|info| {
			info.get("type").and_then(Value::as_str) == Some("page")
				&& info.get("url").and_then(Value::as_str).is_some_and(|url| url.contains(pattern))
		})
	}))
}
