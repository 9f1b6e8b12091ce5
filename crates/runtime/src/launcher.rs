//! Chromium process launching with a remote-debugging endpoint.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use fleet::ProxySpec;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::browser_finder::resolve_executable;
use crate::cdp_probe::fetch_cdp_endpoint;
use crate::error::{Result, RuntimeError};
use crate::process::{pick_free_port, reap};

const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// How session-host and surface browsers are started.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
	/// Explicit browser binary; discovered when `None`.
	pub executable: Option<PathBuf>,
	pub headless: bool,
	pub extra_args: Vec<String>,
	/// How long to wait for the DevTools endpoint to answer.
	pub startup_timeout: Duration,
}

impl Default for LaunchOptions {
	fn default() -> Self {
		Self {
			executable: None,
			headless: true,
			extra_args: Vec::new(),
			startup_timeout: Duration::from_secs(15),
		}
	}
}

/// Browser profile directory, removed on drop when temporary.
#[derive(Debug)]
pub enum ProfileDir {
	Temp(TempDir),
	Persistent(PathBuf),
}

impl ProfileDir {
	pub fn temp() -> Result<Self> {
		let dir = tempfile::Builder::new().prefix("pw-fleet-host-").tempdir()?;
		Ok(Self::Temp(dir))
	}

	pub fn persistent(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		std::fs::create_dir_all(&path)?;
		Ok(Self::Persistent(path))
	}

	pub fn path(&self) -> &Path {
		match self {
			Self::Temp(dir) => dir.path(),
			Self::Persistent(path) => path,
		}
	}
}

/// Command-line flags for a Chromium instance.
pub fn chromium_args(
	port: u16,
	profile: &Path,
	headless: bool,
	proxy: Option<&ProxySpec>,
	extra_args: &[String],
	start_url: Option<&str>,
) -> Vec<String> {
	let mut args = vec![
		format!("--remote-debugging-port={}", port),
		format!("--user-data-dir={}", profile.display()),
		"--no-first-run".to_string(),
		"--no-default-browser-check".to_string(),
		"--disable-background-networking".to_string(),
		"--disable-sync".to_string(),
	];
	if headless {
		args.push("--headless=new".to_string());
	}
	if let Some(proxy) = proxy {
		args.push(format!("--proxy-server={}", proxy.server.trim()));
	}
	args.extend(extra_args.iter().cloned());
	args.push(start_url.unwrap_or("about:blank").to_string());
	args
}

/// A launched browser process and its DevTools endpoint.
#[derive(Debug)]
pub struct BrowserProcess {
	child: Child,
	port: u16,
	ws_url: String,
	profile: ProfileDir,
}

impl BrowserProcess {
	/// Starts Chromium and waits until its DevTools endpoint answers.
	pub async fn launch(
		options: &LaunchOptions,
		profile: ProfileDir,
		proxy: Option<&ProxySpec>,
		start_url: Option<&str>,
	) -> Result<Self> {
		if let Some(proxy) = proxy.filter(|p| p.has_credentials()) {
			return Err(RuntimeError::Launch(format!(
				"proxy {} requires credentials, which --proxy-server cannot carry",
				proxy.server.trim()
			)));
		}
		let executable = resolve_executable(options.executable.as_deref())?;
		let port = pick_free_port()?;

		let args = chromium_args(port, profile.path(), options.headless, proxy, &options.extra_args, start_url);
		debug!(target = "pw.fleet.cdp", executable = %executable.display(), port, "launching browser");

		let mut child = Command::new(&executable)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| RuntimeError::Launch(format!("{}: {}", executable.display(), e)))?;

		let deadline = tokio::time::Instant::now() + options.startup_timeout;
		let ws_url = loop {
			if let Some(status) = child.try_wait()? {
				return Err(RuntimeError::Launch(format!("browser exited during startup with {}", status)));
			}
			match fetch_cdp_endpoint(port).await {
				Ok(info) => break info.web_socket_debugger_url,
				Err(err) if tokio::time::Instant::now() >= deadline => {
					let _ = child.kill().await;
					return Err(err);
				}
				Err(_) => tokio::time::sleep(PROBE_INTERVAL).await,
			}
		};

		info!(target = "pw.fleet.cdp", port, pid = ?child.id(), "browser ready");
		Ok(Self {
			child,
			port,
			ws_url,
			profile,
		})
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn ws_url(&self) -> &str {
		&self.ws_url
	}

	pub fn profile(&self) -> &ProfileDir {
		&self.profile
	}

	/// Resolves when the process exits by itself.
	pub async fn wait(&mut self) -> Result<ExitStatus> {
		Ok(self.child.wait().await?)
	}

	/// Gives the process `grace` to exit after a `Browser.close`, then kills it.
	pub async fn shutdown(mut self, grace: Duration) {
		reap(&mut self.child, grace).await;
	}
}
