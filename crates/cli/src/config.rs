//! Binary configuration: engine settings plus browser, surface, and task bodies.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fleet::FleetConfig;
use pw_fleet_runtime::{LaunchOptions, SurfaceOptions};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

const CONFIG_FILE: &str = "pw-fleet.json";
const ACCOUNTS_FILE: &str = "accounts.json";

/// Contents of `pw-fleet.json`. Engine fields sit at the top level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CliConfig {
	#[serde(flatten)]
	pub fleet: FleetConfig,
	/// Account file, relative to the config file.
	pub accounts: Option<PathBuf>,
	pub browser: BrowserSettings,
	pub surface: SurfaceSettings,
	/// Task body per capability name.
	pub tasks: HashMap<String, TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserSettings {
	pub executable: Option<PathBuf>,
	pub headless: bool,
	pub extra_args: Vec<String>,
	pub startup_timeout_ms: u64,
}

impl Default for BrowserSettings {
	fn default() -> Self {
		Self {
			executable: None,
			headless: true,
			extra_args: Vec::new(),
			startup_timeout_ms: 15_000,
		}
	}
}

impl BrowserSettings {
	pub fn launch_options(&self) -> LaunchOptions {
		LaunchOptions {
			executable: self.executable.clone(),
			headless: self.headless,
			extra_args: self.extra_args.clone(),
			startup_timeout: Duration::from_millis(self.startup_timeout_ms),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SurfaceSettings {
	pub start_url: Option<String>,
	/// URL substring that marks a completed login.
	pub success_url: Option<String>,
	pub poll_interval_ms: u64,
	/// Defaults to the platform data directory.
	pub profile_root: Option<PathBuf>,
}

impl Default for SurfaceSettings {
	fn default() -> Self {
		Self {
			start_url: None,
			success_url: None,
			poll_interval_ms: 2_000,
			profile_root: None,
		}
	}
}

impl SurfaceSettings {
	pub fn surface_options(&self, browser: &BrowserSettings) -> SurfaceOptions {
		let defaults = SurfaceOptions::default();
		SurfaceOptions {
			launch: LaunchOptions {
				headless: false,
				..browser.launch_options()
			},
			profile_root: self.profile_root.clone().unwrap_or(defaults.profile_root),
			start_url: self.start_url.clone(),
			success_url: self.success_url.clone(),
			poll_interval: Duration::from_millis(self.poll_interval_ms.max(100)),
		}
	}
}

/// What a capability does on each run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TaskSpec {
	/// Runs an external program against the account's browser context.
	Command(CommandSpec),
	/// Opens a URL and checks it for challenges.
	Visit(VisitSpec),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandSpec {
	pub program: String,
	pub args: Vec<String>,
	pub env: HashMap<String, String>,
	pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitSpec {
	pub url: String,
	/// URL substring that means the session was sent back to a login page.
	pub login_url: Option<String>,
}

impl CliConfig {
	/// Reads `path`; a missing file yields defaults.
	pub fn load(path: &Path) -> Result<Self> {
		let content = match fs::read_to_string(path) {
			Ok(content) => content,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
			Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
		};
		let mut config: Self =
			serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

		if let Some(accounts) = config.accounts.as_mut() {
			if accounts.is_relative() {
				if let Some(dir) = path.parent() {
					*accounts = dir.join(&*accounts);
				}
			}
		}
		Ok(config)
	}

	/// Applies command-line overrides and validates the result.
	pub fn apply(mut self, cli: &Cli) -> Result<Self> {
		if let Some(concurrency) = cli.concurrency {
			self.fleet.concurrency = concurrency;
		}
		if let Some(accounts) = &cli.accounts {
			self.accounts = Some(accounts.clone());
		}
		if let Some(chromium) = &cli.chromium {
			self.browser.executable = Some(chromium.clone());
		}
		if cli.headful {
			self.browser.headless = false;
		}
		self.validate()?;
		Ok(self)
	}

	pub fn validate(&self) -> Result<()> {
		self.fleet.validate()?;
		for (name, task) in &self.tasks {
			match task {
				TaskSpec::Command(spec) if spec.program.trim().is_empty() => {
					bail!("task '{}': command program is empty", name)
				}
				TaskSpec::Visit(spec) if spec.url.trim().is_empty() => bail!("task '{}': visit url is empty", name),
				_ => {}
			}
		}
		Ok(())
	}

	pub fn accounts_path(&self) -> PathBuf {
		self.accounts.clone().unwrap_or_else(|| PathBuf::from(ACCOUNTS_FILE))
	}
}

/// `./pw-fleet.json` when present, else the user config directory.
pub fn default_config_path() -> PathBuf {
	let local = PathBuf::from(CONFIG_FILE);
	if local.exists() {
		return local;
	}
	dirs::config_dir()
		.map(|dir| dir.join("pw-fleet").join("config.json"))
		.unwrap_or(local)
}
