//! Wires the engine to the Chromium runtime and runs until a stop signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fleet::{ChallengeGate, Orchestrator, ProxySpec, ResourcePool, ShutdownCoordinator, TaskQueue};
use pw_fleet_runtime::{ChromiumDriver, ChromiumSurfaceFactory};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cli::Cli;
use crate::config::{CliConfig, default_config_path};
use crate::store::JsonAccountStore;
use crate::tasks;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Exit code for a fault before the fleet started.
pub const EXIT_STARTUP_FAULT: i32 = 1;

/// Runs the fleet; returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
	let config_path = cli.config.clone().unwrap_or_else(default_config_path);
	let config = CliConfig::load(&config_path)?.apply(&cli)?;
	debug!(target = "pw.fleet", path = %config_path.display(), "configuration loaded");

	let accounts_path = config.accounts_path();
	let store = Arc::new(
		JsonAccountStore::open(&accounts_path).with_context(|| format!("opening account file {}", accounts_path.display()))?,
	);

	let credentialed: Vec<String> = store
		.accounts()
		.into_iter()
		.filter(|account| account.proxy.as_ref().is_some_and(ProxySpec::has_credentials))
		.map(|account| account.id)
		.collect();
	if !credentialed.is_empty() {
		bail!(
			"accounts {} use authenticated proxies; Chromium's --proxy-server cannot carry credentials",
			credentialed.join(", ")
		);
	}

	let capabilities = tasks::build(&config.tasks);
	if capabilities.is_empty() {
		bail!("no tasks configured in {}", config_path.display());
	}
	for name in config.fleet.capabilities.keys() {
		if !config.tasks.contains_key(name) {
			warn!(target = "pw.fleet", capability = %name, "capability configured without a task; ignored");
		}
	}

	if cli.check {
		let names: Vec<String> = capabilities.iter().map(|c| c.name().to_string()).collect();
		let plan = json!({
			"config": config_path,
			"accounts": accounts_path,
			"accountCount": store.len(),
			"concurrency": config.fleet.concurrency,
			"capabilities": names.iter().cloned().zip(config.fleet.loop_settings(names.iter().map(String::as_str))).collect::<std::collections::BTreeMap<_, _>>(),
		});
		println!("{}", serde_json::to_string_pretty(&plan)?);
		return Ok(0);
	}

	let driver = Arc::new(ChromiumDriver::new(config.browser.launch_options()));
	let surfaces = Arc::new(ChromiumSurfaceFactory::new(config.surface.surface_options(&config.browser)));
	let queue = TaskQueue::new(config.fleet.concurrency);
	let pool = Arc::new(ResourcePool::new(driver, store.clone()));
	let gate = ChallengeGate::new(surfaces, store.clone(), config.fleet.auto_close_surfaces);

	let mut orchestrator = Orchestrator::new(config.fleet.clone(), queue, pool, gate, store.clone());
	for capability in capabilities {
		orchestrator = orchestrator.with_capability(capability);
	}

	info!(
		target = "pw.fleet",
		accounts = store.len(),
		concurrency = config.fleet.concurrency,
		"fleet starting"
	);
	orchestrator.start();
	let coordinator = ShutdownCoordinator::for_orchestrator(&orchestrator);

	let mut status = tokio::time::interval(STATUS_INTERVAL);
	status.tick().await;
	let stop = shutdown_signal();
	tokio::pin!(stop);
	let signal = loop {
		tokio::select! {
			signal = &mut stop => break signal,
			_ = status.tick() => {
				let snapshot = orchestrator.snapshot();
				info!(
					target = "pw.fleet",
					running = snapshot.queue.running,
					queued = snapshot.queue.queued,
					hosts = snapshot.pool.host_count,
					contexts = snapshot.pool.active_context_count,
					suspended = snapshot.suspended.len(),
					"fleet status"
				);
			}
		}
	};

	info!(target = "pw.fleet", %signal, "stop requested; shutting down");
	let report = coordinator.shutdown().await;
	info!(
		target = "pw.fleet",
		drained = report.drained,
		discarded = report.discarded,
		loops_aborted = report.loops_aborted,
		hosts_closed = report.hosts_closed,
		surfaces_closed = report.surfaces_closed,
		"fleet stopped"
	);
	Ok(report.exit_code())
}

async fn shutdown_signal() -> &'static str {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		match signal(SignalKind::terminate()) {
			Ok(mut term) => tokio::select! {
				_ = tokio::signal::ctrl_c() => "SIGINT",
				_ = term.recv() => "SIGTERM",
			},
			Err(err) => {
				warn!(target = "pw.fleet", error = %err, "SIGTERM handler unavailable");
				let _ = tokio::signal::ctrl_c().await;
				"SIGINT"
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
		"ctrl-c"
	}
}
