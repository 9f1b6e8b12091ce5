//! Independently paced capability loops.
//!
//! Each registered [`Capability`] gets its own loop. A loop pass selects the
//! accounts that are active, not suspended by the [`ChallengeGate`], have the
//! capability enabled, and are due; submits them to the shared [`TaskQueue`]
//! in fixed-size batches at the capability's priority; waits for each batch;
//! and then sleeps a jittered interval. The shared queue is the only point
//! where loops compete: when it is saturated the more urgent capability gets
//! the next slot.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStore};
use crate::capability::Capability;
use crate::config::{CapabilityConfig, FleetConfig, Pacing};
use crate::error::Result;
use crate::gate::ChallengeGate;
use crate::pool::{PoolStats, ResourcePool};
use crate::queue::{QueueStats, TaskQueue};

mod due;
mod task;
#[cfg(test)]
mod tests;

pub use due::DueTimeTable;

/// State every loop and task wrapper reads.
pub(crate) struct Shared {
	pub(crate) config: FleetConfig,
	pub(crate) queue: TaskQueue,
	pub(crate) pool: Arc<ResourcePool>,
	pub(crate) gate: ChallengeGate,
	pub(crate) store: Arc<dyn AccountStore>,
	pub(crate) due: DueTimeTable,
	pub(crate) running: CancellationToken,
}

impl Shared {
	fn is_eligible(&self, account: &Account, capability: &str) -> bool {
		account.active
			&& !self.gate.is_suspended(&account.id)
			&& account.capability_enabled(capability)
			&& self.due.is_due(&account.id, capability)
	}
}

/// Operator-facing view of the running engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
	pub running: bool,
	pub capabilities: Vec<String>,
	pub queue: QueueStats,
	pub pool: PoolStats,
	pub suspended: Vec<String>,
	pub due_entries: usize,
}

/// Owns the capability loops and the due-time table.
pub struct Orchestrator {
	shared: Arc<Shared>,
	capabilities: Vec<Arc<dyn Capability>>,
	loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
	pub fn new(
		config: FleetConfig,
		queue: TaskQueue,
		pool: Arc<ResourcePool>,
		gate: ChallengeGate,
		store: Arc<dyn AccountStore>,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				config,
				queue,
				pool,
				gate,
				store,
				due: DueTimeTable::new(),
				running: CancellationToken::new(),
			}),
			capabilities: Vec::new(),
			loops: Mutex::new(Vec::new()),
		}
	}

	/// Registers a capability. Loops are spawned by [`Orchestrator::start`].
	pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
		self.capabilities.push(capability);
		self
	}

	/// Spawns one loop per capability, plus host recycling when configured.
	pub fn start(&self) {
		let mut loops = self.loops.lock();
		if !loops.is_empty() {
			warn!(target = "pw.fleet.orchestrator", "orchestrator already started");
			return;
		}

		let settings = self.shared.config.loop_settings(self.capabilities.iter().map(|c| c.name()));
		for (capability, config) in self.capabilities.iter().zip(settings) {
			info!(
				target = "pw.fleet.orchestrator",
				capability = %capability.name(),
				priority = config.priority,
				batch_size = config.batch_size,
				pacing = ?config.pacing,
				"starting capability loop"
			);
			loops.push(tokio::spawn(capability_loop(
				Arc::clone(&self.shared),
				Arc::clone(capability),
				config,
			)));
		}

		if let Some(max_age) = self.shared.config.host_max_age() {
			loops.push(tokio::spawn(maintenance_loop(Arc::clone(&self.shared), max_age)));
		}
	}

	/// Asks every loop to exit after its current batch.
	pub fn stop(&self) {
		self.shared.running.cancel();
	}

	pub fn is_running(&self) -> bool {
		!self.shared.running.is_cancelled()
	}

	/// Token cancelled when the loops should stop.
	pub fn running_flag(&self) -> CancellationToken {
		self.shared.running.clone()
	}

	/// Hands the loop tasks to the caller for joining.
	pub fn take_loops(&self) -> Vec<JoinHandle<()>> {
		std::mem::take(&mut *self.loops.lock())
	}

	pub fn queue(&self) -> &TaskQueue {
		&self.shared.queue
	}

	pub fn pool(&self) -> &Arc<ResourcePool> {
		&self.shared.pool
	}

	pub fn gate(&self) -> &ChallengeGate {
		&self.shared.gate
	}

	pub fn due_times(&self) -> &DueTimeTable {
		&self.shared.due
	}

	pub fn config(&self) -> &FleetConfig {
		&self.shared.config
	}

	pub fn snapshot(&self) -> FleetSnapshot {
		FleetSnapshot {
			running: self.is_running(),
			capabilities: self.capabilities.iter().map(|c| c.name().to_string()).collect(),
			queue: self.shared.queue.stats(),
			pool: self.shared.pool.stats(),
			suspended: self.shared.gate.suspended(),
			due_entries: self.shared.due.len(),
		}
	}
}

async fn capability_loop(shared: Arc<Shared>, capability: Arc<dyn Capability>, config: CapabilityConfig) {
	let name = capability.name().to_string();

	while !shared.running.is_cancelled() {
		let submitted = match run_pass(&shared, &capability, &config).await {
			Ok(submitted) => submitted,
			Err(err) => {
				warn!(target = "pw.fleet.orchestrator", capability = %name, error = %err, "failed to enumerate accounts");
				0
			}
		};

		let pause = match config.pacing {
			Pacing::Continuous if submitted > 0 => config.batch_pause.sample(),
			_ => config.loop_sleep.sample(),
		};
		if !pause_unless_stopped(&shared.running, pause).await {
			break;
		}
	}

	info!(target = "pw.fleet.orchestrator", capability = %name, "capability loop stopped");
}

/// One eligibility pass. Returns how many tasks were submitted.
async fn run_pass(shared: &Arc<Shared>, capability: &Arc<dyn Capability>, config: &CapabilityConfig) -> Result<usize> {
	let name = capability.name();
	let eligible: Vec<Account> = shared
		.store
		.eligible_accounts()
		.await?
		.into_iter()
		.filter(|account| shared.is_eligible(account, name))
		.collect();

	if eligible.is_empty() {
		debug!(target = "pw.fleet.orchestrator", capability = %name, "no eligible accounts");
		return Ok(0);
	}
	debug!(target = "pw.fleet.orchestrator", capability = %name, eligible = eligible.len(), "starting pass");

	let mut submitted = 0;
	for (index, batch) in eligible.chunks(config.batch_size.max(1)).enumerate() {
		if index > 0 && !pause_unless_stopped(&shared.running, config.batch_pause.sample()).await {
			break;
		}

		let handles: Vec<_> = batch
			.iter()
			.map(|account| {
				let task_shared = Arc::clone(shared);
				let capability = Arc::clone(capability);
				let task_config = config.clone();
				let account_id = account.id.clone();
				shared.queue.submit(
					move || task::run_task(task_shared, capability, task_config, account_id),
					config.priority,
					format!("{}:{}", name, account.id),
				)
			})
			.collect();
		submitted += handles.len();

		let failed = join_all(handles).await.iter().filter(|result| result.is_err()).count();
		debug!(
			target = "pw.fleet.orchestrator",
			capability = %name,
			batch = index,
			size = batch.len(),
			failed,
			"batch settled"
		);
	}

	Ok(submitted)
}

async fn maintenance_loop(shared: Arc<Shared>, max_age: Duration) {
	let interval = Duration::from_millis(shared.config.maintenance_interval_ms);
	while pause_unless_stopped(&shared.running, interval).await {
		let recycled = shared.pool.recycle_expired(max_age).await;
		if recycled > 0 {
			debug!(target = "pw.fleet.orchestrator", recycled, "host maintenance pass");
		}
	}
}

/// Sleeps for `duration`. Returns `false` if the token was cancelled first.
async fn pause_unless_stopped(running: &CancellationToken, duration: Duration) -> bool {
	tokio::select! {
		_ = running.cancelled() => false,
		_ = tokio::time::sleep(duration) => true,
	}
}
