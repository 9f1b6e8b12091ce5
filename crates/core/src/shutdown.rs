//! Ordered teardown of the engine.
//!
//! 1. Cancel the running flag; loops exit after their current batch.
//! 2. Wait, bounded, for the loops and then for the queue to drain.
//! 3. On timeout, discard tasks that never started.
//! 4. Close every context and host.
//! 5. Close every manual surface.
//!
//! Every step runs even if an earlier one timed out. Auth state is not
//! persisted during teardown.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gate::ChallengeGate;
use crate::orchestrator::Orchestrator;
use crate::pool::ResourcePool;
use crate::queue::TaskQueue;

/// What the shutdown sequence did.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
	/// Whether loops and queue settled within the timeout.
	pub drained: bool,
	pub discarded: usize,
	pub loops_aborted: usize,
	pub hosts_closed: usize,
	pub surfaces_closed: usize,
}

impl ShutdownReport {
	/// 0 after a clean drain, 2 when the drain timed out and teardown was forced.
	pub fn exit_code(&self) -> i32 {
		if self.drained { 0 } else { 2 }
	}
}

/// Runs the teardown sequence once; later callers get the same report.
pub struct ShutdownCoordinator {
	token: CancellationToken,
	queue: TaskQueue,
	pool: Arc<ResourcePool>,
	gate: ChallengeGate,
	timeout: Duration,
	loops: Mutex<Vec<JoinHandle<()>>>,
	report: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
	pub fn new(token: CancellationToken, queue: TaskQueue, pool: Arc<ResourcePool>, gate: ChallengeGate, timeout: Duration) -> Self {
		Self {
			token,
			queue,
			pool,
			gate,
			timeout,
			loops: Mutex::new(Vec::new()),
			report: OnceCell::new(),
		}
	}

	/// Builds a coordinator for `orchestrator`, taking ownership of its loop tasks.
	pub fn for_orchestrator(orchestrator: &Orchestrator) -> Self {
		let coordinator = Self::new(
			orchestrator.running_flag(),
			orchestrator.queue().clone(),
			Arc::clone(orchestrator.pool()),
			orchestrator.gate().clone(),
			orchestrator.config().shutdown_timeout(),
		);
		coordinator.track_all(orchestrator.take_loops());
		coordinator
	}

	/// Adds tasks that must observe the running flag and exit.
	pub fn track_all(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
		self.loops.lock().extend(handles);
	}

	pub fn token(&self) -> CancellationToken {
		self.token.clone()
	}

	pub fn is_shutting_down(&self) -> bool {
		self.token.is_cancelled()
	}

	pub async fn shutdown(&self) -> ShutdownReport {
		*self.report.get_or_init(|| self.run()).await
	}

	async fn run(&self) -> ShutdownReport {
		let deadline = Instant::now() + self.timeout;
		self.token.cancel();

		let loops = std::mem::take(&mut *self.loops.lock());
		info!(
			target = "pw.fleet.shutdown",
			loops = loops.len(),
			timeout_ms = self.timeout.as_millis() as u64,
			"stopping capability loops"
		);
		let loops_aborted = join_loops(loops, deadline).await;

		let remaining = deadline.saturating_duration_since(Instant::now());
		let drained = loops_aborted == 0 && self.queue.drain_and_wait(remaining).await;

		let mut discarded = 0;
		if !drained {
			discarded = self.queue.clear_pending();
			let stats = self.queue.stats();
			warn!(
				target = "pw.fleet.shutdown",
				discarded,
				still_running = stats.running,
				"drain timed out; forcing teardown"
			);
		}

		let hosts_closed = self.pool.shutdown_all().await;
		let surfaces_closed = self.gate.close_all().await;

		let report = ShutdownReport {
			drained,
			discarded,
			loops_aborted,
			hosts_closed,
			surfaces_closed,
		};
		info!(
			target = "pw.fleet.shutdown",
			drained,
			discarded,
			hosts_closed,
			surfaces_closed,
			"shutdown complete"
		);
		report
	}
}

/// Joins `loops` until `deadline`, aborting whatever is still running. Returns the abort count.
async fn join_loops(loops: Vec<JoinHandle<()>>, deadline: Instant) -> usize {
	let aborts: Vec<_> = loops.iter().map(|handle| handle.abort_handle()).collect();
	if tokio::time::timeout_at(deadline, join_all(loops)).await.is_ok() {
		return 0;
	}

	let mut aborted = 0;
	for handle in aborts.iter().filter(|handle| !handle.is_finished()) {
		handle.abort();
		aborted += 1;
	}
	warn!(target = "pw.fleet.shutdown", aborted, "capability loops did not stop in time");
	aborted
}
