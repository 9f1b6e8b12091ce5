//! Priority-ordered, concurrency-limited task executor.
//!
//! Pending tasks are kept in a heap ordered by ascending priority number with
//! FIFO order among equal priorities. Whenever a slot is free the most urgent
//! task is started on the Tokio runtime; when it settles the slot is released
//! and dispatch runs again. Task failures and panics are captured into the
//! task's [`TaskHandle`] and never affect the queue itself.
//!
//! The queue does not bound task duration. Operations carry their own
//! timeouts; a task that never settles keeps its slot.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::error::{FleetError, Result};


type Job = Box<dyn FnOnce() -> BoxFuture<'static, bool> + Send>;

struct PendingTask {
	priority: u32,
	seq: u64,
	label: String,
	submitted_at: Instant,
	job: Job,
}

// BinaryHeap is a max-heap; invert so the lowest (priority, seq) pops first.
impl Ord for PendingTask {
	fn cmp(&self, other: &Self) -> Ordering {
		other.priority.cmp(&self.priority).then_with(|| other.seq.cmp(&self.seq))
	}
}

impl PartialOrd for PendingTask {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl PartialEq for PendingTask {
	fn eq(&self, other: &Self) -> bool {
		self.priority == other.priority && self.seq == other.seq
	}
}

impl Eq for PendingTask {}

#[derive(Default)]
struct QueueState {
	pending: BinaryHeap<PendingTask>,
	running: usize,
	completed: u64,
	failed: u64,
	next_seq: u64,
}

impl QueueState {
	fn load(&self) -> usize {
		self.pending.len() + self.running
	}
}

struct QueueInner {
	ceiling: usize,
	state: Mutex<QueueState>,
	/// Queued plus running; observed by `drain_and_wait`.
	load: watch::Sender<usize>,
}

/// Counters reported by [`TaskQueue::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
	pub queued: usize,
	pub running: usize,
	pub completed: u64,
	pub failed: u64,
}

/// Admission-controlled executor shared by every capability loop.
#[derive(Clone)]
pub struct TaskQueue {
	inner: Arc<QueueInner>,
}

impl TaskQueue {
	/// Creates a queue that runs at most `ceiling` tasks at once (minimum 1).
	pub fn new(ceiling: usize) -> Self {
		let (load, _) = watch::channel(0);
		Self {
			inner: Arc::new(QueueInner {
				ceiling: ceiling.max(1),
				state: Mutex::new(QueueState::default()),
				load,
			}),
		}
	}

	pub fn ceiling(&self) -> usize {
		self.inner.ceiling
	}

	/// Enqueues `operation` and returns a handle that resolves when it settles.
	///
	/// Never waits for a slot. Must be called from within a Tokio runtime.
	pub fn submit<F, Fut, T>(&self, operation: F, priority: u32, label: impl Into<String>) -> TaskHandle<T>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
		T: Send + 'static,
	{
		let label = label.into();
		let (tx, rx) = oneshot::channel();
		let task_label = label.clone();
		let job: Job = Box::new(move || {
			async move {
				let outcome = AssertUnwindSafe(async move { operation().await }).catch_unwind().await;
				let result = match outcome {
					Ok(result) => result,
					Err(_) => {
						warn!(target = "pw.fleet.queue", label = %task_label, "task panicked");
						Err(FleetError::TaskPanicked(task_label))
					}
				};
				let ok = result.is_ok();
				let _ = tx.send(result);
				ok
			}
			.boxed()
		});

		{
			let mut state = self.inner.state.lock();
			let seq = state.next_seq;
			state.next_seq += 1;
			state.pending.push(PendingTask {
				priority,
				seq,
				label: label.clone(),
				submitted_at: Instant::now(),
				job,
			});
			self.inner.load.send_replace(state.load());
		}

		dispatch(&self.inner);
		TaskHandle { label, rx }
	}

	/// Waits until nothing is queued or running. Returns `false` on timeout.
	///
	/// New submissions are still accepted while waiting.
	pub async fn drain_and_wait(&self, timeout: Duration) -> bool {
		let mut load = self.inner.load.subscribe();
		matches!(tokio::time::timeout(timeout, load.wait_for(|n| *n == 0)).await, Ok(Ok(_)))
	}

	/// Discards every task that has not started yet and returns how many were dropped.
	///
	/// Handles of discarded tasks resolve with [`FleetError::Discarded`].
	pub fn clear_pending(&self) -> usize {
		let discarded = {
			let mut state = self.inner.state.lock();
			let discarded = std::mem::take(&mut state.pending);
			self.inner.load.send_replace(state.load());
			discarded
		};
		let count = discarded.len();
		for task in discarded.into_vec() {
			debug!(target = "pw.fleet.queue", label = %task.label, priority = task.priority, "discarding pending task");
		}
		count
	}

	pub fn stats(&self) -> QueueStats {
		let state = self.inner.state.lock();
		QueueStats {
			queued: state.pending.len(),
			running: state.running,
			completed: state.completed,
			failed: state.failed,
		}
	}
}

fn dispatch(inner: &Arc<QueueInner>) {
	loop {
		let task = {
			let mut state = inner.state.lock();
			if state.running >= inner.ceiling {
				return;
			}
			let Some(task) = state.pending.pop() else {
				return;
			};
			state.running += 1;
			task
		};

		debug!(
			target = "pw.fleet.queue",
			label = %task.label,
			priority = task.priority,
			waited_ms = task.submitted_at.elapsed().as_millis() as u64,
			"dispatching task"
		);

		let inner = Arc::clone(inner);
		tokio::spawn(async move {
			let ok = (task.job)().await;
			{
				let mut state = inner.state.lock();
				state.running -= 1;
				if ok {
					state.completed += 1;
				} else {
					state.failed += 1;
				}
				inner.load.send_replace(state.load());
			}
			dispatch(&inner);
		});
	}
}

/// Future resolving to the outcome of a submitted task.
#[must_use = "dropping a TaskHandle does not cancel the task"]
pub struct TaskHandle<T> {
	label: String,
	rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
	pub fn label(&self) -> &str {
		&self.label
	}
}

impl<T> Future for TaskHandle<T> {
	type Output = Result<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.get_mut();
		Pin::new(&mut this.rx)
			.poll(cx)
			.map(|received| received.unwrap_or_else(|_| Err(FleetError::Discarded(this.label.clone()))))
	}
}
