//! Suspension of accounts that need a human.
//!
//! When a task meets an anti-automation challenge or its login is rejected,
//! the account is escalated: its stored auth state is invalidated, it is
//! dropped from every capability loop, and exactly one manual surface is
//! opened for an operator. The account becomes eligible again once that
//! surface closes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use pw_fleet_protocol::AuthState;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStore};
use crate::capability::{ChallengeKind, TaskStatus};
use crate::error::{FleetError, Result};

/// Why an account was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
	Challenge(ChallengeKind),
	AuthenticationRejected,
	/// Requested directly by an operator.
	Operator,
}

impl EscalationReason {
	pub fn from_status(status: &TaskStatus) -> Option<Self> {
		match status {
			TaskStatus::ChallengeDetected { kind } => Some(Self::Challenge(*kind)),
			TaskStatus::AuthenticationRejected => Some(Self::AuthenticationRejected),
			TaskStatus::Completed | TaskStatus::Skipped => None,
		}
	}

	pub fn from_error(err: &FleetError) -> Option<Self> {
		match err {
			FleetError::ChallengeDetected { kind, .. } => Some(Self::Challenge(ChallengeKind::from_name(kind))),
			FleetError::AuthenticationRejected(_) => Some(Self::AuthenticationRejected),
			_ => None,
		}
	}
}

impl fmt::Display for EscalationReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EscalationReason::Challenge(kind) => write!(f, "challenge ({})", kind),
			EscalationReason::AuthenticationRejected => f.write_str("authentication rejected"),
			EscalationReason::Operator => f.write_str("operator request"),
		}
	}
}

/// Sent once when a manual surface goes away.
#[derive(Debug, Clone, Default)]
pub struct SurfaceClosed {
	/// Auth state captured from the surface before it closed, if any.
	pub auth_state: Option<AuthState>,
}

/// Closes a manual surface from the engine side.
#[async_trait]
pub trait SurfaceControl: Send + Sync {
	async fn close(&self) -> Result<()>;
}

/// An open manual-intervention surface.
pub struct ManualSurface {
	pub control: Arc<dyn SurfaceControl>,
	/// Fires exactly once, however the surface ends.
	pub closed: oneshot::Receiver<SurfaceClosed>,
}

/// Opens human-visible sessions scoped to one account.
#[async_trait]
pub trait SurfaceFactory: Send + Sync {
	async fn open(&self, account: &Account, auto_close_on_success: bool) -> Result<ManualSurface>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
	/// Claimed; the surface is being opened.
	Escalating,
	/// Surface is open and watched.
	Active,
}

#[derive(Default)]
struct GateTable {
	states: HashMap<String, (GateState, EscalationReason)>,
	surfaces: HashMap<String, Arc<dyn SurfaceControl>>,
}

struct GateInner {
	factory: Arc<dyn SurfaceFactory>,
	store: Arc<dyn AccountStore>,
	auto_close: bool,
	table: Mutex<GateTable>,
	closing: AtomicBool,
}

/// Tracks suspended accounts and their manual surfaces.
#[derive(Clone)]
pub struct ChallengeGate {
	inner: Arc<GateInner>,
}

impl ChallengeGate {
	pub fn new(factory: Arc<dyn SurfaceFactory>, store: Arc<dyn AccountStore>, auto_close_on_success: bool) -> Self {
		Self {
			inner: Arc::new(GateInner {
				factory,
				store,
				auto_close: auto_close_on_success,
				table: Mutex::new(GateTable::default()),
				closing: AtomicBool::new(false),
			}),
		}
	}

	/// True while an escalation is in progress or its surface is open.
	pub fn is_suspended(&self, account_id: &str) -> bool {
		self.inner.table.lock().states.contains_key(account_id)
	}

	/// Suspended account ids, sorted.
	pub fn suspended(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.inner.table.lock().states.keys().cloned().collect();
		ids.sort();
		ids
	}

	pub fn open_surfaces(&self) -> usize {
		self.inner.table.lock().surfaces.len()
	}

	/// Suspends `account_id` and opens its manual surface.
	///
	/// Returns `false` without doing anything if the account is already
	/// suspended or the gate is closing. A surface that fails to open leaves
	/// the account unsuspended so a later task can escalate it again.
	pub async fn escalate(&self, account_id: &str, reason: EscalationReason) -> bool {
		{
			let mut table = self.inner.table.lock();
			if self.inner.closing.load(Ordering::Acquire) || table.states.contains_key(account_id) {
				debug!(target = "pw.fleet.gate", account = %account_id, %reason, "escalation already handled");
				return false;
			}
			table.states.insert(account_id.to_string(), (GateState::Escalating, reason));
		}

		warn!(target = "pw.fleet.gate", account = %account_id, %reason, "suspending account for manual intervention");

		if let Err(err) = self.inner.store.update_auth_state(account_id, None).await {
			warn!(target = "pw.fleet.gate", account = %account_id, error = %err, "failed to invalidate stored auth state");
		}

		let account = match self.inner.store.get_account(account_id).await {
			Ok(Some(account)) => account,
			Ok(None) => {
				warn!(target = "pw.fleet.gate", account = %account_id, "account vanished before its surface opened");
				self.clear(account_id);
				return false;
			}
			Err(err) => {
				warn!(target = "pw.fleet.gate", account = %account_id, error = %err, "failed to load account for surface");
				self.clear(account_id);
				return false;
			}
		};

		let surface = match self.inner.factory.open(&account, self.inner.auto_close).await {
			Ok(surface) => surface,
			Err(err) => {
				warn!(target = "pw.fleet.gate", account = %account_id, error = %err, "failed to open manual surface");
				self.clear(account_id);
				return false;
			}
		};

		let ManualSurface { control, closed } = surface;
		let accepted = {
			let mut table = self.inner.table.lock();
			if self.inner.closing.load(Ordering::Acquire) {
				table.states.remove(account_id);
				false
			} else {
				table.states.insert(account_id.to_string(), (GateState::Active, reason));
				table.surfaces.insert(account_id.to_string(), Arc::clone(&control));
				true
			}
		};

		if !accepted {
			debug!(target = "pw.fleet.gate", account = %account_id, "gate closed while surface was opening");
			if let Err(err) = control.close().await {
				debug!(target = "pw.fleet.gate", account = %account_id, error = %err, "surface close failed");
			}
			return false;
		}

		info!(target = "pw.fleet.gate", account = %account_id, "manual surface open");

		let gate = self.clone();
		let id = account_id.to_string();
		tokio::spawn(async move {
			let closed = closed.await.unwrap_or_default();
			gate.on_resolved(&id, closed).await;
		});
		true
	}

	/// Lifts the suspension once the account's surface has closed.
	///
	/// Auth state from surfaces torn down by [`close_all`](Self::close_all) is
	/// discarded; only an operator-finished surface writes to the store.
	pub async fn on_resolved(&self, account_id: &str, closed: SurfaceClosed) {
		let captured = closed.auth_state.filter(|s| !s.is_empty());
		if captured.is_some() && self.inner.closing.load(Ordering::Acquire) {
			debug!(target = "pw.fleet.gate", account = %account_id, "gate closing; captured auth state dropped");
		} else if let Some(state) = captured {
			match self.inner.store.update_auth_state(account_id, Some(state)).await {
				Ok(()) => debug!(target = "pw.fleet.gate", account = %account_id, "stored auth state captured by operator"),
				Err(err) => warn!(target = "pw.fleet.gate", account = %account_id, error = %err, "failed to store captured auth state"),
			}
		}

		let was_suspended = {
			let mut table = self.inner.table.lock();
			table.surfaces.remove(account_id);
			table.states.remove(account_id).is_some()
		};
		if was_suspended {
			info!(target = "pw.fleet.gate", account = %account_id, "account resumed");
		}
	}

	/// Closes every open surface and refuses new escalations. Returns how many were closed.
	pub async fn close_all(&self) -> usize {
		self.inner.closing.store(true, Ordering::Release);
		let surfaces: Vec<(String, Arc<dyn SurfaceControl>)> = self.inner.table.lock().surfaces.drain().collect();

		for (account_id, control) in &surfaces {
			if let Err(err) = control.close().await {
				warn!(target = "pw.fleet.gate", account = %account_id, error = %err, "surface close failed");
			}
		}
		if !surfaces.is_empty() {
			info!(target = "pw.fleet.gate", surfaces = surfaces.len(), "manual surfaces closed");
		}
		surfaces.len()
	}

	fn clear(&self, account_id: &str) {
		let mut table = self.inner.table.lock();
		if matches!(table.states.get(account_id), Some((GateState::Escalating, _))) {
			table.states.remove(account_id);
		}
	}
}
