//! The wrapper every capability body runs inside.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Shared;
use crate::account::CapabilitySettings;
use crate::capability::{Capability, CapabilityOutcome, TaskStatus};
use crate::config::{CapabilityConfig, Pacing};
use crate::error::{ErrorClass, FleetError, Result};
use crate::gate::EscalationReason;
use crate::pool::Lease;

/// Runs one capability for one account and records the consequences.
///
/// Acquires a context, runs the body under the capability's timeout, persists
/// what the outcome asks for, releases the context, then either escalates the
/// account or writes its next due time. Errors are logged here and returned
/// only so the queue can count them.
pub(super) async fn run_task(
	shared: Arc<Shared>,
	capability: Arc<dyn Capability>,
	config: CapabilityConfig,
	account_id: String,
) -> Result<TaskStatus> {
	let name = capability.name().to_string();

	let settings = match shared.store.capability_settings(&account_id, &name).await {
		Ok(Some(settings)) if settings.enabled => settings,
		Ok(_) => {
			debug!(target = "pw.fleet.orchestrator", account = %account_id, capability = %name, "capability disabled since selection");
			return Ok(TaskStatus::Skipped);
		}
		Err(err) => {
			handle_failure(&shared, &name, &account_id, &err).await;
			return Err(err);
		}
	};

	let lease = match shared.pool.acquire_context(&account_id).await {
		Ok(lease) => lease,
		Err(err) => {
			handle_failure(&shared, &name, &account_id, &err).await;
			return Err(err);
		}
	};

	let result = run_body(&shared, capability.as_ref(), &config, &lease, &settings).await;
	let Lease { context, resource_key, .. } = lease;
	shared.pool.release_context(context, &resource_key).await;

	match result {
		Ok(outcome) => {
			if let Some(reason) = EscalationReason::from_status(&outcome.status) {
				shared.due.clear(&account_id, &name);
				shared.gate.escalate(&account_id, reason).await;
				return Ok(outcome.status);
			}

			match config.pacing {
				Pacing::Timed => {
					let interval = outcome.next_due_in.unwrap_or_else(|| config.default_interval());
					shared.due.schedule(&account_id, &name, interval);
					debug!(
						target = "pw.fleet.orchestrator",
						account = %account_id,
						capability = %name,
						next_due_secs = interval.as_secs(),
						"task finished"
					);
				}
				Pacing::Continuous => shared.due.clear(&account_id, &name),
			}
			Ok(outcome.status)
		}
		Err(err) => {
			handle_failure(&shared, &name, &account_id, &err).await;
			Err(err)
		}
	}
}

/// Runs the body and performs the writes that need the live context.
async fn run_body(
	shared: &Shared,
	capability: &dyn Capability,
	config: &CapabilityConfig,
	lease: &Lease,
	settings: &CapabilitySettings,
) -> Result<CapabilityOutcome> {
	let account_id = lease.account.id.as_str();
	let name = capability.name();
	let timeout = config.task_timeout();

	let outcome = match tokio::time::timeout(timeout, capability.run(&lease.context, &lease.account, settings)).await {
		Ok(result) => result?,
		Err(_) => {
			return Err(FleetError::Timeout {
				label: format!("{}:{}", name, account_id),
				timeout_ms: timeout.as_millis() as u64,
			});
		}
	};

	if outcome.status == TaskStatus::Completed && (config.persist_auth_on_success || outcome.persist_auth) {
		if let Err(err) = shared.pool.persist_auth_state(&lease.context, account_id).await {
			warn!(target = "pw.fleet.orchestrator", account = %account_id, capability = %name, error = %err, "failed to persist auth state");
		}
	}

	if let Some(info) = outcome.account_info.as_ref().filter(|info| !info.is_empty()) {
		if let Err(err) = shared.store.update_account_info(account_id, info.clone()).await {
			warn!(target = "pw.fleet.orchestrator", account = %account_id, capability = %name, error = %err, "failed to update account info");
		}
	}

	Ok(outcome)
}

async fn handle_failure(shared: &Shared, capability: &str, account_id: &str, err: &FleetError) {
	match err.class() {
		ErrorClass::Escalate => {
			shared.due.clear(account_id, capability);
			if let Some(reason) = EscalationReason::from_error(err) {
				shared.gate.escalate(account_id, reason).await;
			}
		}
		ErrorClass::Acquisition => {
			let backoff = &shared.config.backoff;
			let (failures, delay) = shared.due.record_failure(account_id, capability, backoff);
			if failures >= backoff.warn_after {
				warn!(
					target = "pw.fleet.orchestrator",
					account = %account_id,
					capability = %capability,
					failures,
					retry_in_secs = delay.as_secs(),
					error = %err,
					"session acquisition keeps failing"
				);
			} else {
				debug!(
					target = "pw.fleet.orchestrator",
					account = %account_id,
					capability = %capability,
					failures,
					retry_in_secs = delay.as_secs(),
					error = %err,
					"session acquisition failed"
				);
			}
		}
		ErrorClass::Transient => {
			warn!(
				target = "pw.fleet.orchestrator",
				account = %account_id,
				capability = %capability,
				error = %err,
				"task failed; retrying next cycle"
			);
		}
		ErrorClass::Shutdown => {
			info!(target = "pw.fleet.orchestrator", account = %account_id, capability = %capability, "task abandoned during shutdown");
		}
	}
}
