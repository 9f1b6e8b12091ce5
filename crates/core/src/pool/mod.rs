//! Keyed pool of shared session hosts with isolated per-task contexts.
//!
//! Accounts behind the same egress identity share one host, which bounds the
//! number of expensive automation processes regardless of account count.
//! Every task still gets its own context, so cookies and storage never leak
//! between accounts that share a host.
//!
//! A host is the arena and contexts are checked-out slots: releasing a
//! context closes the slot and leaves the host running.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStore, ProxySpec, ResourceKey};
use crate::error::{FleetError, Result};

mod driver;
#[cfg(test)]
mod tests;

pub use driver::{ContextHandle, HostDriver, HostHandle};

/// A shared automation process for one resource key.
pub struct SessionHost {
	key: ResourceKey,
	handle: Arc<dyn HostHandle>,
	created_at: Instant,
	active: Mutex<HashMap<u64, Arc<dyn ContextHandle>>>,
	/// Checkouts reserved but not yet in `active`.
	pending: AtomicUsize,
	retired: AtomicBool,
}

impl SessionHost {
	pub fn key(&self) -> &ResourceKey {
		&self.key
	}

	pub fn handle(&self) -> &Arc<dyn HostHandle> {
		&self.handle
	}

	pub fn age(&self) -> Duration {
		self.created_at.elapsed()
	}

	pub fn active_sessions(&self) -> usize {
		self.active.lock().len()
	}

	fn is_idle(&self) -> bool {
		// pending first: a checkout lands in `active` before its reservation is dropped
		self.pending.load(Ordering::SeqCst) == 0 && self.active_sessions() == 0
	}

	/// Marks the host closed; true only for the first caller.
	fn retire(&self) -> bool {
		!self.retired.swap(true, Ordering::AcqRel)
	}
}

/// Keeps a host out of recycling while a context is being created on it.
struct Checkout(Arc<SessionHost>);

impl Drop for Checkout {
	fn drop(&mut self) {
		self.0.pending.fetch_sub(1, Ordering::SeqCst);
	}
}

/// An isolated context owned by exactly one task.
///
/// Deliberately not `Clone`: a context is never shared across tasks.
pub struct SessionContext {
	id: u64,
	account_id: String,
	resource_key: ResourceKey,
	handle: Arc<dyn ContextHandle>,
}

impl SessionContext {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn account_id(&self) -> &str {
		&self.account_id
	}

	pub fn resource_key(&self) -> &ResourceKey {
		&self.resource_key
	}

	pub fn handle(&self) -> &dyn ContextHandle {
		self.handle.as_ref()
	}

	/// Returns the backend context as `T`, if that is its concrete type.
	pub fn downcast<T: ContextHandle>(&self) -> Option<&T> {
		self.handle.as_ref().downcast_ref::<T>()
	}
}

impl std::fmt::Debug for SessionContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionContext")
			.field("id", &self.id)
			.field("account_id", &self.account_id)
			.field("resource_key", &self.resource_key)
			.field("backend_id", &self.handle.id())
			.finish()
	}
}

/// Everything a task needs for one run.
pub struct Lease {
	pub host: Arc<SessionHost>,
	pub context: SessionContext,
	pub account: Account,
	pub resource_key: ResourceKey,
}

/// Counters reported by [`ResourcePool::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
	pub host_count: usize,
	pub active_context_count: usize,
}

type HostSlot = Arc<OnceCell<Arc<SessionHost>>>;

/// Lazily populated map of resource key to session host.
pub struct ResourcePool {
	driver: Arc<dyn HostDriver>,
	store: Arc<dyn AccountStore>,
	hosts: Mutex<HashMap<ResourceKey, HostSlot>>,
	closed: AtomicBool,
	next_context_id: AtomicU64,
}

impl ResourcePool {
	pub fn new(driver: Arc<dyn HostDriver>, store: Arc<dyn AccountStore>) -> Self {
		Self {
			driver,
			store,
			hosts: Mutex::new(HashMap::new()),
			closed: AtomicBool::new(false),
			next_context_id: AtomicU64::new(1),
		}
	}

	/// Checks out an isolated context for `account_id`, creating its host on first use.
	pub async fn acquire_context(&self, account_id: &str) -> Result<Lease> {
		self.ensure_open()?;

		let account = self
			.store
			.get_account(account_id)
			.await?
			.ok_or_else(|| FleetError::AccountNotFound(account_id.to_string()))?;
		let resource_key = account.resource_key();

		let checkout = self.host_for(&resource_key, account.proxy.as_ref()).await?;
		let host = Arc::clone(&checkout.0);
		let handle = host
			.handle
			.new_context()
			.await
			.map_err(|e| FleetError::acquisition(&resource_key, e))?;

		let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
		host.active.lock().insert(id, Arc::clone(&handle));
		drop(checkout);
		let context = SessionContext {
			id,
			account_id: account.id.clone(),
			resource_key: resource_key.clone(),
			handle,
		};

		// shutdown_all may have swept the host while the context was being created
		if self.closed.load(Ordering::Acquire) {
			self.release_context(context, &resource_key).await;
			return Err(FleetError::ShuttingDown);
		}

		if let Some(state) = account.auth_state.as_ref().filter(|s| !s.is_empty()) {
			if let Err(err) = context.handle.apply_auth_state(state).await {
				self.release_context(context, &resource_key).await;
				return Err(FleetError::acquisition(&resource_key, format!("auth state injection failed: {}", err)));
			}
			debug!(
				target = "pw.fleet.pool",
				account = %account.id,
				cookies = state.cookies.len(),
				"injected persisted auth state"
			);
		}

		debug!(
			target = "pw.fleet.pool",
			account = %account.id,
			key = %resource_key,
			context = id,
			active = host.active_sessions(),
			"context acquired"
		);

		Ok(Lease {
			host,
			context,
			account,
			resource_key,
		})
	}

	async fn host_for(&self, key: &ResourceKey, proxy: Option<&ProxySpec>) -> Result<Checkout> {
		loop {
			// The slot is registered before any await so concurrent first users
			// of the same key all wait on the same initialization.
			let slot = {
				let mut hosts = self.hosts.lock();
				Arc::clone(hosts.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())))
			};

			let host = slot
				.get_or_try_init(|| async {
					info!(target = "pw.fleet.pool", key = %key, "launching session host");
					let handle = self.driver.launch(key, proxy).await.map_err(|e| FleetError::acquisition(key, e))?;
					Ok::<_, FleetError>(Arc::new(SessionHost {
						key: key.clone(),
						handle,
						created_at: Instant::now(),
						active: Mutex::new(HashMap::new()),
						pending: AtomicUsize::new(0),
						retired: AtomicBool::new(false),
					}))
				})
				.await?;
			let host = Arc::clone(host);

			// Reserve under the map lock so recycling cannot pick the host in between.
			let reserved = {
				let hosts = self.hosts.lock();
				let current = !self.closed.load(Ordering::Acquire) && hosts.get(key).is_some_and(|s| Arc::ptr_eq(s, &slot));
				if current {
					host.pending.fetch_add(1, Ordering::SeqCst);
				}
				current
			};
			if reserved {
				return Ok(Checkout(host));
			}

			if self.closed.load(Ordering::Acquire) {
				// launched after shutdown_all swept the map; nobody else owns it
				self.close_host(&host).await;
				return Err(FleetError::ShuttingDown);
			}
			debug!(target = "pw.fleet.pool", key = %key, "host recycled before checkout; relaunching");
		}
	}

	/// Closes `context` and returns its slot to the host. Never fails.
	pub async fn release_context(&self, context: SessionContext, resource_key: &ResourceKey) {
		let host = self.hosts.lock().get(resource_key).and_then(|slot| slot.get().cloned());
		if let Some(host) = host {
			host.active.lock().remove(&context.id);
		}

		if let Err(err) = context.handle.close().await {
			debug!(
				target = "pw.fleet.pool",
				account = %context.account_id,
				context = context.id,
				error = %err,
				"context close failed"
			);
		}
	}

	/// Extracts the context's current auth state and hands it to the store.
	pub async fn persist_auth_state(&self, context: &SessionContext, account_id: &str) -> Result<()> {
		let state = context.handle.auth_state().await?;
		debug!(
			target = "pw.fleet.pool",
			account = %account_id,
			cookies = state.cookies.len(),
			"persisting auth state"
		);
		self.store.update_auth_state(account_id, Some(state)).await
	}

	pub fn stats(&self) -> PoolStats {
		let hosts = self.live_hosts();
		PoolStats {
			host_count: hosts.len(),
			active_context_count: hosts.iter().map(|h| h.active_sessions()).sum(),
		}
	}

	/// Closes idle hosts older than `max_age`; they are recreated on next use.
	pub async fn recycle_expired(&self, max_age: Duration) -> usize {
		let expired: Vec<Arc<SessionHost>> = {
			let mut hosts = self.hosts.lock();
			let keys: Vec<ResourceKey> = hosts
				.iter()
				.filter_map(|(key, slot)| {
					let host = slot.get()?;
					(host.age() >= max_age && host.is_idle()).then(|| key.clone())
				})
				.collect();
			keys.iter()
				.filter_map(|key| hosts.remove(key))
				.filter_map(|slot| slot.get().cloned())
				.collect()
		};

		for host in &expired {
			info!(
				target = "pw.fleet.pool",
				key = %host.key,
				age_secs = host.age().as_secs(),
				"recycling idle session host"
			);
			self.close_host(host).await;
		}
		expired.len()
	}

	/// Tears down every context, then every host. Later acquisitions fail.
	pub async fn shutdown_all(&self) -> usize {
		self.closed.store(true, Ordering::Release);
		let hosts: Vec<Arc<SessionHost>> = self
			.hosts
			.lock()
			.drain()
			.filter_map(|(_, slot)| slot.get().cloned())
			.collect();

		for host in &hosts {
			let contexts: Vec<_> = host.active.lock().drain().collect();
			for (id, context) in contexts {
				if let Err(err) = context.close().await {
					debug!(target = "pw.fleet.pool", key = %host.key, context = id, error = %err, "context close failed");
				}
			}
		}

		for host in &hosts {
			self.close_host(host).await;
		}

		info!(target = "pw.fleet.pool", hosts = hosts.len(), "resource pool shut down");
		hosts.len()
	}

	async fn close_host(&self, host: &SessionHost) {
		if !host.retire() {
			return;
		}
		match host.handle.close().await {
			Ok(()) => debug!(target = "pw.fleet.pool", key = %host.key, "host closed"),
			Err(err) => warn!(target = "pw.fleet.pool", key = %host.key, error = %err, "host close failed"),
		}
	}

	fn live_hosts(&self) -> Vec<Arc<SessionHost>> {
		self.hosts.lock().values().filter_map(|slot| slot.get().cloned()).collect()
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(FleetError::ShuttingDown);
		}
		Ok(())
	}
}
