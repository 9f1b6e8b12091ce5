//! In-memory fakes for the collaborator traits.
//!
//! Built for unit tests and, with the `testing` feature, for integration tests
//! of this crate and its dependents.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pw_fleet_protocol::AuthState;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::account::{Account, AccountStore, CapabilitySettings, ProxySpec, ResourceKey};
use crate::error::{FleetError, Result};
use crate::gate::{ManualSurface, SurfaceClosed, SurfaceControl, SurfaceFactory};
use crate::pool::{ContextHandle, HostDriver, HostHandle};

#[derive(Default)]
pub struct MemoryStore {
	accounts: Mutex<HashMap<String, Account>>,
	pub auth_writes: Mutex<Vec<(String, Option<AuthState>)>>,
	pub info_writes: Mutex<Vec<(String, Map<String, Value>)>>,
	pub fail_listing: AtomicBool,
}

impl MemoryStore {
	pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Arc<Self> {
		let store = Self::default();
		{
			let mut map = store.accounts.lock();
			for account in accounts {
				map.insert(account.id.clone(), account);
			}
		}
		Arc::new(store)
	}

	pub fn account(&self, id: &str) -> Option<Account> {
		self.accounts.lock().get(id).cloned()
	}

	pub fn set_active(&self, id: &str, active: bool) {
		if let Some(account) = self.accounts.lock().get_mut(id) {
			account.active = active;
		}
	}
}

#[async_trait]
impl AccountStore for MemoryStore {
	async fn get_account(&self, id: &str) -> Result<Option<Account>> {
		Ok(self.account(id))
	}

	async fn eligible_accounts(&self) -> Result<Vec<Account>> {
		if self.fail_listing.load(Ordering::SeqCst) {
			return Err(FleetError::Store("listing unavailable".into()));
		}
		let mut accounts: Vec<Account> = self.accounts.lock().values().filter(|a| a.active).cloned().collect();
		accounts.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(accounts)
	}

	async fn capability_settings(&self, id: &str, capability: &str) -> Result<Option<CapabilitySettings>> {
		Ok(self.accounts.lock().get(id).and_then(|a| a.capabilities.get(capability).cloned()))
	}

	async fn update_auth_state(&self, id: &str, state: Option<AuthState>) -> Result<()> {
		if let Some(account) = self.accounts.lock().get_mut(id) {
			account.auth_state = state.clone();
		}
		self.auth_writes.lock().push((id.to_string(), state));
		Ok(())
	}

	async fn update_account_info(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
		if let Some(account) = self.accounts.lock().get_mut(id) {
			account.info.extend(fields.clone());
		}
		self.info_writes.lock().push((id.to_string(), fields));
		Ok(())
	}
}

#[derive(Default)]
pub struct FakeDriver {
	pub launches: AtomicUsize,
	pub launch_delay: Mutex<Option<Duration>>,
	/// Applied to every `new_context` on hosts launched afterwards.
	pub context_delay: Mutex<Option<Duration>>,
	pub fail_launch: AtomicBool,
	pub hosts: Mutex<Vec<Arc<FakeHost>>>,
}

impl FakeDriver {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn open_hosts(&self) -> usize {
		self.hosts.lock().iter().filter(|h| !h.closed.load(Ordering::SeqCst)).count()
	}

	pub fn open_contexts(&self) -> usize {
		self.hosts.lock().iter().map(|h| h.open_contexts()).sum()
	}
}

#[async_trait]
impl HostDriver for FakeDriver {
	async fn launch(&self, key: &ResourceKey, _proxy: Option<&ProxySpec>) -> Result<Arc<dyn HostHandle>> {
		self.launches.fetch_add(1, Ordering::SeqCst);
		let delay = *self.launch_delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if self.fail_launch.load(Ordering::SeqCst) {
			return Err(FleetError::Driver(format!("cannot launch host for {}", key)));
		}
		let host = Arc::new(FakeHost {
			key: key.clone(),
			context_delay: *self.context_delay.lock(),
			closed: AtomicBool::new(false),
			contexts: Mutex::new(Vec::new()),
			next: AtomicUsize::new(0),
		});
		self.hosts.lock().push(Arc::clone(&host));
		Ok(host)
	}
}

pub struct FakeHost {
	pub key: ResourceKey,
	context_delay: Option<Duration>,
	pub closed: AtomicBool,
	pub contexts: Mutex<Vec<Arc<FakeContext>>>,
	next: AtomicUsize,
}

impl FakeHost {
	pub fn open_contexts(&self) -> usize {
		self.contexts.lock().iter().filter(|c| !c.closed.load(Ordering::SeqCst)).count()
	}
}

#[async_trait]
impl HostHandle for FakeHost {
	async fn new_context(&self) -> Result<Arc<dyn ContextHandle>> {
		if let Some(delay) = self.context_delay {
			tokio::time::sleep(delay).await;
		}
		if self.closed.load(Ordering::SeqCst) {
			return Err(FleetError::Driver("host closed".into()));
		}
		let n = self.next.fetch_add(1, Ordering::SeqCst);
		let context = Arc::new(FakeContext {
			id: format!("{}#{}", self.key, n),
			jar: Mutex::new(AuthState::default()),
			closed: AtomicBool::new(false),
		});
		self.contexts.lock().push(Arc::clone(&context));
		Ok(context)
	}

	async fn close(&self) -> Result<()> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}
}

pub struct FakeContext {
	pub id: String,
	pub jar: Mutex<AuthState>,
	pub closed: AtomicBool,
}

#[async_trait]
impl ContextHandle for FakeContext {
	fn id(&self) -> &str {
		&self.id
	}

	async fn apply_auth_state(&self, state: &AuthState) -> Result<()> {
		*self.jar.lock() = state.clone();
		Ok(())
	}

	async fn auth_state(&self) -> Result<AuthState> {
		Ok(self.jar.lock().clone())
	}

	async fn close(&self) -> Result<()> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}
}

/// Surface factory that records opens and lets tests fire the closed signal.
#[derive(Default)]
pub struct FakeSurfaces {
	pub opened: Mutex<Vec<String>>,
	pub closed_by_gate: AtomicUsize,
	pub fail_open: AtomicBool,
	pub open_delay: Mutex<Option<Duration>>,
	/// Auth state reported when the gate closes a surface.
	pub state_on_close: Mutex<Option<AuthState>>,
	resolvers: Mutex<HashMap<String, oneshot::Sender<SurfaceClosed>>>,
}

impl FakeSurfaces {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn open_count(&self) -> usize {
		self.opened.lock().len()
	}

	/// Surfaces opened and not yet closed.
	pub fn still_open(&self) -> usize {
		self.resolvers.lock().len()
	}

	/// Simulates the operator finishing with the surface.
	pub fn resolve(&self, account_id: &str, closed: SurfaceClosed) -> bool {
		match self.resolvers.lock().remove(account_id) {
			Some(tx) => tx.send(closed).is_ok(),
			None => false,
		}
	}
}

struct FakeSurfaceControl {
	factory: Arc<FakeSurfaces>,
	account_id: String,
}

#[async_trait]
impl SurfaceControl for FakeSurfaceControl {
	async fn close(&self) -> Result<()> {
		self.factory.closed_by_gate.fetch_add(1, Ordering::SeqCst);
		let auth_state = self.factory.state_on_close.lock().clone();
		self.factory.resolve(&self.account_id, SurfaceClosed { auth_state });
		Ok(())
	}
}

pub struct SharedSurfaces(pub Arc<FakeSurfaces>);

#[async_trait]
impl SurfaceFactory for SharedSurfaces {
	async fn open(&self, account: &Account, _auto_close_on_success: bool) -> Result<ManualSurface> {
		let delay = *self.0.open_delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if self.0.fail_open.load(Ordering::SeqCst) {
			return Err(FleetError::Surface("display unavailable".into()));
		}
		let (tx, rx) = oneshot::channel();
		self.0.opened.lock().push(account.id.clone());
		self.0.resolvers.lock().insert(account.id.clone(), tx);
		Ok(ManualSurface {
			control: Arc::new(FakeSurfaceControl {
				factory: Arc::clone(&self.0),
				account_id: account.id.clone(),
			}),
			closed: rx,
		})
	}
}

pub fn enabled(capability: &str) -> (String, CapabilitySettings) {
	(
		capability.to_string(),
		CapabilitySettings {
			enabled: true,
			template: None,
		},
	)
}

pub fn account(id: &str, proxy: Option<&str>, capabilities: &[&str]) -> Account {
	let mut account = Account::new(id);
	if let Some(server) = proxy {
		account = account.with_proxy(ProxySpec {
			server: server.to_string(),
			username: None,
			password: None,
		});
	}
	for capability in capabilities {
		let (name, settings) = enabled(capability);
		account = account.with_capability(name, settings);
	}
	account
}
