//! Seams between the pool and the concrete automation backend.

use std::sync::Arc;

use async_trait::async_trait;
use downcast_rs::{DowncastSync, impl_downcast};
use pw_fleet_protocol::AuthState;

use crate::account::{ProxySpec, ResourceKey};
use crate::error::Result;

/// Launches session hosts, one per egress identity.
#[async_trait]
pub trait HostDriver: Send + Sync {
	async fn launch(&self, key: &ResourceKey, proxy: Option<&ProxySpec>) -> Result<Arc<dyn HostHandle>>;
}

/// A running, shareable automation process.
#[async_trait]
pub trait HostHandle: Send + Sync {
	/// Creates an isolated context with its own cookie and storage state.
	async fn new_context(&self) -> Result<Arc<dyn ContextHandle>>;

	async fn close(&self) -> Result<()>;
}

/// An isolated session checked out of a host.
///
/// Capabilities downcast this to the backend's concrete type to drive pages.
#[async_trait]
pub trait ContextHandle: DowncastSync {
	/// Backend identifier, used in logs.
	fn id(&self) -> &str;

	async fn apply_auth_state(&self, state: &AuthState) -> Result<()>;

	async fn auth_state(&self) -> Result<AuthState>;

	async fn close(&self) -> Result<()>;
}

impl_downcast!(sync ContextHandle);
