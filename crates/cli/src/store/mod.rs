//! File-backed [`AccountStore`].
//!
//! Accounts live in a single JSON document that is rewritten whole on every
//! update. Writes go to a sibling temp file first and are renamed into place,
//! so a crash mid-write leaves the previous document intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fleet::{Account, AccountStore, AuthState, CapabilitySettings, FleetError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;


const ACCOUNTS_SCHEMA_VERSION: u32 = 1;

/// On-disk format of the account file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountsFile {
	pub schema: u32,
	#[serde(default)]
	pub accounts: Vec<Account>,
}

impl Default for AccountsFile {
	fn default() -> Self {
		Self {
			schema: ACCOUNTS_SCHEMA_VERSION,
			accounts: Vec::new(),
		}
	}
}

pub struct JsonAccountStore {
	path: PathBuf,
	file: Mutex<AccountsFile>,
	/// Serializes writers so renames land in update order.
	write_lock: tokio::sync::Mutex<()>,
}

impl JsonAccountStore {
	/// Loads `path`. Unlike the config file, a missing account file is an error.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		let content = std::fs::read_to_string(&path)
			.map_err(|e| FleetError::Store(format!("{}: {}", path.display(), e)))?;
		let file = parse(&content).map_err(|e| FleetError::Store(format!("{}: {}", path.display(), e)))?;

		let mut seen = std::collections::HashSet::new();
		if let Some(dup) = file.accounts.iter().find(|a| !seen.insert(a.id.as_str())) {
			return Err(FleetError::Store(format!("{}: duplicate account id '{}'", path.display(), dup.id)));
		}

		debug!(target = "pw.fleet.store", path = %path.display(), accounts = file.accounts.len(), "accounts loaded");
		Ok(Self {
			path,
			file: Mutex::new(file),
			write_lock: tokio::sync::Mutex::new(()),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn len(&self) -> usize {
		self.file.lock().accounts.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn accounts(&self) -> Vec<Account> {
		self.file.lock().accounts.clone()
	}

	/// Applies `change` to the account and persists the file if it exists.
	async fn modify(&self, id: &str, change: impl FnOnce(&mut Account)) -> Result<()> {
		let _writer = self.write_lock.lock().await;
		let snapshot = {
			let mut file = self.file.lock();
			let Some(account) = file.accounts.iter_mut().find(|a| a.id == id) else {
				debug!(target = "pw.fleet.store", account = %id, "update for unknown account ignored");
				return Ok(());
			};
			change(account);
			serde_json::to_string_pretty(&*file)?
		};
		write_atomic(&self.path, snapshot).await
	}
}

/// Accepts either the versioned document or a bare array of accounts.
fn parse(content: &str) -> serde_json::Result<AccountsFile> {
	match serde_json::from_str::<Value>(content)? {
		Value::Array(_) => Ok(AccountsFile {
			schema: ACCOUNTS_SCHEMA_VERSION,
			accounts: serde_json::from_str(content)?,
		}),
		_ => serde_json::from_str(content),
	}
}

async fn write_atomic(path: &Path, content: String) -> Result<()> {
	let file_name = path
		.file_name()
		.map(|n| n.to_string_lossy().to_string())
		.unwrap_or_else(|| "accounts.json".to_string());
	let tmp = path.with_file_name(format!(".{}.tmp", file_name));
	tokio::fs::write(&tmp, content).await?;
	tokio::fs::rename(&tmp, path).await?;
	Ok(())
}

#[async_trait]
impl AccountStore for JsonAccountStore {
	async fn get_account(&self, id: &str) -> Result<Option<Account>> {
		Ok(self.file.lock().accounts.iter().find(|a| a.id == id).cloned())
	}

	async fn eligible_accounts(&self) -> Result<Vec<Account>> {
		Ok(self.file.lock().accounts.iter().filter(|a| a.active).cloned().collect())
	}

	async fn capability_settings(&self, id: &str, capability: &str) -> Result<Option<CapabilitySettings>> {
		let file = self.file.lock();
		let account = file
			.accounts
			.iter()
			.find(|a| a.id == id)
			.ok_or_else(|| FleetError::AccountNotFound(id.to_string()))?;
		Ok(account.capabilities.get(capability).cloned())
	}

	async fn update_auth_state(&self, id: &str, state: Option<AuthState>) -> Result<()> {
		self.modify(id, |account| account.auth_state = state).await
	}

	async fn update_account_info(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
		self.modify(id, |account| account.info.extend(fields)).await
	}
}
