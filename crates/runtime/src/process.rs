//! Port and child-process helpers for launched browsers.

use std::net::TcpListener;
use std::time::Duration;

use tokio::process::Child;
use tracing::debug;

use crate::error::{Result, RuntimeError};

/// Returns `true` when `port` can be bound on localhost.
pub fn port_available(port: u16) -> bool {
	TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Asks the OS for a free localhost port for a remote-debugging endpoint.
///
/// The port is released before returning, so a racing process could still
/// take it; the launcher detects that through the endpoint probe.
pub fn pick_free_port() -> Result<u16> {
	let listener = TcpListener::bind(("127.0.0.1", 0))?;
	let port = listener.local_addr()?.port();
	drop(listener);
	if port == 0 {
		return Err(RuntimeError::Launch("OS returned port 0".into()));
	}
	Ok(port)
}

/// Waits up to `grace` for `child` to exit on its own, then kills it.
pub async fn reap(child: &mut Child, grace: Duration) {
	match tokio::time::timeout(grace, child.wait()).await {
		Ok(Ok(status)) => debug!(target = "pw.fleet.cdp", %status, "browser exited"),
		Ok(Err(err)) => debug!(target = "pw.fleet.cdp", error = %err, "failed waiting for browser"),
		Err(_) => {
			debug!(target = "pw.fleet.cdp", pid = ?child.id(), "browser did not exit; killing");
			if let Err(err) = child.kill().await {
				debug!(target = "pw.fleet.cdp", error = %err, "failed to kill browser");
			}
		}
	}
}
