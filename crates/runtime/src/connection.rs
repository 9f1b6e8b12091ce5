//! CDP connection over a browser WebSocket endpoint.
//!
//! Every command gets a unique `id` and a oneshot callback. A reader task
//! routes responses back to their callback by `id` and fans events out on a
//! broadcast channel; a writer task owns the socket sink. When the socket
//! ends, every pending command fails with [`RuntimeError::ChannelClosed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pw_fleet_protocol::{CdpEvent, CdpMessage, CdpRequest, CdpResponse};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, RuntimeError};

const EVENT_CAPACITY: usize = 256;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Callback = oneshot::Sender<Result<Value>>;

/// A multiplexed CDP session to one browser.
pub struct CdpConnection {
	endpoint: String,
	next_id: AtomicU64,
	outbound: mpsc::UnboundedSender<String>,
	pending: Arc<Mutex<HashMap<u64, Callback>>>,
	events: broadcast::Sender<CdpEvent>,
	closed: CancellationToken,
	command_timeout: Duration,
}

impl CdpConnection {
	/// Connects to a browser-level `ws://` debugger URL.
	pub async fn connect(endpoint: &str) -> Result<Arc<Self>> {
		Self::connect_with_timeout(endpoint, DEFAULT_COMMAND_TIMEOUT).await
	}

	pub async fn connect_with_timeout(endpoint: &str, command_timeout: Duration) -> Result<Arc<Self>> {
		let (socket, _) = tokio_tungstenite::connect_async(endpoint)
			.await
			.map_err(|e| RuntimeError::Connection(format!("{}: {}", endpoint, e)))?;
		let (mut sink, mut stream) = socket.split();

		let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
		let pending: Arc<Mutex<HashMap<u64, Callback>>> = Arc::new(Mutex::new(HashMap::new()));
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		let closed = CancellationToken::new();

		let writer_closed = closed.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = writer_closed.cancelled() => {
						let _ = sink.send(Message::Close(None)).await;
						break;
					}
					text = outbound_rx.recv() => {
						let Some(text) = text else { break };
						if let Err(err) = sink.send(Message::Text(text)).await {
							debug!(target = "pw.fleet.cdp", error = %err, "CDP write failed");
							writer_closed.cancel();
							break;
						}
					}
				}
			}
		});

		let reader_pending = Arc::clone(&pending);
		let reader_events = events.clone();
		let reader_closed = closed.clone();
		tokio::spawn(async move {
			loop {
				let frame = tokio::select! {
					_ = reader_closed.cancelled() => break,
					frame = stream.next() => frame,
				};
				match frame {
					Some(Ok(Message::Text(text))) => dispatch(&text, &reader_pending, &reader_events),
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(err)) => {
						debug!(target = "pw.fleet.cdp", error = %err, "CDP read failed");
						break;
					}
				}
			}
			reader_closed.cancel();
			let callbacks: Vec<Callback> = reader_pending.lock().drain().map(|(_, tx)| tx).collect();
			for tx in callbacks {
				let _ = tx.send(Err(RuntimeError::ChannelClosed));
			}
			debug!(target = "pw.fleet.cdp", "CDP connection closed");
		});

		debug!(target = "pw.fleet.cdp", endpoint, "CDP connection established");
		Ok(Arc::new(Self {
			endpoint: endpoint.to_string(),
			next_id: AtomicU64::new(1),
			outbound,
			pending,
			events,
			closed,
			command_timeout,
		}))
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	pub fn is_closed(&self) -> bool {
		self.closed.is_cancelled()
	}

	/// Resolves when the socket has gone away.
	pub async fn closed(&self) {
		self.closed.cancelled().await
	}

	/// Receives every event that arrives after this call.
	pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
		self.events.subscribe()
	}

	/// Sends a browser-level command.
	pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
		self.send(method, params, None).await
	}

	/// Sends a command, routed to `session_id` when given, and awaits its result.
	pub async fn send(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
		if self.is_closed() {
			return Err(RuntimeError::ChannelClosed);
		}

		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);
		if self.is_closed() {
			self.pending.lock().remove(&id);
			return Err(RuntimeError::ChannelClosed);
		}

		let request = CdpRequest {
			id,
			method: method.to_string(),
			params,
			session_id: session_id.map(str::to_string),
		};
		let text = match serde_json::to_string(&request) {
			Ok(text) => text,
			Err(err) => {
				self.pending.lock().remove(&id);
				return Err(err.into());
			}
		};
		trace!(target = "pw.fleet.cdp", id, method, "send");
		if self.outbound.send(text).is_err() {
			self.pending.lock().remove(&id);
			return Err(RuntimeError::ChannelClosed);
		}

		match tokio::time::timeout(self.command_timeout, rx).await {
			Ok(Ok(result)) => result.map_err(|err| match err {
				RuntimeError::Protocol { code, message, .. } => RuntimeError::Protocol {
					method: method.to_string(),
					code,
					message,
				},
				other => other,
			}),
			Ok(Err(_)) => Err(RuntimeError::ChannelClosed),
			Err(_) => {
				self.pending.lock().remove(&id);
				Err(RuntimeError::Timeout(method.to_string()))
			}
		}
	}

	/// Stops both socket tasks; pending commands fail with `ChannelClosed`.
	pub fn close(&self) {
		self.closed.cancel();
	}
}

impl Drop for CdpConnection {
	fn drop(&mut self) {
		self.closed.cancel();
	}
}

fn dispatch(text: &str, pending: &Mutex<HashMap<u64, Callback>>, events: &broadcast::Sender<CdpEvent>) {
	let message: CdpMessage = match serde_json::from_str(text) {
		Ok(message) => message,
		Err(err) => {
			warn!(target = "pw.fleet.cdp", error = %err, "unparseable CDP frame");
			return;
		}
	};

	match message {
		CdpMessage::Response(CdpResponse { id, result, error }) => {
			let Some(tx) = pending.lock().remove(&id) else {
				debug!(target = "pw.fleet.cdp", id, "response for unknown request");
				return;
			};
			let outcome = match error {
				Some(error) => Err(RuntimeError::Protocol {
					method: String::new(),
					code: error.code,
					message: error.message,
				}),
				None => Ok(result.unwrap_or(Value::Null)),
			};
			let _ = tx.send(outcome);
		}
		CdpMessage::Event(event) => {
			trace!(target = "pw.fleet.cdp", method = %event.method, "event");
			let _ = events.send(event);
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::testing::FakeBrowser;

	#[tokio::test]
	async fn responses_are_routed_by_id() {
		let browser = FakeBrowser::start(|request| match request.method.as_str() {
			"Browser.getVersion" => Some(Ok(json!({"product": "Chrome/126"}))),
			"Target.createBrowserContext" => Some(Ok(json!({"browserContextId": "ctx-1"}))),
			_ => None,
		})
		.await;
		let connection = CdpConnection::connect(&browser.url).await.unwrap();

		let (version, context) = tokio::join!(
			connection.call("Browser.getVersion", json!({})),
			connection.call("Target.createBrowserContext", json!({})),
		);
		assert_eq!(version.unwrap()["product"], "Chrome/126");
		assert_eq!(context.unwrap()["browserContextId"], "ctx-1");
		assert_eq!(browser.methods(), vec!["Browser.getVersion", "Target.createBrowserContext"]);
	}

	#[tokio::test]
	async fn protocol_errors_carry_code_and_message() {
		let browser = FakeBrowser::start(|_| Some(Err((-32000, "No target with given id".to_string())))).await;
		let connection = CdpConnection::connect(&browser.url).await.unwrap();

		let err = connection.call("Target.closeTarget", json!({"targetId": "x"})).await.unwrap_err();
		assert!(matches!(err, RuntimeError::Protocol { code: -32000, ref message, .. } if message.contains("No target")));
		assert!(err.to_string().starts_with("CDP command Target.closeTarget failed (-32000)"));
	}

	#[tokio::test]
	async fn session_id_is_forwarded() {
		let browser = FakeBrowser::start(|_| Some(Ok(json!({})))).await;
		let connection = CdpConnection::connect(&browser.url).await.unwrap();

		connection.send("Page.enable", json!({}), Some("session-7")).await.unwrap();
		let requests = browser.requests();
		assert_eq!(requests[0].session_id.as_deref(), Some("session-7"));
	}

	#[tokio::test]
	async fn unanswered_commands_time_out() {
		let browser = FakeBrowser::start(|_| None).await;
		let connection = CdpConnection::connect_with_timeout(&browser.url, Duration::from_millis(50)).await.unwrap();

		let err = connection.call("Page.navigate", json!({})).await.unwrap_err();
		assert!(matches!(err, RuntimeError::Timeout(ref m) if m == "Page.navigate"));
	}

	#[tokio::test]
	async fn pending_commands_fail_when_the_socket_closes() {
		let browser = FakeBrowser::start(|_| None).await;
		let connection = CdpConnection::connect(&browser.url).await.unwrap();

		let call = {
			let connection = Arc::clone(&connection);
			tokio::spawn(async move { connection.call("Page.navigate", json!({})).await })
		};
		browser.wait_for_requests(1).await;
		browser.disconnect();

		let err = call.await.unwrap().unwrap_err();
		assert!(matches!(err, RuntimeError::ChannelClosed));
		connection.closed().await;
		assert!(matches!(connection.call("Browser.getVersion", json!({})).await, Err(RuntimeError::ChannelClosed)));
	}

	#[tokio::test]
	async fn events_are_broadcast_to_subscribers() {
		let browser = FakeBrowser::start(|_| Some(Ok(json!({})))).await;
		let connection = CdpConnection::connect(&browser.url).await.unwrap();
		let mut events = connection.subscribe();

		browser.emit(json!({"method": "Target.targetCreated", "params": {"targetInfo": {"targetId": "t1"}}}));
		let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
		assert_eq!(event.method, "Target.targetCreated");
		assert_eq!(event.params["targetInfo"]["targetId"], "t1");
	}
}
