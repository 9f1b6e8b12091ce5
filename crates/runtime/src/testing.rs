//! In-process stand-in for a browser's DevTools WebSocket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pw_fleet_protocol::CdpRequest;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// `None` leaves the command unanswered.
pub(crate) type Reply = Option<std::result::Result<Value, (i64, String)>>;

enum Control {
	Emit(Value),
	Disconnect,
}

pub(crate) struct FakeBrowser {
	pub url: String,
	requests: Arc<Mutex<Vec<CdpRequest>>>,
	control: mpsc::UnboundedSender<Control>,
}

impl FakeBrowser {
	/// Serves a single client connection, answering each command with `handler`.
	pub async fn start(handler: impl Fn(&CdpRequest) -> Reply + Send + Sync + 'static) -> Self {
		let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let requests = Arc::new(Mutex::new(Vec::new()));
		let (control, mut control_rx) = mpsc::unbounded_channel();

		let recorded = Arc::clone(&requests);
		tokio::spawn(async move {
			let Ok((stream, _)) = listener.accept().await else { return };
			let Ok(socket) = tokio_tungstenite::accept_async(stream).await else { return };
			let (mut tx, mut rx) = socket.split();
			loop {
				tokio::select! {
					ctrl = control_rx.recv() => match ctrl {
						Some(Control::Emit(event)) => {
							let _ = tx.send(Message::Text(event.to_string())).await;
						}
						Some(Control::Disconnect) | None => {
							let _ = tx.send(Message::Close(None)).await;
							break;
						}
					},
					frame = rx.next() => {
						let text = match frame {
							Some(Ok(Message::Text(text))) => text,
							Some(Ok(Message::Close(_))) | None => break,
							Some(_) => continue,
						};
						let Ok(request) = serde_json::from_str::<CdpRequest>(&text) else { continue };
						let reply = handler(&request);
						recorded.lock().push(request.clone());
						let body = match reply {
							Some(Ok(result)) => json!({"id": request.id, "result": result}),
							Some(Err((code, message))) => json!({"id": request.id, "error": {"code": code, "message": message}}),
							None => continue,
						};
						let _ = tx.send(Message::Text(body.to_string())).await;
					}
				}
			}
		});

		Self {
			url: format!("ws://127.0.0.1:{}/devtools/browser/fake", port),
			requests,
			control,
		}
	}

	pub fn requests(&self) -> Vec<CdpRequest> {
		self.requests.lock().clone()
	}

	pub fn methods(&self) -> Vec<String> {
		self.requests.lock().iter().map(|r| r.method.clone()).collect()
	}

	pub async fn wait_for_requests(&self, count: usize) {
		for _ in 0..200 {
			if self.requests.lock().len() >= count {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("expected {} CDP requests, saw {:?}", count, self.methods());
	}

	pub fn emit(&self, event: Value) {
		let _ = self.control.send(Control::Emit(event));
	}

	pub fn disconnect(&self) {
		let _ = self.control.send(Control::Disconnect);
	}
}
