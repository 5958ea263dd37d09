// np-test-utils: A mock relay WebSocket server for testing the proxy.
//
// Speaks the client-facing subset of the relay wire protocol:
//   <- ["REQ", sub_id, filter...]     tracked per connection
//   <- ["CLOSE", sub_id]              removes the subscription
//   <- ["EVENT", event]               recorded; answered with ["OK", id, true, ""]
//   -> ["EVENT", sub_id, event]       injected by the test via `inject_event`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Per-connection bookkeeping shared with the server handle.
struct ConnState {
    frame_tx: UnboundedSender<Message>,
    /// Open subscription ids with their filters, in REQ order.
    subs: Vec<(String, Value)>,
}

#[derive(Default)]
struct RelayState {
    /// Events received via `["EVENT", event]`, in arrival order.
    published: Vec<Value>,
    conns: HashMap<u64, ConnState>,
}

/// A mock relay for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound address. Each test
/// can spin up its own isolated relay instance.
pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
    /// Handle to the background accept loop; dropped when the relay is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockRelay {
    /// Start the mock relay, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(RelayState::default()));

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, accept_state).await;
        });

        Ok(Self { addr, state, _task: task })
    }

    /// The `ws://` URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Snapshot of all events published to this relay so far.
    pub fn published(&self) -> Vec<Value> {
        self.state.lock().unwrap().published.clone()
    }

    /// Number of currently open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().conns.len()
    }

    /// Number of currently open subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().conns.values().map(|c| c.subs.len()).sum()
    }

    /// Filters of every open subscription, in connection order.
    pub fn subscription_filters(&self) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state
            .conns
            .values()
            .flat_map(|c| c.subs.iter().map(|(_, filter)| filter.clone()))
            .collect()
    }

    /// Wait until at least `n` events have been published, up to `timeout`.
    pub async fn wait_for_published(&self, n: usize, timeout: std::time::Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.published();
            if snapshot.len() >= n {
                return snapshot;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {n} published events, have {}", snapshot.len());
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `n` subscriptions are open, up to `timeout`.
    pub async fn wait_for_subscriptions(&self, n: usize, timeout: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.subscription_count() < n {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {n} subscriptions, have {}",
                    self.subscription_count()
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Deliver an event to every open subscription on every connection.
    ///
    /// Returns the number of subscriptions the event was sent to.
    pub fn inject_event(&self, event: &Value) -> usize {
        let state = self.state.lock().unwrap();
        let mut delivered = 0;
        for conn in state.conns.values() {
            for (sub_id, _) in &conn.subs {
                let frame = json!(["EVENT", sub_id, event]).to_string();
                if conn.frame_tx.send(Message::Text(frame.into())).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, state: Arc<Mutex<RelayState>>) {
        static CONN_IDS: AtomicU64 = AtomicU64::new(0);
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let conn_id = CONN_IDS.fetch_add(1, Ordering::Relaxed);
                    let conn_state = state.clone();
                    tokio::spawn(async move {
                        // Connection errors are expected in tests (client drops).
                        let _ = Self::handle_connection(stream, conn_id, conn_state.clone()).await;
                        conn_state.lock().unwrap().conns.remove(&conn_id);
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        conn_id: u64,
        state: Arc<Mutex<RelayState>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        let (frame_tx, mut frame_rx) = unbounded_channel::<Message>();
        state
            .lock()
            .unwrap()
            .conns
            .insert(conn_id, ConnState { frame_tx, subs: Vec::new() });

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => write.send(frame).await?,
                        None => break,
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        None => break,
                        Some(msg) => msg?,
                    };
                    let text = match msg {
                        Message::Text(t) => t,
                        Message::Close(_) => break,
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        _ => continue,
                    };

                    let frame: Vec<Value> = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    match frame.first().and_then(Value::as_str) {
                        Some("REQ") => {
                            let Some(sub_id) = frame.get(1).and_then(Value::as_str) else {
                                continue;
                            };
                            let filter = frame.get(2).cloned().unwrap_or(Value::Null);
                            let mut state = state.lock().unwrap();
                            let conn = state.conns.get_mut(&conn_id).expect("conn registered");
                            conn.subs.push((sub_id.to_owned(), filter));
                        }
                        Some("CLOSE") => {
                            let Some(sub_id) = frame.get(1).and_then(Value::as_str) else {
                                continue;
                            };
                            let mut state = state.lock().unwrap();
                            let conn = state.conns.get_mut(&conn_id).expect("conn registered");
                            conn.subs.retain(|(id, _)| id != sub_id);
                        }
                        Some("EVENT") => {
                            let Some(event) = frame.get(1).cloned() else {
                                continue;
                            };
                            let event_id = event
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned();
                            state.lock().unwrap().published.push(event);
                            let ok = json!(["OK", event_id, true, ""]).to_string();
                            write.send(Message::Text(ok.into())).await?;
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }
}
