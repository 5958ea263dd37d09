//! One WebSocket connection to one relay.
//!
//! The socket is owned by a spawned task; the rest of the proxy talks to it
//! through a command channel and observes its state through a watch channel.
//!
//! # Protocol
//! 1. Connect with bounded exponential backoff (3 attempts)
//! 2. Send `["REQ", sub_id, {since, kinds:[21059], "#p":[proxy_pubkey]}]`
//! 3. Stream `["EVENT", sub_id, event]` frames to the pool's ingest channel
//! 4. Publish `["EVENT", event]` on demand, surfacing per-message errors
//!
//! On subscription rewind the new `REQ` is sent before the old `CLOSE`, so
//! there is no gap in coverage. Read errors transition the connection to
//! `Closed`; publishes made while `Closed` fail fast and are never retried.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Lifecycle of a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// An event as delivered by a relay subscription, tagged with its source.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub relay_url: String,
    pub event: Value,
}

/// Hook consulted before forwarding a received event to ingest, so
/// reconnections and rewinds do not reprocess events already handled.
pub type AlreadyHaveEvent = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Everything a connection needs to come up subscribed.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Normalized `ws://` / `wss://` URL.
    pub url: String,
    /// Hex x-only proxy public key, used in the subscription filter.
    pub proxy_pubkey: String,
    /// Initial `since` for the subscription filter.
    pub since: i64,
    pub ingest_tx: mpsc::UnboundedSender<IncomingEvent>,
    pub already_have: AlreadyHaveEvent,
}

enum Command {
    Publish {
        event: Value,
        done: oneshot::Sender<Result<(), RelayError>>,
    },
    Resubscribe {
        since: i64,
    },
    Shutdown,
}

struct Shared {
    url: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<RelayState>,
}

/// Handle to a task-owned relay connection. Cheap to clone.
#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<Shared>,
}

impl RelayConnection {
    /// Spawn the connection task; returns immediately in `Connecting` state.
    pub fn open(opts: ConnectOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RelayState::Connecting);
        let url = opts.url.clone();
        tokio::spawn(run_connection(opts, cmd_rx, state_tx));
        RelayConnection { shared: Arc::new(Shared { url, cmd_tx, state_rx }) }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> RelayState {
        *self.shared.state_rx.borrow()
    }

    /// Wait until the connection leaves `Connecting`, up to `timeout`.
    /// Returns the state observed when the wait ended.
    pub async fn wait_until_settled(&self, timeout: Duration) -> RelayState {
        let mut rx = self.shared.state_rx.clone();
        let settled = rx.wait_for(|s| !matches!(s, RelayState::Connecting));
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }

    /// Publish one event and wait for the socket write to complete.
    pub async fn publish(&self, event: Value) -> Result<(), RelayError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.shared
            .cmd_tx
            .send(Command::Publish { event, done: done_tx })
            .map_err(|_| RelayError::Closed)?;
        done_rx.await.map_err(|_| RelayError::Closed)?
    }

    /// Replace the subscription with one starting at `since` (gapless).
    pub fn resubscribe(&self, since: i64) {
        let _ = self.shared.cmd_tx.send(Command::Resubscribe { since });
    }

    /// Ask the task to close the socket and exit.
    pub fn close(&self) {
        let _ = self.shared.cmd_tx.send(Command::Shutdown);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connection is closed")]
    Closed,
    #[error("WebSocket error: {0}")]
    Ws(String),
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF_START: Duration = Duration::from_millis(500);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_connection(
    opts: ConnectOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<RelayState>,
) {
    let url = opts.url.clone();

    let Some(mut ws) = connect_with_backoff(&url).await else {
        warn!(relay = %url, "connection never reached open");
        let _ = state_tx.send(RelayState::Closed);
        drain_failing(&mut cmd_rx);
        return;
    };

    let mut current_sub: Option<String> = None;
    if let Err(e) = send_subscription(&mut ws, &opts, &mut current_sub).await {
        warn!(relay = %url, error = %e, "initial subscribe failed");
        let _ = state_tx.send(RelayState::Closed);
        drain_failing(&mut cmd_rx);
        return;
    }
    let _ = state_tx.send(RelayState::Open);
    debug!(relay = %url, "relay connection open");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = state_tx.send(RelayState::Closing);
                        let _ = ws.send(Message::Close(None)).await;
                        break;
                    }
                    Some(Command::Publish { event, done }) => {
                        let frame = json!(["EVENT", event]).to_string();
                        let result = ws
                            .send(Message::Text(frame.into()))
                            .await
                            .map_err(|e| RelayError::Ws(e.to_string()));
                        let failed = result.is_err();
                        let _ = done.send(result);
                        if failed {
                            break;
                        }
                    }
                    Some(Command::Resubscribe { since }) => {
                        let previous = current_sub.take();
                        let rewound = ConnectOptions { since, ..opts.clone() };
                        if let Err(e) = send_subscription(&mut ws, &rewound, &mut current_sub).await {
                            warn!(relay = %url, error = %e, "resubscribe failed");
                            break;
                        }
                        if let Some(old) = previous {
                            let frame = json!(["CLOSE", old]).to_string();
                            if ws.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            msg = ws.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(relay = %url, error = %e, "read error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => handle_frame(&opts, &text),
                    Some(Ok(Message::Ping(data))) => {
                        if ws.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = state_tx.send(RelayState::Closed);
    drain_failing(&mut cmd_rx);
    debug!(relay = %url, "relay connection closed");
}

async fn connect_with_backoff(url: &str) -> Option<WsStream> {
    let mut delay = CONNECT_BACKOFF_START;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match tokio_tungstenite::connect_async(url).await {
            Ok((ws, _response)) => return Some(ws),
            Err(e) => {
                warn!(relay = %url, attempt, error = %e, "connect failed");
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    None
}

async fn send_subscription(
    ws: &mut WsStream,
    opts: &ConnectOptions,
    current_sub: &mut Option<String>,
) -> Result<(), RelayError> {
    let sub_id = Uuid::new_v4().to_string();
    let frame = json!([
        "REQ",
        sub_id,
        { "since": opts.since, "kinds": [np_codec::KIND_GIFT_WRAP], "#p": [opts.proxy_pubkey] }
    ])
    .to_string();
    ws.send(Message::Text(frame.into()))
        .await
        .map_err(|e| RelayError::Ws(e.to_string()))?;
    *current_sub = Some(sub_id);
    Ok(())
}

/// Route one text frame from the relay.
fn handle_frame(opts: &ConnectOptions, text: &str) {
    let Ok(frame) = serde_json::from_str::<Vec<Value>>(text) else {
        debug!(relay = %opts.url, "unparsable frame");
        return;
    };
    match frame.first().and_then(Value::as_str) {
        Some("EVENT") if frame.len() >= 3 => {
            let event = frame[2].clone();
            if let Some(id) = event.get("id").and_then(Value::as_str) {
                if (opts.already_have)(id) {
                    trace!(relay = %opts.url, event_id = id, "event already handled");
                    return;
                }
            }
            let _ = opts
                .ingest_tx
                .send(IncomingEvent { relay_url: opts.url.clone(), event });
        }
        Some("OK") => {
            let accepted = frame.get(2).and_then(Value::as_bool).unwrap_or(false);
            if !accepted {
                let reason = frame.get(3).and_then(Value::as_str).unwrap_or("");
                warn!(relay = %opts.url, reason, "publish rejected");
            }
        }
        Some("NOTICE") => {
            let notice = frame.get(1).and_then(Value::as_str).unwrap_or("");
            warn!(relay = %opts.url, notice, "relay notice");
        }
        Some("EOSE") => trace!(relay = %opts.url, "end of stored events"),
        _ => {}
    }
}

/// Fail any publish commands still queued after the socket is gone.
fn drain_failing(cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let Command::Publish { done, .. } = cmd {
            let _ = done.send(Err(RelayError::Closed));
        }
    }
}
