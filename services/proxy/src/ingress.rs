//! The subscription consumer: runs the decrypt → verify → validate pipeline
//! on every inbound event and routes valid response parts to the pending
//! table.
//!
//! Every failure is swallowed per event with a log line; nothing here may
//! affect neighboring events or requests.

use std::sync::Arc;

use np_codec::{Event, KIND_GIFT_WRAP, KIND_HTTP_RESPONSE, Keys, ResponseMessage, unwrap_event};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pending::{PartOutcome, PendingTable};
use crate::relay::IncomingEvent;
use crate::windows::{Windows, now_unix};

pub struct Ingress {
    keys: Arc<Keys>,
    windows: Arc<Windows>,
    pending: Arc<PendingTable>,
}

/// Why an inbound event was dropped. Only for logging and tests.
#[derive(Debug, PartialEq, Eq)]
pub enum Dropped {
    Unparsable,
    AlreadyHandledEvent,
    WrongKind(u32),
    Envelope(String),
    NotAResponse(u32),
    BadInnerId,
    OutsideReplayWindow(i64),
    AlreadyHandledResponse,
    BadMessage(String),
    NoPendingEntry,
    OutOfRangePart,
    AssemblyFailed(String),
}

impl Ingress {
    pub fn new(keys: Arc<Keys>, windows: Arc<Windows>, pending: Arc<PendingTable>) -> Self {
        Ingress { keys, windows, pending }
    }

    /// Consume the pool's ingest stream until it closes.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<IncomingEvent>) {
        while let Some(incoming) = rx.recv().await {
            let relay_url = incoming.relay_url.clone();
            match self.process(incoming, now_unix()) {
                Ok(()) => {}
                Err(Dropped::AlreadyHandledEvent) | Err(Dropped::NoPendingEntry) => {
                    debug!(relay = %relay_url, "event dropped");
                }
                Err(reason) => {
                    warn!(relay = %relay_url, ?reason, "inbound event dropped");
                }
            }
        }
    }

    /// Steps 1-10 of the ingest pipeline for a single event.
    pub fn process(&self, incoming: IncomingEvent, now: i64) -> Result<(), Dropped> {
        let Ok(outer) = serde_json::from_value::<Event>(incoming.event) else {
            return Err(Dropped::Unparsable);
        };

        // 1. Outer-id dedup. Recorded regardless of what happens next, so a
        //    reconnecting relay cannot replay the same wrap through us twice.
        if !self.windows.record_event(&outer.id, outer.created_at) {
            return Err(Dropped::AlreadyHandledEvent);
        }

        // 2. Only gift wraps are expected on this subscription.
        if outer.kind != KIND_GIFT_WRAP {
            return Err(Dropped::WrongKind(outer.kind));
        }

        // 3-5. Decrypt, verify the seal, decrypt again, check authorship.
        let unwrapped = unwrap_event(&self.keys, &outer)
            .map_err(|e| Dropped::Envelope(e.to_string()))?;
        let inner = unwrapped.inner;

        // 6. Inner shape.
        if inner.kind != KIND_HTTP_RESPONSE {
            return Err(Dropped::NotAResponse(inner.kind));
        }
        if inner.id.is_empty() || inner.id.chars().count() > 100 {
            return Err(Dropped::BadInnerId);
        }

        // 7. Replay window.
        if !self.windows.in_window(inner.created_at, now) {
            return Err(Dropped::OutsideReplayWindow(inner.created_at));
        }

        // 8. Cross-relay dedup on the plaintext response id.
        if !self.windows.record_response(&inner.id, inner.created_at) {
            return Err(Dropped::AlreadyHandledResponse);
        }

        // 9. The content must be a well-formed response message.
        let message: ResponseMessage = serde_json::from_str(&inner.content)
            .map_err(|e| Dropped::BadMessage(e.to_string()))?;
        message.validate().map_err(|e| Dropped::BadMessage(e.to_string()))?;

        // 10. Route to the pending entry.
        let key = (message.id.clone(), unwrapped.seal_pubkey);
        match self.pending.insert_part(&key, message) {
            PartOutcome::Completed => {
                debug!(request_id = %key.0, "response completed");
                Ok(())
            }
            PartOutcome::Stored | PartOutcome::Duplicate => Ok(()),
            PartOutcome::NoPending => Err(Dropped::NoPendingEntry),
            PartOutcome::OutOfRange => Err(Dropped::OutOfRangePart),
            PartOutcome::AssemblyFailed(reason) => Err(Dropped::AssemblyFailed(reason)),
        }
    }
}
