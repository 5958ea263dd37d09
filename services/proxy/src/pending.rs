//! The pending-response table.
//!
//! One entry per in-flight request, keyed by `(request id, destination
//! pubkey)`. Ingress inserts parts as they arrive; when the stored-part count
//! reaches the expected total the entry is removed and the assembled response
//! is delivered to the waiting HTTP handler through a oneshot channel. The
//! handler enforces its own timeout on the receiving side, so removal for any
//! reason (completion, timeout, client disconnect) needs no timer here.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use np_codec::{ResponseMessage, assemble_body};
use tokio::sync::oneshot;
use tracing::debug;

use crate::pool::RelayPool;

/// `(request id, destination pubkey hex)`.
pub type PendingKey = (String, String);

/// A fully reassembled tunneled response.
#[derive(Debug)]
pub struct AssembledResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

struct PendingEntry {
    parts: BTreeMap<u64, ResponseMessage>,
    /// Set by the first part to arrive; later parts may not change it.
    expected_parts: Option<u64>,
    complete_tx: Option<oneshot::Sender<AssembledResponse>>,
}

/// Outcome of routing one response part.
#[derive(Debug, PartialEq, Eq)]
pub enum PartOutcome {
    /// No entry for this key; the part is dropped.
    NoPending,
    /// Stored; more parts are expected.
    Stored,
    /// Same index seen before; dropped without overwriting.
    Duplicate,
    /// Index outside the expected range; dropped.
    OutOfRange,
    /// All parts present; the response was delivered to the handler.
    Completed,
    /// All parts present but assembly failed; the entry stays so duplicate
    /// parts keep being absorbed, and the request runs into its timeout.
    AssemblyFailed(String),
}

#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<PendingKey, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight request.
    ///
    /// Fails if an entry for this key already exists (one Pending entry per
    /// `(request id, destination)` at any instant).
    pub fn insert(
        &self,
        key: PendingKey,
    ) -> Result<oneshot::Receiver<AssembledResponse>, DuplicatePending> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return Err(DuplicatePending);
        }
        let (complete_tx, complete_rx) = oneshot::channel();
        entries.insert(
            key,
            PendingEntry { parts: BTreeMap::new(), expected_parts: None, complete_tx: Some(complete_tx) },
        );
        Ok(complete_rx)
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&self, key: &PendingKey) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    pub fn contains(&self, key: &PendingKey) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one validated response part to its entry.
    pub fn insert_part(&self, key: &PendingKey, message: ResponseMessage) -> PartOutcome {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(key) else {
            return PartOutcome::NoPending;
        };

        let expected = *entry.expected_parts.get_or_insert(message.parts);
        if message.part_index >= expected {
            return PartOutcome::OutOfRange;
        }
        if entry.parts.contains_key(&message.part_index) {
            return PartOutcome::Duplicate;
        }
        entry.parts.insert(message.part_index, message);

        if entry.parts.len() as u64 != expected {
            return PartOutcome::Stored;
        }

        // Complete: assemble while still holding the entry so a failure keeps
        // absorbing duplicates instead of resurrecting the key.
        match assemble(entry) {
            Ok(response) => {
                let entry = entries.remove(key).expect("entry present");
                if let Some(tx) = entry.complete_tx {
                    let _ = tx.send(response);
                }
                PartOutcome::Completed
            }
            Err(reason) => PartOutcome::AssemblyFailed(reason),
        }
    }
}

fn assemble(entry: &PendingEntry) -> Result<AssembledResponse, String> {
    let head = entry.parts.get(&0).ok_or("part 0 missing")?;
    let status = head.status.ok_or("part 0 has no status")?;
    let status = u16::try_from(status)
        .ok()
        .filter(|s| (100..=599).contains(s))
        .ok_or_else(|| format!("status {status} outside 100..=599"))?;
    let headers = head.headers.clone().ok_or("part 0 has no headers")?;

    let body = assemble_body(entry.parts.values().map(|p| p.body_base64.as_str()))
        .map_err(|e| e.to_string())?;
    Ok(AssembledResponse { status, headers, body })
}

#[derive(Debug, thiserror::Error)]
#[error("a pending entry already exists for this request")]
pub struct DuplicatePending;

/// Removes the pending entry and unpins the request's hint relays when the
/// request ends, whatever the cause. Dropped exactly once per request.
pub struct PendingGuard {
    key: PendingKey,
    table: Arc<PendingTable>,
    pool: Arc<RelayPool>,
}

impl PendingGuard {
    pub fn new(key: PendingKey, table: Arc<PendingTable>, pool: Arc<RelayPool>) -> Self {
        PendingGuard { key, table, pool }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.remove(&self.key) {
            debug!(request_id = %self.key.0, "pending entry removed");
        }
        self.pool.unpin(&self.key.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    fn key() -> PendingKey {
        ("req-1".to_owned(), "aa".repeat(32))
    }

    fn part(index: u64, parts: u64, body: &str) -> ResponseMessage {
        let mut msg = ResponseMessage {
            id: "req-1".to_owned(),
            part_index: index,
            parts,
            body_base64: STANDARD.encode(body),
            status: None,
            headers: None,
        };
        if index == 0 {
            msg.status = Some(200);
            msg.headers = Some(HashMap::from([(
                "content-type".to_owned(),
                "text/plain".to_owned(),
            )]));
        }
        msg
    }

    #[test]
    fn second_insert_for_same_key_is_rejected() {
        let table = PendingTable::new();
        let _rx = table.insert(key()).unwrap();
        assert!(table.insert(key()).is_err());
    }

    #[test]
    fn single_part_completes_immediately() {
        let table = PendingTable::new();
        let mut rx = table.insert(key()).unwrap();

        assert_eq!(table.insert_part(&key(), part(0, 1, "hi")), PartOutcome::Completed);
        assert!(!table.contains(&key()));

        let response = rx.try_recv().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers["content-type"], "text/plain");
        assert_eq!(response.body, b"hi");
    }

    #[test]
    fn out_of_order_parts_assemble_in_index_order() {
        let table = PendingTable::new();
        let mut rx = table.insert(key()).unwrap();

        assert_eq!(table.insert_part(&key(), part(1, 2, "world")), PartOutcome::Stored);
        assert_eq!(table.insert_part(&key(), part(0, 2, "hello ")), PartOutcome::Completed);

        let response = rx.try_recv().unwrap();
        assert_eq!(response.body, b"hello world");
    }

    #[test]
    fn duplicate_part_does_not_overwrite_or_complete() {
        let table = PendingTable::new();
        let _rx = table.insert(key()).unwrap();

        assert_eq!(table.insert_part(&key(), part(1, 2, "a")), PartOutcome::Stored);
        assert_eq!(table.insert_part(&key(), part(1, 2, "b")), PartOutcome::Duplicate);
        assert!(table.contains(&key()));
    }

    #[test]
    fn first_part_fixes_the_expected_count() {
        let table = PendingTable::new();
        let mut rx = table.insert(key()).unwrap();

        assert_eq!(table.insert_part(&key(), part(1, 2, "world")), PartOutcome::Stored);
        // A later part claiming a different total cannot stretch the entry.
        assert_eq!(table.insert_part(&key(), part(2, 3, "!")), PartOutcome::OutOfRange);
        assert_eq!(table.insert_part(&key(), part(0, 2, "hello ")), PartOutcome::Completed);
        assert_eq!(rx.try_recv().unwrap().body, b"hello world");
    }

    #[test]
    fn part_for_unknown_request_is_dropped() {
        let table = PendingTable::new();
        assert_eq!(table.insert_part(&key(), part(0, 1, "hi")), PartOutcome::NoPending);
    }

    #[test]
    fn status_outside_http_range_fails_assembly_and_keeps_entry() {
        let table = PendingTable::new();
        let _rx = table.insert(key()).unwrap();

        let mut bad = part(0, 1, "hi");
        bad.status = Some(42);
        assert!(matches!(
            table.insert_part(&key(), bad),
            PartOutcome::AssemblyFailed(_)
        ));
        assert!(table.contains(&key()));
    }

    #[test]
    fn remove_is_idempotent() {
        let table = PendingTable::new();
        let _rx = table.insert(key()).unwrap();
        assert!(table.remove(&key()));
        assert!(!table.remove(&key()));
    }
}
