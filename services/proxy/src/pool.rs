//! The relay pool: a fixed set of initial relays plus a bounded MRU list of
//! opportunistic hint relays.
//!
//! Hint relays come from `nprofile` destinations and are typically the only
//! relays the destination actually reads. The pool keeps them warm across
//! requests, bounded by `max_cached` so misbehaving clients cannot force
//! unbounded open sockets. An entry is evictable iff no in-flight request
//! pins it; when nothing is evictable the list temporarily exceeds the bound.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::relay::{
    AlreadyHaveEvent, ConnectOptions, IncomingEvent, RelayConnection, RelayState,
};

/// How long `touch_hint` waits for a fresh hint connection to come up before
/// letting the request proceed (publishes to it fail fast if it never opens).
const HINT_WARMUP: Duration = Duration::from_secs(5);

struct CachedRelay {
    url: String,
    conn: RelayConnection,
    /// Request ids currently using this relay; non-empty blocks eviction.
    pinned: HashSet<String>,
}

pub struct RelayPool {
    proxy_pubkey: String,
    max_cached: usize,
    since: AtomicI64,
    initial: Vec<RelayConnection>,
    initial_urls: Vec<String>,
    /// MRU at the tail.
    cached: Mutex<Vec<CachedRelay>>,
    ingest_tx: mpsc::UnboundedSender<IncomingEvent>,
    already_have: AlreadyHaveEvent,
}

impl RelayPool {
    /// Open a connection to every initial relay and return the pool together
    /// with the ingest stream all subscriptions feed into.
    pub fn connect(
        initial_urls: Vec<String>,
        proxy_pubkey: String,
        since: i64,
        max_cached: usize,
        already_have: AlreadyHaveEvent,
    ) -> (Self, mpsc::UnboundedReceiver<IncomingEvent>) {
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let initial = initial_urls
            .iter()
            .map(|url| {
                RelayConnection::open(ConnectOptions {
                    url: url.clone(),
                    proxy_pubkey: proxy_pubkey.clone(),
                    since,
                    ingest_tx: ingest_tx.clone(),
                    already_have: already_have.clone(),
                })
            })
            .collect();

        let pool = RelayPool {
            proxy_pubkey,
            max_cached,
            since: AtomicI64::new(since),
            initial,
            initial_urls,
            cached: Mutex::new(Vec::new()),
            ingest_tx,
            already_have,
        };
        (pool, ingest_rx)
    }

    /// The normalized initial relay URLs, in configuration order.
    pub fn initial_urls(&self) -> &[String] {
        &self.initial_urls
    }

    /// Initial connections currently in the `Open` state.
    pub fn connected_count(&self) -> usize {
        self.initial
            .iter()
            .filter(|c| c.state() == RelayState::Open)
            .count()
    }

    /// URLs of the cached hint relays, LRU first.
    pub fn cached_urls(&self) -> Vec<String> {
        self.cached.lock().unwrap().iter().map(|c| c.url.clone()).collect()
    }

    /// Fan out one event to all initial relays and all cached hint relays.
    ///
    /// Failures are logged per relay and never abort the fan-out. Returns the
    /// number of relays that accepted the socket write.
    pub async fn publish(&self, event: &Value) -> usize {
        let targets: Vec<RelayConnection> = self
            .initial
            .iter()
            .cloned()
            .chain(self.cached.lock().unwrap().iter().map(|c| c.conn.clone()))
            .collect();

        let mut succeeded = 0;
        for conn in targets {
            match conn.publish(event.clone()).await {
                Ok(()) => succeeded += 1,
                Err(e) => warn!(relay = %conn.url(), error = %e, "publish failed"),
            }
        }
        succeeded
    }

    /// Mark a hint relay as used by `request_id`, opening it if necessary.
    ///
    /// Present: move to MRU and pin. Absent: connect, subscribe, insert at
    /// MRU pinned, then evict. Never caches a URL that is an initial relay.
    pub async fn touch_hint(&self, url: &str, request_id: &str) {
        if self.initial_urls.iter().any(|u| u == url) {
            return;
        }

        {
            let mut cached = self.cached.lock().unwrap();
            if let Some(pos) = cached.iter().position(|c| c.url == url) {
                let mut entry = cached.remove(pos);
                entry.pinned.insert(request_id.to_owned());
                cached.push(entry);
                return;
            }
        }

        let conn = RelayConnection::open(ConnectOptions {
            url: url.to_owned(),
            proxy_pubkey: self.proxy_pubkey.clone(),
            since: self.since.load(Ordering::Relaxed),
            ingest_tx: self.ingest_tx.clone(),
            already_have: self.already_have.clone(),
        });
        if conn.wait_until_settled(HINT_WARMUP).await == RelayState::Closed {
            warn!(relay = %url, "hint relay failed to connect");
            return;
        }

        let mut cached = self.cached.lock().unwrap();
        if let Some(pos) = cached.iter().position(|c| c.url == url) {
            // Another request opened the same hint while we were connecting.
            conn.close();
            let mut entry = cached.remove(pos);
            entry.pinned.insert(request_id.to_owned());
            cached.push(entry);
        } else {
            info!(relay = %url, "caching hint relay");
            let mut pinned = HashSet::new();
            pinned.insert(request_id.to_owned());
            cached.push(CachedRelay { url: url.to_owned(), conn, pinned });
        }
        Self::evict_locked(&mut cached, self.max_cached);
    }

    /// Release every pin held by `request_id`, then evict.
    pub fn unpin(&self, request_id: &str) {
        let mut cached = self.cached.lock().unwrap();
        for entry in cached.iter_mut() {
            entry.pinned.remove(request_id);
        }
        Self::evict_locked(&mut cached, self.max_cached);
    }

    fn evict_locked(cached: &mut Vec<CachedRelay>, max_cached: usize) {
        while cached.len() > max_cached {
            let Some(pos) = cached.iter().position(|c| c.pinned.is_empty()) else {
                // Everything is pinned; allow the temporary overflow.
                break;
            };
            let entry = cached.remove(pos);
            debug!(relay = %entry.url, "evicting cached hint relay");
            entry.conn.close();
        }
    }

    /// Rewind every subscription (initial and cached) to `since`.
    pub fn resubscribe_all(&self, since: i64) {
        self.since.store(since, Ordering::Relaxed);
        for conn in &self.initial {
            conn.resubscribe(since);
        }
        for entry in self.cached.lock().unwrap().iter() {
            entry.conn.resubscribe(since);
        }
    }

    /// Close every connection; used on shutdown.
    pub fn close_all(&self) {
        for conn in &self.initial {
            conn.close();
        }
        let mut cached = self.cached.lock().unwrap();
        for entry in cached.drain(..) {
            entry.conn.close();
        }
    }
}
