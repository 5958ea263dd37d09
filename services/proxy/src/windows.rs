//! Time windows and dedup maps.
//!
//! One owner for "now", the oldest accepted response timestamp, and the two
//! handled-id maps. The maintenance task advances `oldest_time` every ten
//! minutes and rewinds the subscription window hourly, reaping both maps so
//! memory stays bounded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::pool::RelayPool;

/// Grace applied behind "now" when advancing `oldest_time`: responses can
/// arrive slightly late or from a skewed clock.
const OLDEST_GRACE_SECS: i64 = 60;

/// Responses timestamped further in the future than this are rejected.
pub const FUTURE_DRIFT_SECS: i64 = 600;

/// How far back subscriptions look; also the lifetime of event-id dedup.
pub const SUBSCRIPTION_LOOKBACK_SECS: i64 = 48 * 3600;

const OLDEST_ADVANCE_PERIOD: Duration = Duration::from_secs(600);
const REWIND_PERIOD: Duration = Duration::from_secs(3600);

/// Current unix time in seconds. The single source of truth for "now".
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

struct WindowsInner {
    oldest_time: i64,
    /// Outer event id -> created_at; backs the already-have-event hook.
    handled_events: HashMap<String, i64>,
    /// Inner response id -> created_at; cross-relay dedup of plaintext responses.
    handled_responses: HashMap<String, i64>,
}

pub struct Windows {
    inner: Mutex<WindowsInner>,
}

impl Windows {
    pub fn new(now: i64) -> Self {
        Windows {
            inner: Mutex::new(WindowsInner {
                oldest_time: now - OLDEST_GRACE_SECS,
                handled_events: HashMap::new(),
                handled_responses: HashMap::new(),
            }),
        }
    }

    /// Record an outer event id. Returns false when it was already handled.
    pub fn record_event(&self, id: &str, created_at: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.handled_events.insert(id.to_owned(), created_at).is_none()
    }

    pub fn already_have_event(&self, id: &str) -> bool {
        self.inner.lock().unwrap().handled_events.contains_key(id)
    }

    /// Record an inner response id. Returns false when it was already handled.
    pub fn record_response(&self, id: &str, created_at: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.handled_responses.insert(id.to_owned(), created_at).is_none()
    }

    /// Replay window check for an inner response timestamp.
    pub fn in_window(&self, created_at: i64, now: i64) -> bool {
        let oldest = self.inner.lock().unwrap().oldest_time;
        created_at >= oldest && created_at <= now + FUTURE_DRIFT_SECS
    }

    pub fn oldest_time(&self) -> i64 {
        self.inner.lock().unwrap().oldest_time
    }

    /// Ten-minute tick: advance `oldest_time` and reap response ids behind it.
    pub fn advance_oldest(&self, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.oldest_time = now - OLDEST_GRACE_SECS;
        let cutoff = inner.oldest_time;
        let before = inner.handled_responses.len();
        inner.handled_responses.retain(|_, created_at| *created_at >= cutoff);
        let reaped = before - inner.handled_responses.len();
        if reaped > 0 {
            debug!(reaped, "reaped handled response ids");
        }
    }

    /// Hourly tick: reap event ids older than the new subscription window.
    pub fn reap_events(&self, since: i64) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.handled_events.len();
        inner.handled_events.retain(|_, created_at| *created_at >= since);
        let reaped = before - inner.handled_events.len();
        if reaped > 0 {
            debug!(reaped, "reaped handled event ids");
        }
    }
}

/// Run the two periodic timers until the task is aborted.
pub async fn run_maintenance(windows: Arc<Windows>, pool: Arc<RelayPool>) {
    let start = tokio::time::Instant::now();
    let mut advance = tokio::time::interval_at(start + OLDEST_ADVANCE_PERIOD, OLDEST_ADVANCE_PERIOD);
    let mut rewind = tokio::time::interval_at(start + REWIND_PERIOD, REWIND_PERIOD);

    loop {
        tokio::select! {
            _ = advance.tick() => {
                windows.advance_oldest(now_unix());
            }
            _ = rewind.tick() => {
                let since = now_unix() - SUBSCRIPTION_LOOKBACK_SECS;
                debug!(since, "rewinding subscriptions");
                pool.resubscribe_all(since);
                windows.reap_events(since);
            }
        }
    }
}
