//! The HTTP listener: accepts any method and URL, resolves the destination,
//! drives egress, then waits on the pending table for the reassembled
//! response.
//!
//! Proxy-originated statuses: `400` (destination header missing/malformed/
//! unusable), `500 Timed out` (no complete response within the per-request
//! timeout), `500 Failed` (body read or egress setup failure). A tunneled
//! response propagates the destination's status, headers and body verbatim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use np_codec::{Keys, Profile, decode_destination};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::normalize_relay_list;
use crate::egress::{self, OutboundRequest};
use crate::pending::{PendingGuard, PendingTable};
use crate::pool::RelayPool;

/// The header naming the destination when none is fixed by configuration.
/// Consumed by the proxy, never forwarded.
pub const DESTINATION_HEADER: &str = "x-nostr-destination";

pub struct GatewayState {
    pub keys: Arc<Keys>,
    pub pool: Arc<RelayPool>,
    pub pending: Arc<PendingTable>,
    pub keep_host: bool,
    pub timeout: Duration,
    pub destination: Option<Profile>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

#[derive(Debug)]
struct ResolvedDestination {
    pubkey: String,
    /// Normalized hint relays, minus any URL that is already an initial relay.
    hints: Vec<String>,
}

async fn handle(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let (parts, body) = req.into_parts();

    let mut headers = HashMap::new();
    let mut destination_header = None;
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else {
            warn!(request_id = %request_id, header = %name, "dropping non-UTF-8 request header");
            continue;
        };
        if name.as_str() == DESTINATION_HEADER {
            destination_header = Some(value.to_owned());
        } else {
            headers.insert(name.as_str().to_owned(), value.to_owned());
        }
    }
    if !state.keep_host {
        headers.remove("host");
    }

    let resolved = match resolve_destination(
        state.destination.as_ref(),
        state.pool.initial_urls(),
        destination_header,
    ) {
        Ok(resolved) => resolved,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    debug!(
        request_id = %request_id,
        method = %parts.method,
        uri = %parts.uri,
        hints = resolved.hints.len(),
        "tunneling request"
    );

    // The guard unpins this request's hint relays and clears any leftover
    // pending entry on every exit path, including client disconnect.
    let key = (request_id.clone(), resolved.pubkey.clone());
    let _guard = PendingGuard::new(key.clone(), state.pending.clone(), state.pool.clone());

    // Pin hint relays one by one so none can be evicted mid-request.
    for hint in &resolved.hints {
        state.pool.touch_hint(hint, &request_id).await;
    }

    let response_rx = match state.pending.insert(key) {
        Ok(rx) => rx,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "pending registration failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed").into_response();
        }
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "request body read failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed").into_response();
        }
    };

    let outbound = OutboundRequest {
        request_id: request_id.clone(),
        method: parts.method.as_str().to_owned(),
        url: parts.uri.to_string(),
        headers,
        body,
    };
    if let Err(e) = egress::send_request(
        &state.keys,
        &state.pool,
        &resolved.pubkey,
        &resolved.hints,
        &outbound,
    )
    .await
    {
        warn!(request_id = %request_id, error = %e, "egress failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed").into_response();
    }

    match timeout(state.timeout, response_rx).await {
        Ok(Ok(assembled)) => {
            info!(request_id = %request_id, status = assembled.status, "request completed");
            tunneled_response(assembled)
        }
        Ok(Err(_closed)) => {
            warn!(request_id = %request_id, "pending entry vanished before completion");
            (StatusCode::INTERNAL_SERVER_ERROR, "Timed out").into_response()
        }
        Err(_elapsed) => {
            info!(request_id = %request_id, "request timed out");
            (StatusCode::INTERNAL_SERVER_ERROR, "Timed out").into_response()
        }
    }
}

fn resolve_destination(
    fixed: Option<&Profile>,
    initial_urls: &[String],
    header: Option<String>,
) -> Result<ResolvedDestination, String> {
    let profile = match (fixed, header) {
        (Some(profile), _) => profile.clone(),
        (None, None) => return Err("Missing X-Nostr-Destination header".to_owned()),
        (None, Some(value)) => {
            let profile = decode_destination(&value)
                .map_err(|_| "Invalid X-Nostr-Destination header".to_owned())?;
            if profile.relays.is_empty() && initial_urls.is_empty() {
                return Err(
                    "Destination carries no relay hints and no relays are configured; \
                     use an nprofile destination or configure --relays"
                        .to_owned(),
                );
            }
            profile
        }
    };

    // Hints are normalized like initial relays; URLs already covered by the
    // initial set are not hinted again (they are always published to anyway).
    let mut hints = Vec::new();
    for raw in &profile.relays {
        match normalize_relay_list([raw]) {
            Ok(normalized) => {
                let filtered: Vec<_> = normalized
                    .into_iter()
                    .filter(|url| !initial_urls.contains(url) && !hints.contains(url))
                    .collect();
                hints.extend(filtered);
            }
            Err(e) => warn!(error = %e, "skipping malformed relay hint"),
        }
    }

    Ok(ResolvedDestination { pubkey: profile.pubkey, hints })
}

fn tunneled_response(assembled: crate::pending::AssembledResponse) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(assembled.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &assembled.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => warn!(header = %name, "dropping invalid tunneled response header"),
        }
    }
    builder
        .body(Body::from(assembled.body))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "Failed").into_response())
}
