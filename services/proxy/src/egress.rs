//! The outbound pipeline: segment a request body, build the three-layer
//! envelope for each part, and publish across the union of initial and hint
//! relays.
//!
//! Publish failures are logged per relay and never abort the request; if no
//! relay delivers, the per-request timeout produces the client-facing error.

use std::collections::HashMap;

use np_codec::{
    EventTemplate, KIND_HTTP_REQUEST, Keys, RequestMessage, WrapParams, segment_body, wrap_event,
};
use tracing::{debug, warn};
use url::Url;

use crate::pool::RelayPool;
use crate::windows::now_unix;

/// A buffered HTTP request ready to be tunneled.
#[derive(Debug)]
pub struct OutboundRequest {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("building envelope: {0}")]
    Wrap(#[from] np_codec::WrapError),
    #[error("serializing message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Publish one request to `destination_pk` as one gift wrap per body part.
///
/// `hint_relays` are this request's already-opened hint connections; they
/// join the initial relays in the advertised relay tags.
pub async fn send_request(
    keys: &Keys,
    pool: &RelayPool,
    destination_pk: &str,
    hint_relays: &[String],
    request: &OutboundRequest,
) -> Result<(), EgressError> {
    let chunks = segment_body(&request.body);
    let parts = chunks.len() as u64;

    let safe = safe_relays(pool.initial_urls(), hint_relays);
    let (primary_relay, secondary_relays) = match safe.split_first() {
        Some((first, rest)) => (Some(first.as_str()), rest),
        None => (None, &[] as &[String]),
    };

    let now = now_unix();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let index = index as u64;
        let mut message = RequestMessage::part(&request.request_id, index, parts, chunk);
        if index == 0 {
            message = message.with_head(&request.method, &request.url, request.headers.clone());
        }

        let inner = EventTemplate {
            created_at: now,
            kind: KIND_HTTP_REQUEST,
            tags: vec![],
            content: serde_json::to_string(&message)?,
        }
        .unsigned(keys.public_key_hex());

        let wrap = wrap_event(
            keys,
            &inner,
            &WrapParams { destination_pk, primary_relay, secondary_relays, now },
        )?;

        let accepted = pool.publish(&serde_json::to_value(&wrap)?).await;
        if accepted == 0 {
            warn!(request_id = %request.request_id, part = index, "no relay accepted the publish");
        } else {
            debug!(request_id = %request.request_id, part = index, relays = accepted, "part published");
        }
    }

    Ok(())
}

/// The relay URLs safe to advertise to the destination: the union of initial
/// and hint relays, minus any URL carrying credentials or a query string.
///
/// Unsafe URLs are still used locally for publishing; they are only kept out
/// of the `p`/`relays` tags.
fn safe_relays(initial: &[String], hints: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    initial
        .iter()
        .chain(hints.iter())
        .filter(|candidate| seen.insert(candidate.as_str()))
        .filter(|candidate| match Url::parse(candidate) {
            Ok(url) => {
                url.username().is_empty() && url.password().is_none() && url.query().is_none()
            }
            Err(_) => false,
        })
        .cloned()
        .collect()
}
