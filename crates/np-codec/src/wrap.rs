//! The three-layer envelope: inner event → seal (kind 13) → gift wrap
//! (kind 21059).
//!
//! The seal is signed by the real author with a `created_at` drawn uniformly
//! from the preceding 48 hours, so publish times cannot be correlated across
//! requests. The gift wrap is signed by a one-shot ephemeral key, so the
//! outer `pubkey` cannot link two wraps from the same client. Neither layer
//! may be short-circuited: receivers must verify the seal signature and the
//! author consistency between seal and inner event.

use rand::Rng;

use crate::crypto::{self, CryptoError};
use crate::event::{Event, EventError, EventTemplate, KIND_GIFT_WRAP, KIND_SEAL};
use crate::keys::Keys;

/// Width of the randomized seal-timestamp window, in seconds.
const SEAL_TIMESTAMP_WINDOW: i64 = 48 * 3600;

/// Addressing for an outbound gift wrap.
#[derive(Debug, Clone)]
pub struct WrapParams<'a> {
    /// Hex x-only public key of the destination.
    pub destination_pk: &'a str,
    /// Relay URL placed in the `p` tag, if any.
    pub primary_relay: Option<&'a str>,
    /// Relay URLs placed in the `relays` tag, if any.
    pub secondary_relays: &'a [String],
    /// Current unix time; the wrap's `created_at`.
    pub now: i64,
}

/// Seal and gift-wrap an inner event for the destination.
///
/// The ephemeral wrap key never leaves this function.
pub fn wrap_event(keys: &Keys, inner: &Event, params: &WrapParams<'_>) -> Result<Event, WrapError> {
    let inner_json = serde_json::to_string(inner)?;
    let author_key = crypto::conversation_key(keys, params.destination_pk)?;

    let seal_age: i64 = rand::thread_rng().gen_range(0..=SEAL_TIMESTAMP_WINDOW);
    let seal = EventTemplate {
        created_at: params.now - seal_age,
        kind: KIND_SEAL,
        tags: vec![],
        content: crypto::encrypt(&author_key, &inner_json)?,
    }
    .sign(keys)?;

    let mut p_tag = vec!["p".to_owned(), params.destination_pk.to_owned()];
    if let Some(relay) = params.primary_relay {
        p_tag.push(relay.to_owned());
    }
    let mut tags = vec![p_tag];
    if !params.secondary_relays.is_empty() {
        let mut relays_tag = vec!["relays".to_owned()];
        relays_tag.extend(params.secondary_relays.iter().cloned());
        tags.push(relays_tag);
    }

    let ephemeral = Keys::generate();
    let wrap_key = crypto::conversation_key(&ephemeral, params.destination_pk)?;
    let seal_json = serde_json::to_string(&seal)?;
    let wrap = EventTemplate {
        created_at: params.now,
        kind: KIND_GIFT_WRAP,
        tags,
        content: crypto::encrypt(&wrap_key, &seal_json)?,
    }
    .sign(&ephemeral)?;

    Ok(wrap)
}

/// A successfully opened gift wrap.
#[derive(Debug)]
pub struct Unwrapped {
    /// The verified seal author (hex), i.e. the counterparty identity.
    pub seal_pubkey: String,
    /// Seal timestamp, for diagnostics.
    pub seal_created_at: i64,
    /// The unsigned inner event.
    pub inner: Event,
}

/// Open a gift wrap addressed to `keys`.
///
/// Checks, in order: wrap kind, outer decryption, seal kind, seal signature,
/// seal decryption, and inner/seal author consistency. Timestamp windows and
/// inner-kind policy are the caller's concern.
pub fn unwrap_event(keys: &Keys, wrap: &Event) -> Result<Unwrapped, WrapError> {
    if wrap.kind != KIND_GIFT_WRAP {
        return Err(WrapError::NotGiftWrap(wrap.kind));
    }

    let outer_key = crypto::conversation_key(keys, &wrap.pubkey)?;
    let seal_json = crypto::decrypt(&outer_key, &wrap.content)?;
    let seal: Event = serde_json::from_str(&seal_json)?;
    if seal.kind != KIND_SEAL {
        return Err(WrapError::NotSeal(seal.kind));
    }
    seal.verify()?;

    let seal_key = crypto::conversation_key(keys, &seal.pubkey)?;
    let inner_json = crypto::decrypt(&seal_key, &seal.content)?;
    let inner: Event = serde_json::from_str(&inner_json)?;
    if inner.pubkey != seal.pubkey {
        return Err(WrapError::AuthorMismatch);
    }

    Ok(Unwrapped { seal_pubkey: seal.pubkey, seal_created_at: seal.created_at, inner })
}

#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error("expected gift wrap, got kind {0}")]
    NotGiftWrap(u32),
    #[error("expected seal, got kind {0}")]
    NotSeal(u32),
    #[error("inner event author does not match seal author")]
    AuthorMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}
