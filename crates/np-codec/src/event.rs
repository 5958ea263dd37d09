//! Event model: canonical serialization, event ids, BIP-340 signatures.
//!
//! An event id is the hex SHA-256 of the canonical form
//! `[0, pubkey, created_at, kind, tags, content]`; the signature is a
//! BIP-340 Schnorr signature over the 32-byte id under the x-only `pubkey`.

use k256::schnorr::Signature;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::keys::Keys;

/// Inner request event: unsigned, content = request message JSON.
pub const KIND_HTTP_REQUEST: u32 = 80;
/// Inner response event: authored and verified against the destination key.
pub const KIND_HTTP_RESPONSE: u32 = 81;
/// Seal: signed by the real author, content = encrypted inner event.
pub const KIND_SEAL: u32 = 13;
/// Gift wrap: ephemeral outer event, content = encrypted seal.
pub const KIND_GIFT_WRAP: u32 = 21059;

/// A wire event.
///
/// Inner (kind 80/81) events travel without a signature; the outer layers
/// (seal and gift wrap) always carry one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Hex x-only public key of the author.
    pub pubkey: String,
    /// Unix seconds.
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Hex BIP-340 signature over `id`; absent on unsigned inner events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

/// The author-independent part of an event, ready to be finalized.
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    /// Finalize without signing (inner kind-80/81 events).
    pub fn unsigned(self, pubkey_hex: &str) -> Event {
        let id = hex::encode(canonical_hash(
            pubkey_hex,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ));
        Event {
            id,
            pubkey: pubkey_hex.to_owned(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: None,
        }
    }

    /// Finalize and sign under `keys`.
    pub fn sign(self, keys: &Keys) -> Result<Event, EventError> {
        let pubkey = keys.public_key_hex().to_owned();
        let hash = canonical_hash(&pubkey, self.created_at, self.kind, &self.tags, &self.content);
        let sig = keys.sign_hash(&hash).map_err(|e| EventError::Signing(e.to_string()))?;
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: Some(sig),
        })
    }
}

impl Event {
    /// Recompute the canonical id and check it matches `self.id`.
    pub fn check_id(&self) -> Result<(), EventError> {
        let hash = canonical_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if hex::encode(hash) == self.id {
            Ok(())
        } else {
            Err(EventError::IdMismatch)
        }
    }

    /// Verify the id and the Schnorr signature against `self.pubkey`.
    pub fn verify(&self) -> Result<(), EventError> {
        self.check_id()?;
        let sig_hex = self.sig.as_deref().ok_or(EventError::MissingSignature)?;
        let sig_bytes = hex::decode(sig_hex).map_err(|_| EventError::BadSignature)?;
        let sig = Signature::try_from(sig_bytes.as_slice()).map_err(|_| EventError::BadSignature)?;
        let id_bytes: [u8; 32] = hex::decode(&self.id)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(EventError::IdMismatch)?;
        let verifying_key = crate::keys::verifying_key_from_hex(&self.pubkey)
            .map_err(|e| EventError::BadPubkey(e.to_string()))?;
        verifying_key
            .verify_raw(&id_bytes, &sig)
            .map_err(|_| EventError::BadSignature)
    }
}

/// SHA-256 of the canonical form `[0, pubkey, created_at, kind, tags, content]`.
pub fn canonical_hash(
    pubkey_hex: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical = json!([0, pubkey_hex, created_at, kind, tags, content]);
    let serialized = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event id does not match canonical hash")]
    IdMismatch,
    #[error("event is unsigned")]
    MissingSignature,
    #[error("signature verification failed")]
    BadSignature,
    #[error("bad pubkey: {0}")]
    BadPubkey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}
