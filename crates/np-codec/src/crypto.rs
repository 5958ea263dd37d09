//! Conversation-key derivation and v2 conversation encryption.
//!
//! Protocol: secp256k1 ECDH → HKDF-SHA256 key derivation → ChaCha20-Poly1305
//! AEAD. The conversation key is derived from the ECDH x-coordinate alone,
//! so `conversation_key(a, B) == conversation_key(b, A)` — either side can
//! decrypt what the other encrypted.
//!
//! Wire format of an encrypted payload:
//!   `base64( version_byte(0x02) || nonce_12 || ciphertext )`
//!
//! Nonces are fresh random 12-byte values per message.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::keys::Keys;

/// 32-byte symmetric key shared by exactly one ordered-insensitive key pair.
pub type ConversationKey = [u8; 32];

const VERSION: u8 = 2;
const KDF_SALT: &[u8] = b"np-conversation-v2";
const KDF_INFO: &[u8] = b"conversation-key";

/// Derive the conversation key between our secret key and a peer's x-only
/// public key.
pub fn conversation_key(keys: &Keys, peer_pubkey_hex: &str) -> Result<ConversationKey, CryptoError> {
    let peer_x = hex::decode(peer_pubkey_hex).map_err(|_| CryptoError::BadPeerKey)?;
    if peer_x.len() != 32 {
        return Err(CryptoError::BadPeerKey);
    }

    // Lift the x-only key at even y. ECDH on the x-coordinate is insensitive
    // to the y parity of either side, which is what makes the key symmetric.
    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(&peer_x);
    let peer = k256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::BadPeerKey)?;

    let shared = k256::ecdh::diffie_hellman(
        keys.signing_key().as_nonzero_scalar(),
        peer.as_affine(),
    );

    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared.raw_secret_bytes().as_slice());
    let mut key = [0u8; 32];
    hk.expand(KDF_INFO, &mut key).map_err(|_| CryptoError::Kdf)?;
    Ok(key)
}

/// Encrypt a plaintext under a conversation key.
pub fn encrypt(key: &ConversationKey, plaintext: &str) -> Result<String, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut payload = Vec::with_capacity(1 + nonce.len() + ciphertext.len());
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(payload))
}

/// Decrypt a payload produced by [`encrypt`] under the complementary key.
pub fn decrypt(key: &ConversationKey, payload: &str) -> Result<String, CryptoError> {
    let data = STANDARD.decode(payload).map_err(|_| CryptoError::BadPayload)?;
    if data.len() < 1 + 12 {
        return Err(CryptoError::BadPayload);
    }
    if data[0] != VERSION {
        return Err(CryptoError::UnsupportedVersion(data[0]));
    }
    let (nonce, ciphertext) = data[1..].split_at(12);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::BadPayload)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("peer public key is not a valid x-only secp256k1 point")]
    BadPeerKey,
    #[error("key derivation failed")]
    Kdf,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed encrypted payload")]
    BadPayload,
    #[error("unsupported encryption version {0}")]
    UnsupportedVersion(u8),
}
