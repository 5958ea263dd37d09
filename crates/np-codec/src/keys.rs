//! Key material and bech32 encodings (`nsec`, `npub`, `nprofile`).

use bech32::{Bech32, Hrp};
use k256::schnorr::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// A secret key and its cached x-only public key.
///
/// Read-only after construction; the proxy builds one at startup and shares
/// it by reference for the lifetime of the process.
pub struct Keys {
    signing: SigningKey,
    public_hex: String,
}

impl Keys {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Build from a raw 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let signing = SigningKey::from_bytes(bytes).map_err(|_| KeyError::BadSecretKey)?;
        Ok(Self::from_signing_key(signing))
    }

    /// Decode a bech32 `nsec…` string.
    pub fn from_nsec(encoded: &str) -> Result<Self, KeyError> {
        let data = decode_with_prefix("nsec", encoded)?;
        Self::from_secret_bytes(&data)
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public_hex = hex::encode(signing.verifying_key().to_bytes());
        Keys { signing, public_hex }
    }

    /// Hex x-only public key.
    pub fn public_key_hex(&self) -> &str {
        &self.public_hex
    }

    /// Bech32 form of the secret key.
    pub fn to_nsec(&self) -> String {
        encode_with_prefix("nsec", self.signing.to_bytes().as_slice())
    }

    /// Bech32 form of the public key, for display.
    pub fn npub(&self) -> String {
        encode_with_prefix("npub", self.signing.verifying_key().to_bytes().as_slice())
    }

    /// BIP-340 signature (hex) over a 32-byte event id.
    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<String, KeyError> {
        let aux_rand: [u8; 32] = rand::random();
        let sig = self
            .signing
            .sign_raw(hash, &aux_rand)
            .map_err(|e| KeyError::Signing(e.to_string()))?;
        Ok(hex::encode(sig.to_bytes()))
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl std::fmt::Debug for Keys {
    // Never expose the secret scalar through logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").field("public", &self.public_hex).finish()
    }
}

/// A destination: public key plus optional relay hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Hex x-only public key.
    pub pubkey: String,
    /// Relay hint URLs, in the order they appeared.
    pub relays: Vec<String>,
}

/// Parse a destination string: bare `npub…` or `nprofile…` with relay hints.
pub fn decode_destination(encoded: &str) -> Result<Profile, KeyError> {
    if encoded.starts_with("npub1") {
        Ok(Profile { pubkey: decode_npub(encoded)?, relays: vec![] })
    } else if encoded.starts_with("nprofile1") {
        decode_nprofile(encoded)
    } else {
        Err(KeyError::UnknownPrefix)
    }
}

/// Decode a bech32 `npub…` string to a hex public key.
pub fn decode_npub(encoded: &str) -> Result<String, KeyError> {
    let data = decode_with_prefix("npub", encoded)?;
    if data.len() != 32 {
        return Err(KeyError::BadLength);
    }
    Ok(hex::encode(data))
}

/// Decode a bech32 `nprofile…` TLV string: type 0 = 32-byte pubkey (required,
/// first wins), type 1 = relay URL (repeatable). Unknown types are skipped.
pub fn decode_nprofile(encoded: &str) -> Result<Profile, KeyError> {
    let data = decode_with_prefix("nprofile", encoded)?;

    let mut pubkey: Option<String> = None;
    let mut relays = Vec::new();
    let mut rest = data.as_slice();
    while rest.len() >= 2 {
        let (tlv_type, len) = (rest[0], rest[1] as usize);
        rest = &rest[2..];
        if rest.len() < len {
            return Err(KeyError::BadTlv);
        }
        let value = &rest[..len];
        rest = &rest[len..];
        match tlv_type {
            0 => {
                if len != 32 {
                    return Err(KeyError::BadLength);
                }
                if pubkey.is_none() {
                    pubkey = Some(hex::encode(value));
                }
            }
            1 => {
                let url = String::from_utf8(value.to_vec()).map_err(|_| KeyError::BadTlv)?;
                relays.push(url);
            }
            _ => {}
        }
    }
    if !rest.is_empty() {
        return Err(KeyError::BadTlv);
    }

    let pubkey = pubkey.ok_or(KeyError::MissingProfilePubkey)?;
    Ok(Profile { pubkey, relays })
}

/// Encode a pubkey + relay hints as an `nprofile…` string (used by tests and
/// display paths).
pub fn encode_nprofile(pubkey_hex: &str, relays: &[String]) -> Result<String, KeyError> {
    let pk = hex::decode(pubkey_hex).map_err(|_| KeyError::BadPublicKey)?;
    if pk.len() != 32 {
        return Err(KeyError::BadLength);
    }
    let mut data = Vec::with_capacity(2 + pk.len());
    data.push(0);
    data.push(32);
    data.extend_from_slice(&pk);
    for relay in relays {
        let bytes = relay.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(KeyError::BadTlv);
        }
        data.push(1);
        data.push(bytes.len() as u8);
        data.extend_from_slice(bytes);
    }
    Ok(encode_with_prefix("nprofile", &data))
}

pub(crate) fn verifying_key_from_hex(pubkey_hex: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = hex::decode(pubkey_hex).map_err(|_| KeyError::BadPublicKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::BadPublicKey)
}

fn encode_with_prefix(prefix: &str, data: &[u8]) -> String {
    let hrp = Hrp::parse(prefix).expect("static hrp is valid");
    bech32::encode::<Bech32>(hrp, data).expect("bech32 encoding of short data")
}

fn decode_with_prefix(prefix: &str, encoded: &str) -> Result<Vec<u8>, KeyError> {
    let (hrp, data) =
        bech32::decode(encoded.trim()).map_err(|e| KeyError::BadEncoding(e.to_string()))?;
    let found = hrp.to_string().to_lowercase();
    if found != prefix {
        return Err(KeyError::WrongPrefix { expected: prefix.to_owned(), found });
    }
    Ok(data)
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("bech32 decode failed: {0}")]
    BadEncoding(String),
    #[error("expected bech32 prefix '{expected}', found '{found}'")]
    WrongPrefix { expected: String, found: String },
    #[error("destination must be npub or nprofile")]
    UnknownPrefix,
    #[error("key payload has wrong length")]
    BadLength,
    #[error("malformed TLV payload")]
    BadTlv,
    #[error("invalid secret key")]
    BadSecretKey,
    #[error("invalid public key")]
    BadPublicKey,
    #[error("nprofile is missing the pubkey entry")]
    MissingProfilePubkey,
    #[error("signing failed: {0}")]
    Signing(String),
}
