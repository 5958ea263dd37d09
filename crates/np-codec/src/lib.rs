// np-codec: event model, crypto envelope and message serialization for the
// HTTP-over-relay tunnel.
//
// Pure library crate: no I/O, no async. The proxy service composes these
// primitives into its ingest and publish pipelines.

pub mod crypto;
pub mod event;
pub mod keys;
pub mod message;
pub mod wrap;

pub use crypto::{ConversationKey, CryptoError, conversation_key, decrypt, encrypt};
pub use event::{
    Event, EventError, EventTemplate, KIND_GIFT_WRAP, KIND_HTTP_REQUEST, KIND_HTTP_RESPONSE,
    KIND_SEAL,
};
pub use keys::{
    KeyError, Keys, Profile, decode_destination, decode_nprofile, decode_npub, encode_nprofile,
};
pub use message::{
    BODY_CHUNK_CHARS, MessageError, RequestMessage, ResponseMessage, assemble_body, segment_body,
};
pub use wrap::{Unwrapped, WrapError, WrapParams, unwrap_event, wrap_event};
