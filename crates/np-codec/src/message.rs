//! Inner HTTP messages and body segmentation.
//!
//! Requests and responses share the part envelope (`id`, `partIndex`,
//! `parts`, `bodyBase64`); the head fields (`method`/`url`/`headers` or
//! `status`/`headers`) appear on part 0 only. Bodies are base64-encoded as a
//! whole and split into fixed-size chunks, so the receiver reassembles by
//! concatenating chunks in index order before decoding.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// Chunk size of a segmented body, in base64 characters.
pub const BODY_CHUNK_CHARS: usize = 32_768;

/// Maximum accepted length of a message correlation id.
pub const MAX_ID_CHARS: usize = 100;

/// Largest integer a JSON peer can represent exactly (2^53 - 1).
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// One part of a tunneled HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub id: String,
    pub part_index: u64,
    pub parts: u64,
    pub body_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl RequestMessage {
    /// Build a non-head part. Part 0 additionally needs [`Self::with_head`].
    pub fn part(id: &str, part_index: u64, parts: u64, body_base64: String) -> Self {
        RequestMessage {
            id: id.to_owned(),
            part_index,
            parts,
            body_base64,
            method: None,
            url: None,
            headers: None,
        }
    }

    /// Attach the request head carried by part 0.
    pub fn with_head(mut self, method: &str, url: &str, headers: HashMap<String, String>) -> Self {
        self.method = Some(method.to_owned());
        self.url = Some(url.to_owned());
        self.headers = Some(headers);
        self
    }
}

/// One part of a tunneled HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub id: String,
    pub part_index: u64,
    pub parts: u64,
    pub body_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl ResponseMessage {
    /// Shape checks shared by every part, plus the part-0 head requirements.
    ///
    /// `status` is accepted as any JSON safe integer here; range policy is
    /// applied where the HTTP response is written.
    pub fn validate(&self) -> Result<(), MessageError> {
        validate_envelope(&self.id, self.part_index, self.parts)?;
        if self.part_index == 0 {
            match self.status {
                None => return Err(MessageError::MissingStatus),
                Some(status) if !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&status) => {
                    return Err(MessageError::UnsafeStatus(status));
                }
                Some(_) => {}
            }
            if self.headers.is_none() {
                return Err(MessageError::MissingHeaders);
            }
        }
        Ok(())
    }
}

fn validate_envelope(id: &str, part_index: u64, parts: u64) -> Result<(), MessageError> {
    if id.is_empty() || id.chars().count() > MAX_ID_CHARS {
        return Err(MessageError::BadId);
    }
    if parts == 0 {
        return Err(MessageError::ZeroParts);
    }
    if part_index >= parts {
        return Err(MessageError::PartOutOfRange { part_index, parts });
    }
    Ok(())
}

/// Base64-encode a body and split it into [`BODY_CHUNK_CHARS`]-sized chunks.
///
/// An empty body still yields exactly one (empty) part.
pub fn segment_body(body: &[u8]) -> Vec<String> {
    let encoded = STANDARD.encode(body);
    if encoded.is_empty() {
        return vec![String::new()];
    }
    encoded
        .as_bytes()
        .chunks(BODY_CHUNK_CHARS)
        // base64 output is ASCII, so chunking bytes never splits a char
        .map(|chunk| String::from_utf8(chunk.to_vec()).expect("base64 is ASCII"))
        .collect()
}

/// Concatenate base64 chunks in the order given and decode.
pub fn assemble_body<'a, I>(parts: I) -> Result<Vec<u8>, MessageError>
where
    I: IntoIterator<Item = &'a str>,
{
    let joined: String = parts.into_iter().collect();
    STANDARD.decode(joined).map_err(|_| MessageError::BadBody)
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message id must be 1..=100 characters")]
    BadId,
    #[error("parts must be at least 1")]
    ZeroParts,
    #[error("partIndex {part_index} out of range for {parts} parts")]
    PartOutOfRange { part_index: u64, parts: u64 },
    #[error("part 0 is missing the status")]
    MissingStatus,
    #[error("status {0} is not a safe integer")]
    UnsafeStatus(i64),
    #[error("part 0 is missing the headers")]
    MissingHeaders,
    #[error("body is not valid base64")]
    BadBody,
}
