//! Wire format for host ⇄ enclave transport.
//!
//! Every logical message starts with a metadata frame:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────┐
//! │ u32 length (BE)      │ UTF-8 JSON MessageMetadata       │
//! └──────────────────────┴──────────────────────────────────┘
//! ```
//!
//! An optional raw payload follows. The payload is NOT length-prefixed:
//! its end is the end of the connection's write side.

use crate::message::MessageMetadata;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the big-endian length prefix in front of every metadata frame.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Network chunk size: reads and writes of payload bytes happen in units of this.
pub const DEFAULT_CHUNK_SIZE: usize = 20 * 1024 * 1024;

/// Upper bound on a metadata frame. Metadata is a handful of short strings;
/// anything larger is a corrupt or hostile prefix.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("metadata frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("metadata frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Serialize metadata into a complete frame (length prefix + JSON body).
pub fn encode_frame(metadata: &MessageMetadata) -> Result<Vec<u8>, WireError> {
    let body =
        serde_json::to_vec(metadata).map_err(|e| WireError::InvalidMetadata(e.to_string()))?;
    let len = u32::try_from(body.len()).map_err(|_| WireError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Interpret a length prefix, rejecting frames larger than `max`.
pub fn frame_length(prefix: [u8; LENGTH_PREFIX_BYTES], max: usize) -> Result<usize, WireError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max {
        return Err(WireError::FrameTooLarge { len, max });
    }
    Ok(len)
}

/// Parse the JSON body of a metadata frame.
pub fn decode_metadata(body: &[u8]) -> Result<MessageMetadata, WireError> {
    serde_json::from_slice(body).map_err(|e| WireError::InvalidMetadata(e.to_string()))
}

/// Decode a frame from the front of `bytes`.
///
/// Returns the metadata and the number of bytes consumed; whatever follows
/// is payload.
pub fn decode_frame(bytes: &[u8], max: usize) -> Result<(MessageMetadata, usize), WireError> {
    if bytes.len() < LENGTH_PREFIX_BYTES {
        return Err(WireError::Truncated {
            expected: LENGTH_PREFIX_BYTES,
            actual: bytes.len(),
        });
    }
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    prefix.copy_from_slice(&bytes[..LENGTH_PREFIX_BYTES]);
    let len = frame_length(prefix, max)?;

    let end = LENGTH_PREFIX_BYTES + len;
    if bytes.len() < end {
        return Err(WireError::Truncated {
            expected: len,
            actual: bytes.len() - LENGTH_PREFIX_BYTES,
        });
    }
    let metadata = decode_metadata(&bytes[LENGTH_PREFIX_BYTES..end])?;
    Ok((metadata, end))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
