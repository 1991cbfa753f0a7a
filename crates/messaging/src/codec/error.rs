use crate::codec::CodecError;

use thiserror::Error;

/// Errors raised by the bundled codecs.
#[derive(Debug, Error)]
pub enum Error {
    /// JSON encoding or decoding failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR encoding failed.
    #[error("cbor encode: {0}")]
    CborEncode(String),

    /// CBOR decoding failed.
    #[error("cbor decode: {0}")]
    CborDecode(String),
}

impl CodecError for Error {}
