use thiserror::Error;

/// Errors that can occur in a service.
#[derive(Debug, Error)]
pub enum Error {
    /// `start` was called twice.
    #[error("service already started")]
    AlreadyStarted,

    /// The caller's token or the service token was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),

    /// Payload could not be decoded.
    #[error("decode: {0}")]
    Decode(String),

    /// Payload could not be encoded.
    #[error("encode: {0}")]
    Encode(String),

    /// Identity header is not a valid public key.
    #[error("invalid identity")]
    InvalidIdentity,

    /// Options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Signature does not match the payload.
    #[error("invalid signature")]
    InvalidSignature,

    /// Signing key seed is malformed.
    #[error("invalid signing key: {0}")]
    InvalidSigningKey(String),

    /// Signature header could not be decoded.
    #[error("malformed signature")]
    MalformedSignature,

    /// Tried to respond to a message without reply subject.
    #[error("message has no reply subject")]
    NoReplySubject,

    /// The background loop is gone.
    #[error("publish queue closed")]
    PublishQueueClosed,

    /// The remote handler answered with an error envelope.
    #[error("{0}")]
    Remote(String),

    /// Bus failure.
    #[error("transport: {0}")]
    Transport(String),

    /// Identity is not in the allowlist.
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
}
