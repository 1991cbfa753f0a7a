use busrpc_messaging::subject::{Error as SubjectError, Subject};
use busrpc_messaging::transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the in-memory transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Subject failed validation.
    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),

    /// Wildcards are only valid in subscriptions.
    #[error("cannot publish to wildcard subject `{0}`")]
    WildcardPublish(Subject),

    /// A request matched no subscription.
    #[error("no responders for `{0}`")]
    NoResponders(Subject),

    /// The reply inbox closed before a reply arrived.
    #[error("request aborted before a reply arrived")]
    RequestAborted,
}

impl TransportError for Error {}
