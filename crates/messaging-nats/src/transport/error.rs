use busrpc_messaging::transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the NATS transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not connect.
    #[error("connect: {0}")]
    Connect(String),

    /// Flush failed.
    #[error("flush: {0}")]
    Flush(String),

    /// A request matched no subscriber.
    #[error("no responders for `{0}`")]
    NoResponders(String),

    /// Publish failed.
    #[error("publish: {0}")]
    Publish(String),

    /// Request failed.
    #[error("request: {0}")]
    Request(String),

    /// Subscribe failed.
    #[error("subscribe: {0}")]
    Subscribe(String),

    /// The client-side request timeout elapsed.
    #[error("request to `{0}` timed out")]
    TimedOut(String),
}

impl TransportError for Error {}
