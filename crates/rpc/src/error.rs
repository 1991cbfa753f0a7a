use thiserror::Error;

/// Errors surfaced by the RPC layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The registrar was started twice.
    #[error("registrar already started")]
    AlreadyStarted,

    /// The call was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// The method is flagged "skip inputs" and cannot be called.
    #[error("calling disabled: {method}@{service}")]
    CallingDisabled {
        /// Service full name.
        service: String,
        /// Method name.
        method: String,
    },

    /// The call's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A descriptor with the same full name is already registered.
    #[error("duplicate service descriptor: {0}")]
    DuplicateService(String),

    /// Method path is not `/{service}/{method}`.
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// Derived subject is empty or not addressable.
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// The local service was never started, so queued requests would not
    /// be published.
    #[error("service not started")]
    NotStarted,

    /// The remote handler answered with an error.
    #[error("{0}")]
    Remote(String),

    /// Sending half of a stream is closed.
    #[error("send closed")]
    SendClosed,

    /// Service layer failure.
    #[error(transparent)]
    Service(busrpc_service::Error),

    /// The stream was closed.
    #[error("stream closed")]
    StreamClosed,

    /// Method is not part of the service descriptor.
    #[error("unknown method: {method}@{service}")]
    UnknownMethod {
        /// Service full name.
        service: String,
        /// Method name.
        method: String,
    },

    /// No descriptor is registered under that name.
    #[error("unknown service: {0}")]
    UnknownService(String),
}

impl From<busrpc_service::Error> for Error {
    fn from(error: busrpc_service::Error) -> Self {
        match error {
            busrpc_service::Error::Cancelled => Self::Cancelled,
            busrpc_service::Error::Remote(message) => Self::Remote(message),
            other => Self::Service(other),
        }
    }
}
