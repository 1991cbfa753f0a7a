//! Abstract interface for carrying RPC traffic over a pub/sub bus.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Codecs turn typed messages into payload bytes and back.
pub mod codec;

/// Header maps carried by every envelope.
pub mod headers;

/// Envelopes are the unit that crosses the bus boundary.
pub mod message;

/// Subjects are named channels for messages.
pub mod subject;

/// Subscriptions are live bindings between a subject pattern and a handler.
pub mod subscription;

/// Subscription handlers process messages for subscriptions.
pub mod subscription_handler;

/// Transports move envelopes across the bus.
pub mod transport;

pub use headers::HeaderMap;
pub use message::Message;
pub use subject::{Subject, SubjectMap};
