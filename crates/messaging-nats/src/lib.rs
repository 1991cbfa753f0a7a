//! NATS implementation of the messaging crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Subscriptions backed by NATS subscribers.
pub mod subscription;

/// The NATS transport.
pub mod transport;

pub use subscription::NatsSubscription;
pub use transport::{Error, NatsTransport, NatsTransportOptions};
