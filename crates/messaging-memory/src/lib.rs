//! In-memory implementation of the messaging crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Subscriptions on the in-memory bus.
pub mod subscription;

/// The in-memory bus.
pub mod transport;

pub use subscription::MemorySubscription;
pub use transport::{Error, MemoryStats, MemoryTransport, MemoryTransportOptions};
