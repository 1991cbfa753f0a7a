//! A message-bus service: signed envelopes, delivery accounting, a bounded
//! publish queue drained by a background loop, and telemetry.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod counters;
mod delivery;
mod error;
mod identity;
mod options;
mod service;
mod telemetry;

pub use counters::CounterSnapshot;
pub use delivery::{Delivery, RpcError};
pub use error::Error;
pub use identity::{Identity, decode_identity, encode_identity, unix_nanos};
pub use options::{ServiceConfig, ServiceOptions};
pub use service::{HandlerError, Service, StatusCallback};
pub use telemetry::{Telemetry, TelemetryPing, TelemetryPong};
