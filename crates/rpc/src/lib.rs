//! RPC over a pub/sub bus: services and methods map to subjects, unary calls
//! ride request/reply and streams ride plain subscriptions.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod context;
mod descriptor;
mod error;
mod server;

/// Subject derivation from service and method names.
pub mod derive;

pub use client::{ClientConn, ClientStream};
pub use context::Context;
pub use descriptor::{DescriptorRegistry, MethodDescriptor, MethodKind, ServiceDescriptor};
pub use error::Error;
pub use server::{ServerStream, ServiceDefinition, ServiceRegistrar};
