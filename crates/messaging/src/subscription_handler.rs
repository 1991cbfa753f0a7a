use crate::message::Message;

use std::convert::Infallible;
use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for subscription handler errors
pub trait SubscriptionHandlerError: Error + Send + Sync + 'static {}

impl SubscriptionHandlerError for Infallible {}

/// A handler invoked for every message delivered to a subscription, in
/// delivery order.
#[async_trait]
pub trait SubscriptionHandler
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: SubscriptionHandlerError;

    /// Handle a message.
    async fn handle(&self, message: Message) -> Result<(), Self::Error>;
}
