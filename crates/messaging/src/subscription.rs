use crate::subject::Subject;

use std::convert::Infallible;
use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for subscription errors
pub trait SubscriptionError: Error + Send + Sync + 'static {}

impl SubscriptionError for Infallible {}

/// A live binding between a subject pattern and a handler.
#[async_trait]
pub trait Subscription
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the subscription.
    type Error: SubscriptionError;

    /// The pattern this subscription listens on.
    fn subject(&self) -> &Subject;

    /// Stops delivery. Calling it more than once is a no-op.
    async fn unsubscribe(&self) -> Result<(), Self::Error>;
}
