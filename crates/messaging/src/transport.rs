use crate::message::Message;
use crate::subject::Subject;
use crate::subscription::Subscription;
use crate::subscription_handler::SubscriptionHandler;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use uuid::Uuid;

/// Prefix of ephemeral reply subjects.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Marker trait for transport errors
pub trait TransportError: Error + Send + Sync + 'static {}

/// Outcome reported back to buses that track delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processed successfully.
    Ack,

    /// Processing failed.
    Nak,
}

/// A connection to the message bus.
#[async_trait]
pub trait Transport
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the transport.
    type Error: TransportError;

    /// The subscription type returned by `subscribe`.
    type Subscription: Subscription;

    /// Publish a message.
    async fn publish(&self, message: Message) -> Result<(), Self::Error>;

    /// Subscribe a handler to a subject pattern.
    async fn subscribe<X>(
        &self,
        subject: &Subject,
        handler: X,
    ) -> Result<Self::Subscription, Self::Error>
    where
        X: SubscriptionHandler;

    /// Subscribe as a member of a queue group; each message reaches one member.
    async fn queue_subscribe<X>(
        &self,
        subject: &Subject,
        queue_group: &str,
        handler: X,
    ) -> Result<Self::Subscription, Self::Error>
    where
        X: SubscriptionHandler;

    /// Publish a message with a fresh reply subject and wait for one reply.
    async fn request(&self, message: Message) -> Result<Message, Self::Error>;

    /// Flush buffered outbound messages.
    async fn flush(&self) -> Result<(), Self::Error>;

    /// Report a delivery outcome. A no-op for buses without acknowledgements.
    async fn acknowledge(
        &self,
        _message: &Message,
        _acknowledgement: Acknowledgement,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// A fresh, unique reply subject.
    fn new_inbox(&self) -> Subject {
        Subject::from(format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple()))
    }
}
