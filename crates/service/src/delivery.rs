use crate::error::Error;
use crate::service::Service;

use std::fmt::{self, Debug};

use busrpc_messaging::codec::Codec;
use busrpc_messaging::headers::{RPC_STATUS, RPC_STATUS_ERROR};
use busrpc_messaging::subject::Subject;
use busrpc_messaging::transport::{Acknowledgement, Transport};
use busrpc_messaging::{HeaderMap, Message};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Payload of an error reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcError {
    /// Human-readable error.
    pub error: String,
}

/// An inbound envelope together with the service it arrived on.
pub struct Delivery<T, C>
where
    T: Transport,
    C: Codec,
{
    message: Message,
    service: Service<T, C>,
}

impl<T, C> Clone for Delivery<T, C>
where
    T: Transport,
    C: Codec,
{
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            service: self.service.clone(),
        }
    }
}

impl<T, C> Debug for Delivery<T, C>
where
    T: Transport,
    C: Codec,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl<T, C> Delivery<T, C>
where
    T: Transport,
    C: Codec,
{
    /// Wraps an envelope received by `service`.
    pub const fn new(service: Service<T, C>, message: Message) -> Self {
        Self { message, service }
    }

    /// The raw envelope.
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Subject the envelope was published to.
    pub const fn subject(&self) -> &Subject {
        &self.message.subject
    }

    /// Reply subject, if the sender expects an answer.
    pub const fn reply(&self) -> Option<&Subject> {
        self.message.reply.as_ref()
    }

    /// Envelope headers.
    pub const fn headers(&self) -> &HeaderMap {
        &self.message.headers
    }

    /// Raw payload.
    pub const fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    /// The service that received the envelope.
    pub const fn service(&self) -> &Service<T, C> {
        &self.service
    }

    /// Verifies and decodes the payload.
    ///
    /// # Errors
    /// Returns a verification or decode error, or `Remote` for error envelopes.
    pub fn decode<M>(&self) -> Result<M, Error>
    where
        M: DeserializeOwned,
    {
        self.service.unmarshal(&self.message)
    }

    /// Encodes `reply` and sends it to the reply subject.
    ///
    /// # Errors
    /// Returns an error if there is no reply subject or publishing fails.
    pub async fn respond<M>(&self, reply: &M) -> Result<(), Error>
    where
        M: Serialize + Sync + ?Sized,
    {
        let payload = self.service.encode(reply)?;
        self.respond_buf(payload).await
    }

    /// Sends raw bytes to the reply subject.
    ///
    /// # Errors
    /// Returns an error if there is no reply subject or publishing fails.
    pub async fn respond_buf(&self, payload: Bytes) -> Result<(), Error> {
        self.respond_with_headers(payload, HeaderMap::new()).await
    }

    /// Sends raw bytes with extra headers to the reply subject. Replies
    /// bypass the publish queue.
    ///
    /// # Errors
    /// Returns an error if there is no reply subject or publishing fails.
    pub async fn respond_with_headers(
        &self,
        payload: Bytes,
        headers: HeaderMap,
    ) -> Result<(), Error> {
        let reply = self.reply().cloned().ok_or(Error::NoReplySubject)?;
        let message = self.service.make_message(reply, None, payload, headers);
        self.service.publish_now(message).await
    }

    /// Sends an error envelope to the reply subject.
    ///
    /// # Errors
    /// Returns an error if there is no reply subject or publishing fails.
    pub async fn respond_error(&self, error: impl Into<String>) -> Result<(), Error> {
        let payload = self.service.encode(&RpcError {
            error: error.into(),
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(RPC_STATUS, RPC_STATUS_ERROR);
        self.respond_with_headers(payload, headers).await
    }

    /// Reports successful processing.
    pub async fn ack(&self) {
        self.acknowledge(Acknowledgement::Ack).await;
    }

    /// Reports failed processing.
    pub async fn nak(&self) {
        self.acknowledge(Acknowledgement::Nak).await;
    }

    async fn acknowledge(&self, acknowledgement: Acknowledgement) {
        if let Err(e) = self
            .service
            .transport()
            .acknowledge(&self.message, acknowledgement)
            .await
        {
            debug!(subject = %self.message.subject, "failed to acknowledge: {e}");
        }
    }
}
