mod error;

use crate::subscription::NatsSubscription;
pub use error::Error;

use async_nats::Client;
use async_nats::HeaderMap as NatsHeaderMap;
use async_nats::RequestErrorKind;
use async_trait::async_trait;
use busrpc_messaging::subject::Subject;
use busrpc_messaging::subscription_handler::SubscriptionHandler;
use busrpc_messaging::transport::Transport;
use busrpc_messaging::{HeaderMap, Message};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Options for the NATS transport.
#[derive(Clone, Debug)]
pub struct NatsTransportOptions {
    /// The NATS client to use.
    pub client: Client,
}

/// A transport backed by a NATS connection.
#[derive(Clone, Debug)]
pub struct NatsTransport {
    client: Client,
}

impl NatsTransport {
    /// Creates a transport over an existing client.
    #[must_use]
    pub fn new(NatsTransportOptions { client }: NatsTransportOptions) -> Self {
        Self { client }
    }

    /// Connects to a NATS server.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        Ok(Self { client })
    }

    /// The underlying client.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    fn spawn_delivery<X>(
        subject: &Subject,
        mut subscriber: async_nats::Subscriber,
        handler: X,
    ) -> NatsSubscription
    where
        X: SubscriptionHandler,
    {
        let shutdown_token = CancellationToken::new();
        let token = shutdown_token.clone();
        let pattern = subject.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        let _ = subscriber.unsubscribe().await;
                        break;
                    }
                    message = subscriber.next() => {
                        let Some(message) = message else {
                            break;
                        };
                        if let Err(e) = handler.handle(from_nats(message)).await {
                            debug!(subject = %pattern, "subscription handler failed: {e}");
                        }
                    }
                }
            }
        });

        NatsSubscription::new(subject.clone(), shutdown_token)
    }
}

fn to_nats_headers(headers: &HeaderMap) -> NatsHeaderMap {
    let mut nats_headers = NatsHeaderMap::new();
    for (key, values) in headers {
        for value in values {
            nats_headers.append(key.as_str(), value.as_str());
        }
    }
    nats_headers
}

fn from_nats(message: async_nats::Message) -> Message {
    let mut headers = HeaderMap::new();
    if let Some(nats_headers) = &message.headers {
        for (key, values) in nats_headers.iter() {
            for value in values {
                headers.append(key.to_string(), value.to_string());
            }
        }
    }

    Message {
        subject: Subject::from(message.subject.to_string()),
        reply: message.reply.map(|reply| Subject::from(reply.to_string())),
        payload: message.payload,
        headers,
    }
}

#[async_trait]
impl Transport for NatsTransport {
    type Error = Error;
    type Subscription = NatsSubscription;

    async fn publish(&self, message: Message) -> Result<(), Error> {
        let headers = to_nats_headers(&message.headers);
        let subject = String::from(message.subject);

        let result = match message.reply {
            Some(reply) => {
                self.client
                    .publish_with_reply_and_headers(
                        subject,
                        String::from(reply),
                        headers,
                        message.payload,
                    )
                    .await
            }
            None => {
                self.client
                    .publish_with_headers(subject, headers, message.payload)
                    .await
            }
        };

        result.map_err(|e| Error::Publish(e.to_string()))
    }

    async fn subscribe<X>(&self, subject: &Subject, handler: X) -> Result<NatsSubscription, Error>
    where
        X: SubscriptionHandler,
    {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        Ok(Self::spawn_delivery(subject, subscriber, handler))
    }

    async fn queue_subscribe<X>(
        &self,
        subject: &Subject,
        queue_group: &str,
        handler: X,
    ) -> Result<NatsSubscription, Error>
    where
        X: SubscriptionHandler,
    {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        Ok(Self::spawn_delivery(subject, subscriber, handler))
    }

    async fn request(&self, message: Message) -> Result<Message, Error> {
        let subject = String::from(message.subject);
        let headers = to_nats_headers(&message.headers);

        let reply = self
            .client
            .request_with_headers(subject.clone(), headers, message.payload)
            .await
            .map_err(|e| match e.kind() {
                RequestErrorKind::NoResponders => Error::NoResponders(subject.clone()),
                RequestErrorKind::TimedOut => Error::TimedOut(subject.clone()),
                RequestErrorKind::Other => Error::Request(e.to_string()),
            })?;

        Ok(from_nats(reply))
    }

    async fn flush(&self) -> Result<(), Error> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Flush(e.to_string()))
    }

    fn new_inbox(&self) -> Subject {
        Subject::from(self.client.new_inbox())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;

    use busrpc_messaging::subscription::Subscription;
    use tokio::sync::mpsc;
    use tokio::time::{Duration, timeout};

    #[derive(Clone, Debug)]
    struct Forward(mpsc::Sender<Message>);

    #[async_trait]
    impl SubscriptionHandler for Forward {
        type Error = Infallible;

        async fn handle(&self, message: Message) -> Result<(), Infallible> {
            let _ = self.0.send(message).await;
            Ok(())
        }
    }

    #[test]
    fn test_header_conversion() {
        let mut headers = HeaderMap::new();
        headers.append("identity", "abc");
        headers.append("multi", "1");
        headers.append("multi", "2");

        let nats_headers = to_nats_headers(&headers);
        let message = from_nats(async_nats::Message {
            subject: "a.b".into(),
            reply: Some("_INBOX.x".into()),
            payload: "payload".into(),
            headers: Some(nats_headers),
            status: None,
            description: None,
            length: 0,
        });

        assert_eq!(message.subject.as_str(), "a.b");
        assert_eq!(message.reply, Some(Subject::from("_INBOX.x")));
        assert_eq!(message.headers.get("identity"), Some("abc"));
        assert_eq!(message.headers.get_all("multi"), ["1", "2"]);
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server"]
    async fn test_publish_subscribe_roundtrip() {
        let transport = NatsTransport::connect("localhost:4222").await.unwrap();
        let (sender, mut receiver) = mpsc::channel(10);
        let subject = Subject::from("busrpc.test.roundtrip");

        let subscription = transport
            .subscribe(&subject, Forward(sender))
            .await
            .unwrap();
        transport.flush().await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("identity", "abc");
        transport
            .publish(Message::new(subject.clone(), "hello").with_headers(headers))
            .await
            .unwrap();

        let message = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, "hello");
        assert_eq!(message.headers.get("identity"), Some("abc"));

        subscription.unsubscribe().await.unwrap();
    }
}
