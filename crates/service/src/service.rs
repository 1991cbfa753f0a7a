use crate::counters::{CounterSnapshot, Counters};
use crate::delivery::{Delivery, RpcError};
use crate::error::Error;
use crate::identity::{Identity, unix_nanos};
use crate::options::ServiceOptions;
use crate::telemetry::{Telemetry, TelemetryPing, TelemetryPong};

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use busrpc_messaging::codec::Codec;
use busrpc_messaging::headers::{RPC_STATUS, RPC_STATUS_ERROR};
use busrpc_messaging::subject::Subject;
use busrpc_messaging::subscription::Subscription;
use busrpc_messaging::subscription_handler::SubscriptionHandler;
use busrpc_messaging::transport::Transport;
use busrpc_messaging::{HeaderMap, Message};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Produces extra telemetry status values.
pub type StatusCallback = Arc<dyn Fn() -> BTreeMap<String, Value> + Send + Sync>;

/// Error returned by request handlers passed to [`Service::serve`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type BoxedHandler<T, C> = Arc<dyn Fn(Delivery<T, C>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Inner<T, C>
where
    T: Transport,
    C: Codec,
{
    options: ServiceOptions,
    transport: T,
    codec: C,
    identity: Identity,
    counters: Counters,
    publish_sender: mpsc::Sender<Message>,
    publish_receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
    started_at: Instant,
    last_telemetry: Mutex<Instant>,
    telemetry_nonce: AtomicU64,
    status_callbacks: RwLock<BTreeMap<String, StatusCallback>>,
}

/// A named participant on the bus. Clones share state.
pub struct Service<T, C>
where
    T: Transport,
    C: Codec,
{
    inner: Arc<Inner<T, C>>,
}

impl<T, C> Clone for Service<T, C>
where
    T: Transport,
    C: Codec,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, C> Debug for Service<T, C>
where
    T: Transport,
    C: Codec,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("prefix", &self.inner.options.prefix)
            .field("name", &self.inner.options.name)
            .field("identity", &self.inner.identity.public())
            .finish_non_exhaustive()
    }
}

impl<T, C> Service<T, C>
where
    T: Transport,
    C: Codec,
{
    /// Creates a service. Call [`Self::start`] to run the publish loop.
    ///
    /// # Errors
    /// Returns an error if the options fail validation.
    pub fn new(transport: T, codec: C, options: ServiceOptions) -> Result<Self, Error> {
        options.validate()?;

        let identity = Identity::new(
            options.signing_key.clone(),
            options.known_identities.clone(),
        );
        if let Some(public) = identity.public() {
            info!(service = %options.name, identity = %public, "service identity");
        }

        let (publish_sender, publish_receiver) = mpsc::channel(options.publish_queue_size);

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                transport,
                codec,
                identity,
                counters: Counters::default(),
                publish_sender,
                publish_receiver: Mutex::new(Some(publish_receiver)),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
                started_at: Instant::now(),
                last_telemetry: Mutex::new(Instant::now()),
                telemetry_nonce: AtomicU64::new(0),
                status_callbacks: RwLock::new(BTreeMap::new()),
            }),
        })
    }

    /// Service options.
    pub fn options(&self) -> &ServiceOptions {
        &self.inner.options
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// The payload codec.
    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    /// Signing identity and allowlist.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Token cancelled when the service shuts down or fails.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown_token
    }

    /// Current counters, without resetting them.
    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }

    /// `{prefix}.{name}.{suffixes}`.
    pub fn subject<I, S>(&self, suffixes: I) -> Subject
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = std::iter::once(self.inner.options.name.clone())
            .chain(suffixes.into_iter().map(|suffix| suffix.as_ref().to_string()));
        Subject::new(&self.inner.options.prefix, suffixes)
    }

    /// A fresh reply subject.
    pub fn new_inbox(&self) -> Subject {
        self.inner.transport.new_inbox()
    }

    /// Encodes with the service codec.
    ///
    /// # Errors
    /// Returns an error if the codec rejects the message.
    pub fn encode<M>(&self, message: &M) -> Result<Bytes, Error>
    where
        M: Serialize + ?Sized,
    {
        self.inner
            .codec
            .encode(message)
            .map_err(|e| Error::Encode(e.to_string()))
    }

    /// Decodes with the service codec, without verification.
    ///
    /// # Errors
    /// Returns an error if the payload is malformed.
    pub fn decode<M>(&self, payload: &[u8]) -> Result<M, Error>
    where
        M: DeserializeOwned,
    {
        self.inner
            .codec
            .decode(payload)
            .map_err(|e| Error::Decode(e.to_string()))
    }

    /// Verifies the envelope signature.
    ///
    /// # Errors
    /// Returns a verification error.
    pub fn verify(&self, message: &Message) -> Result<(), Error> {
        self.inner
            .identity
            .verify(&message.headers, &message.payload)
    }

    /// Verifies and decodes an envelope. Error envelopes become
    /// [`Error::Remote`].
    ///
    /// # Errors
    /// Returns a verification, decode or remote error.
    pub fn unmarshal<M>(&self, message: &Message) -> Result<M, Error>
    where
        M: DeserializeOwned,
    {
        self.verify(message)?;

        if message.headers.get(RPC_STATUS) == Some(RPC_STATUS_ERROR) {
            let remote: RpcError = self.decode(&message.payload)?;
            return Err(Error::Remote(remote.error));
        }

        self.decode(&message.payload)
    }

    /// Builds a signed envelope.
    pub fn make_message(
        &self,
        subject: Subject,
        reply: Option<Subject>,
        payload: Bytes,
        mut headers: HeaderMap,
    ) -> Message {
        self.inner.identity.stamp(&mut headers, &payload);
        Message {
            subject,
            reply,
            payload,
            headers,
        }
    }

    /// Publishes `message` to `{prefix}.{name}.{suffixes}` through the queue.
    ///
    /// # Errors
    /// Returns an error if encoding fails or the service is shut down.
    pub async fn publish<M, I, S>(&self, message: &M, suffixes: I) -> Result<(), Error>
    where
        M: Serialize + Sync + ?Sized,
        I: IntoIterator<Item = S> + Send,
        S: AsRef<str>,
    {
        let subject = self.subject(suffixes);
        self.publish_to(message, subject).await
    }

    /// Publishes `message` to `subject` through the queue.
    ///
    /// # Errors
    /// Returns an error if encoding fails or the service is shut down.
    pub async fn publish_to<M>(&self, message: &M, subject: Subject) -> Result<(), Error>
    where
        M: Serialize + Sync + ?Sized,
    {
        let payload = self.encode(message)?;
        self.publish_buf_to(payload, subject).await
    }

    /// Publishes raw bytes to `{prefix}.{name}.{suffixes}` through the queue.
    ///
    /// # Errors
    /// Returns an error if the service is shut down.
    pub async fn publish_buf<I, S>(&self, payload: Bytes, suffixes: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S> + Send,
        S: AsRef<str>,
    {
        let subject = self.subject(suffixes);
        self.publish_buf_to(payload, subject).await
    }

    /// Publishes raw bytes to `subject` through the queue.
    ///
    /// # Errors
    /// Returns an error if the service is shut down.
    pub async fn publish_buf_to(&self, payload: Bytes, subject: Subject) -> Result<(), Error> {
        let message = self.make_message(subject, None, payload, HeaderMap::new());
        self.enqueue(message).await
    }

    /// Publishes `message` to `subject` with `reply` as the reply subject.
    ///
    /// # Errors
    /// Returns an error if encoding fails or the service is shut down.
    pub async fn publish_to_rpc<M>(
        &self,
        message: &M,
        reply: Subject,
        subject: Subject,
    ) -> Result<(), Error>
    where
        M: Serialize + Sync + ?Sized,
    {
        let payload = self.encode(message)?;
        let message = self.make_message(subject, Some(reply), payload, HeaderMap::new());
        self.enqueue(message).await
    }

    /// Puts an envelope on the publish queue, waiting for space.
    ///
    /// # Errors
    /// `Cancelled` once the service shuts down, `PublishQueueClosed` if the
    /// loop is gone.
    pub async fn enqueue(&self, message: Message) -> Result<(), Error> {
        tokio::select! {
            biased;
            () = self.inner.shutdown_token.cancelled() => Err(Error::Cancelled),
            result = self.inner.publish_sender.send(message) => {
                result.map_err(|_| Error::PublishQueueClosed)
            }
        }
    }

    /// Publishes immediately, bypassing the queue.
    ///
    /// # Errors
    /// Returns a transport error.
    pub async fn publish_now(&self, message: Message) -> Result<(), Error> {
        let bytes = message.len();
        self.inner
            .transport
            .publish(message)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        self.inner.counters.record_out(bytes);
        Ok(())
    }

    /// Subscribes `handler` to `{prefix}.{name}.{suffixes}`.
    ///
    /// # Errors
    /// Returns a transport error.
    pub async fn subscribe<F, Fut, I, S>(
        &self,
        handler: F,
        suffixes: I,
    ) -> Result<T::Subscription, Error>
    where
        F: Fn(Delivery<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        I: IntoIterator<Item = S> + Send,
        S: AsRef<str>,
    {
        let subject = self.subject(suffixes);
        self.subscribe_to(handler, &subject).await
    }

    /// Subscribes `handler` to `subject`. With a configured queue name the
    /// subscription joins that queue group.
    ///
    /// # Errors
    /// Returns a transport error.
    pub async fn subscribe_to<F, Fut>(
        &self,
        handler: F,
        subject: &Subject,
    ) -> Result<T::Subscription, Error>
    where
        F: Fn(Delivery<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.options.verbose {
            debug!(service = %self.name(), subject = %subject, "subscribing");
        }

        let handler = DeliveryHandler {
            service: self.clone(),
            handler: Arc::new(move |delivery| handler(delivery).boxed()),
        };

        let result = match &self.inner.options.queue_name {
            Some(queue_name) => {
                self.inner
                    .transport
                    .queue_subscribe(subject, queue_name, handler)
                    .await
            }
            None => self.inner.transport.subscribe(subject, handler).await,
        };

        result.map_err(|e| Error::Transport(e.to_string()))
    }

    /// Request/reply helper: answers every request on `subject` with the
    /// handler's result, or with an error envelope.
    ///
    /// # Errors
    /// Returns a transport error.
    pub async fn serve<F, Fut, R>(
        &self,
        handler: F,
        subject: &Subject,
    ) -> Result<T::Subscription, Error>
    where
        F: Fn(Delivery<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.serve_buf(
            move |delivery: Delivery<T, C>| {
                let handler = Arc::clone(&handler);
                async move {
                    let service = delivery.service().clone();
                    let reply = handler(delivery).await?;
                    Ok::<_, HandlerError>(service.encode(&reply)?)
                }
            },
            subject,
        )
        .await
    }

    /// Like [`Service::serve`], for handlers that encode their own replies.
    ///
    /// # Errors
    /// Returns a transport error.
    pub async fn serve_buf<F, Fut>(
        &self,
        handler: F,
        subject: &Subject,
    ) -> Result<T::Subscription, Error>
    where
        F: Fn(Delivery<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.subscribe_to(
            move |delivery: Delivery<T, C>| {
                let handler = Arc::clone(&handler);
                async move {
                    match handler(delivery.clone()).await {
                        Ok(payload) => {
                            if let Err(e) = delivery.respond_buf(payload).await {
                                warn!(subject = %delivery.subject(), "failed to respond: {e}");
                            }
                            delivery.ack().await;
                        }
                        Err(handler_error) => {
                            if let Err(e) = delivery.respond_error(handler_error.to_string()).await
                            {
                                warn!(subject = %delivery.subject(), "failed to respond: {e}");
                            }
                            delivery.nak().await;
                        }
                    }
                }
            },
            subject,
        )
        .await
    }

    /// Sends a request and decodes the reply. Bypasses the publish queue.
    ///
    /// # Errors
    /// `Cancelled` if `token` or the service token fires first, `Remote`
    /// for error replies, transport and decode errors otherwise.
    pub async fn request_from<Req, Resp>(
        &self,
        token: &CancellationToken,
        request: &Req,
        subject: Subject,
    ) -> Result<Resp, Error>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = self.encode(request)?;
        let reply = self
            .request_buf_from(token, payload, subject, HeaderMap::new())
            .await?;
        self.unmarshal(&reply)
    }

    /// Sends raw bytes as a request and returns the reply envelope. The
    /// request counts as outbound as soon as it reaches the transport, whether
    /// or not a reply arrives.
    ///
    /// # Errors
    /// `Cancelled` if `token` or the service token fires first, transport
    /// errors otherwise.
    pub async fn request_buf_from(
        &self,
        token: &CancellationToken,
        payload: Bytes,
        subject: Subject,
        headers: HeaderMap,
    ) -> Result<Message, Error> {
        let message = self.make_message(subject, None, payload, headers);

        // Counted once handed to the transport, even if the wait is abandoned.
        let request = async {
            self.inner.counters.record_out(message.len());
            self.inner.transport.request(message).await
        };

        let reply = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Cancelled),
            () = self.inner.shutdown_token.cancelled() => return Err(Error::Cancelled),
            reply = request => reply.map_err(|e| Error::Transport(e.to_string()))?,
        };

        if self.verify(&reply).is_ok() {
            self.inner.counters.record_in(reply.len());
        }
        Ok(reply)
    }

    /// Replies to a delivery.
    ///
    /// # Errors
    /// Returns an error if there is no reply subject or publishing fails.
    pub async fn respond<M>(&self, delivery: &Delivery<T, C>, reply: &M) -> Result<(), Error>
    where
        M: Serialize + Sync + ?Sized,
    {
        delivery.respond(reply).await
    }

    /// Tokens of `subject` starting at the last fixed token of
    /// `{prefix}.{name}.{suffixes}`, where `suffixes` end with a wildcard.
    pub fn stream_id_parts<I, S>(&self, subject: &Subject, suffixes: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let root_len = self.subject(suffixes).tokens().len();
        let start = root_len.saturating_sub(2);
        subject
            .tokens()
            .into_iter()
            .skip(start)
            .map(ToString::to_string)
            .collect()
    }

    /// The wildcard-matched remainder of `subject`, joined with dots.
    pub fn stream_id<I, S>(&self, subject: &Subject, suffixes: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts = self.stream_id_parts(subject, suffixes);
        parts.get(1..).map(|rest| rest.join(".")).unwrap_or_default()
    }

    /// Registers a telemetry status callback under `name`.
    pub fn add_status_callback<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn() -> BTreeMap<String, Value> + Send + Sync + 'static,
    {
        self.inner
            .status_callbacks
            .write()
            .insert(name.into(), Arc::new(callback));
    }

    /// Removes a telemetry status callback.
    pub fn remove_status_callback(&self, name: &str) {
        self.inner.status_callbacks.write().remove(name);
    }

    /// Envelopes waiting in the publish queue.
    pub fn publish_queue_len(&self) -> usize {
        self.inner.publish_sender.max_capacity() - self.inner.publish_sender.capacity()
    }

    /// Whether [`Service::start`] has run. Queued publishes only drain once it has.
    pub fn is_started(&self) -> bool {
        self.inner.publish_receiver.lock().is_none()
    }

    /// Starts the background loop: drains the publish queue, reports
    /// telemetry and answers telemetry pings.
    ///
    /// # Errors
    /// `AlreadyStarted` on a second call, or a transport error if the ping
    /// subscription fails.
    pub async fn start(&self) -> Result<(), Error> {
        let receiver = self
            .inner
            .publish_receiver
            .lock()
            .take()
            .ok_or(Error::AlreadyStarted)?;

        let service = self.clone();
        let ping_subscription = self
            .subscribe(
                move |delivery| {
                    let service = service.clone();
                    async move { service.handle_telemetry_ping(delivery).await }
                },
                ["telemetry", "ping"],
            )
            .await?;

        *self.inner.last_telemetry.lock() = Instant::now();

        let service = self.clone();
        self.inner.task_tracker.spawn(async move {
            service.run(receiver, ping_subscription).await;
        });

        Ok(())
    }

    async fn run(self, mut receiver: mpsc::Receiver<Message>, ping_subscription: T::Subscription) {
        let period = self.inner.options.telemetry_period;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        let shutdown_token = self.inner.shutdown_token.clone();

        loop {
            tokio::select! {
                biased;
                () = shutdown_token.cancelled() => {
                    debug!(service = %self.name(), "publish loop cancelled");
                    break;
                }
                message = receiver.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if let Err(e) = self.publish_now(message).await {
                        error!(service = %self.name(), "failed to publish: {e}");
                    }
                }
                _ = ticker.tick() => self.report_telemetry().await,
            }
        }

        if let Err(e) = ping_subscription.unsubscribe().await {
            warn!(service = %self.name(), "failed to unsubscribe telemetry ping: {e}");
        }
    }

    fn collect_status(&self) -> BTreeMap<String, Value> {
        let callbacks: Vec<StatusCallback> = self
            .inner
            .status_callbacks
            .read()
            .values()
            .cloned()
            .collect();

        let mut status = BTreeMap::new();
        for callback in callbacks {
            status.extend(callback());
        }

        let now = Instant::now();
        let period = {
            let mut last = self.inner.last_telemetry.lock();
            let period = now.duration_since(*last);
            *last = now;
            period
        };
        let counters = self.inner.counters.take();

        status.insert(
            "uptime".to_string(),
            json!(now.duration_since(self.inner.started_at).as_secs_f64()),
        );
        status.insert("period".to_string(), json!(period.as_secs_f64()));
        status.insert("publish_queue".to_string(), json!(self.publish_queue_len()));
        status.insert(
            "publish_queue_cap".to_string(),
            json!(self.inner.publish_sender.max_capacity()),
        );
        status.insert("msg_in".to_string(), json!(counters.msg_in));
        status.insert("msg_out".to_string(), json!(counters.msg_out));
        status.insert("bytes_in".to_string(), json!(counters.bytes_in));
        status.insert("bytes_out".to_string(), json!(counters.bytes_out));

        status
    }

    async fn report_telemetry(&self) {
        let nonce = self.inner.telemetry_nonce.fetch_add(1, Ordering::Relaxed) + 1;
        let telemetry = Telemetry {
            nonce: format!("{nonce:x}"),
            status: self.collect_status(),
        };

        let result = match self.encode(&telemetry) {
            Ok(payload) => {
                let subject = self.subject(["telemetry"]);
                self.publish_now(self.make_message(subject, None, payload, HeaderMap::new()))
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(service = %self.name(), "failed to report telemetry: {e}");
        }
    }

    async fn handle_telemetry_ping(&self, delivery: Delivery<T, C>) {
        let now = unix_nanos();

        let ping: TelemetryPing = match delivery.decode() {
            Ok(ping) => ping,
            Err(e) => {
                warn!(service = %self.name(), "malformed telemetry ping: {e}");
                return;
            }
        };
        let Ok(sent) = ping.timestamp.parse::<i64>() else {
            warn!(service = %self.name(), "telemetry ping timestamp is not a number");
            return;
        };

        let pong = TelemetryPong {
            nonce: ping.nonce,
            timestamp: now.to_string(),
            owl: now.saturating_sub(sent).to_string(),
        };
        if let Err(e) = delivery.respond(&pong).await {
            warn!(service = %self.name(), "failed to answer telemetry ping: {e}");
        }
    }

    /// Logs `error` and cancels the service.
    pub fn fail(&self, error: impl fmt::Display) {
        error!(service = %self.name(), "service failed: {error}");
        self.inner.shutdown_token.cancel();
    }

    /// Cancels the service and waits for the background loop to stop.
    pub async fn shutdown(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;
    }
}

struct DeliveryHandler<T, C>
where
    T: Transport,
    C: Codec,
{
    service: Service<T, C>,
    handler: BoxedHandler<T, C>,
}

impl<T, C> Clone for DeliveryHandler<T, C>
where
    T: Transport,
    C: Codec,
{
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T, C> Debug for DeliveryHandler<T, C>
where
    T: Transport,
    C: Codec,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandler")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, C> SubscriptionHandler for DeliveryHandler<T, C>
where
    T: Transport,
    C: Codec,
{
    type Error = Infallible;

    async fn handle(&self, message: Message) -> Result<(), Infallible> {
        // Rejected envelopes still reach the handler, whose decode reports the
        // failure; they are just not counted.
        match self.service.verify(&message) {
            Ok(()) => self.service.inner.counters.record_in(message.len()),
            Err(e) => debug!(
                service = %self.service.name(),
                subject = %message.subject,
                "rejected envelope: {e}"
            ),
        }
        if self.service.inner.options.verbose {
            debug!(
                service = %self.service.name(),
                subject = %message.subject,
                bytes = message.len(),
                "delivery"
            );
        }

        (self.handler)(Delivery::new(self.service.clone(), message)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use busrpc_messaging::codec::JsonCodec;
    use busrpc_messaging_memory::MemoryTransport;
    use ed25519_dalek::SigningKey;
    use serde::Deserialize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sum {
        a: i64,
        b: i64,
    }

    fn service(
        transport: &MemoryTransport,
        options: ServiceOptions,
    ) -> Service<MemoryTransport, JsonCodec> {
        Service::new(transport.clone(), JsonCodec, options).unwrap()
    }

    fn signed_options(seed: u8) -> ServiceOptions {
        ServiceOptions {
            prefix: "test".to_string(),
            name: "svc".to_string(),
            ..ServiceOptions::default()
        }
        .with_signing_key(SigningKey::from_bytes(&[seed; 32]))
    }

    #[tokio::test]
    async fn test_subject_and_stream_id() {
        let transport = MemoryTransport::default();
        let service = service(&transport, signed_options(1));

        assert_eq!(service.subject(["a", "", "b"]).as_str(), "test.svc.a.b");

        let subject = Subject::from("test.svc.query.p1.p2");
        assert_eq!(
            service.stream_id_parts(&subject, ["query.>"]),
            vec!["query", "p1", "p2"]
        );
        assert_eq!(service.stream_id(&subject, ["query.>"]), "p1.p2");
        assert_eq!(service.stream_id(&Subject::from("x"), ["query.>"]), "");
    }

    #[tokio::test]
    async fn test_publish_goes_through_queue() {
        let transport = MemoryTransport::default();
        let publisher = service(&transport, signed_options(1));
        let subscriber = service(&transport, signed_options(2));
        let (sender, mut receiver) = mpsc::channel(10);

        let _subscription = subscriber
            .subscribe_to(
                move |delivery: Delivery<_, _>| {
                    let sender = sender.clone();
                    async move {
                        let _ = sender.send(delivery.decode::<Sum>()).await;
                    }
                },
                &Subject::from("test.svc.sums"),
            )
            .await
            .unwrap();

        publisher.publish(&Sum { a: 1, b: 2 }, ["sums"]).await.unwrap();
        assert_eq!(publisher.publish_queue_len(), 1);
        assert_eq!(transport.stats().published, 0);
        assert!(!publisher.is_started());

        publisher.start().await.unwrap();
        let received = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(received, Sum { a: 1, b: 2 });
        assert_eq!(subscriber.counters().msg_in, 1);
        assert!(publisher.is_started());
        assert!(matches!(publisher.start().await, Err(Error::AlreadyStarted)));

        publisher.shutdown().await;
        assert_eq!(publisher.counters().msg_out, 1);
    }

    #[tokio::test]
    async fn test_full_queue_unblocks_on_shutdown() {
        let transport = MemoryTransport::default();
        let publisher = service(
            &transport,
            ServiceOptions {
                publish_queue_size: 1,
                ..signed_options(1)
            },
        );

        publisher.publish_buf(Bytes::from("1"), ["x"]).await.unwrap();

        let blocked = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish_buf(Bytes::from("2"), ["x"]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        publisher.shutdown().await;
        let result = timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_serve_and_request() {
        let transport = MemoryTransport::default();
        let server = service(&transport, signed_options(1));
        let client = service(&transport, signed_options(2));

        let _subscription = server
            .serve(
                |delivery: Delivery<_, _>| async move {
                    let sum: Sum = delivery.decode()?;
                    if sum.a < 0 {
                        return Err(HandlerError::from(format!("negative value: {}", sum.a)));
                    }
                    Ok(sum.a + sum.b)
                },
                &server.subject(["add"]),
            )
            .await
            .unwrap();

        let token = CancellationToken::new();
        let total: i64 = client
            .request_from(&token, &Sum { a: 123, b: 321 }, Subject::from("test.svc.add"))
            .await
            .unwrap();
        assert_eq!(total, 444);

        let failed = client
            .request_from::<_, i64>(&token, &Sum { a: -1, b: 0 }, Subject::from("test.svc.add"))
            .await;
        assert!(matches!(failed, Err(Error::Remote(message)) if message == "negative value: -1"));
    }

    #[tokio::test]
    async fn test_request_cancelled_by_token() {
        let transport = MemoryTransport::default();
        let server = service(&transport, signed_options(1));
        let client = service(&transport, signed_options(2));

        // Never answers.
        let _subscription = server
            .subscribe(|_delivery| async {}, ["silent"])
            .await
            .unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = timeout(
            Duration::from_secs(1),
            client.request_buf_from(
                &token,
                Bytes::from("{}"),
                Subject::from("test.svc.silent"),
                HeaderMap::new(),
            ),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_request_still_counts_outbound() {
        let transport = MemoryTransport::default();
        let server = service(&transport, signed_options(1));
        let client = service(&transport, signed_options(2));

        let _subscription = server
            .subscribe(|_delivery| async {}, ["silent"])
            .await
            .unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let payload = Bytes::from("{}");
        let result = timeout(
            Duration::from_secs(1),
            client.request_buf_from(
                &token,
                payload.clone(),
                Subject::from("test.svc.silent"),
                HeaderMap::new(),
            ),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        timeout(Duration::from_secs(1), async {
            while server.counters().msg_in == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let sent = client.counters();
        assert_eq!(sent.msg_out, 1);
        assert_eq!(sent.bytes_out, payload.len() as u64);
        assert_eq!(sent.msg_in, 0);
        assert_eq!(server.counters().msg_in, 1);

        // A token cancelled up front never reaches the transport.
        let result = client
            .request_buf_from(
                &token,
                payload,
                Subject::from("test.svc.silent"),
                HeaderMap::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(client.counters().msg_out, 1);
    }

    #[tokio::test]
    async fn test_allowlist_rejects_unknown_sender() {
        let transport = MemoryTransport::default();
        let stranger = SigningKey::from_bytes(&[7; 32]).verifying_key();
        let server = service(
            &transport,
            signed_options(1).with_known_public_keys([stranger]),
        );
        let client = service(&transport, signed_options(2));
        let (sender, mut receiver) = mpsc::channel(1);

        let _subscription = server
            .subscribe(
                move |delivery: Delivery<_, _>| {
                    let sender = sender.clone();
                    async move {
                        let _ = sender.send(delivery.decode::<Sum>()).await;
                    }
                },
                ["in"],
            )
            .await
            .unwrap();

        client.start().await.unwrap();
        client
            .publish_to(&Sum { a: 1, b: 1 }, Subject::from("test.svc.in"))
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::UnknownIdentity(_))));
        assert_eq!(server.counters().msg_in, 0);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_telemetry_report_and_ping() {
        let transport = MemoryTransport::default();
        let service = service(
            &transport,
            ServiceOptions {
                telemetry_period: Duration::from_millis(50),
                ..signed_options(1)
            },
        );
        let observer = service_observer(&transport);
        service.add_status_callback("custom", || {
            BTreeMap::from([
                ("answer".to_string(), json!(42)),
                ("uptime".to_string(), json!("overwritten")),
            ])
        });

        let (sender, mut receiver) = mpsc::channel(10);
        let _subscription = observer
            .subscribe_to(
                move |delivery: Delivery<_, _>| {
                    let sender = sender.clone();
                    async move {
                        let _ = sender.send(delivery.decode::<Telemetry>()).await;
                    }
                },
                &Subject::from("test.svc.telemetry"),
            )
            .await
            .unwrap();

        service.start().await.unwrap();

        let telemetry = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(telemetry.nonce, "1");
        assert_eq!(telemetry.status.get("answer"), Some(&json!(42)));
        assert!(telemetry.status.get("uptime").is_some_and(Value::is_f64));
        assert_eq!(telemetry.status.get("publish_queue_cap"), Some(&json!(1000)));

        let token = CancellationToken::new();
        let sent = unix_nanos();
        let pong: TelemetryPong = observer
            .request_from(
                &token,
                &TelemetryPing {
                    nonce: "abc".to_string(),
                    timestamp: sent.to_string(),
                },
                Subject::from("test.svc.telemetry.ping"),
            )
            .await
            .unwrap();
        assert_eq!(pong.nonce, "abc");
        assert!(pong.owl.parse::<i64>().unwrap() >= 0);

        service.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_ping_is_dropped() {
        let transport = MemoryTransport::default();
        let service = service(&transport, signed_options(1));
        let observer = service_observer(&transport);
        service.start().await.unwrap();

        let token = CancellationToken::new();
        let result = timeout(
            Duration::from_millis(100),
            observer.request_from::<_, TelemetryPong>(
                &token,
                &TelemetryPing {
                    nonce: "abc".to_string(),
                    timestamp: "yesterday".to_string(),
                },
                Subject::from("test.svc.telemetry.ping"),
            ),
        )
        .await;

        assert!(result.is_err());
        assert!(logs_contain("telemetry ping timestamp is not a number"));

        service.shutdown().await;
    }

    fn service_observer(transport: &MemoryTransport) -> Service<MemoryTransport, JsonCodec> {
        service(transport, signed_options(9))
    }
}
