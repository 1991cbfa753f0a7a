use crate::context::Context;
use crate::derive::{derive_subject, extract_service_vars, split_and_parametrize_tokens};
use crate::descriptor::{DescriptorRegistry, MethodDescriptor, MethodKind, ServiceDescriptor};
use crate::error::Error;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use busrpc_messaging::HeaderMap;
use busrpc_messaging::codec::Codec;
use busrpc_messaging::subject::Subject;
use busrpc_messaging::subscription::Subscription;
use busrpc_messaging::transport::Transport;
use busrpc_service::{Delivery, HandlerError, Service};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

type UnaryHandler<T, C> = Arc<
    dyn Fn(Context, Delivery<T, C>) -> BoxFuture<'static, Result<Bytes, HandlerError>>
        + Send
        + Sync,
>;

type StreamHandler<T, C> =
    Arc<dyn Fn(ServerStream<T, C>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

enum MethodHandler<T, C>
where
    T: Transport,
    C: Codec,
{
    Unary(UnaryHandler<T, C>),
    Stream(MethodKind, StreamHandler<T, C>),
}

impl<T, C> Clone for MethodHandler<T, C>
where
    T: Transport,
    C: Codec,
{
    fn clone(&self) -> Self {
        match self {
            Self::Unary(handler) => Self::Unary(Arc::clone(handler)),
            Self::Stream(kind, handler) => Self::Stream(*kind, Arc::clone(handler)),
        }
    }
}

impl<T, C> MethodHandler<T, C>
where
    T: Transport,
    C: Codec,
{
    const fn kind(&self) -> MethodKind {
        match self {
            Self::Unary(_) => MethodKind::Unary,
            Self::Stream(kind, _) => *kind,
        }
    }
}

/// The handlers implementing one service. Each handler is a closure that
/// typically captures the implementation behind an `Arc`.
pub struct ServiceDefinition<T, C>
where
    T: Transport,
    C: Codec,
{
    full_name: String,
    handlers: BTreeMap<String, MethodHandler<T, C>>,
}

impl<T, C> Debug for ServiceDefinition<T, C>
where
    T: Transport,
    C: Codec,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("full_name", &self.full_name)
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T, C> ServiceDefinition<T, C>
where
    T: Transport,
    C: Codec,
{
    /// A definition for the service registered as `full_name`.
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Service full name.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Adds a unary method.
    #[must_use]
    pub fn unary<Req, Resp, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let handler: UnaryHandler<T, C> =
            Arc::new(move |ctx: Context, delivery: Delivery<T, C>| {
                let handler = Arc::clone(&handler);
                async move {
                    let request: Req = delivery.decode()?;
                    let response = handler(ctx, request).await?;
                    Ok::<_, HandlerError>(delivery.service().encode(&response)?)
                }
                .boxed()
            });

        self.handlers
            .insert(method.into(), MethodHandler::Unary(handler));
        self
    }

    /// Adds a server-streaming method. The handler receives the decoded
    /// request and the stream to send replies on.
    #[must_use]
    pub fn server_streaming<Req, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req, ServerStream<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let handler: StreamHandler<T, C> = Arc::new(move |mut stream: ServerStream<T, C>| {
            let handler = Arc::clone(&handler);
            async move {
                let Some(request) = stream.recv::<Req>()? else {
                    return Err(HandlerError::from("missing request"));
                };
                handler(request, stream).await
            }
            .boxed()
        });

        self.handlers.insert(
            method.into(),
            MethodHandler::Stream(MethodKind::ServerStreaming, handler),
        );
        self
    }

    /// Adds a bidirectional streaming method.
    #[must_use]
    pub fn bidi_streaming<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ServerStream<T, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: StreamHandler<T, C> =
            Arc::new(move |stream: ServerStream<T, C>| handler(stream).boxed());

        self.handlers.insert(
            method.into(),
            MethodHandler::Stream(MethodKind::BidiStreaming, handler),
        );
        self
    }
}

/// Server side of a streaming call, bound to the inbound envelope.
///
/// Every [`ServerStream::send`] replies to the envelope's reply subject, so
/// all responses land on the caller's inbox. [`ServerStream::recv`] decodes
/// the inbound envelope once and then reports end of stream.
pub struct ServerStream<T, C>
where
    T: Transport,
    C: Codec,
{
    delivery: Delivery<T, C>,
    context: Context,
    headers: HeaderMap,
    received: bool,
}

impl<T, C> Debug for ServerStream<T, C>
where
    T: Transport,
    C: Codec,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStream")
            .field("subject", self.delivery.subject())
            .field("headers", &self.headers)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl<T, C> ServerStream<T, C>
where
    T: Transport,
    C: Codec,
{
    fn new(delivery: Delivery<T, C>, context: Context) -> Self {
        Self {
            delivery,
            context,
            headers: HeaderMap::new(),
            received: false,
        }
    }

    /// Call context carrying the inbound subject and headers.
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Sends one response to the caller.
    ///
    /// # Errors
    /// Returns an error if encoding fails, the caller left no reply subject,
    /// or publishing fails.
    pub async fn send<M>(&self, message: &M) -> Result<(), Error>
    where
        M: Serialize + Sync + ?Sized,
    {
        let payload = self.delivery.service().encode(message)?;
        self.delivery
            .respond_with_headers(payload, self.headers.clone())
            .await?;
        Ok(())
    }

    /// Decodes the inbound request. Returns `None` once it was consumed.
    ///
    /// # Errors
    /// Returns a verification or decode error.
    pub fn recv<M>(&mut self) -> Result<Option<M>, Error>
    where
        M: DeserializeOwned,
    {
        if self.received {
            return Ok(None);
        }

        self.received = true;
        Ok(Some(self.delivery.decode()?))
    }

    /// Sets headers merged into every subsequent response.
    pub fn set_header(&mut self, headers: &HeaderMap) {
        self.headers.merge(headers);
    }

    /// Same as [`ServerStream::set_header`]; there is no separate header frame.
    pub fn send_header(&mut self, headers: &HeaderMap) {
        self.set_header(headers);
    }

    /// Trailers are not carried by the bus.
    pub const fn set_trailer(&mut self, _trailer: &HeaderMap) {}
}

struct Binding<T, C>
where
    T: Transport,
    C: Codec,
{
    descriptor: Arc<ServiceDescriptor>,
    method: MethodDescriptor,
    handler: Option<MethodHandler<T, C>>,
}

/// Binds registered service definitions to their derived subjects.
pub struct ServiceRegistrar<T, C>
where
    T: Transport,
    C: Codec,
{
    service: Service<T, C>,
    registry: Arc<DescriptorRegistry>,
    prefix: String,
    vars: Option<HashMap<String, String>>,
    definitions: Mutex<BTreeMap<String, ServiceDefinition<T, C>>>,
    subscriptions: Arc<Mutex<Vec<T::Subscription>>>,
    started: AtomicBool,
}

impl<T, C> Debug for ServiceRegistrar<T, C>
where
    T: Transport,
    C: Codec,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistrar")
            .field("service", &self.service)
            .field("prefix", &self.prefix)
            .field("services", &self.definitions.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<T, C> ServiceRegistrar<T, C>
where
    T: Transport,
    C: Codec,
{
    /// A registrar serving under `{prefix}.{name}` of `service`.
    pub fn new(service: Service<T, C>, registry: Arc<DescriptorRegistry>) -> Self {
        Self {
            service,
            registry,
            prefix: String::new(),
            vars: None,
            definitions: Mutex::new(BTreeMap::new()),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            started: AtomicBool::new(false),
        }
    }

    /// Extra tokens inserted between the service subject and the derived
    /// method tokens.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Values for `{name}` variables in derived subjects.
    #[must_use]
    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = Some(vars);
        self
    }

    /// Registers the handlers of one service.
    ///
    /// # Panics
    /// On a duplicate registration, when the registry has no descriptor for
    /// the service, when a handler does not match a described method, or
    /// when a callable method has no handler.
    pub fn register_service(&self, definition: ServiceDefinition<T, C>) {
        let mut definitions = self.definitions.lock();
        let full_name = definition.full_name.clone();

        assert!(
            !definitions.contains_key(&full_name),
            "duplicate service registration for {full_name:?}"
        );

        let Some(descriptor) = self.registry.service(&full_name) else {
            panic!("no descriptor registered for {full_name:?}");
        };

        for (name, handler) in &definition.handlers {
            let Some(method) = descriptor.method(name) else {
                panic!("{full_name:?} has no method {name:?}");
            };
            assert!(
                method.kind() == handler.kind(),
                "{full_name}.{name} is {:?}, handler is {:?}",
                method.kind(),
                handler.kind()
            );
        }

        for method in descriptor.methods() {
            assert!(
                method.skip_inputs() || definition.handlers.contains_key(method.name()),
                "{full_name}.{} has no handler",
                method.name()
            );
        }

        definitions.insert(full_name, definition);
    }

    /// Subscribes every callable method. Subscriptions are dropped when
    /// `ctx` or the service is cancelled, or on [`ServiceRegistrar::stop`].
    ///
    /// # Errors
    /// `AlreadyStarted` on a second call, derivation errors, and transport
    /// errors from subscribing.
    pub async fn start(&self, ctx: &Context) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        for binding in self.bindings() {
            let tokens = derive_subject(&self.prefix, &binding.descriptor, &binding.method)?;
            let vars = extract_service_vars(binding.descriptor.full_name(), self.vars.as_ref());
            let tokens = split_and_parametrize_tokens(&tokens, vars.as_ref());
            let subject = self.service.subject(&tokens);

            debug!(
                service = binding.descriptor.full_name(),
                method = binding.method.name(),
                subject = %subject,
                "binding method"
            );

            let Some(handler) = binding.handler else {
                continue;
            };
            if binding.method.skip_inputs() {
                continue;
            }

            let label = format!("{}.{}", binding.descriptor.full_name(), binding.method.name());
            let subscription = match handler {
                MethodHandler::Unary(handler) => {
                    self.serve_unary(ctx, label, handler, &subject).await?
                }
                MethodHandler::Stream(_, handler) => {
                    self.serve_stream(ctx, label, handler, &subject).await?
                }
            };
            self.subscriptions.lock().push(subscription);
        }

        let token = ctx.token().clone();
        let shutdown_token = self.service.shutdown_token().clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = shutdown_token.cancelled() => {}
            }
            unsubscribe_all(&subscriptions).await;
        });

        Ok(())
    }

    /// Drops every subscription made by [`ServiceRegistrar::start`].
    pub async fn stop(&self) {
        unsubscribe_all(&self.subscriptions).await;
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    fn bindings(&self) -> Vec<Binding<T, C>> {
        let definitions = self.definitions.lock();
        let mut bindings = Vec::new();

        for definition in definitions.values() {
            let Some(descriptor) = self.registry.service(&definition.full_name) else {
                continue;
            };
            for method in descriptor.methods() {
                bindings.push(Binding {
                    descriptor: Arc::clone(descriptor),
                    method: method.clone(),
                    handler: definition.handlers.get(method.name()).cloned(),
                });
            }
        }

        bindings
    }

    async fn serve_unary(
        &self,
        ctx: &Context,
        label: String,
        handler: UnaryHandler<T, C>,
        subject: &Subject,
    ) -> Result<T::Subscription, Error> {
        let parent = ctx.clone();
        let subscription = self
            .service
            .serve_buf(
                move |delivery: Delivery<T, C>| {
                    let ctx = parent
                        .child()
                        .with_envelope(delivery.subject().clone(), delivery.headers().clone());
                    let call = handler(ctx, delivery);
                    let label = label.clone();
                    async move {
                        call.await
                            .map_err(|e| HandlerError::from(format!("{label}: {e}")))
                    }
                },
                subject,
            )
            .await?;
        Ok(subscription)
    }

    async fn serve_stream(
        &self,
        ctx: &Context,
        label: String,
        handler: StreamHandler<T, C>,
        subject: &Subject,
    ) -> Result<T::Subscription, Error> {
        let parent = ctx.clone();
        let subscription = self
            .service
            .subscribe_to(
                move |delivery: Delivery<T, C>| {
                    let ctx = parent
                        .child()
                        .with_envelope(delivery.subject().clone(), delivery.headers().clone());
                    let call = handler(ServerStream::new(delivery.clone(), ctx));
                    let label = label.clone();
                    async move {
                        match call.await {
                            Ok(()) => delivery.ack().await,
                            Err(e) => {
                                debug!(subject = %delivery.subject(), "{label}: {e}");
                                let message = format!("{label}: {e}");
                                if delivery.reply().is_some()
                                    && let Err(e) = delivery.respond_error(message).await
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
            .await?;
        Ok(subscription)
    }
}

async fn unsubscribe_all<S>(subscriptions: &Mutex<Vec<S>>)
where
    S: Subscription,
{
    let drained = std::mem::take(&mut *subscriptions.lock());
    for subscription in drained {
        if let Err(e) = subscription.unsubscribe().await {
            warn!(subject = %subscription.subject(), "failed to unsubscribe: {e}");
        }
    }
}
