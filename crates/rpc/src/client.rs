use crate::context::Context;
use crate::derive::{derive_subject, extract_service_vars, split_and_parametrize_tokens};
use crate::descriptor::DescriptorRegistry;
use crate::error::Error;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use busrpc_messaging::codec::Codec;
use busrpc_messaging::subject::Subject;
use busrpc_messaging::subscription::Subscription;
use busrpc_messaging::transport::Transport;
use busrpc_messaging::{HeaderMap, Message};
use busrpc_service::{Delivery, Service};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Client side of the bus: resolves method paths to subjects under a remote
/// prefix and issues calls.
pub struct ClientConn<T, C>
where
    T: Transport,
    C: Codec,
{
    service: Service<T, C>,
    registry: Arc<DescriptorRegistry>,
    prefix: String,
    vars: Option<HashMap<String, String>>,
}

impl<T, C> Clone for ClientConn<T, C>
where
    T: Transport,
    C: Codec,
{
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            registry: Arc::clone(&self.registry),
            prefix: self.prefix.clone(),
            vars: self.vars.clone(),
        }
    }
}

impl<T, C> Debug for ClientConn<T, C>
where
    T: Transport,
    C: Codec,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("service", &self.service)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<T, C> ClientConn<T, C>
where
    T: Transport,
    C: Codec,
{
    /// A connection to services published under `remote_prefix`, usually
    /// the remote `{prefix}.{name}`.
    pub fn new(
        service: Service<T, C>,
        registry: Arc<DescriptorRegistry>,
        remote_prefix: impl Into<String>,
    ) -> Self {
        Self {
            service,
            registry,
            prefix: remote_prefix.into(),
            vars: None,
        }
    }

    /// Values for `{name}` variables in derived subjects.
    #[must_use]
    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = Some(vars);
        self
    }

    /// The local service making the calls.
    pub const fn service(&self) -> &Service<T, C> {
        &self.service
    }

    /// Resolves `/{service}/{method}` to the subject it is served on.
    ///
    /// # Errors
    /// Derivation errors, `CallingDisabled` for write-only methods and
    /// `InvalidSubject` when a variable is left unbound.
    pub fn subject_for(&self, method: &str) -> Result<Subject, Error> {
        let (service, descriptor) = self.registry.resolve(method)?;

        let tokens = derive_subject(&self.prefix, service, descriptor)?;
        let vars = extract_service_vars(service.full_name(), self.vars.as_ref());
        let subject = Subject::join(split_and_parametrize_tokens(&tokens, vars.as_ref()));

        debug!(
            service = service.full_name(),
            method = descriptor.name(),
            subject = %subject,
            "resolved method"
        );

        if descriptor.skip_inputs() {
            return Err(Error::CallingDisabled {
                service: service.full_name().to_string(),
                method: descriptor.name().to_string(),
            });
        }
        if subject.is_wildcard() {
            return Err(Error::InvalidSubject(subject.to_string()));
        }

        Ok(subject)
    }

    /// Unary call. Headers of `ctx` travel with the request.
    ///
    /// # Errors
    /// Derivation errors before any I/O; `Cancelled` or `DeadlineExceeded`
    /// from `ctx`; `Remote` when the handler failed; transport, verification
    /// and decode errors otherwise.
    pub async fn invoke<Req, Resp>(
        &self,
        ctx: &Context,
        method: &str,
        request: &Req,
    ) -> Result<Resp, Error>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let subject = self.subject_for(method)?;
        if let Some(error) = ctx.err() {
            return Err(error);
        }

        let payload = self.service.encode(request)?;
        let reply = tokio::select! {
            biased;
            error = ctx.done() => return Err(error),
            reply = self.service.request_buf_from(
                ctx.token(),
                payload,
                subject,
                ctx.headers().clone(),
            ) => reply?,
        };

        Ok(self.service.unmarshal(&reply)?)
    }

    /// Opens a stream. Nothing touches the bus until the first
    /// [`ClientStream::send_msg`] or [`ClientStream::listen`]. Requests go
    /// through the publish queue, so the local service must be started for
    /// `send_msg` to succeed.
    ///
    /// # Errors
    /// Derivation errors, `CallingDisabled` for write-only methods.
    pub fn new_stream(&self, ctx: &Context, method: &str) -> Result<ClientStream<T, C>, Error> {
        let subject = self.subject_for(method)?;
        Ok(ClientStream::new(self.service.clone(), ctx.child(), subject))
    }
}

/// Client side of a streaming call.
///
/// All responses arrive on a private reply subject and are queued in
/// receipt order. Every method takes `&self`, so the stream can be shared
/// with the task that closes it.
pub struct ClientStream<T, C>
where
    T: Transport,
    C: Codec,
{
    service: Service<T, C>,
    context: Context,
    subject: Subject,
    reply_subject: Subject,
    sender: mpsc::Sender<Message>,
    receiver: Mutex<mpsc::Receiver<Message>>,
    subscription: Mutex<Option<T::Subscription>>,
    closed: CancellationToken,
    send_closed: AtomicBool,
    torn_down: AtomicBool,
}

impl<T, C> Debug for ClientStream<T, C>
where
    T: Transport,
    C: Codec,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("subject", &self.subject)
            .field("reply_subject", &self.reply_subject)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T, C> ClientStream<T, C>
where
    T: Transport,
    C: Codec,
{
    fn new(service: Service<T, C>, context: Context, subject: Subject) -> Self {
        let (sender, receiver) = mpsc::channel(service.options().subscribe_queue_size);
        let reply_subject = service.new_inbox();

        Self {
            service,
            context,
            subject,
            reply_subject,
            sender,
            receiver: Mutex::new(receiver),
            subscription: Mutex::new(None),
            closed: CancellationToken::new(),
            send_closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Subject requests are published to.
    pub const fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Private subject responses arrive on.
    pub const fn reply_subject(&self) -> &Subject {
        &self.reply_subject
    }

    /// The stream's context, a child of the one it was opened with.
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Queues a request addressed to the stream's subject, listening on the
    /// reply subject first. The request is published by the local service's
    /// background loop.
    ///
    /// # Errors
    /// `SendClosed` after [`ClientStream::close_send`], `StreamClosed` after
    /// [`ClientStream::close`], `NotStarted` when the local service was never
    /// started, context errors and transport errors.
    pub async fn send_msg<M>(&self, message: &M) -> Result<(), Error>
    where
        M: Serialize + Sync + ?Sized,
    {
        self.check_send()?;
        if !self.service.is_started() {
            return Err(Error::NotStarted);
        }
        self.subscribe().await?;

        let payload = self.service.encode(message)?;
        let envelope = self.service.make_message(
            self.subject.clone(),
            Some(self.reply_subject.clone()),
            payload,
            self.context.headers().clone(),
        );
        self.service.enqueue(envelope).await?;
        Ok(())
    }

    /// Listens on the reply subject without publishing anything. Hand
    /// [`ClientStream::reply_subject`] to the producer out of band.
    ///
    /// # Errors
    /// Same as [`ClientStream::send_msg`], minus encoding.
    pub async fn listen(&self) -> Result<(), Error> {
        self.check_send()?;
        self.subscribe().await
    }

    /// Waits for the next response.
    ///
    /// # Errors
    /// `StreamClosed` once closed, `Cancelled` or `DeadlineExceeded` from the
    /// context, verification, decode and `Remote` errors for the envelope.
    pub async fn recv_msg<M>(&self) -> Result<M, Error>
    where
        M: DeserializeOwned,
    {
        if self.closed.is_cancelled() {
            return Err(Error::StreamClosed);
        }

        let message = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(Error::StreamClosed),
            error = self.context.done() => return Err(error),
            message = async { self.receiver.lock().await.recv().await } => {
                message.ok_or(Error::StreamClosed)?
            }
        };

        Ok(self.service.unmarshal(&message)?)
    }

    /// Closes the sending half. Receiving keeps working.
    pub fn close_send(&self) {
        self.send_closed.store(true, Ordering::Release);
    }

    /// Tears the stream down: stops listening and fails pending and future
    /// calls with `StreamClosed`. Only the first call has an effect.
    pub async fn close(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.send_closed.store(true, Ordering::Release);
        self.closed.cancel();
        self.context.cancel();

        let subscription = self.subscription.lock().await.take();
        if let Some(subscription) = subscription
            && let Err(e) = subscription.unsubscribe().await
        {
            warn!(subject = %self.reply_subject, "failed to unsubscribe: {e}");
        }
    }

    /// Response headers are not carried separately; always empty.
    pub fn header(&self) -> HeaderMap {
        HeaderMap::new()
    }

    /// Trailers are not carried by the bus; always empty.
    pub fn trailer(&self) -> HeaderMap {
        HeaderMap::new()
    }

    fn check_send(&self) -> Result<(), Error> {
        if self.send_closed.load(Ordering::Acquire) {
            return Err(Error::SendClosed);
        }
        self.context.err().map_or(Ok(()), Err)
    }

    async fn subscribe(&self) -> Result<(), Error> {
        let mut subscription = self.subscription.lock().await;
        if self.closed.is_cancelled() {
            return Err(Error::StreamClosed);
        }
        if subscription.is_some() {
            return Ok(());
        }

        let sender = self.sender.clone();
        let closed = self.closed.clone();
        let handle = self
            .service
            .subscribe_to(
                move |delivery: Delivery<T, C>| {
                    let sender = sender.clone();
                    let closed = closed.clone();
                    async move {
                        tokio::select! {
                            biased;
                            () = closed.cancelled() => {}
                            result = sender.send(delivery.message().clone()) => {
                                if result.is_err() {
                                    debug!(subject = %delivery.subject(), "stream receiver gone");
                                }
                            }
                        }
                    }
                },
                &self.reply_subject,
            )
            .await?;

        *subscription = Some(handle);
        Ok(())
    }
}

impl<T, C> Drop for ClientStream<T, C>
where
    T: Transport,
    C: Codec,
{
    fn drop(&mut self) {
        self.closed.cancel();

        let Some(subscription) = self.subscription.get_mut().take() else {
            return;
        };
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = subscription.unsubscribe().await {
                    debug!(subject = %subscription.subject(), "failed to unsubscribe: {e}");
                }
            });
        }
    }
}
