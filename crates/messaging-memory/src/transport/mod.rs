mod error;

use crate::subscription::MemorySubscription;
pub use error::Error;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use busrpc_messaging::Message;
use busrpc_messaging::subject::Subject;
use busrpc_messaging::subscription_handler::SubscriptionHandler;
use busrpc_messaging::transport::Transport;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Options for the in-memory transport.
#[derive(Clone, Copy, Debug)]
pub struct MemoryTransportOptions {
    /// Capacity of each subscription's delivery queue.
    pub channel_capacity: usize,
}

impl Default for MemoryTransportOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Snapshot of bus interactions made through a transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Calls to `publish`.
    pub published: u64,

    /// Calls to `subscribe` and `queue_subscribe`.
    pub subscribed: u64,

    /// Effective `unsubscribe` calls.
    pub unsubscribed: u64,

    /// Calls to `request`.
    pub requests: u64,
}

impl MemoryStats {
    /// Sum of every counted interaction.
    #[must_use]
    pub const fn interactions(&self) -> u64 {
        self.published + self.subscribed + self.unsubscribed + self.requests
    }
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    subscribed: AtomicU64,
    unsubscribed: AtomicU64,
    requests: AtomicU64,
}

#[derive(Debug)]
struct Route {
    pattern: Subject,
    queue_group: Option<String>,
    sender: mpsc::Sender<Message>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    options: MemoryTransportOptions,
    routes: RwLock<BTreeMap<Uuid, Route>>,
    queue_cursor: AtomicUsize,
    counters: Counters,
}

impl Inner {
    pub(crate) fn remove_route(&self, id: &Uuid) -> bool {
        self.routes.write().remove(id).is_some()
    }

    pub(crate) fn count_unsubscribe(&self) {
        self.counters.unsubscribed.fetch_add(1, Ordering::Relaxed);
    }

    fn matching_senders(&self, subject: &Subject) -> Vec<mpsc::Sender<Message>> {
        let routes = self.routes.read();
        let mut senders = Vec::new();
        let mut groups: BTreeMap<&str, Vec<&mpsc::Sender<Message>>> = BTreeMap::new();

        for route in routes.values().filter(|route| route.pattern.matches(subject)) {
            match route.queue_group.as_deref() {
                None => senders.push(route.sender.clone()),
                Some(group) => groups.entry(group).or_default().push(&route.sender),
            }
        }

        for members in groups.into_values() {
            let pick = self.queue_cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            senders.push(members[pick].clone());
        }

        senders
    }
}

/// A process-local bus. Clones share the same routing table.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(MemoryTransportOptions::default())
    }
}

impl MemoryTransport {
    /// Creates a new in-memory transport.
    #[must_use]
    pub fn new(options: MemoryTransportOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                routes: RwLock::new(BTreeMap::new()),
                queue_cursor: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Interactions made so far.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let counters = &self.inner.counters;
        MemoryStats {
            published: counters.published.load(Ordering::Relaxed),
            subscribed: counters.subscribed.load(Ordering::Relaxed),
            unsubscribed: counters.unsubscribed.load(Ordering::Relaxed),
            requests: counters.requests.load(Ordering::Relaxed),
        }
    }

    /// Number of live subscriptions, including request inboxes.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner.routes.read().len()
    }

    async fn deliver(&self, message: Message) -> usize {
        let mut delivered = 0;
        for sender in self.inner.matching_senders(&message.subject) {
            if sender.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn check_publishable(subject: &Subject) -> Result<(), Error> {
        subject.validate()?;
        if subject.is_wildcard() {
            return Err(Error::WildcardPublish(subject.clone()));
        }
        Ok(())
    }

    fn add_route<X>(
        &self,
        subject: &Subject,
        queue_group: Option<&str>,
        handler: X,
    ) -> Result<MemorySubscription, Error>
    where
        X: SubscriptionHandler,
    {
        subject.validate()?;

        let id = Uuid::new_v4();
        let (sender, mut receiver) = mpsc::channel(self.inner.options.channel_capacity.max(1));
        let shutdown_token = CancellationToken::new();

        self.inner.routes.write().insert(
            id,
            Route {
                pattern: subject.clone(),
                queue_group: queue_group.map(ToString::to_string),
                sender,
            },
        );

        let token = shutdown_token.clone();
        let pattern = subject.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    message = receiver.recv() => {
                        let Some(message) = message else {
                            break;
                        };
                        if let Err(e) = handler.handle(message).await {
                            debug!(subject = %pattern, "subscription handler failed: {e}");
                        }
                    }
                }
            }
        });

        Ok(MemorySubscription::new(
            id,
            subject.clone(),
            Arc::clone(&self.inner),
            shutdown_token,
        ))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Error = Error;
    type Subscription = MemorySubscription;

    async fn publish(&self, message: Message) -> Result<(), Error> {
        Self::check_publishable(&message.subject)?;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.deliver(message).await;
        Ok(())
    }

    async fn subscribe<X>(&self, subject: &Subject, handler: X) -> Result<MemorySubscription, Error>
    where
        X: SubscriptionHandler,
    {
        let subscription = self.add_route(subject, None, handler)?;
        self.inner.counters.subscribed.fetch_add(1, Ordering::Relaxed);
        Ok(subscription)
    }

    async fn queue_subscribe<X>(
        &self,
        subject: &Subject,
        queue_group: &str,
        handler: X,
    ) -> Result<MemorySubscription, Error>
    where
        X: SubscriptionHandler,
    {
        let subscription = self.add_route(subject, Some(queue_group), handler)?;
        self.inner.counters.subscribed.fetch_add(1, Ordering::Relaxed);
        Ok(subscription)
    }

    async fn request(&self, message: Message) -> Result<Message, Error> {
        Self::check_publishable(&message.subject)?;
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        let inbox = self.new_inbox();
        let (reply_sender, reply_receiver) = oneshot::channel();
        let handler = ReplyHandler {
            sender: Arc::new(Mutex::new(Some(reply_sender))),
        };
        let _inbox = InboxGuard(self.add_route(&inbox, None, handler)?);

        let subject = message.subject.clone();
        if self.deliver(message.with_reply(inbox)).await == 0 {
            return Err(Error::NoResponders(subject));
        }

        reply_receiver.await.map_err(|_| Error::RequestAborted)
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct ReplyHandler {
    sender: Arc<Mutex<Option<oneshot::Sender<Message>>>>,
}

#[async_trait]
impl SubscriptionHandler for ReplyHandler {
    type Error = Infallible;

    async fn handle(&self, message: Message) -> Result<(), Infallible> {
        let sender = self.sender.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(message);
        }
        Ok(())
    }
}

// Removes the request inbox even when the request future is dropped.
struct InboxGuard(MemorySubscription);

impl Drop for InboxGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}
