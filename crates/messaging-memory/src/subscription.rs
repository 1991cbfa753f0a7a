use crate::transport::Inner;

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use busrpc_messaging::subject::Subject;
use busrpc_messaging::subscription::Subscription;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A subscription on the in-memory bus.
#[derive(Debug)]
pub struct MemorySubscription {
    id: Uuid,
    subject: Subject,
    inner: Arc<Inner>,
    shutdown_token: CancellationToken,
    closed: AtomicBool,
}

impl MemorySubscription {
    pub(crate) const fn new(
        id: Uuid,
        subject: Subject,
        inner: Arc<Inner>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            id,
            subject,
            inner,
            shutdown_token,
            closed: AtomicBool::new(false),
        }
    }

    /// Removes the route and stops the delivery task. Returns `false` if the
    /// subscription was already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.remove_route(&self.id);
        self.shutdown_token.cancel();
        true
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    type Error = Infallible;

    fn subject(&self) -> &Subject {
        &self.subject
    }

    async fn unsubscribe(&self) -> Result<(), Infallible> {
        if self.close() {
            self.inner.count_unsubscribe();
        }
        Ok(())
    }
}
