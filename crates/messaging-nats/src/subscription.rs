use std::convert::Infallible;

use async_trait::async_trait;
use busrpc_messaging::subject::Subject;
use busrpc_messaging::subscription::Subscription;
use tokio_util::sync::CancellationToken;

/// A NATS-based subscription. Delivery runs on a background task that is
/// stopped by `unsubscribe`.
#[derive(Debug)]
pub struct NatsSubscription {
    subject: Subject,
    shutdown_token: CancellationToken,
}

impl NatsSubscription {
    pub(crate) const fn new(subject: Subject, shutdown_token: CancellationToken) -> Self {
        Self {
            subject,
            shutdown_token,
        }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    type Error = Infallible;

    fn subject(&self) -> &Subject {
        &self.subject
    }

    async fn unsubscribe(&self) -> Result<(), Infallible> {
        self.shutdown_token.cancel();
        Ok(())
    }
}
