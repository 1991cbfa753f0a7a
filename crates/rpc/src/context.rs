use crate::error::Error;

use std::future::pending;
use std::time::Duration;

use busrpc_messaging::HeaderMap;
use busrpc_messaging::subject::Subject;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Call context: a node in the cancellation tree with an optional deadline.
///
/// On the client side the headers are sent with the request. On the server
/// side the context carries the subject and headers of the inbound envelope.
#[derive(Clone, Debug)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    subject: Option<Subject>,
    headers: HeaderMap,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context that is never cancelled on its own.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// A context driven by `token`.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            subject: None,
            headers: HeaderMap::new(),
        }
    }

    /// A child context. Cancelling the child leaves the parent untouched.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            subject: self.subject.clone(),
            headers: self.headers.clone(),
        }
    }

    /// A child context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child context that expires at `deadline`, or earlier if the parent
    /// does.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(self.deadline.map_or(deadline, |own| own.min(deadline)));
        child
    }

    /// Adds a header to send with the call.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub(crate) fn with_envelope(mut self, subject: Subject, headers: HeaderMap) -> Self {
        self.subject = Some(subject);
        self.headers = headers;
        self
    }

    /// Cancels this context and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The underlying token.
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The deadline, if any.
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Subject of the inbound envelope.
    pub const fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    /// Headers of the inbound envelope, or headers to send.
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Why the context is done, if it is.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            Some(Error::Cancelled)
        } else if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            Some(Error::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        let expired = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Error::Cancelled,
            () = expired => Error::DeadlineExceeded,
        }
    }
}
