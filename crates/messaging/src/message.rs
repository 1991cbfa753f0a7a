use crate::headers::HeaderMap;
use crate::subject::Subject;

use bytes::Bytes;

/// The envelope that crosses the bus boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: Subject,

    /// Subject replies should be addressed to.
    pub reply: Option<Subject>,

    /// Encoded payload.
    pub payload: Bytes,

    /// Envelope headers.
    pub headers: HeaderMap,
}

impl Message {
    /// Creates a message without reply subject or headers.
    pub fn new(subject: Subject, payload: impl Into<Bytes>) -> Self {
        Self {
            subject,
            reply: None,
            payload: payload.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Sets the reply subject.
    #[must_use]
    pub fn with_reply(mut self, reply: Subject) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Replaces the headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
