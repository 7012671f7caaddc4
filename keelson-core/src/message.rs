//! Outbound/inbound message representation.
//!
//! The core moves two shapes of message: refcounted byte payloads
//! ([`bytes::Bytes`], the common case) and opaque transport-specific objects
//! (file regions, accepted child channels, ...). Opaque messages pass through
//! the core untouched; only the owning transport knows how to write them.
//!
//! Every message that enters the core is either handed to the transport or
//! released through [`dispose`] on the failure path. With refcounted
//! payloads, disposal is a refcount decrement; for opaque messages it runs
//! the boxed value's destructor.

use std::any::Any;
use std::fmt;

use bytes::Bytes;
use tracing::trace;

/// A message travelling through a channel.
pub enum Message {
    /// Raw payload bytes.
    Bytes(Bytes),
    /// Transport-specific message. The concrete transport downcasts it in
    /// `filter_outbound_message` / `do_write_now`.
    Other(Box<dyn Any + Send>),
}

impl Message {
    /// Borrow the byte payload, if this is a byte message.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Message::Bytes(b) => Some(b),
            Message::Other(_) => None,
        }
    }

    /// Take the byte payload, if this is a byte message.
    pub fn into_bytes(self) -> Result<Bytes, Message> {
        match self {
            Message::Bytes(b) => Ok(b),
            other => Err(other),
        }
    }

    /// Wrap an opaque transport-specific value.
    pub fn other(value: impl Any + Send) -> Self {
        Message::Other(Box::new(value))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Bytes(b)
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Message {
    fn from(s: &'static [u8]) -> Self {
        Message::Bytes(Bytes::from_static(s))
    }
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self {
        Message::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Message::Other(_) => f.write_str("Other(..)"),
        }
    }
}

/// Release a message that will never reach the transport.
pub fn dispose(msg: Message) {
    trace!(?msg, "disposing message");
    drop(msg);
}

/// Estimates the size of outbound messages for pending-byte accounting.
///
/// A negative estimate is clamped to zero by the core.
pub trait MessageSizeEstimator: Send + Sync {
    fn size_of(&self, msg: &Message) -> isize;
}

/// Default estimator: byte payloads count their length, opaque messages a
/// fixed guess.
#[derive(Debug, Clone, Copy)]
pub struct DefaultMessageSizeEstimator {
    unknown_size: isize,
}

impl DefaultMessageSizeEstimator {
    pub const DEFAULT_UNKNOWN_SIZE: isize = 8;

    #[must_use]
    pub const fn new(unknown_size: isize) -> Self {
        Self { unknown_size }
    }
}

impl Default for DefaultMessageSizeEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_UNKNOWN_SIZE)
    }
}

impl MessageSizeEstimator for DefaultMessageSizeEstimator {
    fn size_of(&self, msg: &Message) -> isize {
        match msg {
            Message::Bytes(b) => b.len() as isize,
            Message::Other(_) => self.unknown_size,
        }
    }
}
