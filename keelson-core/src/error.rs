/// Keelson Error Types
///
/// Comprehensive error handling for all channel operations.
///
/// Every failure surfaces on an operation promise rather than being thrown
/// back at the caller, so the error type is cheaply cloneable: one completion
/// may be observed by several listeners.

use std::io;
use thiserror::Error;

use crate::endpoint::Endpoint;

/// Main error type for channel operations
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// The channel is closed, or was closed before the operation ran.
    ///
    /// Carries the initial close cause as contributing context when the
    /// close was triggered by an earlier failure.
    #[error("channel closed")]
    Closed {
        #[source]
        cause: Option<Box<ChannelError>>,
    },

    /// Write attempted after the outbound side was shut down
    #[error("channel output shutdown")]
    OutputShutdown,

    /// Operation requires an active channel
    #[error("channel not yet connected")]
    NotYetConnected,

    /// Duplicate connect on an already-connected channel
    #[error("channel already connected")]
    AlreadyConnected,

    /// Duplicate connect while another connect is pending
    #[error("a connect attempt is already pending")]
    ConnectionPending,

    /// Register on a channel that is already registered
    #[error("channel already registered to an event loop")]
    AlreadyRegistered,

    /// Operation before the channel was registered
    #[error("channel not registered to an event loop")]
    NotRegistered,

    /// Connect timer fired before the transport completed the connect
    #[error("connect timed out: {addr}")]
    ConnectTimeout { addr: String },

    /// Address could not be resolved
    #[error("failed to resolve address: {addr}")]
    Unresolved { addr: String },

    /// Connect refused by the remote endpoint
    #[error("connection refused: {addr}")]
    ConnectionRefused { addr: String },

    /// No route to the remote endpoint
    #[error("no route to host: {addr}")]
    NoRouteToHost { addr: String },

    /// Generic transport failure
    #[error("{message}")]
    Io { kind: io::ErrorKind, message: String },

    /// Option not recognized by the channel or its transport
    #[error("unsupported channel option: {name}")]
    UnsupportedOption { name: String },

    /// Promise cancelled before completion
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias for channel operations
pub type Result<T, E = ChannelError> = std::result::Result<T, E>;

impl ChannelError {
    /// A plain closed-channel error with no contributing cause.
    #[must_use]
    pub const fn closed() -> Self {
        Self::Closed { cause: None }
    }

    /// A closed-channel error carrying the failure that initiated the close.
    #[must_use]
    pub fn closed_with(cause: Option<ChannelError>) -> Self {
        Self::Closed {
            cause: cause.map(Box::new),
        }
    }

    /// Create an unsupported-option error.
    pub fn unsupported_option(name: impl Into<String>) -> Self {
        Self::UnsupportedOption { name: name.into() }
    }

    /// Check if this error is transient (retrying the operation may succeed).
    ///
    /// Transient read failures do not tear the channel down; see the read
    /// loop's error classification.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Io { kind, .. } => matches!(
                kind,
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Check if this error originated from transport I/O.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Check if this is a connect-phase error annotated with a remote address.
    #[must_use]
    pub const fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::NoRouteToHost { .. }
                | Self::ConnectTimeout { .. }
                | Self::Unresolved { .. }
        )
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Wrap a connect-time I/O error so the message carries the remote address.
///
/// The refused / no-route / timeout kinds get a dedicated variant; anything
/// else stays a generic I/O error with the address appended to the message.
#[must_use]
pub fn annotate_connect_error(e: io::Error, remote: &Endpoint) -> ChannelError {
    let addr = remote.to_string();
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ChannelError::ConnectionRefused { addr },
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            ChannelError::NoRouteToHost { addr }
        }
        io::ErrorKind::TimedOut => ChannelError::ConnectTimeout { addr },
        kind => ChannelError::Io {
            kind,
            message: format!("{e}: {addr}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = ChannelError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(transient.is_transient());

        let fatal = ChannelError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!fatal.is_transient());

        assert!(!ChannelError::closed().is_transient());
    }

    #[test]
    fn test_closed_carries_cause() {
        let cause = ChannelError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        let err = ChannelError::closed_with(Some(cause));
        let rendered = format!("{err}");
        assert_eq!(rendered, "channel closed");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_connect_annotation_refused() {
        let remote = Endpoint::local("ANY");
        let err = annotate_connect_error(io::Error::from(io::ErrorKind::ConnectionRefused), &remote);
        assert!(matches!(err, ChannelError::ConnectionRefused { .. }));
        assert!(format!("{err}").contains("ANY"));
    }

    #[test]
    fn test_connect_annotation_generic_keeps_kind() {
        let remote = Endpoint::local("somewhere");
        let err = annotate_connect_error(io::Error::from(io::ErrorKind::BrokenPipe), &remote);
        match err {
            ChannelError::Io { kind, message } => {
                assert_eq!(kind, io::ErrorKind::BrokenPipe);
                assert!(message.contains("somewhere"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
