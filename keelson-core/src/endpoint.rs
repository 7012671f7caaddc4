//! Endpoint abstraction for transport-agnostic channel addressing.
//!
//! Provides unified addressing for TCP and in-process local transports with
//! parsing support.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP transport: `tcp://host:port`
    Tcp(SocketAddr),
    /// In-process transport: `local://name`
    Local(String),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:5555`
    /// - `tcp://[::1]:5555` (IPv6)
    /// - `local://name`
    ///
    /// # Examples
    ///
    /// ```
    /// use keelson_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
    /// assert!(matches!(endpoint, Endpoint::Tcp(_)));
    ///
    /// let endpoint = Endpoint::parse("local://my-endpoint").unwrap();
    /// assert!(matches!(endpoint, Endpoint::Local(_)));
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Shorthand for a local (in-process) endpoint.
    pub fn local(name: impl Into<String>) -> Self {
        Endpoint::Local(name.into())
    }

    /// Returns true if this is a TCP endpoint.
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp(_))
    }

    /// Returns true if this is a local endpoint.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }

    /// Returns true for a wildcard (any-interface) address.
    ///
    /// Local endpoints are never wildcards.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        match self {
            Endpoint::Tcp(addr) => addr.ip().is_unspecified(),
            Endpoint::Local(_) => false,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let socket_addr = addr
                .parse::<SocketAddr>()
                .map_err(|_| EndpointError::InvalidTcpAddress(addr.to_string()))?;
            Ok(Endpoint::Tcp(socket_addr))
        } else if let Some(name) = s.strip_prefix("local://") {
            if name.is_empty() {
                Err(EndpointError::InvalidLocalName(
                    "local endpoint name cannot be empty".to_string(),
                ))
            } else {
                Ok(Endpoint::Local(name.to_string()))
            }
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Local(name) => write!(f, "local://{}", name),
        }
    }
}

/// Errors that can occur when parsing endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp:// or local://)")]
    InvalidScheme(String),

    #[error("Invalid TCP address: {0}")]
    InvalidTcpAddress(String),

    #[error("Invalid local name: {0}")]
    InvalidLocalName(String),
}
