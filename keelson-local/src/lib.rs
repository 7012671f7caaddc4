//! In-process transport for Keelson channels.
//!
//! The local transport links two channels inside one process through a
//! named registry, without TCP/IP overhead:
//!
//! - **Zero-copy**: payloads are refcounted `Bytes` shared between ends
//! - **Thread-safe**: the name registry is a `DashMap`; each end is pinned
//!   to its own event loop
//! - **Faithful**: connects, half-close, EOF, and accept flow through the
//!   same core state machine as any socket transport
//!
//! # Usage
//!
//! ```rust,no_run
//! use keelson_core::prelude::*;
//! use keelson_local::{LocalServerTransport, LocalTransport};
//!
//! let server_loop = EventLoop::new("server");
//! let client_loop = EventLoop::new("client");
//!
//! // Serve: echo every payload back to the peer.
//! let server = Channel::new(Box::new(LocalServerTransport::new(|child| {
//!     let _ = child; // install child handlers here
//! })));
//! server.register(&server_loop);
//! server.bind(Endpoint::local("my-endpoint"));
//!
//! // Connect from another loop.
//! let client = Channel::new(Box::new(LocalTransport::new()));
//! client.register(&client_loop);
//! client.connect(Endpoint::local("my-endpoint"));
//! ```

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod registry;
mod transport;

pub use registry::{bound_endpoints, is_bound};
pub use transport::{LocalServerTransport, LocalTransport};
