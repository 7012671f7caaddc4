//! # Keelson
//!
//! A channel transport core: the state machine between a transport's I/O
//! mechanism and a user-visible handler pipeline.
//!
//! ## Architecture
//!
//! Keelson is structured as a **channel kernel** with clean layering:
//!
//! - **`keelson-core`**: event loop, channel state machine, outbound buffer,
//!   pipeline, promises
//! - **Transport crates**: backends implementing the hook contract
//!   (`keelson-local` ships an in-process transport)
//! - **`keelson`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keelson::prelude::*;
//! use keelson::local::{LocalServerTransport, LocalTransport};
//! use std::time::Duration;
//!
//! // One loop per side; a channel is pinned to its loop.
//! let server_loop = EventLoop::new("server");
//! let client_loop = EventLoop::new("client");
//!
//! // Bind a named in-process endpoint.
//! let server = Channel::new(Box::new(LocalServerTransport::new(|_child| {})));
//! server.register(&server_loop).wait(Duration::from_secs(1));
//! server.bind(Endpoint::local("greeter")).wait(Duration::from_secs(1));
//!
//! // Connect and write.
//! let client = Channel::new(Box::new(LocalTransport::new()));
//! client.register(&client_loop).wait(Duration::from_secs(1));
//! client.connect(Endpoint::local("greeter")).wait(Duration::from_secs(1));
//! client.write_and_flush("hello");
//! ```
//!
//! ## Guarantees
//!
//! - **Single-threaded per channel**: every state transition and handler
//!   invocation runs on the channel's event loop
//! - **Promise-based**: operations return single-shot completions; errors
//!   surface there, never as panics into user code
//! - **Watermarked**: writability flips exactly on high/low watermark
//!   crossings, never spuriously
//! - **Leak-free**: every queued message is delivered to the transport or
//!   disposed on the failure path

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]

// Re-export core types
pub use bytes::Bytes;
pub use keelson_core::alloc;
pub use keelson_core::channel::{Channel, WeakChannel};
pub use keelson_core::endpoint::Endpoint;
pub use keelson_core::error::{ChannelError, Result};
pub use keelson_core::event_loop::EventLoop;
pub use keelson_core::handle;
pub use keelson_core::id::ChannelId;
pub use keelson_core::message::Message;
pub use keelson_core::monitor;
pub use keelson_core::options::{ChannelOption, ChannelOptions, WaterMark};
pub use keelson_core::pipeline::{Handler, HandlerContext, Pipeline};
pub use keelson_core::promise::Promise;
pub use keelson_core::sink::{ReadSink, WriteSink};
pub use keelson_core::transport::{ConnectStart, ShutdownDirection, Transport};

/// In-process transport (named registry, zero-copy links).
pub mod local {
    pub use keelson_local::{bound_endpoints, is_bound, LocalServerTransport, LocalTransport};
}

/// Convenience prelude.
pub mod prelude {
    pub use keelson_core::prelude::*;
}

/// Development helpers (benches/tests)
pub mod dev_tracing;
