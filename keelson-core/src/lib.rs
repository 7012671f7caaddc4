//! Keelson Core
//!
//! This crate contains the transport-agnostic channel core:
//! - Single-threaded event loop with a FIFO task queue and timers (`event_loop`)
//! - Per-channel state machine: register / bind / connect / read / write /
//!   shutdown / close (`channel`)
//! - Outbound buffer with watermark-driven writability (`outbound`, `options`)
//! - Read/write sinks and per-loop advisor handles (`sink`, `handle`)
//! - Single-shot completion promises (`promise`)
//! - Inbound handler pipeline (`pipeline`)
//! - Error types (`error`)
//!
//! Concrete transports implement the hook surface in `transport` and drive
//! the core through `Channel::read_now` / `Channel::write_flushed_now` /
//! `Channel::finish_connect`.

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod alloc;
pub mod channel;
pub mod endpoint;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod id;
pub mod message;
pub mod monitor;
pub mod options;
pub mod outbound;
pub mod pipeline;
pub mod promise;
pub mod sink;
pub mod transport;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::channel::Channel;
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{ChannelError, Result};
    pub use crate::event_loop::EventLoop;
    pub use crate::message::Message;
    pub use crate::monitor::{create_monitor, ChannelEvent, ChannelMonitor, MonitorHandler};
    pub use crate::options::{ChannelOption, ChannelOptions, WaterMark};
    pub use crate::pipeline::{Handler, HandlerContext, Pipeline};
    pub use crate::promise::Promise;
    pub use crate::transport::{ConnectStart, ShutdownDirection, Transport};
}
