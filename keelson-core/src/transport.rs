//! The transport hook contract.
//!
//! A [`Transport`] is the capability set a concrete backend (epoll socket,
//! in-process pipe, ...) implements for the channel core. The core owns all
//! sequencing and accounting; hooks only perform the underlying operation
//! and report progress through the read/write sinks.
//!
//! Threading contract: every `do_*` hook is invoked on the channel's event
//! loop. State introspection (`is_open`, `is_active`, `is_shutdown`,
//! `local_addr`, `remote_addr`) must be cheap and callable from any thread.
//! A hook must not hold internal locks across sink callbacks — the sink
//! fires pipeline events, and handlers may re-enter the transport.

use std::any::Any;
use std::io;
use std::sync::Arc;

use bytes::Bytes;

use crate::channel::Channel;
use crate::endpoint::Endpoint;
use crate::error::ChannelError;
use crate::event_loop::TaskExecutor;
use crate::message::Message;
use crate::sink::{ReadSink, WriteSink};

/// One direction of a duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Inbound,
    Outbound,
}

/// Outcome of starting a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStart {
    /// The connect completed synchronously. `initial_sent` reports how many
    /// bytes of fast-open initial data the transport consumed; the core
    /// removes exactly that many from the outbound buffer.
    Done { initial_sent: usize },
    /// The connect is in flight; the transport will call
    /// `Channel::finish_connect` when the backend signals completion.
    Pending,
}

/// The abstract surface concrete transports implement.
pub trait Transport: Send + Sync + 'static {
    /// Called once when the transport is bound to its channel. Transports
    /// that post readiness events keep a handle here.
    fn attach(&self, channel: &Channel) {
        let _ = channel;
    }

    /// The underlying resource has not been closed.
    fn is_open(&self) -> bool;

    /// The channel can send and/or receive application data.
    fn is_active(&self) -> bool;

    /// One direction has been shut down (or the channel is closed).
    fn is_shutdown(&self, direction: ShutdownDirection) -> bool;

    /// Server (accepting) transports get server error semantics on read.
    fn is_server(&self) -> bool {
        false
    }

    /// Whether `do_disconnect` is meaningful for this transport.
    fn supports_disconnect(&self) -> bool {
        false
    }

    /// Datagram transports with broadcast enabled; drives the non-wildcard
    /// bind warning.
    fn is_broadcast(&self) -> bool {
        false
    }

    /// TCP fast-open: pass the head of the flushed region as connect data.
    fn fast_open_connect(&self) -> bool {
        false
    }

    /// Current local address, if any.
    fn local_addr(&self) -> Option<Endpoint>;

    /// Current remote address, if any.
    fn remote_addr(&self) -> Option<Endpoint>;

    /// Register with the backend's I/O facility. No-op for transports
    /// without registration state.
    fn do_register(&self) -> io::Result<()> {
        Ok(())
    }

    /// Undo `do_register`.
    fn do_deregister(&self) -> io::Result<()> {
        Ok(())
    }

    /// Bind the underlying endpoint.
    fn do_bind(&self, addr: &Endpoint) -> io::Result<()>;

    /// Begin a connect. `initial_data` is fast-open payload (head of the
    /// flushed region) when enabled and available.
    fn do_connect(
        &self,
        remote: &Endpoint,
        local: Option<&Endpoint>,
        initial_data: Option<Bytes>,
    ) -> io::Result<ConnectStart>;

    /// Complete a pending connect. Returns true when done, false to stay
    /// pending.
    fn do_finish_connect(&self, requested_remote: &Endpoint) -> io::Result<bool>;

    /// Disconnect (datagram-style). Only called when `supports_disconnect`.
    fn do_disconnect(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport does not support disconnect",
        ))
    }

    /// Shut down one direction.
    fn do_shutdown(&self, direction: ShutdownDirection) -> io::Result<()>;

    /// Close the underlying resource. Best-effort, idempotent.
    fn do_close(&self);

    /// A read was requested. Level-triggered backends may treat this as a
    /// no-op; others arm read interest. `was_pending` is true when a read
    /// was already outstanding.
    fn do_read(&self, was_pending: bool) -> io::Result<()>;

    /// Perform one read batch, reporting progress through the sink. Returns
    /// true iff the read side hit EOF and should shut down.
    fn do_read_now(&self, sink: &mut ReadSink<'_>) -> io::Result<bool>;

    /// Perform one write attempt. Must call `sink.complete` (or
    /// `sink.complete_with_error`) exactly once.
    fn do_write_now(&self, sink: &mut WriteSink<'_>) -> io::Result<()>;

    /// Cancel any pending read interest.
    fn do_clear_scheduled_read(&self) {}

    /// If true, flush kicks are deferred until the transport reports
    /// writability by invoking `Channel::write_flushed_now` itself.
    fn is_write_flushed_scheduled(&self) -> bool {
        false
    }

    /// Optional executor for the actual close (transports that block in
    /// close, e.g. lingering sockets). `None` closes inline on the loop.
    fn prepare_to_close(&self) -> Option<Arc<dyn TaskExecutor>> {
        None
    }

    /// Transform outbound messages before queueing (e.g. heap → direct
    /// copy). Errors fail the write promise and dispose the message.
    fn filter_outbound_message(&self, msg: Message) -> Result<Message, ChannelError> {
        Ok(msg)
    }

    /// Extension hook for transport-specific options.
    fn set_extended_option(
        &self,
        name: &str,
        value: Box<dyn Any + Send>,
    ) -> Result<(), ChannelError> {
        let _ = value;
        Err(ChannelError::unsupported_option(name))
    }
}
