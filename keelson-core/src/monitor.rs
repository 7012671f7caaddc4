//! Channel event monitoring.
//!
//! Provides event streams for tracking channel lifecycle events like
//! registration, activation, reads, writability flips, and errors. Tests and
//! embedders attach a [`MonitorHandler`] to a pipeline and consume the
//! resulting stream.

use crate::error::ChannelError;
use crate::message::Message;
use crate::pipeline::{Handler, HandlerContext};
use crate::transport::ShutdownDirection;

/// Channel lifecycle events.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel was registered with an event loop.
    Registered,

    /// The channel was deregistered from its event loop.
    Unregistered,

    /// The channel became active.
    Active,

    /// The channel became inactive.
    Inactive,

    /// One direction was shut down.
    Shutdown(ShutdownDirection),

    /// A message arrived. The monitor consumes it.
    Read(Message),

    /// A read batch completed.
    ReadComplete,

    /// Writability crossed a watermark.
    WritabilityChanged(bool),

    /// An exception was observed.
    Exception(ChannelError),
}

/// Handle for receiving channel events.
pub type ChannelMonitor = flume::Receiver<ChannelEvent>;

/// Sender half of a monitor stream.
pub type ChannelEventSender = flume::Sender<ChannelEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (ChannelEventSender, ChannelMonitor) {
    flume::unbounded()
}

/// Pipeline handler that forwards every event into a monitor stream.
///
/// Lifecycle events are forwarded down the chain after recording; read
/// messages are consumed into the stream (the handler is a terminal
/// consumer).
pub struct MonitorHandler {
    tx: ChannelEventSender,
}

impl MonitorHandler {
    #[must_use]
    pub fn new(tx: ChannelEventSender) -> Self {
        Self { tx }
    }
}

impl Handler for MonitorHandler {
    fn channel_registered(&mut self, ctx: &HandlerContext<'_>) {
        let _ = self.tx.send(ChannelEvent::Registered);
        ctx.fire_channel_registered();
    }

    fn channel_unregistered(&mut self, ctx: &HandlerContext<'_>) {
        let _ = self.tx.send(ChannelEvent::Unregistered);
        ctx.fire_channel_unregistered();
    }

    fn channel_active(&mut self, ctx: &HandlerContext<'_>) {
        let _ = self.tx.send(ChannelEvent::Active);
        ctx.fire_channel_active();
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext<'_>) {
        let _ = self.tx.send(ChannelEvent::Inactive);
        ctx.fire_channel_inactive();
    }

    fn channel_shutdown(&mut self, ctx: &HandlerContext<'_>, direction: ShutdownDirection) {
        let _ = self.tx.send(ChannelEvent::Shutdown(direction));
        ctx.fire_channel_shutdown(direction);
    }

    fn channel_read(&mut self, _ctx: &HandlerContext<'_>, msg: Message) {
        let _ = self.tx.send(ChannelEvent::Read(msg));
    }

    fn channel_read_complete(&mut self, ctx: &HandlerContext<'_>) {
        let _ = self.tx.send(ChannelEvent::ReadComplete);
        ctx.fire_channel_read_complete();
    }

    fn channel_writability_changed(&mut self, ctx: &HandlerContext<'_>, writable: bool) {
        let _ = self.tx.send(ChannelEvent::WritabilityChanged(writable));
        ctx.fire_channel_writability_changed(writable);
    }

    fn channel_exception(&mut self, _ctx: &HandlerContext<'_>, error: ChannelError) {
        let _ = self.tx.send(ChannelEvent::Exception(error));
    }
}
