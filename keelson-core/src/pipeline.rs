//! The inbound handler pipeline.
//!
//! An ordered chain of handlers through which the channel core fires inbound
//! events: lifecycle transitions, read messages, writability changes, and
//! exceptions. Default trait implementations forward every event to the next
//! handler, so an observer overrides only what it needs; a consumer simply
//! does not forward.
//!
//! Events are always fired from the channel's event loop. The core never
//! fires an event while another handler invocation for the same channel is
//! on the stack — outbound-triggered inbound events are deferred through the
//! loop's task queue instead (see the channel's reentrancy policy). Messages
//! that fall off the tail of the chain are disposed and traced.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::channel::{Channel, ChannelInner};
use crate::error::ChannelError;
use crate::message::{dispose, Message};
use crate::transport::ShutdownDirection;

/// An inbound event handler.
///
/// All methods default to forwarding the event to the next handler in the
/// chain.
#[allow(unused_variables)]
pub trait Handler: Send + 'static {
    /// The handler was added to a pipeline.
    fn handler_added(&mut self, ctx: &HandlerContext<'_>) {}

    /// The handler was removed from its pipeline.
    fn handler_removed(&mut self, ctx: &HandlerContext<'_>) {}

    /// The channel was registered with an event loop.
    fn channel_registered(&mut self, ctx: &HandlerContext<'_>) {
        ctx.fire_channel_registered();
    }

    /// The channel was deregistered from its event loop.
    fn channel_unregistered(&mut self, ctx: &HandlerContext<'_>) {
        ctx.fire_channel_unregistered();
    }

    /// The channel became active.
    fn channel_active(&mut self, ctx: &HandlerContext<'_>) {
        ctx.fire_channel_active();
    }

    /// The channel became inactive.
    fn channel_inactive(&mut self, ctx: &HandlerContext<'_>) {
        ctx.fire_channel_inactive();
    }

    /// One direction of the channel was shut down.
    fn channel_shutdown(&mut self, ctx: &HandlerContext<'_>, direction: ShutdownDirection) {
        ctx.fire_channel_shutdown(direction);
    }

    /// A message was read from the transport.
    fn channel_read(&mut self, ctx: &HandlerContext<'_>, msg: Message) {
        ctx.fire_channel_read(msg);
    }

    /// The current read batch completed.
    fn channel_read_complete(&mut self, ctx: &HandlerContext<'_>) {
        ctx.fire_channel_read_complete();
    }

    /// The channel's writability crossed a watermark.
    fn channel_writability_changed(&mut self, ctx: &HandlerContext<'_>, writable: bool) {
        ctx.fire_channel_writability_changed(writable);
    }

    /// An exception was observed on the transport.
    fn channel_exception(&mut self, ctx: &HandlerContext<'_>, error: ChannelError) {
        ctx.fire_channel_exception(error);
    }
}

struct Entry {
    name: Arc<str>,
    handler: Arc<Mutex<dyn Handler>>,
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Invocation context handed to handlers; forwards events to the next
/// handler in the chain.
pub struct HandlerContext<'a> {
    pipeline: &'a Pipeline,
    index: usize,
    name: Arc<str>,
}

impl HandlerContext<'_> {
    /// The channel this pipeline belongs to.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.pipeline.channel()
    }

    /// The handler's registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fire_channel_registered(&self) {
        self.pipeline.invoke_registered(self.index + 1);
    }

    pub fn fire_channel_unregistered(&self) {
        self.pipeline.invoke_unregistered(self.index + 1);
    }

    pub fn fire_channel_active(&self) {
        self.pipeline.invoke_active(self.index + 1);
    }

    pub fn fire_channel_inactive(&self) {
        self.pipeline.invoke_inactive(self.index + 1);
    }

    pub fn fire_channel_shutdown(&self, direction: ShutdownDirection) {
        self.pipeline.invoke_shutdown(self.index + 1, direction);
    }

    pub fn fire_channel_read(&self, msg: Message) {
        self.pipeline.invoke_read(self.index + 1, msg);
    }

    pub fn fire_channel_read_complete(&self) {
        self.pipeline.invoke_read_complete(self.index + 1);
    }

    pub fn fire_channel_writability_changed(&self, writable: bool) {
        self.pipeline.invoke_writability_changed(self.index + 1, writable);
    }

    pub fn fire_channel_exception(&self, error: ChannelError) {
        self.pipeline.invoke_exception(self.index + 1, error);
    }
}

/// The ordered handler chain exclusively owned by a channel.
pub struct Pipeline {
    channel: Weak<ChannelInner>,
    entries: Mutex<Vec<Entry>>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<ChannelInner>) -> Self {
        Self {
            channel,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn channel(&self) -> Channel {
        Channel::from_inner(self.channel.upgrade().expect("channel alive"))
    }

    /// Append a handler to the tail of the chain.
    pub fn add_last(&self, name: impl Into<String>, handler: impl Handler) {
        let name: Arc<str> = Arc::from(name.into());
        let entry = Entry {
            name: name.clone(),
            handler: Arc::new(Mutex::new(handler)),
        };
        let index = {
            let mut entries = self.entries.lock();
            entries.push(entry.clone());
            entries.len() - 1
        };
        let ctx = HandlerContext {
            pipeline: self,
            index,
            name,
        };
        entry.handler.lock().handler_added(&ctx);
    }

    /// Remove a handler by name. Returns true if it was present.
    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.iter().position(|e| &*e.name == name) {
                Some(index) => Some((index, entries.remove(index))),
                None => None,
            }
        };
        match removed {
            Some((index, entry)) => {
                let ctx = HandlerContext {
                    pipeline: self,
                    index,
                    name: entry.name.clone(),
                };
                entry.handler.lock().handler_removed(&ctx);
                true
            }
            None => false,
        }
    }

    /// Number of handlers currently in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drain every handler, tolerating removals that race with handler
    /// callbacks. Used once the channel is closed and deregistered.
    pub(crate) fn clear(&self) {
        loop {
            let entry = {
                let mut entries = self.entries.lock();
                if entries.is_empty() {
                    return;
                }
                entries.remove(0)
            };
            let ctx = HandlerContext {
                pipeline: self,
                index: 0,
                name: entry.name.clone(),
            };
            entry.handler.lock().handler_removed(&ctx);
        }
    }

    fn entry_at(&self, index: usize) -> Option<Entry> {
        self.entries.lock().get(index).cloned()
    }

    fn ctx_for(&self, index: usize, entry: &Entry) -> HandlerContext<'_> {
        HandlerContext {
            pipeline: self,
            index,
            name: entry.name.clone(),
        }
    }

    pub fn fire_channel_registered(&self) {
        self.invoke_registered(0);
    }

    pub fn fire_channel_unregistered(&self) {
        self.invoke_unregistered(0);
    }

    pub fn fire_channel_active(&self) {
        self.invoke_active(0);
    }

    pub fn fire_channel_inactive(&self) {
        self.invoke_inactive(0);
    }

    pub fn fire_channel_shutdown(&self, direction: ShutdownDirection) {
        self.invoke_shutdown(0, direction);
    }

    pub fn fire_channel_read(&self, msg: Message) {
        self.invoke_read(0, msg);
    }

    pub fn fire_channel_read_complete(&self) {
        self.invoke_read_complete(0);
    }

    pub fn fire_channel_writability_changed(&self, writable: bool) {
        self.invoke_writability_changed(0, writable);
    }

    pub fn fire_channel_exception(&self, error: ChannelError) {
        self.invoke_exception(0, error);
    }

    fn invoke_registered(&self, index: usize) {
        if let Some(entry) = self.entry_at(index) {
            let ctx = self.ctx_for(index, &entry);
            entry.handler.lock().channel_registered(&ctx);
        }
    }

    fn invoke_unregistered(&self, index: usize) {
        if let Some(entry) = self.entry_at(index) {
            let ctx = self.ctx_for(index, &entry);
            entry.handler.lock().channel_unregistered(&ctx);
        }
    }

    fn invoke_active(&self, index: usize) {
        if let Some(entry) = self.entry_at(index) {
            let ctx = self.ctx_for(index, &entry);
            entry.handler.lock().channel_active(&ctx);
        }
    }

    fn invoke_inactive(&self, index: usize) {
        if let Some(entry) = self.entry_at(index) {
            let ctx = self.ctx_for(index, &entry);
            entry.handler.lock().channel_inactive(&ctx);
        }
    }

    fn invoke_shutdown(&self, index: usize, direction: ShutdownDirection) {
        if let Some(entry) = self.entry_at(index) {
            let ctx = self.ctx_for(index, &entry);
            entry.handler.lock().channel_shutdown(&ctx, direction);
        }
    }

    fn invoke_read(&self, index: usize, msg: Message) {
        match self.entry_at(index) {
            Some(entry) => {
                let ctx = self.ctx_for(index, &entry);
                entry.handler.lock().channel_read(&ctx, msg);
            }
            None => {
                trace!(?msg, "message reached pipeline tail, discarding");
                dispose(msg);
            }
        }
    }

    fn invoke_read_complete(&self, index: usize) {
        if let Some(entry) = self.entry_at(index) {
            let ctx = self.ctx_for(index, &entry);
            entry.handler.lock().channel_read_complete(&ctx);
        }
    }

    fn invoke_writability_changed(&self, index: usize, writable: bool) {
        if let Some(entry) = self.entry_at(index) {
            let ctx = self.ctx_for(index, &entry);
            entry.handler.lock().channel_writability_changed(&ctx, writable);
        }
    }

    fn invoke_exception(&self, index: usize, error: ChannelError) {
        match self.entry_at(index) {
            Some(entry) => {
                let ctx = self.ctx_for(index, &entry);
                entry.handler.lock().channel_exception(&ctx, error);
            }
            None => {
                warn!(error = %error, "exception reached pipeline tail unhandled");
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .entries
            .lock()
            .iter()
            .map(|e| e.name.to_string())
            .collect();
        f.debug_struct("Pipeline").field("handlers", &names).finish()
    }
}
