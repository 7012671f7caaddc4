//! Read and write sinks.
//!
//! A sink is the short-lived reporting surface a transport uses during one
//! `do_read_now` / `do_write_now` invocation. It keeps the core in charge of
//! accounting and handler dispatch: the transport only says what happened,
//! the sink consults the handle for continuation, and the core applies the
//! bookkeeping after the hook returns.

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::alloc::{BufferAllocator, ReadBufferAllocator};
use crate::channel::Channel;
use crate::error::ChannelError;
use crate::handle::{ReadHandle, WriteHandle};
use crate::message::Message;
use std::sync::Arc;

/// Per-read-loop scratchpad handed to `Transport::do_read_now`.
pub struct ReadSink<'a> {
    channel: &'a Channel,
    handle: &'a mut dyn ReadHandle,
    read_allocator: Arc<dyn ReadBufferAllocator>,
    buffer_allocator: Arc<dyn BufferAllocator>,
    read_any: bool,
    messages: usize,
}

impl<'a> ReadSink<'a> {
    pub(crate) fn new(
        channel: &'a Channel,
        handle: &'a mut dyn ReadHandle,
        read_allocator: Arc<dyn ReadBufferAllocator>,
        buffer_allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        Self {
            channel,
            handle,
            read_allocator,
            buffer_allocator,
            read_any: false,
            messages: 0,
        }
    }

    /// Allocate an inbound buffer sized by the read handle and the pending
    /// read allocator.
    pub fn allocate_buffer(&mut self) -> BytesMut {
        let capacity = self.handle.estimated_buffer_capacity();
        self.read_allocator.allocate(&*self.buffer_allocator, capacity)
    }

    /// Report one read attempt. Fires `channel_read` when a message was
    /// produced and returns the handle's continuation hint.
    pub fn process_read(&mut self, attempted: usize, actual: usize, msg: Option<Message>) -> bool {
        let produced = match msg {
            Some(msg) => {
                self.read_any = true;
                self.messages += 1;
                self.channel.pipeline().fire_channel_read(msg);
                1
            }
            None => 0,
        };
        self.handle.last_read(attempted, actual, produced)
    }

    /// True once at least one message was delivered in this loop.
    pub(crate) fn read_any(&self) -> bool {
        self.read_any
    }

    /// Messages delivered in this loop.
    pub(crate) fn messages(&self) -> usize {
        self.messages
    }
}

/// What the transport reported for one write attempt.
pub(crate) enum WriteCompletion {
    Progress {
        attempted: usize,
        written: usize,
        /// `Some(n)`: remove exactly `n` whole entries. `None`: consume
        /// `written` bytes across entries (gathering write).
        messages: Option<usize>,
        continue_hint: bool,
    },
    Failure {
        cause: ChannelError,
        continue_hint: bool,
    },
}

/// Per-write-attempt scratchpad handed to `Transport::do_write_now`.
///
/// Exactly one of [`WriteSink::complete`] / [`WriteSink::complete_with_error`]
/// must be called per invocation.
pub struct WriteSink<'a> {
    channel: &'a Channel,
    max_bytes_per_gathering_write: usize,
    completion: Option<WriteCompletion>,
    _handle: &'a mut dyn WriteHandle,
}

impl<'a> WriteSink<'a> {
    pub(crate) fn new(channel: &'a Channel, handle: &'a mut dyn WriteHandle) -> Self {
        let max_bytes_per_gathering_write = handle.estimated_max_bytes_per_gathering_write();
        Self {
            channel,
            max_bytes_per_gathering_write,
            completion: None,
            _handle: handle,
        }
    }

    /// Number of flushed entries available to write.
    #[must_use]
    pub fn size(&self) -> usize {
        self.channel
            .with_outbound(|buf| buf.map_or(0, |b| b.flushed_count()))
    }

    /// True when nothing is flushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Inspect the head of the flushed region.
    pub fn with_current<R>(&self, f: impl FnOnce(Option<&Message>) -> R) -> R {
        self.channel
            .with_outbound(|buf| f(buf.and_then(|b| b.current())))
    }

    /// Visit flushed entries in order until `f` returns false.
    pub fn for_each_flushed(&self, f: impl FnMut(&Message) -> bool) {
        self.channel.with_outbound(|buf| {
            if let Some(buf) = buf {
                buf.for_each_flushed(f);
            }
        });
    }

    /// Collect byte payloads from the head of the flushed region for a
    /// gathering write: stops at the first non-byte message, the byte cap,
    /// or the end of the flushed region. Always includes at least one entry
    /// when the head is a byte payload.
    #[must_use]
    pub fn gather_bytes(&self, max_bytes: usize) -> (SmallVec<[Bytes; 8]>, usize) {
        let mut segments: SmallVec<[Bytes; 8]> = SmallVec::new();
        let mut total = 0usize;
        self.for_each_flushed(|msg| match msg.as_bytes() {
            Some(b) => {
                if !segments.is_empty() && total + b.len() > max_bytes {
                    return false;
                }
                total += b.len();
                segments.push(b.clone());
                total < max_bytes
            }
            None => false,
        });
        (segments, total)
    }

    /// Byte ceiling for a single gathering write, as advised by the write
    /// handle when this attempt started.
    #[must_use]
    pub fn estimated_max_bytes_per_gathering_write(&self) -> usize {
        self.max_bytes_per_gathering_write
    }

    /// Report a (possibly partial) successful write attempt.
    ///
    /// `messages` is `Some(n)` when the transport consumed `n` whole
    /// entries, or `None` to account by bytes across entries.
    ///
    /// # Panics
    ///
    /// Panics if a completion was already recorded for this attempt.
    pub fn complete(
        &mut self,
        attempted: usize,
        written: usize,
        messages: Option<usize>,
        continue_hint: bool,
    ) {
        self.record(WriteCompletion::Progress {
            attempted,
            written,
            messages,
            continue_hint,
        });
    }

    /// Report a failed write attempt; fails the head entry.
    ///
    /// # Panics
    ///
    /// Panics if a completion was already recorded for this attempt.
    pub fn complete_with_error(&mut self, cause: ChannelError, continue_hint: bool) {
        self.record(WriteCompletion::Failure {
            cause,
            continue_hint,
        });
    }

    fn record(&mut self, completion: WriteCompletion) {
        assert!(
            self.completion.is_none(),
            "write sink completed twice for one do_write_now call"
        );
        self.completion = Some(completion);
    }

    pub(crate) fn take_completion(&mut self) -> Option<WriteCompletion> {
        self.completion.take()
    }
}
