//! Outbound write buffer.
//!
//! A FIFO of pending writes with two logical regions: the *unflushed* tail
//! (added but not yet eligible for the transport) and the *flushed* head
//! (promoted by `add_flush`, consumed by the write loop). Each entry carries
//! its message, a byte estimate, and the completion promise for the
//! originating `write` call.
//!
//! All mutation happens on the event loop. Promise completions and message
//! disposal are *returned* to the caller as [`FinishedWrite`] batches and
//! dispatched after the channel's locks are released, so listener callbacks
//! can re-enter the channel safely. The pending-byte total lives in a shared
//! atomic so `writable_bytes()` stays readable from any thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::ChannelError;
use crate::message::{dispose, Message};
use crate::promise::{safe_fail, safe_succeed, Promise};

struct Entry {
    msg: Message,
    remaining: usize,
    promise: Promise<()>,
}

/// A completed (succeeded or failed) write entry, ready for dispatch outside
/// the buffer's lock.
pub(crate) struct FinishedWrite {
    msg: Message,
    promise: Promise<()>,
    result: Result<(), ChannelError>,
}

impl FinishedWrite {
    /// Complete the promise and release the message.
    pub(crate) fn dispatch(self) {
        match self.result {
            Ok(()) => {
                drop(self.msg);
                safe_succeed(&self.promise, ());
            }
            Err(err) => {
                dispose(self.msg);
                safe_fail(&self.promise, err);
            }
        }
    }
}

/// Dispatch a batch of finished writes in order.
pub(crate) fn dispatch_finished(batch: impl IntoIterator<Item = FinishedWrite>) {
    for finished in batch {
        finished.dispatch();
    }
}

pub(crate) type FinishedBatch = SmallVec<[FinishedWrite; 4]>;

/// FIFO of pending outbound messages plus their completion promises.
pub struct OutboundBuffer {
    entries: VecDeque<Entry>,
    flushed: usize,
    pending: Arc<AtomicUsize>,
}

impl OutboundBuffer {
    pub(crate) fn new(pending: Arc<AtomicUsize>) -> Self {
        Self {
            entries: VecDeque::new(),
            flushed: 0,
            pending,
        }
    }

    /// Append to the unflushed region.
    pub(crate) fn add_message(&mut self, msg: Message, size: usize, promise: Promise<()>) {
        self.pending.fetch_add(size, Ordering::AcqRel);
        self.entries.push_back(Entry {
            msg,
            remaining: size,
            promise,
        });
    }

    /// Promote all unflushed entries to the flushed region.
    pub(crate) fn add_flush(&mut self) {
        self.flushed = self.entries.len();
    }

    /// Head of the flushed region.
    #[must_use]
    pub fn current(&self) -> Option<&Message> {
        if self.flushed == 0 {
            return None;
        }
        self.entries.front().map(|e| &e.msg)
    }

    /// Pop the head of the flushed region as a success.
    pub(crate) fn remove(&mut self) -> Option<FinishedWrite> {
        self.pop_head(Ok(()))
    }

    /// Pop the head of the flushed region as a failure.
    pub(crate) fn remove_err(&mut self, cause: ChannelError) -> Option<FinishedWrite> {
        self.pop_head(Err(cause))
    }

    fn pop_head(&mut self, result: Result<(), ChannelError>) -> Option<FinishedWrite> {
        if self.flushed == 0 {
            return None;
        }
        let entry = self.entries.pop_front()?;
        self.flushed -= 1;
        self.pending.fetch_sub(entry.remaining, Ordering::AcqRel);
        Some(FinishedWrite {
            msg: entry.msg,
            promise: entry.promise,
            result,
        })
    }

    /// Advance the flushed region by `n` written bytes, completing every
    /// fully-consumed entry. A partially-consumed head entry stays queued
    /// with its payload cursor and byte count advanced.
    ///
    /// Returns the finished entries and how many were fully removed.
    pub(crate) fn remove_bytes(&mut self, mut n: usize) -> (FinishedBatch, usize) {
        let mut batch = FinishedBatch::new();
        while n > 0 && self.flushed > 0 {
            let head_remaining = match self.entries.front() {
                Some(entry) => entry.remaining,
                None => break,
            };
            if n >= head_remaining {
                n -= head_remaining;
                if let Some(done) = self.remove() {
                    batch.push(done);
                }
            } else {
                let entry = self.entries.front_mut().expect("flushed head exists");
                entry.remaining -= n;
                if let Message::Bytes(b) = &mut entry.msg {
                    let advance = n.min(b.len());
                    let _ = b.split_to(advance);
                }
                self.pending.fetch_sub(n, Ordering::AcqRel);
                n = 0;
            }
        }
        let removed = batch.len();
        (batch, removed)
    }

    /// Fail every entry in the flushed region.
    pub(crate) fn fail_flushed(&mut self, cause: &ChannelError) -> FinishedBatch {
        let mut batch = FinishedBatch::new();
        while self.flushed > 0 {
            if let Some(done) = self.remove_err(cause.clone()) {
                batch.push(done);
            } else {
                break;
            }
        }
        batch
    }

    /// Fail the flushed region with one cause and the unflushed tail with
    /// another. Used during close and output shutdown.
    pub(crate) fn fail_flushed_and_close(
        &mut self,
        flushed_cause: &ChannelError,
        unflushed_cause: &ChannelError,
    ) -> FinishedBatch {
        let mut batch = self.fail_flushed(flushed_cause);
        while let Some(entry) = self.entries.pop_front() {
            self.pending.fetch_sub(entry.remaining, Ordering::AcqRel);
            batch.push(FinishedWrite {
                msg: entry.msg,
                promise: entry.promise,
                result: Err(unflushed_cause.clone()),
            });
        }
        batch
    }

    /// Visit flushed entries in order until `f` returns false.
    pub fn for_each_flushed(&self, mut f: impl FnMut(&Message) -> bool) {
        for entry in self.entries.iter().take(self.flushed) {
            if !f(&entry.msg) {
                break;
            }
        }
    }

    /// Total estimated bytes queued (flushed + unflushed).
    #[must_use]
    pub fn total_pending_bytes(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of queued entries (flushed + unflushed).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries in the flushed region.
    #[must_use]
    pub fn flushed_count(&self) -> usize {
        self.flushed
    }
}
