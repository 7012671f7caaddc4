//! The channel core state machine.
//!
//! One `Channel` == one transport endpoint bound to one event loop. The
//! channel owns its pipeline, its outbound buffer, and its read/write
//! handles; the transport performs the actual I/O and reports progress
//! through sinks. Every state transition runs on the owning loop — public
//! operations called from other threads are marshalled onto it and observed
//! through promises.
//!
//! # Reentrancy policy
//!
//! Handlers run with their own lock held, so the core never fires a pipeline
//! event while another handler invocation for this channel is on the stack:
//!
//! - Outbound-triggered inbound events (`channel_active` after bind,
//!   `channel_inactive` after close, `channel_shutdown`, writability flips,
//!   read-request failures) are posted to the loop's task queue.
//! - Transport-triggered events (`channel_read`, `channel_read_complete`,
//!   read exceptions) fire inline from the read loop, which is itself a
//!   top-level loop task.
//!
//! Promise completions are collected while locks are held and dispatched
//! afterwards, so completion listeners may freely re-enter the channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::alloc::{HandleSizedReadAllocator, ReadBufferAllocator};
use crate::endpoint::Endpoint;
use crate::error::{annotate_connect_error, ChannelError};
use crate::event_loop::{EventLoop, ScheduledHandle};
use crate::handle::{ReadHandle, WriteHandle};
use crate::id::ChannelId;
use crate::message::{dispose, Message};
use crate::options::{ChannelOption, ChannelOptions};
use crate::outbound::{dispatch_finished, FinishedBatch, OutboundBuffer};
use crate::pipeline::Pipeline;
use crate::promise::{safe_fail, safe_succeed, Promise};
use crate::sink::{ReadSink, WriteCompletion, WriteSink};
use crate::transport::{ConnectStart, ShutdownDirection, Transport};

struct Lifecycle {
    never_registered: bool,
    never_active: bool,
    close_initiated: bool,
    initial_close_cause: Option<ChannelError>,
    connect_promise: Option<Promise<()>>,
    requested_remote: Option<Endpoint>,
    connect_timeout: Option<ScheduledHandle>,
    in_write_flushed: bool,
    input_closed_seen_error: bool,
    read_before_active: Option<Arc<dyn ReadBufferAllocator>>,
    pending_read: Option<Arc<dyn ReadBufferAllocator>>,
    read_handle: Option<Box<dyn ReadHandle>>,
    write_handle: Option<Box<dyn WriteHandle>>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            never_registered: true,
            never_active: true,
            close_initiated: false,
            initial_close_cause: None,
            connect_promise: None,
            requested_remote: None,
            connect_timeout: None,
            in_write_flushed: false,
            input_closed_seen_error: false,
            read_before_active: None,
            pending_read: None,
            read_handle: None,
            write_handle: None,
        }
    }
}

pub(crate) struct ChannelInner {
    id: ChannelId,
    parent: Option<Channel>,
    transport: Box<dyn Transport>,
    options: ChannelOptions,
    pipeline: Pipeline,
    outbound: Mutex<Option<OutboundBuffer>>,
    pending_bytes: Arc<AtomicUsize>,
    writable: AtomicBool,
    registered: AtomicBool,
    event_loop: RwLock<Option<Arc<EventLoop>>>,
    local_addr: Mutex<Option<Endpoint>>,
    remote_addr: Mutex<Option<Endpoint>>,
    close_promise: Promise<()>,
    lifecycle: Mutex<Lifecycle>,
}

/// A channel handle. Cheap to clone; all clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel over the given transport with default options.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::build(None, transport, ChannelOptions::new())
    }

    /// Create a channel with explicit options.
    #[must_use]
    pub fn with_options(transport: Box<dyn Transport>, options: ChannelOptions) -> Self {
        Self::build(None, transport, options)
    }

    /// Create a child channel (e.g. an accepted connection) linked to its
    /// parent.
    #[must_use]
    pub fn new_child(parent: &Channel, transport: Box<dyn Transport>) -> Self {
        Self::build(Some(parent.clone()), transport, ChannelOptions::new())
    }

    fn build(parent: Option<Channel>, transport: Box<dyn Transport>, options: ChannelOptions) -> Self {
        let pending = Arc::new(AtomicUsize::new(0));
        let buffer_pending = pending.clone();
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| ChannelInner {
            id: ChannelId::next(),
            parent,
            transport,
            options,
            pipeline: Pipeline::new(weak.clone()),
            outbound: Mutex::new(Some(OutboundBuffer::new(buffer_pending))),
            pending_bytes: pending,
            writable: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            event_loop: RwLock::new(None),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            close_promise: Promise::new_guarded(),
            lifecycle: Mutex::new(Lifecycle::new()),
        });
        let channel = Channel { inner };
        channel.inner.transport.attach(&channel);
        channel
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Channel { inner }
    }

    /// Non-owning handle for back-references (transports, registries).
    #[must_use]
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ---- introspection -------------------------------------------------

    /// The channel's unique id.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Parent channel, for accepted children.
    #[must_use]
    pub fn parent(&self) -> Option<&Channel> {
        self.inner.parent.as_ref()
    }

    /// The handler pipeline exclusively owned by this channel.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// The channel's option table.
    #[must_use]
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// The loop this channel is (or was last) registered with.
    #[must_use]
    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.inner.event_loop.read().clone()
    }

    /// True while registered with an event loop.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// True while the underlying transport resource is not closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.transport.is_open()
    }

    /// True while the channel can carry application data.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.transport.is_active()
    }

    /// True if the given direction has been shut down.
    #[must_use]
    pub fn is_shutdown(&self, direction: ShutdownDirection) -> bool {
        self.inner.transport.is_shutdown(direction)
    }

    /// Current writability as tracked by the watermark protocol.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::Acquire)
    }

    /// Bytes that can be queued before the channel turns unwritable. Zero
    /// whenever the writable flag is down.
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        if !self.is_writable() {
            return 0;
        }
        if self.inner.outbound.lock().is_none() {
            return 0;
        }
        let high = self.inner.options.water_mark().high();
        high.saturating_sub(self.inner.pending_bytes.load(Ordering::Acquire))
    }

    /// Total estimated bytes queued for write.
    #[must_use]
    pub fn total_pending_write_bytes(&self) -> usize {
        self.inner.pending_bytes.load(Ordering::Acquire)
    }

    /// Cached local address.
    #[must_use]
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.inner.local_addr.lock().clone()
    }

    /// Cached remote address.
    #[must_use]
    pub fn remote_addr(&self) -> Option<Endpoint> {
        self.inner.remote_addr.lock().clone()
    }

    /// Completion that fires once the channel is fully closed. External
    /// completion attempts on it always fail.
    #[must_use]
    pub fn close_future(&self) -> Promise<()> {
        self.inner.close_promise.clone()
    }

    // ---- helpers -------------------------------------------------------

    fn executor(&self) -> Result<Arc<EventLoop>, ChannelError> {
        self.inner
            .event_loop
            .read()
            .clone()
            .ok_or(ChannelError::NotRegistered)
    }

    fn invoke_later(&self, f: impl FnOnce() + Send + 'static) {
        if let Ok(event_loop) = self.executor() {
            event_loop.execute_task(f);
        }
    }

    fn assert_loop(&self) {
        if let Ok(event_loop) = self.executor() {
            debug_assert!(
                event_loop.in_event_loop(),
                "channel state touched off its event loop"
            );
        }
    }

    fn run_on_loop(
        &self,
        promise: &Promise<()>,
        f: impl FnOnce(Channel, Promise<()>) + Send + 'static,
    ) {
        match self.executor() {
            Err(e) => safe_fail(promise, e),
            Ok(event_loop) => {
                if event_loop.in_event_loop() {
                    f(self.clone(), promise.clone());
                } else {
                    let channel = self.clone();
                    let promise = promise.clone();
                    event_loop.execute_task(move || f(channel, promise));
                }
            }
        }
    }

    pub(crate) fn with_outbound<R>(&self, f: impl FnOnce(Option<&mut OutboundBuffer>) -> R) -> R {
        let mut guard = self.inner.outbound.lock();
        f(guard.as_mut())
    }

    fn closed_error(&self) -> ChannelError {
        ChannelError::closed_with(self.inner.lifecycle.lock().initial_close_cause.clone())
    }

    fn ensure_open(&self, promise: &Promise<()>) -> bool {
        if self.is_open() {
            return true;
        }
        safe_fail(promise, self.closed_error());
        false
    }

    fn refresh_addresses(&self) {
        *self.inner.local_addr.lock() = self.inner.transport.local_addr();
        *self.inner.remote_addr.lock() = self.inner.transport.remote_addr();
    }

    /// Fire `channel_active` if it never fired, then replay or trigger
    /// reads. Runs on every activation; the event itself is delivered at
    /// most once until a disconnect resets the latch.
    fn mark_active_and_fire(&self) {
        self.assert_loop();
        let (fire, replay) = {
            let mut lc = self.inner.lifecycle.lock();
            let fire = lc.never_active;
            lc.never_active = false;
            (fire, lc.read_before_active.take())
        };
        if fire {
            self.inner.pipeline.fire_channel_active();
        }
        if let Some(allocator) = replay {
            self.read_with(allocator);
        } else if self.inner.options.auto_read() {
            self.read();
        }
    }

    // ---- registration --------------------------------------------------

    /// Register the channel with an event loop. Fails if already
    /// registered; re-registration after `deregister()` is allowed and does
    /// not re-fire `channel_active`.
    pub fn register(&self, event_loop: &Arc<EventLoop>) -> Promise<()> {
        let promise = Promise::new();
        if event_loop.in_event_loop() {
            self.register_now(event_loop.clone(), promise.clone());
        } else {
            let channel = self.clone();
            let target = event_loop.clone();
            let task_promise = promise.clone();
            event_loop.execute_task(move || channel.register_now(target, task_promise));
        }
        promise
    }

    fn register_now(&self, event_loop: Arc<EventLoop>, promise: Promise<()>) {
        debug_assert!(event_loop.in_event_loop());
        if self.is_registered() {
            safe_fail(&promise, ChannelError::AlreadyRegistered);
            return;
        }
        if !promise.set_uncancellable() {
            return;
        }
        *self.inner.event_loop.write() = Some(event_loop);
        if !self.ensure_open(&promise) {
            return;
        }
        let first_registration = {
            let mut lc = self.inner.lifecycle.lock();
            let first = lc.never_registered;
            lc.never_registered = false;
            first
        };
        if let Err(e) = self.inner.transport.do_register() {
            self.close_forcibly();
            safe_fail(&promise, e.into());
            return;
        }
        self.inner.registered.store(true, Ordering::Release);
        self.refresh_addresses();
        debug!(id = %self.id(), first = first_registration, "channel registered");
        safe_succeed(&promise, ());
        self.inner.pipeline.fire_channel_registered();
        if self.is_active() {
            // First registration fires channel_active; later ones only
            // restart reading.
            self.mark_active_and_fire();
        }
    }

    /// Deregister from the current loop. The actual deregistration is
    /// deferred through the task queue so it never runs beneath a handler.
    pub fn deregister(&self) -> Promise<()> {
        let promise = Promise::new();
        self.run_on_loop(&promise, |channel, promise| {
            promise.set_uncancellable();
            let inner_channel = channel.clone();
            channel.invoke_later(move || {
                inner_channel.deregister_now(true);
                safe_succeed(&promise, ());
            });
        });
        promise
    }

    fn deregister_now(&self, fire: bool) {
        self.assert_loop();
        if !self.inner.registered.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.inner.transport.do_deregister() {
            warn!(id = %self.id(), error = %e, "transport deregistration failed");
        }
        self.inner.transport.do_clear_scheduled_read();
        {
            let mut lc = self.inner.lifecycle.lock();
            lc.pending_read = None;
            lc.read_handle = None;
        }
        debug!(id = %self.id(), "channel deregistered");
        if fire {
            self.inner.pipeline.fire_channel_unregistered();
        }
        if !self.is_open() {
            self.inner.pipeline.clear();
        }
    }

    // ---- bind / connect ------------------------------------------------

    /// Bind the transport to a local address.
    pub fn bind(&self, addr: Endpoint) -> Promise<()> {
        let promise = Promise::new();
        self.run_on_loop(&promise, move |channel, promise| {
            channel.bind_now(&addr, promise);
        });
        promise
    }

    fn bind_now(&self, addr: &Endpoint, promise: Promise<()>) {
        self.assert_loop();
        if !promise.set_uncancellable() {
            return;
        }
        if !self.ensure_open(&promise) {
            return;
        }
        if self.inner.transport.is_broadcast() && !addr.is_wildcard() {
            warn!(
                id = %self.id(),
                %addr,
                "binding a broadcast transport to a non-wildcard address; \
                 datagrams may not reach it without elevated privileges"
            );
        }
        let was_active = self.is_active();
        if let Err(e) = self.inner.transport.do_bind(addr) {
            safe_fail(&promise, e.into());
            self.close_if_closed();
            return;
        }
        self.refresh_addresses();
        debug!(id = %self.id(), %addr, "channel bound");
        if !was_active && self.is_active() {
            let channel = self.clone();
            self.invoke_later(move || channel.mark_active_and_fire());
        }
        safe_succeed(&promise, ());
    }

    /// Connect to a remote address.
    pub fn connect(&self, remote: Endpoint) -> Promise<()> {
        self.connect_with_local(remote, None)
    }

    /// Connect with an explicit local address.
    pub fn connect_with_local(&self, remote: Endpoint, local: Option<Endpoint>) -> Promise<()> {
        let promise = Promise::new();
        self.run_on_loop(&promise, move |channel, promise| {
            channel.connect_now(remote, local, promise);
        });
        promise
    }

    fn connect_now(&self, remote: Endpoint, local: Option<Endpoint>, promise: Promise<()>) {
        self.assert_loop();
        if !self.ensure_open(&promise) {
            return;
        }
        if self.inner.lifecycle.lock().connect_promise.is_some() {
            safe_fail(&promise, ChannelError::ConnectionPending);
            return;
        }
        if self.is_active() {
            safe_fail(&promise, ChannelError::AlreadyConnected);
            return;
        }
        // Fast-open: promote queued writes and hand the head of the flushed
        // region to the transport as connect payload.
        let initial = if self.inner.transport.fast_open_connect() {
            self.with_outbound(|buf| {
                buf.and_then(|b| {
                    b.add_flush();
                    b.current().and_then(Message::as_bytes).cloned()
                })
            })
        } else {
            None
        };
        match self.inner.transport.do_connect(&remote, local.as_ref(), initial) {
            Ok(ConnectStart::Done { initial_sent }) => {
                if initial_sent > 0 {
                    let batch = self.with_outbound(|buf| {
                        buf.map(|b| b.remove_bytes(initial_sent).0)
                    });
                    if let Some(batch) = batch {
                        dispatch_finished(batch);
                    }
                    self.update_writability(true);
                }
                self.fulfill_connect(promise);
            }
            Ok(ConnectStart::Pending) => {
                let timeout = self.inner.options.connect_timeout();
                let timer = if timeout > Duration::ZERO {
                    let channel = self.clone();
                    let timeout_remote = remote.clone();
                    self.executor().ok().map(|event_loop| {
                        event_loop
                            .schedule(timeout, move || channel.connect_timed_out(&timeout_remote))
                    })
                } else {
                    None
                };
                {
                    let mut lc = self.inner.lifecycle.lock();
                    lc.connect_promise = Some(promise.clone());
                    lc.requested_remote = Some(remote);
                    lc.connect_timeout = timer;
                }
                // User cancellation aborts the connect and closes.
                let channel = self.clone();
                promise.on_complete(move |result| {
                    if matches!(result, Err(ChannelError::Cancelled)) {
                        let target = channel.clone();
                        if let Ok(event_loop) = channel.executor() {
                            event_loop.execute_task(move || target.connect_cancelled());
                        }
                    }
                });
            }
            Err(e) => {
                safe_fail(&promise, annotate_connect_error(e, &remote));
                self.close_if_closed();
            }
        }
    }

    /// Called by the transport when a pending connect completes.
    pub fn finish_connect(&self) {
        self.assert_loop();
        let (promise, requested) = {
            let lc = self.inner.lifecycle.lock();
            (lc.connect_promise.clone(), lc.requested_remote.clone())
        };
        let (Some(promise), Some(requested)) = (promise, requested) else {
            trace!(id = %self.id(), "finish_connect without a pending connect");
            return;
        };
        match self.inner.transport.do_finish_connect(&requested) {
            Ok(false) => {} // still pending; timeout stays armed
            Ok(true) => {
                self.clear_connect_state();
                self.fulfill_connect(promise);
            }
            Err(e) => {
                self.clear_connect_state();
                safe_fail(&promise, annotate_connect_error(e, &requested));
                self.close_if_closed();
            }
        }
    }

    fn fulfill_connect(&self, promise: Promise<()>) {
        self.refresh_addresses();
        let promise_set = promise.succeed(());
        if self.is_active() {
            self.mark_active_and_fire();
        }
        if !promise_set {
            // Cancelled while the connect was completing.
            self.close();
        }
    }

    fn clear_connect_state(&self) {
        let timer = {
            let mut lc = self.inner.lifecycle.lock();
            lc.connect_promise = None;
            lc.requested_remote = None;
            lc.connect_timeout.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    fn connect_timed_out(&self, remote: &Endpoint) {
        self.assert_loop();
        let promise = self.inner.lifecycle.lock().connect_promise.clone();
        if let Some(promise) = promise {
            if promise.fail(ChannelError::ConnectTimeout {
                addr: remote.to_string(),
            }) {
                debug!(id = %self.id(), %remote, "connect timed out");
                self.clear_connect_state();
                self.close();
            }
        }
    }

    fn connect_cancelled(&self) {
        self.assert_loop();
        let should_close = {
            let mut lc = self.inner.lifecycle.lock();
            match &lc.connect_promise {
                Some(promise) if promise.is_cancelled() => {
                    lc.connect_promise = None;
                    lc.requested_remote = None;
                    if let Some(timer) = lc.connect_timeout.take() {
                        timer.cancel();
                    }
                    true
                }
                _ => false,
            }
        };
        if should_close {
            debug!(id = %self.id(), "connect cancelled by user, closing");
            self.close();
        }
    }

    /// Disconnect a connection-less transport. Falls back to `close()` when
    /// the transport does not support disconnect.
    pub fn disconnect(&self) -> Promise<()> {
        let promise = Promise::new();
        self.run_on_loop(&promise, |channel, promise| channel.disconnect_now(promise));
        promise
    }

    fn disconnect_now(&self, promise: Promise<()>) {
        self.assert_loop();
        if !self.inner.transport.supports_disconnect() {
            self.close_now(promise, None);
            return;
        }
        if !promise.set_uncancellable() {
            return;
        }
        let was_active = self.is_active();
        if let Err(e) = self.inner.transport.do_disconnect() {
            safe_fail(&promise, e.into());
            self.close_if_closed();
            return;
        }
        *self.inner.local_addr.lock() = None;
        *self.inner.remote_addr.lock() = None;
        // A later reconnect activates the channel again, so the active
        // latch re-arms.
        self.inner.lifecycle.lock().never_active = true;
        if was_active && !self.is_active() {
            let channel = self.clone();
            self.invoke_later(move || channel.inner.pipeline.fire_channel_inactive());
        }
        safe_succeed(&promise, ());
        self.close_if_closed();
    }

    // ---- shutdown / close ----------------------------------------------

    /// Shut down one direction of the channel.
    pub fn shutdown(&self, direction: ShutdownDirection) -> Promise<()> {
        let promise = Promise::new();
        self.run_on_loop(&promise, move |channel, promise| {
            channel.shutdown_now(direction, promise);
        });
        promise
    }

    fn shutdown_now(&self, direction: ShutdownDirection, promise: Promise<()>) {
        self.assert_loop();
        if !promise.set_uncancellable() {
            return;
        }
        if !self.is_open() {
            safe_fail(&promise, self.closed_error());
            return;
        }
        if !self.is_active() {
            safe_fail(&promise, ChannelError::NotYetConnected);
            return;
        }
        if self.inner.transport.is_shutdown(direction) {
            safe_succeed(&promise, ());
            return;
        }
        match direction {
            ShutdownDirection::Outbound => {
                // Reject further writes before touching the transport.
                let taken = self.inner.outbound.lock().take();
                let result = self.inner.transport.do_shutdown(direction);
                if let Some(mut buf) = taken {
                    let batch = buf.fail_flushed_and_close(
                        &ChannelError::OutputShutdown,
                        &ChannelError::OutputShutdown,
                    );
                    dispatch_finished(batch);
                }
                if let Err(e) = result {
                    safe_fail(&promise, e.into());
                    return;
                }
            }
            ShutdownDirection::Inbound => {
                if let Err(e) = self.inner.transport.do_shutdown(direction) {
                    safe_fail(&promise, e.into());
                    return;
                }
            }
        }
        debug!(id = %self.id(), ?direction, "channel direction shut down");
        safe_succeed(&promise, ());
        let channel = self.clone();
        self.invoke_later(move || channel.inner.pipeline.fire_channel_shutdown(direction));
    }

    /// Close the channel. Idempotent: later calls attach to the same close.
    pub fn close(&self) -> Promise<()> {
        let promise = Promise::new();
        self.run_on_loop(&promise, |channel, promise| channel.close_now(promise, None));
        promise
    }

    /// Close carrying the failure that caused it; queued writes fail with
    /// that cause.
    pub(crate) fn close_with_cause(&self, cause: ChannelError) -> Promise<()> {
        let promise = Promise::new();
        self.run_on_loop(&promise, move |channel, promise| {
            channel.close_now(promise, Some(cause));
        });
        promise
    }

    fn close_now(&self, promise: Promise<()>, cause: Option<ChannelError>) {
        self.assert_loop();
        promise.set_uncancellable();
        let already_initiated = {
            let mut lc = self.inner.lifecycle.lock();
            if lc.close_initiated {
                true
            } else {
                lc.close_initiated = true;
                lc.initial_close_cause = cause.clone();
                false
            }
        };
        if already_initiated {
            self.inner
                .close_promise
                .on_complete(move |_| safe_succeed(&promise, ()));
            return;
        }
        debug!(id = %self.id(), "closing channel");
        let was_active = self.is_active();
        let taken = self.inner.outbound.lock().take();

        // A pending connect dies with the channel.
        let pending_connect = {
            let mut lc = self.inner.lifecycle.lock();
            let promise = lc.connect_promise.take();
            lc.requested_remote = None;
            let timer = lc.connect_timeout.take();
            (promise, timer)
        };
        if let Some(timer) = pending_connect.1 {
            timer.cancel();
        }
        if let Some(connect_promise) = pending_connect.0 {
            safe_fail(&connect_promise, ChannelError::closed_with(cause.clone()));
        }

        let flushed_cause = cause.clone().unwrap_or_else(ChannelError::closed);
        let unflushed_cause = ChannelError::closed_with(cause);

        match self.inner.transport.prepare_to_close() {
            Some(executor) => {
                let channel = self.clone();
                executor.execute(Box::new(move || {
                    channel.inner.transport.do_close();
                    let finisher = channel.clone();
                    if let Ok(event_loop) = channel.executor() {
                        event_loop.execute_task(move || {
                            finisher.finish_close(
                                promise,
                                taken,
                                was_active,
                                flushed_cause,
                                unflushed_cause,
                            );
                        });
                    }
                }));
            }
            None => {
                self.inner.transport.do_close();
                self.finish_close(promise, taken, was_active, flushed_cause, unflushed_cause);
            }
        }
    }

    fn finish_close(
        &self,
        promise: Promise<()>,
        taken: Option<OutboundBuffer>,
        was_active: bool,
        flushed_cause: ChannelError,
        unflushed_cause: ChannelError,
    ) {
        self.assert_loop();
        self.inner.close_promise.force_succeed(());
        safe_succeed(&promise, ());
        if let Some(mut buf) = taken {
            let batch = buf.fail_flushed_and_close(&flushed_cause, &unflushed_cause);
            dispatch_finished(batch);
        }
        let fire_inactive = was_active && !self.is_active();
        let channel = self.clone();
        self.invoke_later(move || {
            if fire_inactive {
                channel.inner.pipeline.fire_channel_inactive();
            }
            channel.deregister_now(true);
        });
    }

    /// Immediate transport close without the graceful event sequence. Used
    /// when registration fails.
    fn close_forcibly(&self) {
        self.inner.lifecycle.lock().close_initiated = true;
        self.inner.transport.do_close();
        let taken = self.inner.outbound.lock().take();
        if let Some(mut buf) = taken {
            let closed = ChannelError::closed();
            let batch = buf.fail_flushed_and_close(&closed, &closed);
            dispatch_finished(batch);
        }
        self.inner.close_promise.force_succeed(());
    }

    /// Run the graceful close sequence iff the transport already reports
    /// closed (failure cleanup paths).
    fn close_if_closed(&self) {
        if !self.is_open() {
            self.close();
        }
    }

    // ---- read path -----------------------------------------------------

    /// Request a read with the default buffer sizing.
    pub fn read(&self) {
        self.read_with(Arc::new(HandleSizedReadAllocator));
    }

    /// Request a read with an explicit buffer allocator for this read.
    pub fn read_with(&self, allocator: Arc<dyn ReadBufferAllocator>) {
        match self.executor() {
            Err(_) => warn!(id = %self.id(), "read requested before registration, ignoring"),
            Ok(event_loop) => {
                if event_loop.in_event_loop() {
                    self.read_transport(allocator);
                } else {
                    let channel = self.clone();
                    event_loop.execute_task(move || channel.read_transport(allocator));
                }
            }
        }
    }

    fn read_transport(&self, allocator: Arc<dyn ReadBufferAllocator>) {
        self.assert_loop();
        if !self.is_active() {
            // Replayed once the channel becomes active.
            self.inner.lifecycle.lock().read_before_active = Some(allocator);
            return;
        }
        if self.inner.transport.is_shutdown(ShutdownDirection::Inbound) {
            return;
        }
        let was_pending = {
            let mut lc = self.inner.lifecycle.lock();
            let was = lc.pending_read.is_some();
            lc.pending_read = Some(allocator);
            was
        };
        if let Err(e) = self.inner.transport.do_read(was_pending) {
            let channel = self.clone();
            let error = ChannelError::from(e);
            self.invoke_later(move || {
                channel.inner.pipeline.fire_channel_exception(error);
                channel.close();
            });
        }
    }

    /// Called by the transport when inbound data is available. Runs one
    /// read batch through the sink and the pipeline.
    pub fn read_now(&self) {
        self.assert_loop();
        {
            let lc = self.inner.lifecycle.lock();
            if self.inner.transport.is_shutdown(ShutdownDirection::Inbound)
                && (lc.input_closed_seen_error || !self.inner.options.allow_half_closure())
            {
                drop(lc);
                self.clear_scheduled_read();
                return;
            }
        }
        let (taken_handle, allocator) = {
            let mut lc = self.inner.lifecycle.lock();
            (lc.read_handle.take(), lc.pending_read.clone())
        };
        let mut handle = taken_handle
            .unwrap_or_else(|| self.inner.options.read_handle_factory().new_handle());
        let allocator: Arc<dyn ReadBufferAllocator> =
            allocator.unwrap_or_else(|| Arc::new(HandleSizedReadAllocator));
        let buffer_allocator = self.inner.options.allocator();

        let mut sink = ReadSink::new(self, handle.as_mut(), allocator, buffer_allocator);
        let result = self.inner.transport.do_read_now(&mut sink);
        let read_any = sink.read_any();
        let messages = sink.messages();
        drop(sink);

        if read_any {
            handle.read_complete();
        }
        self.inner.lifecycle.lock().read_handle = Some(handle);
        if read_any {
            trace!(id = %self.id(), messages, "read batch complete");
            self.inner.pipeline.fire_channel_read_complete();
        }

        match result {
            Ok(shutdown_read_side) => {
                self.read_loop_complete();
                if shutdown_read_side {
                    self.shutdown_read_side();
                }
            }
            Err(e) => self.handle_read_error(e),
        }
    }

    fn read_loop_complete(&self) {
        if self.inner.options.auto_read() {
            self.read();
        } else {
            let still_pending = self.inner.lifecycle.lock().pending_read.is_some();
            if still_pending {
                self.clear_scheduled_read();
            }
        }
    }

    fn clear_scheduled_read(&self) {
        self.inner.lifecycle.lock().pending_read = None;
        self.inner.transport.do_clear_scheduled_read();
    }

    /// The transport hit EOF: half-close the read side when allowed,
    /// otherwise close the channel.
    fn shutdown_read_side(&self) {
        if self.inner.options.allow_half_closure() {
            if self.inner.transport.is_shutdown(ShutdownDirection::Inbound) {
                return;
            }
            match self.inner.transport.do_shutdown(ShutdownDirection::Inbound) {
                Ok(()) => {
                    self.clear_scheduled_read();
                    let channel = self.clone();
                    self.invoke_later(move || {
                        channel
                            .inner
                            .pipeline
                            .fire_channel_shutdown(ShutdownDirection::Inbound);
                    });
                }
                Err(e) => {
                    self.close_with_cause(e.into());
                }
            }
        } else {
            self.close();
        }
    }

    fn handle_read_error(&self, e: std::io::Error) {
        let cause = ChannelError::from(e);
        debug!(id = %self.id(), error = %cause, "read failed");
        self.inner.pipeline.fire_channel_exception(cause.clone());
        if cause.is_transient() {
            // Port-unreachable-style blips: keep reading.
            return;
        }
        if self.inner.transport.is_server() {
            // Accept failures don't tear the listener down.
            return;
        }
        self.inner.lifecycle.lock().input_closed_seen_error = true;
        self.shutdown_read_side();
    }

    // ---- write path ----------------------------------------------------

    /// Queue a message for writing. The returned promise completes when the
    /// transport consumed the message, or fails when the channel cannot
    /// accept writes.
    pub fn write(&self, msg: impl Into<Message>) -> Promise<()> {
        let promise = Promise::new();
        let msg = msg.into();
        match self.executor() {
            Err(e) => {
                dispose(msg);
                safe_fail(&promise, e);
            }
            Ok(event_loop) => {
                if event_loop.in_event_loop() {
                    self.write_now(msg, promise.clone());
                } else {
                    let channel = self.clone();
                    let task_promise = promise.clone();
                    event_loop.execute_task(move || channel.write_now(msg, task_promise));
                }
            }
        }
        promise
    }

    fn write_now(&self, msg: Message, promise: Promise<()>) {
        self.assert_loop();
        if self.inner.outbound.lock().is_none() {
            let err = if self.is_active() {
                ChannelError::OutputShutdown
            } else {
                self.closed_error()
            };
            dispose(msg);
            safe_fail(&promise, err);
            return;
        }
        let msg = match self.inner.transport.filter_outbound_message(msg) {
            Ok(msg) => msg,
            Err(e) => {
                // The filter consumed the message.
                safe_fail(&promise, e);
                return;
            }
        };
        let size = self
            .inner
            .options
            .message_size_estimator()
            .size_of(&msg)
            .max(0) as usize;
        let rejected = {
            let mut guard = self.inner.outbound.lock();
            match guard.as_mut() {
                Some(buf) => {
                    buf.add_message(msg, size, promise.clone());
                    None
                }
                // The filter closed the channel out from under us.
                None => Some(msg),
            }
        };
        if let Some(msg) = rejected {
            dispose(msg);
            let err = if self.is_active() {
                ChannelError::OutputShutdown
            } else {
                self.closed_error()
            };
            safe_fail(&promise, err);
            return;
        }
        self.update_writability(true);
    }

    /// Promote queued writes to the flushed region and kick the write loop.
    pub fn flush(&self) {
        match self.executor() {
            Err(_) => {}
            Ok(event_loop) => {
                if event_loop.in_event_loop() {
                    self.flush_now();
                } else {
                    let channel = self.clone();
                    event_loop.execute_task(move || channel.flush_now());
                }
            }
        }
    }

    fn flush_now(&self) {
        self.assert_loop();
        {
            let mut guard = self.inner.outbound.lock();
            match guard.as_mut() {
                Some(buf) => buf.add_flush(),
                None => return,
            }
        }
        if !self.inner.transport.is_write_flushed_scheduled() {
            self.write_flushed_now();
        }
    }

    /// `write` + `flush` in one call.
    pub fn write_and_flush(&self, msg: impl Into<Message>) -> Promise<()> {
        let promise = self.write(msg);
        self.flush();
        promise
    }

    /// Drive the write loop. Called internally by `flush` and by transports
    /// when they become writable again. Non-reentrant.
    pub fn write_flushed_now(&self) {
        self.assert_loop();
        {
            let mut lc = self.inner.lifecycle.lock();
            if lc.in_write_flushed {
                return;
            }
            lc.in_write_flushed = true;
        }
        let result = self.write_loop();
        self.inner.lifecycle.lock().in_write_flushed = false;
        if let Err(e) = result {
            self.handle_write_error(e);
        }
    }

    fn flushed_is_empty(&self) -> bool {
        self.with_outbound(|buf| buf.map_or(true, |b| b.flushed_count() == 0))
    }

    fn write_loop(&self) -> std::io::Result<()> {
        if self.flushed_is_empty() {
            return Ok(());
        }
        if !self.is_active() {
            let cause = if self.is_open() {
                ChannelError::NotYetConnected
            } else {
                self.closed_error()
            };
            let batch = self.with_outbound(|buf| buf.map(|b| b.fail_flushed(&cause)));
            if let Some(batch) = batch {
                dispatch_finished(batch);
            }
            self.update_writability(true);
            return Ok(());
        }

        let mut handle = {
            let mut lc = self.inner.lifecycle.lock();
            lc.write_handle.take()
        }
        .unwrap_or_else(|| self.inner.options.write_handle_factory().new_handle());

        let mut all_written = false;
        let mut io_error = None;
        loop {
            if self.flushed_is_empty() {
                all_written = true;
                break;
            }
            let mut sink = WriteSink::new(self, handle.as_mut());
            let hook_result = self.inner.transport.do_write_now(&mut sink);
            let completion = sink.take_completion();
            drop(sink);

            if let Err(e) = hook_result {
                io_error = Some(e);
                break;
            }
            let Some(completion) = completion else {
                warn!(id = %self.id(), "do_write_now returned without completing the sink");
                break;
            };
            match completion {
                WriteCompletion::Progress {
                    attempted,
                    written,
                    messages,
                    continue_hint,
                } => {
                    let (batch, removed) = self.with_outbound(|buf| match buf {
                        Some(b) => match messages {
                            None => b.remove_bytes(written),
                            Some(n) => {
                                let mut batch = FinishedBatch::new();
                                for _ in 0..n {
                                    match b.remove() {
                                        Some(done) => batch.push(done),
                                        None => break,
                                    }
                                }
                                let removed = batch.len();
                                (batch, removed)
                            }
                        },
                        None => (FinishedBatch::new(), 0),
                    });
                    dispatch_finished(batch);
                    let keep_going = handle.last_write(attempted, written, removed);
                    if !(continue_hint && keep_going) {
                        all_written = self.flushed_is_empty();
                        break;
                    }
                }
                WriteCompletion::Failure {
                    cause,
                    continue_hint,
                } => {
                    let done = self.with_outbound(|buf| buf.and_then(|b| b.remove_err(cause.clone())));
                    if let Some(done) = done {
                        done.dispatch();
                    }
                    if !continue_hint {
                        all_written = self.flushed_is_empty();
                        break;
                    }
                }
            }
        }

        if !all_written && io_error.is_none() && !self.inner.transport.is_write_flushed_scheduled() {
            // The transport stopped early: another round once the loop
            // drains its queue.
            let channel = self.clone();
            self.invoke_later(move || channel.write_flushed_now());
        }
        handle.write_complete();
        self.inner.lifecycle.lock().write_handle = Some(handle);
        self.update_writability(true);
        match io_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handle_write_error(&self, e: std::io::Error) {
        let cause = ChannelError::from(e);
        warn!(id = %self.id(), error = %cause, "write failed");
        if self.inner.options.auto_close() {
            self.close_with_cause(cause);
            return;
        }
        // Keep the inbound side alive: shut down output only, escalating to
        // a full close if even that fails.
        let taken = self.inner.outbound.lock().take();
        if let Some(mut buf) = taken {
            let batch = buf.fail_flushed_and_close(&cause, &ChannelError::OutputShutdown);
            dispatch_finished(batch);
        }
        if self.inner.transport.is_shutdown(ShutdownDirection::Outbound) {
            return;
        }
        match self.inner.transport.do_shutdown(ShutdownDirection::Outbound) {
            Ok(()) => {
                let channel = self.clone();
                self.invoke_later(move || {
                    channel
                        .inner
                        .pipeline
                        .fire_channel_shutdown(ShutdownDirection::Outbound);
                });
            }
            Err(shutdown_err) => {
                self.close_with_cause(shutdown_err.into());
            }
        }
    }

    // ---- writability ---------------------------------------------------

    /// Re-evaluate the writable flag against the watermarks, firing
    /// `channel_writability_changed` exactly on transitions.
    fn update_writability(&self, defer: bool) {
        let total = self.inner.pending_bytes.load(Ordering::Acquire);
        let water_mark = self.inner.options.water_mark();
        let flipped = if total > water_mark.high() {
            self.inner
                .writable
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else if total < water_mark.low() {
            self.inner
                .writable
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            // Between the thresholds the flag is sticky.
            false
        };
        if flipped {
            if defer {
                let channel = self.clone();
                self.invoke_later(move || {
                    let writable = channel.inner.writable.load(Ordering::Acquire);
                    channel
                        .inner
                        .pipeline
                        .fire_channel_writability_changed(writable);
                });
            } else {
                let writable = self.inner.writable.load(Ordering::Acquire);
                self.inner.pipeline.fire_channel_writability_changed(writable);
            }
        }
    }

    // ---- options -------------------------------------------------------

    /// Apply a typed option. Unknown extensions are offered to the
    /// transport; anything it refuses reports unsupported.
    pub fn set_option(&self, option: ChannelOption) -> Result<(), ChannelError> {
        match option {
            ChannelOption::AutoRead(enabled) => {
                let was = self.inner.options.set_auto_read(enabled);
                if was && !enabled {
                    // Stop reading; marshalled onto the loop when needed.
                    match self.executor() {
                        Ok(event_loop) if !event_loop.in_event_loop() => {
                            let channel = self.clone();
                            event_loop.execute_task(move || channel.clear_scheduled_read());
                        }
                        Ok(_) => self.clear_scheduled_read(),
                        Err(_) => {}
                    }
                } else if !was && enabled {
                    self.read();
                }
                Ok(())
            }
            ChannelOption::AutoClose(enabled) => {
                self.inner.options.set_auto_close(enabled);
                Ok(())
            }
            ChannelOption::AllowHalfClosure(enabled) => {
                self.inner.options.set_allow_half_closure(enabled);
                Ok(())
            }
            ChannelOption::ConnectTimeout(timeout) => {
                self.inner.options.set_connect_timeout(timeout);
                Ok(())
            }
            ChannelOption::WriteBufferWaterMark(water_mark) => {
                self.inner.options.set_water_mark(water_mark);
                Ok(())
            }
            ChannelOption::BufferAllocator(allocator) => {
                self.inner.options.set_allocator(allocator);
                Ok(())
            }
            ChannelOption::ReadHandleFactory(factory) => {
                self.inner.options.set_read_handle_factory(factory);
                Ok(())
            }
            ChannelOption::WriteHandleFactory(factory) => {
                self.inner.options.set_write_handle_factory(factory);
                Ok(())
            }
            ChannelOption::MessageSizeEstimator(estimator) => {
                self.inner.options.set_message_size_estimator(estimator);
                Ok(())
            }
            ChannelOption::Extension { name, value } => {
                self.inner.transport.set_extended_option(&name, value)
            }
        }
    }
}

/// Weak counterpart of [`Channel`]; upgrade to interact.
#[derive(Clone)]
pub struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    #[must_use]
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(Channel::from_inner)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Channel {}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.id.cmp(&other.inner.id)
    }
}

impl std::hash::Hash for Channel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("registered", &self.is_registered())
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .finish()
    }
}
