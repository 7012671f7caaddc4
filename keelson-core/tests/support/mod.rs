//! Shared test support: a scriptable in-memory transport plus small
//! helpers for driving channels from test threads.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use keelson_core::channel::{Channel, WeakChannel};
use keelson_core::endpoint::Endpoint;
use keelson_core::error::ChannelError;
use keelson_core::event_loop::EventLoop;
use keelson_core::message::Message;
use keelson_core::monitor::{create_monitor, ChannelEvent, ChannelMonitor, MonitorHandler};
use keelson_core::options::ChannelOptions;
use keelson_core::event_loop::TaskExecutor;
use keelson_core::promise::Promise;
use keelson_core::sink::{ReadSink, WriteSink};
use keelson_core::transport::{ConnectStart, ShutdownDirection, Transport};

/// One scripted `do_write_now` outcome.
pub enum WriteBehavior {
    /// Byte-account everything currently flushed.
    WriteAll,
    /// Partial gathering write of exactly `n` bytes.
    WriteBytes(usize),
    /// Fail the head entry, keep going.
    FailHead(ChannelError),
    /// The hook itself errors.
    IoError(io::ErrorKind),
    /// Write nothing and stop the loop.
    Stall,
}

pub struct MockState {
    pub open: AtomicBool,
    pub active: AtomicBool,
    pub input_shutdown: AtomicBool,
    pub output_shutdown: AtomicBool,
    pub server: AtomicBool,
    pub disconnect_support: AtomicBool,
    pub fast_open: AtomicBool,
    pub activate_on_bind: AtomicBool,
    pub calls: Mutex<Vec<String>>,
    pub connect_script: Mutex<VecDeque<io::Result<ConnectStart>>>,
    pub finish_script: Mutex<VecDeque<io::Result<bool>>>,
    pub write_script: Mutex<VecDeque<WriteBehavior>>,
    pub written: Mutex<Vec<Bytes>>,
    pub inbound: Mutex<VecDeque<Message>>,
    pub eof: AtomicBool,
    pub read_error: Mutex<Option<io::Error>>,
    pub initial_seen: Mutex<Option<Bytes>>,
    pub channel: Mutex<Option<WeakChannel>>,
    pub close_executor: Mutex<Option<Arc<dyn TaskExecutor>>>,
}

impl MockState {
    pub fn new(open: bool, active: bool) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(open),
            active: AtomicBool::new(active),
            input_shutdown: AtomicBool::new(false),
            output_shutdown: AtomicBool::new(false),
            server: AtomicBool::new(false),
            disconnect_support: AtomicBool::new(false),
            fast_open: AtomicBool::new(false),
            activate_on_bind: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            connect_script: Mutex::new(VecDeque::new()),
            finish_script: Mutex::new(VecDeque::new()),
            write_script: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
            eof: AtomicBool::new(false),
            read_error: Mutex::new(None),
            initial_seen: Mutex::new(None),
            channel: Mutex::new(None),
            close_executor: Mutex::new(None),
        })
    }

    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn saw_call(&self, name: &str) -> bool {
        self.calls.lock().iter().any(|c| c == name)
    }

    fn channel(&self) -> Option<Channel> {
        self.channel.lock().as_ref().and_then(WeakChannel::upgrade)
    }

    /// Post a `read_now` onto the owning loop, as a readiness backend
    /// would.
    pub fn signal_readable(&self) {
        let Some(channel) = self.channel() else { return };
        let Some(event_loop) = channel.event_loop() else {
            return;
        };
        event_loop.execute_task(move || channel.read_now());
    }
}

pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(state: Arc<MockState>) -> Self {
        Self { state }
    }
}

impl Transport for MockTransport {
    fn attach(&self, channel: &Channel) {
        *self.state.channel.lock() = Some(channel.downgrade());
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    fn is_shutdown(&self, direction: ShutdownDirection) -> bool {
        if !self.is_open() {
            return true;
        }
        match direction {
            ShutdownDirection::Inbound => self.state.input_shutdown.load(Ordering::Acquire),
            ShutdownDirection::Outbound => self.state.output_shutdown.load(Ordering::Acquire),
        }
    }

    fn is_server(&self) -> bool {
        self.state.server.load(Ordering::Acquire)
    }

    fn supports_disconnect(&self) -> bool {
        self.state.disconnect_support.load(Ordering::Acquire)
    }

    fn fast_open_connect(&self) -> bool {
        self.state.fast_open.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<Endpoint> {
        None
    }

    fn remote_addr(&self) -> Option<Endpoint> {
        None
    }

    fn do_register(&self) -> io::Result<()> {
        self.state.record("register");
        Ok(())
    }

    fn do_deregister(&self) -> io::Result<()> {
        self.state.record("deregister");
        Ok(())
    }

    fn do_bind(&self, addr: &Endpoint) -> io::Result<()> {
        self.state.record(format!("bind:{addr}"));
        if self.state.activate_on_bind.load(Ordering::Acquire) {
            self.state.active.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn do_connect(
        &self,
        remote: &Endpoint,
        _local: Option<&Endpoint>,
        initial_data: Option<Bytes>,
    ) -> io::Result<ConnectStart> {
        self.state.record(format!("connect:{remote}"));
        *self.state.initial_seen.lock() = initial_data;
        let scripted = self.state.connect_script.lock().pop_front();
        let result = scripted.unwrap_or(Ok(ConnectStart::Pending));
        if let Ok(ConnectStart::Done { .. }) = &result {
            self.state.active.store(true, Ordering::Release);
        }
        result
    }

    fn do_finish_connect(&self, requested_remote: &Endpoint) -> io::Result<bool> {
        self.state.record(format!("finish_connect:{requested_remote}"));
        let scripted = self.state.finish_script.lock().pop_front();
        let result = scripted.unwrap_or(Ok(true));
        if let Ok(true) = &result {
            self.state.active.store(true, Ordering::Release);
        }
        result
    }

    fn do_disconnect(&self) -> io::Result<()> {
        self.state.record("disconnect");
        self.state.active.store(false, Ordering::Release);
        Ok(())
    }

    fn do_shutdown(&self, direction: ShutdownDirection) -> io::Result<()> {
        self.state.record(format!("shutdown:{direction:?}"));
        match direction {
            ShutdownDirection::Inbound => {
                self.state.input_shutdown.store(true, Ordering::Release);
            }
            ShutdownDirection::Outbound => {
                self.state.output_shutdown.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    fn do_close(&self) {
        self.state.record("close");
        self.state.open.store(false, Ordering::Release);
        self.state.active.store(false, Ordering::Release);
    }

    fn do_read(&self, was_pending: bool) -> io::Result<()> {
        self.state.record(format!("read:{was_pending}"));
        let has_data = !self.state.inbound.lock().is_empty();
        if has_data || self.state.eof.load(Ordering::Acquire) {
            self.state.signal_readable();
        }
        Ok(())
    }

    fn do_read_now(&self, sink: &mut ReadSink<'_>) -> io::Result<bool> {
        if let Some(e) = self.state.read_error.lock().take() {
            return Err(e);
        }
        loop {
            let msg = self.state.inbound.lock().pop_front();
            let Some(msg) = msg else { break };
            let size = msg.as_bytes().map_or(8, Bytes::len);
            if !sink.process_read(size, size, Some(msg)) {
                break;
            }
        }
        let drained = self.state.inbound.lock().is_empty();
        Ok(drained && self.state.eof.load(Ordering::Acquire))
    }

    fn do_write_now(&self, sink: &mut WriteSink<'_>) -> io::Result<()> {
        let behavior = self
            .state
            .write_script
            .lock()
            .pop_front()
            .unwrap_or(WriteBehavior::WriteAll);
        match behavior {
            WriteBehavior::WriteAll => {
                let (segments, total) = sink.gather_bytes(usize::MAX);
                self.state.written.lock().extend(segments);
                sink.complete(total, total, None, true);
            }
            WriteBehavior::WriteBytes(n) => {
                let (_, total) = sink.gather_bytes(usize::MAX);
                sink.complete(total, n.min(total), None, false);
            }
            WriteBehavior::FailHead(cause) => {
                sink.complete_with_error(cause, true);
            }
            WriteBehavior::IoError(kind) => {
                return Err(io::Error::from(kind));
            }
            WriteBehavior::Stall => {
                sink.complete(0, 0, Some(0), false);
            }
        }
        Ok(())
    }

    fn do_clear_scheduled_read(&self) {
        self.state.record("clear_scheduled_read");
    }

    fn prepare_to_close(&self) -> Option<Arc<dyn TaskExecutor>> {
        self.state.close_executor.lock().clone()
    }
}

/// Run a closure on the loop and wait for its result.
pub fn run_on<T: Send + 'static>(
    event_loop: &Arc<EventLoop>,
    f: impl FnOnce() -> T + Send + 'static,
) -> T {
    let (tx, rx) = flume::bounded(1);
    event_loop.execute_task(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("loop task completed")
}

/// Wait for a promise with the standard test timeout.
pub fn await_done(promise: &Promise<()>) -> Result<(), ChannelError> {
    promise.wait(Duration::from_secs(5)).expect("promise completed")
}

pub fn expect_event(monitor: &ChannelMonitor) -> ChannelEvent {
    monitor
        .recv_timeout(Duration::from_secs(5))
        .expect("expected a channel event")
}

pub fn expect_no_event(monitor: &ChannelMonitor) {
    if let Ok(event) = monitor.recv_timeout(Duration::from_millis(80)) {
        panic!("unexpected channel event: {event:?}");
    }
}

/// Build a channel over a mock transport with a monitor as its only
/// handler.
pub fn monitored_channel(
    state: &Arc<MockState>,
    options: ChannelOptions,
) -> (Channel, ChannelMonitor) {
    let channel = Channel::with_options(Box::new(MockTransport::new(state.clone())), options);
    let (tx, monitor) = create_monitor();
    channel.pipeline().add_last("monitor", MonitorHandler::new(tx));
    (channel, monitor)
}
