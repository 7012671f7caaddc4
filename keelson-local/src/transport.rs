//! In-process channel transport.
//!
//! Two linked ends move whole messages through per-end inbound queues; no
//! serialization, syscalls, or framing. A server channel claims a name in
//! the global registry; clients resolve the name on connect and the server
//! spawns a child channel on its own loop for each accepted peer. Payloads
//! are refcounted `Bytes`, so delivery is zero-copy.
//!
//! Delivery is level-triggered through the core's read protocol: a write
//! notifies the peer end, which schedules one `read_now` on its loop if read
//! interest is armed. EOF (peer closed or shut down its output) surfaces
//! after the inbound queue drains.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use keelson_core::channel::{Channel, WeakChannel};
use keelson_core::endpoint::Endpoint;
use keelson_core::error::ChannelError;
use keelson_core::message::Message;
use keelson_core::sink::{ReadSink, WriteSink};
use keelson_core::transport::{ConnectStart, ShutdownDirection, Transport};

use crate::registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectPhase {
    Idle,
    Pending,
    Ready,
    Refused,
}

/// One end of a local link.
struct EndState {
    channel: Mutex<Option<WeakChannel>>,
    peer: Mutex<Option<Arc<EndState>>>,
    inbound: Mutex<VecDeque<Message>>,
    open: AtomicBool,
    active: AtomicBool,
    input_shutdown: AtomicBool,
    output_shutdown: AtomicBool,
    read_interest: AtomicBool,
    read_posted: AtomicBool,
    peer_output_closed: AtomicBool,
    connect_phase: Mutex<ConnectPhase>,
    local_addr: Mutex<Option<Endpoint>>,
    remote_addr: Mutex<Option<Endpoint>>,
}

impl EndState {
    fn idle() -> Arc<Self> {
        Arc::new(Self {
            channel: Mutex::new(None),
            peer: Mutex::new(None),
            inbound: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
            active: AtomicBool::new(false),
            input_shutdown: AtomicBool::new(false),
            output_shutdown: AtomicBool::new(false),
            read_interest: AtomicBool::new(false),
            read_posted: AtomicBool::new(false),
            peer_output_closed: AtomicBool::new(false),
            connect_phase: Mutex::new(ConnectPhase::Idle),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
        })
    }

    /// A child end born connected (accept path).
    fn connected(local: Option<Endpoint>, remote: Option<Endpoint>) -> Arc<Self> {
        let end = Self::idle();
        end.active.store(true, Ordering::Release);
        *end.connect_phase.lock() = ConnectPhase::Ready;
        *end.local_addr.lock() = local;
        *end.remote_addr.lock() = remote;
        end
    }

    fn channel(&self) -> Option<Channel> {
        self.channel.lock().as_ref().and_then(WeakChannel::upgrade)
    }

    /// Schedule one `read_now` on the owning loop if read interest is
    /// armed. Posts are coalesced.
    fn schedule_read(self: &Arc<Self>) {
        if !self.read_interest.load(Ordering::Acquire) {
            return;
        }
        if self.read_posted.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(channel) = self.channel() else {
            self.read_posted.store(false, Ordering::Release);
            return;
        };
        let Some(event_loop) = channel.event_loop() else {
            self.read_posted.store(false, Ordering::Release);
            return;
        };
        let end = self.clone();
        event_loop.execute_task(move || {
            end.read_posted.store(false, Ordering::Release);
            channel.read_now();
        });
    }

    /// The peer will send no more data.
    fn peer_closed_output(self: &Arc<Self>) {
        self.peer_output_closed.store(true, Ordering::Release);
        self.schedule_read();
    }
}

fn post_finish_connect(client: &Arc<EndState>) {
    let Some(channel) = client.channel() else {
        return;
    };
    let Some(event_loop) = channel.event_loop() else {
        return;
    };
    event_loop.execute_task(move || channel.finish_connect());
}

fn refuse(client: &Arc<EndState>) {
    *client.connect_phase.lock() = ConnectPhase::Refused;
    post_finish_connect(client);
}

/// Client / accepted-child end of a local link.
pub struct LocalTransport {
    end: Arc<EndState>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            end: EndState::idle(),
        }
    }

    fn from_end(end: Arc<EndState>) -> Self {
        Self { end }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn attach(&self, channel: &Channel) {
        *self.end.channel.lock() = Some(channel.downgrade());
    }

    fn is_open(&self) -> bool {
        self.end.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.end.active.load(Ordering::Acquire)
    }

    fn is_shutdown(&self, direction: ShutdownDirection) -> bool {
        if !self.is_open() {
            return true;
        }
        match direction {
            ShutdownDirection::Inbound => self.end.input_shutdown.load(Ordering::Acquire),
            ShutdownDirection::Outbound => self.end.output_shutdown.load(Ordering::Acquire),
        }
    }

    fn local_addr(&self) -> Option<Endpoint> {
        self.end.local_addr.lock().clone()
    }

    fn remote_addr(&self) -> Option<Endpoint> {
        self.end.remote_addr.lock().clone()
    }

    fn do_bind(&self, _addr: &Endpoint) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "local stream channels cannot bind; use a local server channel",
        ))
    }

    fn do_connect(
        &self,
        remote: &Endpoint,
        local: Option<&Endpoint>,
        _initial_data: Option<Bytes>,
    ) -> io::Result<ConnectStart> {
        let Endpoint::Local(name) = remote else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("local transport cannot connect to {remote}"),
            ));
        };
        let Some(binding) = registry::lookup(name) else {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        };
        let Some(server_loop) = binding.channel.event_loop() else {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        };

        let ephemeral = match (local, self.end.channel()) {
            (Some(addr), _) => Some(addr.clone()),
            (None, Some(channel)) => Some(Endpoint::local(format!("ephemeral-{}", channel.id()))),
            (None, None) => None,
        };
        *self.end.local_addr.lock() = ephemeral;
        *self.end.connect_phase.lock() = ConnectPhase::Pending;

        let client = self.end.clone();
        let server = binding.server.clone();
        server_loop.execute_task(move || serve(&server, &client));
        Ok(ConnectStart::Pending)
    }

    fn do_finish_connect(&self, requested_remote: &Endpoint) -> io::Result<bool> {
        let phase = *self.end.connect_phase.lock();
        match phase {
            ConnectPhase::Idle | ConnectPhase::Pending => Ok(false),
            ConnectPhase::Ready => {
                self.end.active.store(true, Ordering::Release);
                trace!(remote = %requested_remote, "local connect established");
                Ok(true)
            }
            ConnectPhase::Refused => {
                *self.end.connect_phase.lock() = ConnectPhase::Idle;
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        }
    }

    fn do_shutdown(&self, direction: ShutdownDirection) -> io::Result<()> {
        match direction {
            ShutdownDirection::Outbound => {
                self.end.output_shutdown.store(true, Ordering::Release);
                let peer = self.end.peer.lock().clone();
                if let Some(peer) = peer {
                    peer.peer_closed_output();
                }
            }
            ShutdownDirection::Inbound => {
                self.end.input_shutdown.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    fn do_close(&self) {
        if !self.end.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.end.active.store(false, Ordering::Release);
        self.end.input_shutdown.store(true, Ordering::Release);
        self.end.output_shutdown.store(true, Ordering::Release);
        // Breaking the peer link here also breaks the refcount cycle
        // between the two ends.
        let peer = self.end.peer.lock().take();
        if let Some(peer) = peer {
            peer.peer_closed_output();
        }
    }

    fn do_read(&self, _was_pending: bool) -> io::Result<()> {
        self.end.read_interest.store(true, Ordering::Release);
        let has_data = !self.end.inbound.lock().is_empty();
        if has_data || self.end.peer_output_closed.load(Ordering::Acquire) {
            self.end.schedule_read();
        }
        Ok(())
    }

    fn do_read_now(&self, sink: &mut ReadSink<'_>) -> io::Result<bool> {
        loop {
            let msg = self.end.inbound.lock().pop_front();
            let Some(msg) = msg else { break };
            let size = msg.as_bytes().map_or(0, Bytes::len);
            if !sink.process_read(size, size, Some(msg)) {
                break;
            }
        }
        let drained = self.end.inbound.lock().is_empty();
        let eof = drained && self.end.peer_output_closed.load(Ordering::Acquire);
        Ok(eof)
    }

    fn do_write_now(&self, sink: &mut WriteSink<'_>) -> io::Result<()> {
        let peer = self.end.peer.lock().clone();
        let Some(peer) = peer else {
            sink.complete_with_error(ChannelError::closed(), false);
            return Ok(());
        };
        let mut delivered = 0usize;
        let mut bytes = 0usize;
        sink.for_each_flushed(|msg| match msg.as_bytes() {
            Some(payload) => {
                peer.inbound
                    .lock()
                    .push_back(Message::Bytes(payload.clone()));
                bytes += payload.len();
                delivered += 1;
                true
            }
            None => false,
        });
        sink.complete(bytes, bytes, Some(delivered), true);
        if delivered > 0 {
            peer.schedule_read();
        }
        Ok(())
    }

    fn do_clear_scheduled_read(&self) {
        self.end.read_interest.store(false, Ordering::Release);
    }

    fn filter_outbound_message(&self, msg: Message) -> Result<Message, ChannelError> {
        match msg {
            Message::Bytes(_) => Ok(msg),
            Message::Other(_) => Err(ChannelError::Io {
                kind: io::ErrorKind::InvalidInput,
                message: "local transport carries byte messages only".to_string(),
            }),
        }
    }
}

/// Runs on the server loop: link the client to a freshly accepted child
/// channel.
fn serve(server: &Arc<ServerState>, client: &Arc<EndState>) {
    let Some(server_channel) = server.channel() else {
        refuse(client);
        return;
    };
    if !server.open.load(Ordering::Acquire) || !server_channel.is_registered() {
        refuse(client);
        return;
    }
    let Some(server_loop) = server_channel.event_loop() else {
        refuse(client);
        return;
    };

    let server_addr = server_channel.local_addr();
    let client_addr = client.local_addr.lock().clone();
    let child_end = EndState::connected(server_addr.clone(), client_addr);
    *child_end.peer.lock() = Some(client.clone());
    {
        *client.peer.lock() = Some(child_end.clone());
        *client.remote_addr.lock() = server_addr;
        *client.connect_phase.lock() = ConnectPhase::Ready;
    }

    let child = Channel::new_child(&server_channel, Box::new(LocalTransport::from_end(child_end)));
    (server.child_init)(&child);
    child.register(&server_loop);
    debug!(parent = %server_channel.id(), child = %child.id(), "accepted local connection");

    post_finish_connect(client);
}

pub(crate) struct ServerState {
    channel: Mutex<Option<WeakChannel>>,
    bound_name: Mutex<Option<String>>,
    open: AtomicBool,
    active: AtomicBool,
    child_init: Box<dyn Fn(&Channel) + Send + Sync>,
}

impl ServerState {
    fn channel(&self) -> Option<Channel> {
        self.channel.lock().as_ref().and_then(WeakChannel::upgrade)
    }
}

/// Registry entry: the serving channel plus its accept state.
pub(crate) struct LocalBinding {
    pub(crate) channel: Channel,
    pub(crate) server: Arc<ServerState>,
}

impl Clone for LocalBinding {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            server: self.server.clone(),
        }
    }
}

/// Serving end: claims a name on bind and spawns one child channel per
/// accepted connect.
pub struct LocalServerTransport {
    state: Arc<ServerState>,
}

impl LocalServerTransport {
    /// `child_init` runs on the server loop for every accepted child,
    /// before the child registers; install its handlers here.
    #[must_use]
    pub fn new(child_init: impl Fn(&Channel) + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(ServerState {
                channel: Mutex::new(None),
                bound_name: Mutex::new(None),
                open: AtomicBool::new(true),
                active: AtomicBool::new(false),
                child_init: Box::new(child_init),
            }),
        }
    }
}

impl Transport for LocalServerTransport {
    fn attach(&self, channel: &Channel) {
        *self.state.channel.lock() = Some(channel.downgrade());
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    fn is_shutdown(&self, _direction: ShutdownDirection) -> bool {
        !self.is_open()
    }

    fn is_server(&self) -> bool {
        true
    }

    fn local_addr(&self) -> Option<Endpoint> {
        self.state
            .bound_name
            .lock()
            .as_ref()
            .map(|name| Endpoint::local(name.clone()))
    }

    fn remote_addr(&self) -> Option<Endpoint> {
        None
    }

    fn do_bind(&self, addr: &Endpoint) -> io::Result<()> {
        let Endpoint::Local(name) = addr else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("local server cannot bind {addr}"),
            ));
        };
        let Some(channel) = self.state.channel() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "server transport is not attached to a channel",
            ));
        };
        registry::bind(
            name,
            LocalBinding {
                channel,
                server: self.state.clone(),
            },
        )?;
        *self.state.bound_name.lock() = Some(name.clone());
        self.state.active.store(true, Ordering::Release);
        debug!(endpoint = %addr, "local server bound");
        Ok(())
    }

    fn do_connect(
        &self,
        _remote: &Endpoint,
        _local: Option<&Endpoint>,
        _initial_data: Option<Bytes>,
    ) -> io::Result<ConnectStart> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "server channels do not connect",
        ))
    }

    fn do_finish_connect(&self, _requested_remote: &Endpoint) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "server channels do not connect",
        ))
    }

    fn do_shutdown(&self, _direction: ShutdownDirection) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "server channels carry no data directions",
        ))
    }

    fn do_close(&self) {
        if !self.state.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.state.active.store(false, Ordering::Release);
        let name = self.state.bound_name.lock().take();
        if let Some(name) = name {
            let channel = self.state.channel();
            registry::unbind(&name, channel.as_ref());
        }
    }

    fn do_read(&self, _was_pending: bool) -> io::Result<()> {
        // Children are registered directly from `serve`; nothing to poll.
        Ok(())
    }

    fn do_read_now(&self, _sink: &mut ReadSink<'_>) -> io::Result<bool> {
        Ok(false)
    }

    fn do_write_now(&self, sink: &mut WriteSink<'_>) -> io::Result<()> {
        sink.complete_with_error(
            ChannelError::Io {
                kind: io::ErrorKind::Unsupported,
                message: "server channels do not write".to_string(),
            },
            false,
        );
        Ok(())
    }
}
