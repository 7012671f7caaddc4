//! Read path: explicit reads with message caps, auto-read, EOF handling,
//! half-closure, and read-error classification.

mod support;

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use keelson_core::error::ChannelError;
use keelson_core::event_loop::EventLoop;
use keelson_core::handle::FixedReadHandleFactory;
use keelson_core::message::Message;
use keelson_core::monitor::ChannelEvent;
use keelson_core::options::ChannelOptions;
use keelson_core::transport::ShutdownDirection;

use support::{
    await_done, expect_event, expect_no_event, monitored_channel, MockState,
};

fn drain_lifecycle(monitor: &keelson_core::monitor::ChannelMonitor) {
    assert!(matches!(expect_event(monitor), ChannelEvent::Registered));
    assert!(matches!(expect_event(monitor), ChannelEvent::Active));
}

#[test]
fn test_auto_read_delivers_buffered_messages() {
    let event_loop = EventLoop::new("read-1");
    let state = MockState::new(true, true);
    state
        .inbound
        .lock()
        .push_back(Message::Bytes(Bytes::from_static(b"first")));
    let (channel, monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();
    drain_lifecycle(&monitor);

    // Registration triggered the auto-read; data was already buffered.
    match expect_event(&monitor) {
        ChannelEvent::Read(msg) => {
            assert_eq!(msg.as_bytes().unwrap(), &Bytes::from_static(b"first"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(expect_event(&monitor), ChannelEvent::ReadComplete));
    event_loop.shutdown();
}

#[test]
fn test_explicit_read_with_single_message_cap() {
    let event_loop = EventLoop::new("read-2");
    let state = MockState::new(true, true);
    for i in 0..3u8 {
        state
            .inbound
            .lock()
            .push_back(Message::Bytes(Bytes::copy_from_slice(&[i])));
    }
    let options = ChannelOptions::new()
        .with_auto_read(false)
        .with_read_handle_factory(Arc::new(
            FixedReadHandleFactory::new(4096).with_max_messages_per_read(1),
        ));
    let (channel, monitor) = monitored_channel(&state, options);
    await_done(&channel.register(&event_loop)).unwrap();
    drain_lifecycle(&monitor);
    expect_no_event(&monitor);

    // Each explicit read delivers exactly one message and one
    // read-complete.
    for i in 0..3u8 {
        channel.read();
        match expect_event(&monitor) {
            ChannelEvent::Read(msg) => {
                assert_eq!(msg.as_bytes().unwrap().as_ref(), &[i]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(expect_event(&monitor), ChannelEvent::ReadComplete));
        expect_no_event(&monitor);
    }

    // Queue drained; one more read produces nothing.
    channel.read();
    expect_no_event(&monitor);
    event_loop.shutdown();
}

#[test]
fn test_eof_without_half_closure_closes_channel() {
    let event_loop = EventLoop::new("read-3");
    let state = MockState::new(true, true);
    state
        .inbound
        .lock()
        .push_back(Message::Bytes(Bytes::from_static(b"last words")));
    state.eof.store(true, Ordering::SeqCst);
    let (channel, monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();
    drain_lifecycle(&monitor);

    // Data first, then the EOF tears the channel down.
    assert!(matches!(expect_event(&monitor), ChannelEvent::Read(_)));
    assert!(matches!(expect_event(&monitor), ChannelEvent::ReadComplete));
    assert!(matches!(expect_event(&monitor), ChannelEvent::Inactive));
    await_done(&channel.close_future()).unwrap();
    assert!(!channel.is_open());
    event_loop.shutdown();
}

#[test]
fn test_eof_with_half_closure_shuts_down_input_only() {
    let event_loop = EventLoop::new("read-4");
    let state = MockState::new(true, true);
    state.eof.store(true, Ordering::SeqCst);
    let options = ChannelOptions::new().with_allow_half_closure(true);
    let (channel, monitor) = monitored_channel(&state, options);
    await_done(&channel.register(&event_loop)).unwrap();
    drain_lifecycle(&monitor);

    assert!(matches!(
        expect_event(&monitor),
        ChannelEvent::Shutdown(ShutdownDirection::Inbound)
    ));
    assert!(channel.is_open(), "half-closure keeps the channel open");
    assert!(channel.is_active());
    assert!(channel.is_shutdown(ShutdownDirection::Inbound));
    assert!(!channel.is_shutdown(ShutdownDirection::Outbound));
    event_loop.shutdown();
}

#[test]
fn test_transient_read_error_keeps_channel_alive() {
    let event_loop = EventLoop::new("read-5");
    let state = MockState::new(true, true);
    *state.read_error.lock() = Some(io::Error::from(io::ErrorKind::WouldBlock));
    state
        .inbound
        .lock()
        .push_back(Message::Bytes(Bytes::from_static(b"later")));
    let (channel, monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();
    drain_lifecycle(&monitor);

    match expect_event(&monitor) {
        ChannelEvent::Exception(err) => assert!(err.is_transient()),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(channel.is_open());
    assert!(channel.is_active());

    // The next readiness signal delivers normally.
    state.signal_readable();
    assert!(matches!(expect_event(&monitor), ChannelEvent::Read(_)));
    event_loop.shutdown();
}

#[test]
fn test_fatal_read_error_shuts_down_read_side() {
    let event_loop = EventLoop::new("read-6");
    let state = MockState::new(true, true);
    state
        .inbound
        .lock()
        .push_back(Message::Bytes(Bytes::from_static(b"partial")));
    let options = ChannelOptions::new().with_allow_half_closure(true);
    let (channel, monitor) = monitored_channel(&state, options);
    await_done(&channel.register(&event_loop)).unwrap();
    drain_lifecycle(&monitor);
    assert!(matches!(expect_event(&monitor), ChannelEvent::Read(_)));
    assert!(matches!(expect_event(&monitor), ChannelEvent::ReadComplete));

    *state.read_error.lock() = Some(io::Error::from(io::ErrorKind::ConnectionReset));
    state.signal_readable();

    assert!(matches!(expect_event(&monitor), ChannelEvent::Exception(_)));
    assert!(matches!(
        expect_event(&monitor),
        ChannelEvent::Shutdown(ShutdownDirection::Inbound)
    ));
    assert!(channel.is_open());

    // Once the input shut down on error, further readiness is ignored.
    state
        .inbound
        .lock()
        .push_back(Message::Bytes(Bytes::from_static(b"ghost")));
    state.signal_readable();
    expect_no_event(&monitor);
    event_loop.shutdown();
}

#[test]
fn test_fatal_read_error_without_half_closure_closes() {
    let event_loop = EventLoop::new("read-7");
    let state = MockState::new(true, true);
    *state.read_error.lock() = Some(io::Error::from(io::ErrorKind::ConnectionReset));
    let (channel, monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();
    drain_lifecycle(&monitor);

    assert!(matches!(expect_event(&monitor), ChannelEvent::Exception(_)));
    assert!(matches!(expect_event(&monitor), ChannelEvent::Inactive));
    await_done(&channel.close_future()).unwrap();
    event_loop.shutdown();
}

#[test]
fn test_read_before_active_replays_on_activation() {
    let event_loop = EventLoop::new("read-8");
    let state = MockState::new(true, false);
    state
        .inbound
        .lock()
        .push_back(Message::Bytes(Bytes::from_static(b"queued")));
    let options = ChannelOptions::new().with_auto_read(false);
    let (channel, monitor) = monitored_channel(&state, options);
    await_done(&channel.register(&event_loop)).unwrap();
    assert!(matches!(expect_event(&monitor), ChannelEvent::Registered));

    // Requested while inactive: stored, not executed.
    channel.read();
    expect_no_event(&monitor);

    // Activation replays the stored read.
    state
        .connect_script
        .lock()
        .push_back(Ok(keelson_core::transport::ConnectStart::Done { initial_sent: 0 }));
    await_done(&channel.connect(keelson_core::endpoint::Endpoint::local("peer"))).unwrap();
    assert!(matches!(expect_event(&monitor), ChannelEvent::Active));
    assert!(matches!(expect_event(&monitor), ChannelEvent::Read(_)));
    assert!(matches!(expect_event(&monitor), ChannelEvent::ReadComplete));
    event_loop.shutdown();
}

#[test]
fn test_setting_auto_read_false_clears_scheduled_read() {
    let event_loop = EventLoop::new("read-9");
    let state = MockState::new(true, true);
    let (channel, monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();
    drain_lifecycle(&monitor);

    channel
        .set_option(keelson_core::options::ChannelOption::AutoRead(false))
        .unwrap();
    // Allow the loop to process the clear.
    support::run_on(&event_loop, || ());
    assert!(state.saw_call("clear_scheduled_read"));

    // Buffered data now stays put until an explicit read.
    state
        .inbound
        .lock()
        .push_back(Message::Bytes(Bytes::from_static(b"parked")));
    expect_no_event(&monitor);
    channel.read();
    assert!(matches!(expect_event(&monitor), ChannelEvent::Read(_)));
    event_loop.shutdown();
}

#[test]
fn test_unsupported_extension_option() {
    let state = MockState::new(true, false);
    let (channel, _monitor) = monitored_channel(&state, ChannelOptions::new());
    let result = channel.set_option(keelson_core::options::ChannelOption::Extension {
        name: "SO_MYSTERY".to_string(),
        value: Box::new(42u32),
    });
    match result {
        Err(ChannelError::UnsupportedOption { name }) => assert_eq!(name, "SO_MYSTERY"),
        other => panic!("unexpected result: {other:?}"),
    }
}
