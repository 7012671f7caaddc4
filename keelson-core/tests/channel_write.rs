//! Write path: rejection and disposal, pending-byte accounting, watermark
//! transitions, partial writes, and write-error classification.

mod support;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keelson_core::error::ChannelError;
use keelson_core::event_loop::EventLoop;
use keelson_core::message::Message;
use keelson_core::monitor::ChannelEvent;
use keelson_core::options::{ChannelOptions, WaterMark};
use keelson_core::transport::ShutdownDirection;

use support::{
    await_done, expect_event, expect_no_event, monitored_channel, MockState, WriteBehavior,
};

#[test]
fn test_write_flush_delivers_bytes() {
    let event_loop = EventLoop::new("write-1");
    let state = MockState::new(true, true);
    let (channel, _monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();

    let promise = channel.write_and_flush(Bytes::from_static(b"payload"));
    await_done(&promise).unwrap();

    assert_eq!(state.written.lock().as_slice(), &[Bytes::from_static(b"payload")]);
    assert_eq!(channel.total_pending_write_bytes(), 0);
    event_loop.shutdown();
}

#[test]
fn test_write_after_close_fails_and_disposes() {
    let event_loop = EventLoop::new("write-2");
    let state = MockState::new(true, true);
    let (channel, _monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();
    await_done(&channel.close()).unwrap();

    let tracker = Arc::new(());
    let promise = channel.write(Message::other(tracker.clone()));
    let result = await_done(&promise);
    assert!(matches!(result, Err(ChannelError::Closed { .. })));
    assert_eq!(Arc::strong_count(&tracker), 1, "message must be disposed");
    event_loop.shutdown();
}

#[test]
fn test_write_after_output_shutdown_fails_and_disposes() {
    let event_loop = EventLoop::new("write-3");
    let state = MockState::new(true, true);
    let (channel, monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();
    assert!(matches!(expect_event(&monitor), ChannelEvent::Registered));
    assert!(matches!(expect_event(&monitor), ChannelEvent::Active));

    await_done(&channel.shutdown(ShutdownDirection::Outbound)).unwrap();
    assert!(matches!(
        expect_event(&monitor),
        ChannelEvent::Shutdown(ShutdownDirection::Outbound)
    ));

    let tracker = Arc::new(());
    let result = await_done(&channel.write(Message::other(tracker.clone())));
    assert!(matches!(result, Err(ChannelError::OutputShutdown)));
    assert_eq!(Arc::strong_count(&tracker), 1, "message must be disposed");
    event_loop.shutdown();
}

#[test]
fn test_shutdown_outbound_fails_queued_writes() {
    let event_loop = EventLoop::new("write-4");
    let state = MockState::new(true, true);
    let (channel, _monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();

    // Queued but never flushed.
    let queued = channel.write(Bytes::from_static(b"stranded"));
    await_done(&channel.shutdown(ShutdownDirection::Outbound)).unwrap();
    let result = await_done(&queued);
    assert!(matches!(result, Err(ChannelError::OutputShutdown)));
    assert_eq!(channel.total_pending_write_bytes(), 0);
    event_loop.shutdown();
}

#[test]
fn test_pending_bytes_decrease_by_actual_bytes_written() {
    let event_loop = EventLoop::new("write-5");
    let state = MockState::new(true, true);
    let (channel, _monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();

    let first = channel.write(Bytes::from_static(b"hello"));
    let second = channel.write(Bytes::from_static(b"world!"));
    assert_eq!(channel.total_pending_write_bytes(), 11);

    // One short write of 7 bytes, then the loop reschedules and drains.
    state.write_script.lock().push_back(WriteBehavior::WriteBytes(7));
    channel.flush();
    await_done(&first).unwrap();
    await_done(&second).unwrap();
    assert_eq!(channel.total_pending_write_bytes(), 0);
    event_loop.shutdown();
}

#[test]
fn test_writability_flips_exactly_on_watermark_transitions() {
    let event_loop = EventLoop::new("write-6");
    let state = MockState::new(true, true);
    let options = ChannelOptions::new().with_water_mark(WaterMark::new(4, 8));
    let (channel, monitor) = monitored_channel(&state, options);
    await_done(&channel.register(&event_loop)).unwrap();
    assert!(matches!(expect_event(&monitor), ChannelEvent::Registered));
    assert!(matches!(expect_event(&monitor), ChannelEvent::Active));

    assert!(channel.is_writable());
    let w1 = channel.write(Bytes::from_static(b"one"));
    let w2 = channel.write(Bytes::from_static(b"two"));
    let w3 = channel.write(Bytes::from_static(b"tri"));

    // 9 pending > high=8: exactly one transition to unwritable.
    match expect_event(&monitor) {
        ChannelEvent::WritabilityChanged(writable) => assert!(!writable),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!channel.is_writable());
    assert_eq!(channel.writable_bytes(), 0);

    // Draining below low=4 flips back exactly once.
    channel.flush();
    for promise in [w1, w2, w3] {
        await_done(&promise).unwrap();
    }
    match expect_event(&monitor) {
        ChannelEvent::WritabilityChanged(writable) => assert!(writable),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(channel.is_writable());
    assert!(channel.writable_bytes() > 0);
    expect_no_event(&monitor);
    event_loop.shutdown();
}

#[test]
fn test_writable_bytes_consistent_with_flag() {
    let event_loop = EventLoop::new("write-7");
    let state = MockState::new(true, true);
    let options = ChannelOptions::new().with_water_mark(WaterMark::new(2, 4));
    let (channel, _monitor) = monitored_channel(&state, options);
    await_done(&channel.register(&event_loop)).unwrap();

    assert!(channel.writable_bytes() > 0);
    assert!(channel.is_writable());

    let _w = channel.write(Bytes::from_static(b"xxxxxxxx"));
    // 8 > high=4: flag down, writable_bytes pinned to zero.
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while channel.is_writable() && std::time::Instant::now() < deadline {
        std::thread::yield_now();
    }
    assert!(!channel.is_writable());
    assert_eq!(channel.writable_bytes(), 0);
    event_loop.shutdown();
}

#[test]
fn test_failed_head_entry_fails_its_promise_only() {
    let event_loop = EventLoop::new("write-8");
    let state = MockState::new(true, true);
    let (channel, _monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();

    let doomed = channel.write(Bytes::from_static(b"doomed"));
    let survivor = channel.write(Bytes::from_static(b"survivor"));
    state.write_script.lock().push_back(WriteBehavior::FailHead(ChannelError::Io {
        kind: io::ErrorKind::BrokenPipe,
        message: "peer reset".to_string(),
    }));
    channel.flush();

    assert!(matches!(await_done(&doomed), Err(ChannelError::Io { .. })));
    await_done(&survivor).unwrap();
    assert!(channel.is_open());
    event_loop.shutdown();
}

#[test]
fn test_write_io_error_with_auto_close_closes_channel() {
    let event_loop = EventLoop::new("write-9");
    let state = MockState::new(true, true);
    let (channel, monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();
    assert!(matches!(expect_event(&monitor), ChannelEvent::Registered));
    assert!(matches!(expect_event(&monitor), ChannelEvent::Active));

    let doomed = channel.write(Bytes::from_static(b"doomed"));
    state
        .write_script
        .lock()
        .push_back(WriteBehavior::IoError(io::ErrorKind::ConnectionReset));
    channel.flush();

    let result = await_done(&doomed);
    assert!(result.is_err());
    await_done(&channel.close_future()).unwrap();
    assert!(!channel.is_open());
    assert!(matches!(expect_event(&monitor), ChannelEvent::Inactive));
    event_loop.shutdown();
}

#[test]
fn test_write_io_error_without_auto_close_shuts_down_output() {
    let event_loop = EventLoop::new("write-10");
    let state = MockState::new(true, true);
    let options = ChannelOptions::new().with_auto_close(false);
    let (channel, monitor) = monitored_channel(&state, options);
    await_done(&channel.register(&event_loop)).unwrap();
    assert!(matches!(expect_event(&monitor), ChannelEvent::Registered));
    assert!(matches!(expect_event(&monitor), ChannelEvent::Active));

    let doomed = channel.write(Bytes::from_static(b"doomed"));
    state
        .write_script
        .lock()
        .push_back(WriteBehavior::IoError(io::ErrorKind::ConnectionReset));
    channel.flush();

    assert!(await_done(&doomed).is_err());
    assert!(matches!(
        expect_event(&monitor),
        ChannelEvent::Shutdown(ShutdownDirection::Outbound)
    ));
    assert!(channel.is_open(), "channel survives with output shut down");
    assert!(channel.is_shutdown(ShutdownDirection::Outbound));
    assert!(state.saw_call("shutdown:Outbound"));
    event_loop.shutdown();
}

#[test]
fn test_flush_while_inactive_fails_with_not_yet_connected() {
    let event_loop = EventLoop::new("write-11");
    let state = MockState::new(true, false);
    let (channel, _monitor) = monitored_channel(&state, ChannelOptions::new());
    await_done(&channel.register(&event_loop)).unwrap();

    let promise = channel.write_and_flush(Bytes::from_static(b"early"));
    let result = await_done(&promise);
    assert!(matches!(result, Err(ChannelError::NotYetConnected)));
    event_loop.shutdown();
}
