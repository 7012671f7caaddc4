//! Channel configuration options.
//!
//! This module provides the typed option table for channels: timeouts,
//! watermarks, auto-read, auto-close, half-closure, allocator and handle
//! factories. All values are readable from any thread; mutation is allowed
//! from outside the loop, with side effects (clearing a scheduled read)
//! marshalled onto the loop by the channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::alloc::{BufferAllocator, DefaultBufferAllocator};
use crate::handle::{
    AdaptiveReadHandleFactory, MaxBytesWriteHandleFactory, ReadHandleFactory, WriteHandleFactory,
};
use crate::message::{DefaultMessageSizeEstimator, MessageSizeEstimator};

/// High/low thresholds bracketing the writability flag transitions.
///
/// # Examples
///
/// ```
/// use keelson_core::options::WaterMark;
///
/// let wm = WaterMark::new(8 * 1024, 32 * 1024);
/// assert_eq!(wm.low(), 8 * 1024);
/// assert_eq!(wm.high(), 32 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterMark {
    low: usize,
    high: usize,
}

impl WaterMark {
    /// Default thresholds: 32 KiB low, 64 KiB high.
    pub const DEFAULT: WaterMark = WaterMark {
        low: 32 * 1024,
        high: 64 * 1024,
    };

    /// Create a watermark pair.
    ///
    /// # Panics
    ///
    /// Panics if `low > high`.
    #[must_use]
    pub fn new(low: usize, high: usize) -> Self {
        assert!(low <= high, "watermark low ({low}) must be <= high ({high})");
        Self { low, high }
    }

    #[inline]
    #[must_use]
    pub const fn low(&self) -> usize {
        self.low
    }

    #[inline]
    #[must_use]
    pub const fn high(&self) -> usize {
        self.high
    }
}

impl Default for WaterMark {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Typed option values accepted by `Channel::set_option`.
///
/// Unrecognized extension options are routed to the transport; a transport
/// that does not understand them reports an unsupported-option error.
pub enum ChannelOption {
    /// Automatically schedule a read after each read-complete.
    AutoRead(bool),
    /// Close the channel when a write fails with an I/O error.
    AutoClose(bool),
    /// Permit shutting down the inbound side without a full close.
    AllowHalfClosure(bool),
    /// Connect timeout; zero disables.
    ConnectTimeout(Duration),
    /// Writability thresholds.
    WriteBufferWaterMark(WaterMark),
    /// Allocator for inbound payload buffers.
    BufferAllocator(Arc<dyn BufferAllocator>),
    /// Factory producing read handles.
    ReadHandleFactory(Arc<dyn ReadHandleFactory>),
    /// Factory producing write handles.
    WriteHandleFactory(Arc<dyn WriteHandleFactory>),
    /// Estimator for pending-byte accounting.
    MessageSizeEstimator(Arc<dyn MessageSizeEstimator>),
    /// Transport-specific option, dispatched to the transport's extension
    /// hook.
    Extension {
        name: String,
        value: Box<dyn std::any::Any + Send>,
    },
}

impl std::fmt::Debug for ChannelOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoRead(v) => write!(f, "AutoRead({v})"),
            Self::AutoClose(v) => write!(f, "AutoClose({v})"),
            Self::AllowHalfClosure(v) => write!(f, "AllowHalfClosure({v})"),
            Self::ConnectTimeout(v) => write!(f, "ConnectTimeout({v:?})"),
            Self::WriteBufferWaterMark(v) => write!(f, "WriteBufferWaterMark({v:?})"),
            Self::BufferAllocator(_) => f.write_str("BufferAllocator(..)"),
            Self::ReadHandleFactory(_) => f.write_str("ReadHandleFactory(..)"),
            Self::WriteHandleFactory(_) => f.write_str("WriteHandleFactory(..)"),
            Self::MessageSizeEstimator(_) => f.write_str("MessageSizeEstimator(..)"),
            Self::Extension { name, .. } => write!(f, "Extension({name})"),
        }
    }
}

/// Per-channel configuration, shared between the channel handle and the
/// loop-side state machine.
pub struct ChannelOptions {
    auto_read: AtomicBool,
    auto_close: AtomicBool,
    allow_half_closure: AtomicBool,
    connect_timeout_millis: AtomicU64,
    water_mark: Mutex<WaterMark>,
    allocator: RwLock<Arc<dyn BufferAllocator>>,
    read_handle_factory: RwLock<Arc<dyn ReadHandleFactory>>,
    write_handle_factory: RwLock<Arc<dyn WriteHandleFactory>>,
    estimator: RwLock<Arc<dyn MessageSizeEstimator>>,
}

impl ChannelOptions {
    /// Default connect timeout: 30 seconds.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    #[must_use]
    pub fn new() -> Self {
        Self {
            auto_read: AtomicBool::new(true),
            auto_close: AtomicBool::new(true),
            allow_half_closure: AtomicBool::new(false),
            connect_timeout_millis: AtomicU64::new(
                Self::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
            ),
            water_mark: Mutex::new(WaterMark::DEFAULT),
            allocator: RwLock::new(Arc::new(DefaultBufferAllocator)),
            read_handle_factory: RwLock::new(Arc::new(AdaptiveReadHandleFactory::default())),
            write_handle_factory: RwLock::new(Arc::new(MaxBytesWriteHandleFactory::default())),
            estimator: RwLock::new(Arc::new(DefaultMessageSizeEstimator::default())),
        }
    }

    /// Builder-style auto-read toggle (construction time).
    #[must_use]
    pub fn with_auto_read(self, enabled: bool) -> Self {
        self.auto_read.store(enabled, Ordering::Release);
        self
    }

    /// Builder-style auto-close toggle.
    #[must_use]
    pub fn with_auto_close(self, enabled: bool) -> Self {
        self.auto_close.store(enabled, Ordering::Release);
        self
    }

    /// Builder-style half-closure toggle.
    #[must_use]
    pub fn with_allow_half_closure(self, enabled: bool) -> Self {
        self.allow_half_closure.store(enabled, Ordering::Release);
        self
    }

    /// Builder-style connect timeout.
    #[must_use]
    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        self.set_connect_timeout(timeout);
        self
    }

    /// Builder-style watermark pair.
    #[must_use]
    pub fn with_water_mark(self, water_mark: WaterMark) -> Self {
        *self.water_mark.lock() = water_mark;
        self
    }

    /// Builder-style read handle factory.
    #[must_use]
    pub fn with_read_handle_factory(self, factory: Arc<dyn ReadHandleFactory>) -> Self {
        *self.read_handle_factory.write() = factory;
        self
    }

    /// Builder-style write handle factory.
    #[must_use]
    pub fn with_write_handle_factory(self, factory: Arc<dyn WriteHandleFactory>) -> Self {
        *self.write_handle_factory.write() = factory;
        self
    }

    /// Builder-style message size estimator.
    #[must_use]
    pub fn with_message_size_estimator(self, estimator: Arc<dyn MessageSizeEstimator>) -> Self {
        *self.estimator.write() = estimator;
        self
    }

    #[must_use]
    pub fn auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_auto_read(&self, enabled: bool) -> bool {
        self.auto_read.swap(enabled, Ordering::AcqRel)
    }

    #[must_use]
    pub fn auto_close(&self) -> bool {
        self.auto_close.load(Ordering::Acquire)
    }

    pub fn set_auto_close(&self, enabled: bool) {
        self.auto_close.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn allow_half_closure(&self) -> bool {
        self.allow_half_closure.load(Ordering::Acquire)
    }

    pub fn set_allow_half_closure(&self, enabled: bool) {
        self.allow_half_closure.store(enabled, Ordering::Release);
    }

    /// Connect timeout; `Duration::ZERO` disables the timer.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis.load(Ordering::Acquire))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout_millis
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    #[must_use]
    pub fn water_mark(&self) -> WaterMark {
        *self.water_mark.lock()
    }

    pub fn set_water_mark(&self, water_mark: WaterMark) {
        *self.water_mark.lock() = water_mark;
    }

    #[must_use]
    pub fn allocator(&self) -> Arc<dyn BufferAllocator> {
        self.allocator.read().clone()
    }

    pub fn set_allocator(&self, allocator: Arc<dyn BufferAllocator>) {
        *self.allocator.write() = allocator;
    }

    #[must_use]
    pub fn read_handle_factory(&self) -> Arc<dyn ReadHandleFactory> {
        self.read_handle_factory.read().clone()
    }

    pub fn set_read_handle_factory(&self, factory: Arc<dyn ReadHandleFactory>) {
        *self.read_handle_factory.write() = factory;
    }

    #[must_use]
    pub fn write_handle_factory(&self) -> Arc<dyn WriteHandleFactory> {
        self.write_handle_factory.read().clone()
    }

    pub fn set_write_handle_factory(&self, factory: Arc<dyn WriteHandleFactory>) {
        *self.write_handle_factory.write() = factory;
    }

    #[must_use]
    pub fn message_size_estimator(&self) -> Arc<dyn MessageSizeEstimator> {
        self.estimator.read().clone()
    }

    pub fn set_message_size_estimator(&self, estimator: Arc<dyn MessageSizeEstimator>) {
        *self.estimator.write() = estimator;
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("auto_read", &self.auto_read())
            .field("auto_close", &self.auto_close())
            .field("allow_half_closure", &self.allow_half_closure())
            .field("connect_timeout", &self.connect_timeout())
            .field("water_mark", &self.water_mark())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = ChannelOptions::new();
        assert!(opts.auto_read());
        assert!(opts.auto_close());
        assert!(!opts.allow_half_closure());
        assert_eq!(opts.connect_timeout(), Duration::from_secs(30));
        assert_eq!(opts.water_mark(), WaterMark::DEFAULT);
    }

    #[test]
    fn test_builder_pattern() {
        let opts = ChannelOptions::new()
            .with_auto_read(false)
            .with_connect_timeout(Duration::from_millis(250))
            .with_water_mark(WaterMark::new(4, 8));

        assert!(!opts.auto_read());
        assert_eq!(opts.connect_timeout(), Duration::from_millis(250));
        assert_eq!(opts.water_mark(), WaterMark::new(4, 8));
    }

    #[test]
    fn test_set_auto_read_returns_previous() {
        let opts = ChannelOptions::new();
        assert!(opts.set_auto_read(false));
        assert!(!opts.set_auto_read(true));
    }

    #[test]
    #[should_panic(expected = "watermark low")]
    fn test_watermark_rejects_inverted_pair() {
        let _ = WaterMark::new(64, 8);
    }
}
