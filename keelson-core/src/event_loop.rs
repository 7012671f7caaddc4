//! Single-threaded event loop.
//!
//! One loop == one owned thread. Channels are pinned to a loop; every state
//! mutation, pipeline event, and transport hook runs on it. The loop drains a
//! FIFO task queue and a timer heap:
//!
//! - Tasks enqueued with [`EventLoop::execute`] run in enqueue order, even
//!   when enqueued from the loop thread itself (this is the deferral
//!   primitive the channel core uses to avoid reentrant handler calls).
//! - Timers scheduled with [`EventLoop::schedule`] fire at-or-after their
//!   deadline and can be cancelled up to the moment they run.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{trace, warn};

/// A unit of work for the loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run tasks on some thread.
///
/// Implemented by [`EventLoop`]; transports may also supply one from
/// `prepare_to_close` to run a blocking close off-loop.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

enum LoopMsg {
    Task(Task),
    Timer(TimerEntry),
    Shutdown,
}

struct TimerState {
    cancelled: AtomicBool,
    fired: AtomicBool,
}

/// Cancellation handle for a scheduled timer.
#[derive(Clone)]
pub struct ScheduledHandle {
    state: Arc<TimerState>,
}

impl ScheduledHandle {
    /// Cancel the timer. Returns true if it had not fired yet.
    pub fn cancel(&self) -> bool {
        if self.state.fired.load(Ordering::Acquire) {
            return false;
        }
        self.state
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true if the timer was cancelled before firing.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Returns true once the timer task has run.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    state: Arc<TimerState>,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // BinaryHeap is a max-heap; invert so the earliest deadline surfaces
    // first, FIFO among equal deadlines.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A single-threaded executor owning a set of channels.
pub struct EventLoop {
    name: String,
    tx: flume::Sender<LoopMsg>,
    thread_id: OnceLock<ThreadId>,
    timer_seq: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Spawn a new loop thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn the thread.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let (tx, rx) = flume::unbounded();
        let handle = thread::Builder::new()
            .name(format!("keelson-loop-{name}"))
            .spawn(move || run_loop(&rx))
            .expect("failed to spawn event loop thread");

        let event_loop = Arc::new(Self {
            name,
            tx,
            thread_id: OnceLock::new(),
            timer_seq: AtomicU64::new(1),
            join: Mutex::new(None),
        });
        event_loop
            .thread_id
            .set(handle.thread().id())
            .expect("thread id set once");
        *event_loop.join.lock() = Some(handle);
        event_loop
    }

    /// Loop name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true when called from the loop's own thread.
    #[must_use]
    pub fn in_event_loop(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// Enqueue a task. Order is preserved with respect to every other task
    /// enqueued on this loop.
    pub fn execute_task(&self, task: impl FnOnce() + Send + 'static) {
        if self.tx.send(LoopMsg::Task(Box::new(task))).is_err() {
            warn!(name = %self.name, "event loop stopped, dropping task");
        }
    }

    /// Schedule a task to run after `delay`.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> ScheduledHandle {
        let state = Arc::new(TimerState {
            cancelled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
        });
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.timer_seq.fetch_add(1, Ordering::Relaxed),
            state: state.clone(),
            task: Box::new(task),
        };
        if self.tx.send(LoopMsg::Timer(entry)).is_err() {
            warn!(name = %self.name, "event loop stopped, dropping timer");
            state.cancelled.store(true, Ordering::Release);
        }
        ScheduledHandle { state }
    }

    /// Stop the loop once the queue drains up to the shutdown marker, and
    /// join the thread when called from outside the loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopMsg::Shutdown);
        if !self.in_event_loop() {
            if let Some(handle) = self.join.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

impl TaskExecutor for EventLoop {
    fn execute(&self, task: Task) {
        if self.tx.send(LoopMsg::Task(task)).is_err() {
            warn!(name = %self.name, "event loop stopped, dropping task");
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").field("name", &self.name).finish()
    }
}

fn run_loop(rx: &flume::Receiver<LoopMsg>) {
    let mut timers: BinaryHeap<TimerEntry> = BinaryHeap::new();

    loop {
        // Fire everything that is due before blocking again.
        let now = Instant::now();
        while timers.peek().is_some_and(|entry| entry.deadline <= now) {
            let entry = timers.pop().expect("peeked entry");
            fire_timer(entry);
        }

        let msg = match timers.peek() {
            Some(next) => match rx.recv_deadline(next.deadline) {
                Ok(msg) => msg,
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };

        match msg {
            LoopMsg::Task(task) => task(),
            LoopMsg::Timer(entry) => timers.push(entry),
            LoopMsg::Shutdown => break,
        }
    }
    trace!("event loop thread exiting");
}

fn fire_timer(entry: TimerEntry) {
    if entry.state.cancelled.load(Ordering::Acquire) {
        return;
    }
    entry.state.fired.store(true, Ordering::Release);
    (entry.task)();
}
