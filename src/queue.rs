//! Per-context command serialiser.
//!
//! A [`CommandQueue`] accepts commands from any thread and runs them strictly in
//! arrival order, one at a time, on the blocking pool of an injected
//! [`WorkerPool`]. Queues of different contexts run independently of each other.
//!
//! # Dispatch
//!
//! ```text
//! enqueue ──► pending (FIFO) ──dispatch──► in flight ──complete──► ticket resolved
//!                 ▲                                      │
//!                 └────────── next head if running ◄─────┘
//! ```
//!
//! - `enqueue` never blocks; it starts the queue if it was idle.
//! - Completion pops the entry, resolves its [`Ticket`], drops the queue's reference
//!   to the command and dispatches the next head.
//! - `request_stop` only prevents the next dispatch; an in-flight command finishes.
//! - Commands that bypass the queue (buffer cancellation) are dispatched on arrival,
//!   next to whatever is in flight. They are counted for `wait` and `drained`.
//! - A failing command completes like any other; its negative code is the only
//!   trace of the failure.
//!
//! # Example
//!
//! ```
//! use iio_link::backend::mock::{MockBackend, MockChannel, MockDevice};
//! use iio_link::backend::{Backend, SharedContext};
//! use iio_link::commands::{ChannelAttributeRead, ChannelPath};
//! use iio_link::queue::{CommandQueue, WorkerPool};
//! use iio_link::config::WorkerConfig;
//!
//! let backend = MockBackend::new().with_device(
//!     MockDevice::new("adc").channel(MockChannel::input("voltage0").attr("raw", "7")),
//! );
//! let pool = WorkerPool::new(&WorkerConfig::default()).unwrap();
//! let ctx = SharedContext::new(backend.create_context("local:").unwrap());
//! let queue = CommandQueue::new(ctx, &pool);
//!
//! let read = ChannelAttributeRead::new(ChannelPath::input("adc", "voltage0"), "raw");
//! let ticket = queue.enqueue(read.clone());
//! assert_eq!(ticket.blocking_wait().unwrap(), 1);
//! assert_eq!(read.value().as_deref(), Some("7"));
//! ```

use crate::backend::SharedContext;
use crate::command::{self, SharedCommand};
use crate::config::WorkerConfig;
use crate::error::{Errno, LinkError, LinkResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

// =============================================================================
// WorkerPool
// =============================================================================

struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics; detach instead.
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Executor shared by every queue of a process.
///
/// Commands run on the runtime's blocking pool, since hardware calls block.
/// Queues keep only the runtime [`Handle`]; the owning pool must outlive them for
/// new work to be accepted.
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    _runtime: Option<Arc<OwnedRuntime>>,
}

impl WorkerPool {
    /// Build a dedicated multi-thread runtime.
    ///
    /// Zero-sized pools are rejected with [`LinkError::Configuration`].
    pub fn new(config: &WorkerConfig) -> LinkResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .max_blocking_threads(config.max_blocking_threads)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()?;
        debug!(
            worker_threads = config.worker_threads,
            max_blocking_threads = config.max_blocking_threads,
            "Worker pool started"
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(Arc::new(OwnedRuntime(Some(runtime)))),
        })
    }

    /// Borrow an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }

    /// Borrow the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::from_handle)
    }

    /// Runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("owned", &self._runtime.is_some())
            .finish()
    }
}

// =============================================================================
// Ticket
// =============================================================================

/// Completion handle for one queue entry.
#[derive(Debug)]
pub struct Ticket {
    seq: u64,
    rx: oneshot::Receiver<LinkResult<i32>>,
}

impl Ticket {
    /// Sequence number of the entry (strictly increasing per queue).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the entry's return code.
    pub async fn wait(self) -> LinkResult<i32> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(LinkError::QueueDropped),
        }
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from async context.
    pub fn blocking_wait(self) -> LinkResult<i32> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(LinkError::QueueDropped),
        }
    }
}

// =============================================================================
// CommandQueue
// =============================================================================

struct Entry {
    seq: u64,
    command: SharedCommand,
    done: oneshot::Sender<LinkResult<i32>>,
}

struct QueueState {
    pending: VecDeque<Entry>,
    running: bool,
    in_flight: Option<u64>,
    out_of_band: usize,
    next_seq: u64,
    last_cmd_time: Option<Instant>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.in_flight.is_none()
            && self.out_of_band == 0
            && (self.pending.is_empty() || !self.running)
    }
}

struct QueueInner {
    context: SharedContext,
    runtime: Handle,
    state: Mutex<QueueState>,
    idle: Condvar,
    idle_tx: watch::Sender<bool>,
}

/// FIFO executor for the commands of one context.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    /// Queue serialising access to `context`, running on `pool`.
    pub fn new(context: SharedContext, pool: &WorkerPool) -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            inner: Arc::new(QueueInner {
                context,
                runtime: pool.handle().clone(),
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    running: false,
                    in_flight: None,
                    out_of_band: 0,
                    next_seq: 0,
                    last_cmd_time: None,
                }),
                idle: Condvar::new(),
                idle_tx,
            }),
        }
    }

    /// Append `command` to the tail and start the queue if it is idle.
    ///
    /// The same command may be enqueued any number of times; every call is a
    /// separate entry. If the command is flagged overwrite and has a coalesce key,
    /// pending entries with that key are removed and their tickets resolve to
    /// [`LinkError::Superseded`].
    ///
    /// Commands that [bypass the queue](crate::Command::bypasses_queue) skip the FIFO
    /// and start immediately, even while another command is in flight.
    pub fn enqueue(&self, command: SharedCommand) -> Ticket {
        let (done, rx) = oneshot::channel();
        let mut superseded = Vec::new();

        let seq = {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;

            if command.bypasses_queue() {
                debug!(
                    uri = self.inner.context.uri(),
                    seq,
                    command = command.name(),
                    "Command dispatched ahead of the queue"
                );
                state.out_of_band += 1;
                self.inner.publish_locked(&state);
                let inner = Arc::clone(&self.inner);
                let entry = Entry { seq, command, done };
                drop(self.inner.runtime.spawn_blocking(move || inner.run_out_of_band(entry)));
                return Ticket { seq, rx };
            }

            if command.core().is_overwrite() {
                if let Some(key) = command.coalesce_key() {
                    let (stale, keep): (VecDeque<Entry>, VecDeque<Entry>) = state
                        .pending
                        .drain(..)
                        .partition(|e| e.command.coalesce_key().as_deref() == Some(key.as_str()));
                    state.pending = keep;
                    superseded.extend(stale);
                }
            }

            debug!(
                uri = self.inner.context.uri(),
                seq,
                command = command.name(),
                pending = state.pending.len(),
                "Command enqueued"
            );
            state.pending.push_back(Entry { seq, command, done });

            state.running = true;
            self.inner.dispatch_locked(&mut state);
            seq
        };

        for entry in superseded {
            debug!(seq = entry.seq, command = entry.command.name(), "Command superseded");
            let _ = entry.done.send(Err(LinkError::Superseded));
        }

        Ticket { seq, rx }
    }

    /// Mark the queue active and dispatch the head if nothing is in flight.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        state.running = true;
        self.inner.dispatch_locked(&mut state);
    }

    /// Stop dispatching. An in-flight command still completes.
    pub fn request_stop(&self) {
        let mut state = self.inner.state.lock();
        state.running = false;
        self.inner.publish_locked(&state);
    }

    /// Block until nothing is in flight and nothing more will be dispatched.
    ///
    /// Must not be called from a command observer of this queue.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.is_idle() {
            self.inner.idle.wait(&mut state);
        }
    }

    /// Async variant of [`wait`](Self::wait).
    pub async fn drained(&self) {
        let mut rx = self.inner.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Completion time of the most recent command.
    pub fn last_cmd_time(&self) -> Option<Instant> {
        self.inner.state.lock().last_cmd_time
    }

    /// Entries waiting to be dispatched (excludes the in-flight one).
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// True when nothing is pending or in flight.
    pub fn is_empty(&self) -> bool {
        let state = self.inner.state.lock();
        state.pending.is_empty() && state.in_flight.is_none() && state.out_of_band == 0
    }

    /// True while the queue dispatches.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Context this queue serialises.
    pub fn context(&self) -> &SharedContext {
        &self.inner.context
    }

    /// True if both handles refer to the same queue.
    pub fn same_queue(&self, other: &CommandQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl QueueInner {
    fn dispatch_locked(self: &Arc<Self>, state: &mut QueueState) {
        if state.running && state.in_flight.is_none() {
            match state.pending.pop_front() {
                Some(entry) => {
                    state.in_flight = Some(entry.seq);
                    let inner = Arc::clone(self);
                    // The returned JoinHandle is not needed; completion is tracked in state.
                    drop(self.runtime.spawn_blocking(move || inner.run_entry(entry)));
                }
                None => state.running = false,
            }
        }
        self.publish_locked(state);
    }

    fn publish_locked(&self, state: &QueueState) {
        let idle = state.is_idle();
        self.idle_tx.send_replace(idle);
        if idle {
            self.idle.notify_all();
        }
    }

    fn run_entry(self: Arc<Self>, entry: Entry) {
        self.complete(entry);

        let mut state = self.state.lock();
        state.in_flight = None;
        state.last_cmd_time = Some(Instant::now());
        self.dispatch_locked(&mut state);
    }

    fn run_out_of_band(self: Arc<Self>, entry: Entry) {
        self.complete(entry);

        let mut state = self.state.lock();
        state.out_of_band -= 1;
        state.last_cmd_time = Some(Instant::now());
        self.publish_locked(&state);
    }

    /// Execute `entry` and resolve its ticket.
    fn complete(&self, entry: Entry) {
        let Entry { seq, command, done } = entry;

        // execute() contains command and observer panics; this keeps the queue
        // draining should anything else unwind
        let code = panic::catch_unwind(AssertUnwindSafe(|| {
            command::execute(command.as_ref(), seq, &self.context)
        }))
        .unwrap_or_else(|_| {
            warn!(uri = self.context.uri(), seq, "Command execution panicked");
            Errno::EIO.as_code()
        });

        debug!(
            uri = self.context.uri(),
            seq,
            command = command.name(),
            code,
            "Command finished"
        );
        let _ = done.send(Ok(code));
        // The queue's reference goes away only after every notification is out
        drop(command);
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CommandQueue")
            .field("uri", &self.inner.context.uri())
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .field("in_flight", &state.in_flight)
            .field("out_of_band", &state.out_of_band)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::{Backend, Context};
    use crate::command::{Command, CommandCore, CommandPhase};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records start/finish order and flags overlapping executions.
    struct Timed {
        core: CommandCore,
        id: usize,
        sleep: Duration,
        active: Arc<AtomicUsize>,
        overlaps: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<(usize, CommandPhase)>>>,
    }

    impl Command for Timed {
        fn name(&self) -> &'static str {
            "timed"
        }
        fn core(&self) -> &CommandCore {
            &self.core
        }
        fn run(&self, _context: &mut dyn Context) -> i32 {
            if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(self.sleep);
            self.active.fetch_sub(1, Ordering::SeqCst);
            i32::try_from(self.id).unwrap_or(i32::MAX)
        }
    }

    /// Runs without the context, ahead of the queue.
    struct Urgent {
        core: CommandCore,
    }

    impl Command for Urgent {
        fn name(&self) -> &'static str {
            "urgent"
        }
        fn core(&self) -> &CommandCore {
            &self.core
        }
        fn run(&self, _context: &mut dyn Context) -> i32 {
            -1
        }
        fn bypasses_queue(&self) -> bool {
            true
        }
        fn run_unlocked(&self) -> i32 {
            7
        }
    }

    struct Harness {
        pool: WorkerPool,
        queue: CommandQueue,
        active: Arc<AtomicUsize>,
        overlaps: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<(usize, CommandPhase)>>>,
    }

    impl Harness {
        fn new() -> Self {
            let pool = WorkerPool::new(&WorkerConfig::default()).unwrap();
            let ctx = SharedContext::new(MockBackend::new().create_context("local:").unwrap());
            let queue = CommandQueue::new(ctx, &pool);
            Self {
                pool,
                queue,
                active: Arc::default(),
                overlaps: Arc::default(),
                log: Arc::default(),
            }
        }

        fn timed(&self, id: usize, sleep_ms: u64) -> Arc<Timed> {
            let timed = Arc::new(Timed {
                core: CommandCore::new(),
                id,
                sleep: Duration::from_millis(sleep_ms),
                active: Arc::clone(&self.active),
                overlaps: Arc::clone(&self.overlaps),
                log: Arc::clone(&self.log),
            });
            let log = Arc::clone(&timed.log);
            timed.core.on_started(move |_| log.lock().push((id, CommandPhase::Started)));
            let log = Arc::clone(&timed.log);
            timed.core.on_finished(move |_| log.lock().push((id, CommandPhase::Finished)));
            timed
        }
    }

    #[test]
    fn executes_in_fifo_order_without_overlap() {
        let h = Harness::new();
        let tickets: Vec<Ticket> = (0..8)
            .map(|i| h.queue.enqueue(h.timed(i, 3)))
            .collect();
        h.queue.wait();

        let log = h.log.lock().clone();
        let expected: Vec<(usize, CommandPhase)> = (0..8)
            .flat_map(|i| [(i, CommandPhase::Started), (i, CommandPhase::Finished)])
            .collect();
        assert_eq!(log, expected);
        assert_eq!(h.overlaps.load(Ordering::SeqCst), 0);

        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(ticket.seq(), i as u64);
            assert_eq!(ticket.blocking_wait().unwrap(), i as i32);
        }
        assert!(h.queue.is_empty());
        assert!(!h.queue.is_running());
        drop(h.pool);
    }

    #[test]
    fn concurrent_enqueue_from_many_threads() {
        let h = Harness::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = h.queue.clone();
                let commands: Vec<_> = (0..5).map(|i| h.timed(t * 10 + i, 1)).collect();
                std::thread::spawn(move || {
                    for timed in commands {
                        queue.enqueue(timed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        h.queue.wait();

        let log = h.log.lock().clone();
        assert_eq!(log.len(), 40);
        // Strict alternation: every start is immediately followed by its own finish
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, CommandPhase::Started);
            assert_eq!(pair[1].1, CommandPhase::Finished);
        }
        assert_eq!(h.overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn same_command_twice_yields_two_entries() {
        let h = Harness::new();
        let timed = h.timed(5, 2);
        let first = h.queue.enqueue(timed.clone());
        let second = h.queue.enqueue(timed.clone());
        assert_ne!(first.seq(), second.seq());
        h.queue.wait();

        assert_eq!(
            *h.log.lock(),
            vec![
                (5, CommandPhase::Started),
                (5, CommandPhase::Finished),
                (5, CommandPhase::Started),
                (5, CommandPhase::Finished),
            ]
        );
        assert_eq!(timed.core().executions(), 2);
        assert_eq!(first.blocking_wait().unwrap(), 5);
        assert_eq!(second.blocking_wait().unwrap(), 5);
    }

    #[test]
    fn request_stop_holds_pending_until_start() {
        let h = Harness::new();
        let gate = h.timed(0, 30);
        h.queue.enqueue(gate);
        h.queue.enqueue(h.timed(1, 1));
        h.queue.request_stop();
        h.queue.wait();

        // The in-flight command finished, the next one was never dispatched
        assert_eq!(
            *h.log.lock(),
            vec![(0, CommandPhase::Started), (0, CommandPhase::Finished)]
        );
        assert_eq!(h.queue.len(), 1);

        h.queue.start();
        h.queue.wait();
        assert_eq!(h.log.lock().len(), 4);
        assert!(h.queue.last_cmd_time().is_some());
    }

    #[test]
    fn overwrite_supersedes_pending_entries() {
        use crate::commands::{ChannelAttributeWrite, ChannelPath};

        let h = Harness::new();
        // Keep the queue busy so the writes stay pending
        let blocker = h.timed(0, 50);
        let path = ChannelPath::output("dac", "voltage0");
        let w1 = ChannelAttributeWrite::new(path.clone(), "raw", "1");
        let w2 = ChannelAttributeWrite::new(path, "raw", "2");
        w2.core().set_overwrite(true);

        let t0 = h.queue.enqueue(blocker);
        let t1 = h.queue.enqueue(w1);
        let t2 = h.queue.enqueue(w2);
        h.queue.wait();

        assert!(t0.blocking_wait().is_ok());
        assert!(matches!(t1.blocking_wait(), Err(LinkError::Superseded)));
        // Device "dac" does not exist in the empty mock tree
        assert_eq!(t2.blocking_wait().unwrap(), -2);
    }

    #[test]
    fn bypassing_command_overtakes_in_flight_one() {
        let h = Harness::new();
        let slow = h.queue.enqueue(h.timed(0, 80));
        let queued = h.queue.enqueue(h.timed(1, 1));
        std::thread::sleep(Duration::from_millis(20));

        let urgent = Arc::new(Urgent {
            core: CommandCore::new(),
        });
        let log = Arc::clone(&h.log);
        urgent.core.on_finished(move |_| log.lock().push((99, CommandPhase::Finished)));
        assert_eq!(h.queue.enqueue(urgent).blocking_wait().unwrap(), 7);

        // Done while the slow command still holds the context
        assert_eq!(
            *h.log.lock(),
            vec![(0, CommandPhase::Started), (99, CommandPhase::Finished)]
        );
        assert_eq!(slow.blocking_wait().unwrap(), 0);
        assert_eq!(queued.blocking_wait().unwrap(), 1);
        h.queue.wait();
        assert!(h.queue.is_empty());
    }

    #[test]
    fn zero_sized_pool_is_a_configuration_error() {
        let config = WorkerConfig {
            worker_threads: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(WorkerPool::new(&config), Err(LinkError::Configuration(_))));

        let config = WorkerConfig {
            max_blocking_threads: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(WorkerPool::new(&config), Err(LinkError::Configuration(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drained_resolves_when_idle() {
        let pool = WorkerPool::current().unwrap();
        let ctx = SharedContext::new(MockBackend::new().create_context("local:").unwrap());
        let queue = CommandQueue::new(ctx, &pool);
        let ticket = queue.enqueue(crate::commands::ContextPing::new());
        queue.drained().await;
        assert_eq!(ticket.wait().await.unwrap(), 0);
        assert!(queue.is_empty());
    }
}
