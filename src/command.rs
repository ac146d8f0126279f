//! Command abstraction: one unit of work against a hardware context.
//!
//! A command carries everything it needs to perform exactly one backend operation
//! plus a result slot. Ownership is shared: callers keep an `Arc` to read the typed
//! payload after completion while the queue holds its own clone for the duration of
//! the entry.
//!
//! Two lifecycle events are observable per execution, [`CommandPhase::Started`] and
//! [`CommandPhase::Finished`]. Both are delivered on the worker thread that runs the
//! command, so observers must not block on the queue they were fired from.

use crate::backend::{Context, SharedContext};
use crate::error::Errno;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Shared handle to a type-erased command.
pub type SharedCommand = Arc<dyn Command>;

/// Observer callback type.
pub type Observer = Arc<dyn Fn(&CommandEvent) + Send + Sync>;

/// Lifecycle phase reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    /// About to call the backend
    Started,
    /// Backend call returned and the result slot is set
    Finished,
}

/// Notification delivered to command observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    /// Command variant name
    pub command: &'static str,
    /// Queue sequence number of the entry being executed
    pub seq: u64,
    /// Which phase fired
    pub phase: CommandPhase,
    /// Return code; always 0 for `Started`
    pub code: i32,
}

/// Handle used to detach an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

// =============================================================================
// CommandCore
// =============================================================================

/// State every command variant embeds: result code, overwrite flag, observers.
pub struct CommandCore {
    code: AtomicI32,
    executions: AtomicU64,
    overwrite: AtomicBool,
    next_observer: AtomicU64,
    observers: Mutex<Vec<(ObserverId, CommandPhase, Observer)>>,
}

impl CommandCore {
    /// Fresh core with return code 0 and no observers.
    pub fn new() -> Self {
        Self {
            code: AtomicI32::new(0),
            executions: AtomicU64::new(0),
            overwrite: AtomicBool::new(false),
            next_observer: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Return code of the most recent execution.
    pub fn return_code(&self) -> i32 {
        self.code.load(Ordering::SeqCst)
    }

    pub(crate) fn set_return_code(&self, code: i32) {
        self.code.store(code, Ordering::SeqCst);
    }

    /// How many times this command has finished executing.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Whether enqueuing this command supersedes pending entries with the same key.
    pub fn is_overwrite(&self) -> bool {
        self.overwrite.load(Ordering::SeqCst)
    }

    /// Set the overwrite flag.
    pub fn set_overwrite(&self, overwrite: bool) {
        self.overwrite.store(overwrite, Ordering::SeqCst);
    }

    /// Attach an observer for `phase`.
    pub fn observe(
        &self,
        phase: CommandPhase,
        observer: impl Fn(&CommandEvent) + Send + Sync + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, phase, Arc::new(observer)));
        id
    }

    /// Attach a "started" observer.
    pub fn on_started(
        &self,
        observer: impl Fn(&CommandEvent) + Send + Sync + 'static,
    ) -> ObserverId {
        self.observe(CommandPhase::Started, observer)
    }

    /// Attach a "finished" observer.
    pub fn on_finished(
        &self,
        observer: impl Fn(&CommandEvent) + Send + Sync + 'static,
    ) -> ObserverId {
        self.observe(CommandPhase::Finished, observer)
    }

    /// Detach an observer. Returns false if it was not attached.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _, _)| *oid != id);
        observers.len() != before
    }

    fn emit(&self, event: &CommandEvent) {
        // Snapshot so observers may attach/detach from inside a callback
        let targets: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .filter(|(_, phase, _)| *phase == event.phase)
            .map(|(_, _, observer)| Arc::clone(observer))
            .collect();
        for observer in targets {
            // A panicking observer must not cost the others their event
            if panic::catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                warn!(
                    command = event.command,
                    seq = event.seq,
                    phase = ?event.phase,
                    "Command observer panicked"
                );
            }
        }
    }
}

impl Default for CommandCore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCore")
            .field("code", &self.return_code())
            .field("executions", &self.executions())
            .field("overwrite", &self.is_overwrite())
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

// =============================================================================
// Payload slot
// =============================================================================

/// Typed result payload owned by a command variant.
#[derive(Debug)]
pub struct Payload<T>(Mutex<Option<T>>);

impl<T: Clone> Payload<T> {
    /// Empty slot.
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    /// Replace the stored value.
    pub fn set(&self, value: Option<T>) {
        *self.0.lock() = value;
    }

    /// Clone of the stored value.
    pub fn get(&self) -> Option<T> {
        self.0.lock().clone()
    }

    /// Empty the slot.
    pub fn clear(&self) {
        self.0.lock().take();
    }
}

impl<T: Clone> Default for Payload<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Command Trait
// =============================================================================

/// One operation against a hardware context.
///
/// Implementors hold only their own parameters and payload; [`run`](Command::run)
/// performs the backend call, stores the payload and returns the code (negative on
/// failure). The queue wraps `run` with notifications and result bookkeeping.
///
/// The payload always describes the most recent execution: it is cleared before
/// each run, so a failed execution leaves it empty.
pub trait Command: Send + Sync + 'static {
    /// Variant name for logging
    fn name(&self) -> &'static str;

    /// Shared per-command state
    fn core(&self) -> &CommandCore;

    /// Perform the operation. Called on a worker, never concurrently for one context.
    fn run(&self, context: &mut dyn Context) -> i32;

    /// Drop the payload of the previous execution.
    fn clear_payload(&self) {}

    /// True for commands that must reach the backend while another command holds
    /// the context, such as cancelling a blocked refill. The queue dispatches them
    /// on arrival and runs [`run_unlocked`](Command::run_unlocked) instead of `run`.
    fn bypasses_queue(&self) -> bool {
        false
    }

    /// Operation for [`bypasses_queue`](Command::bypasses_queue) commands. Must only
    /// use thread-safe backend handles captured earlier, never the context.
    fn run_unlocked(&self) -> i32 {
        Errno::ENOSYS.as_code()
    }

    /// Key used to coalesce overwrite commands; `None` disables coalescing.
    fn coalesce_key(&self) -> Option<String> {
        None
    }

    /// Return code of the most recent execution.
    fn return_code(&self) -> i32 {
        self.core().return_code()
    }
}

/// Execute one queue entry: "started", backend call, result store, "finished".
///
/// A sealed or released context yields `-ENODEV`; a panicking command yields
/// `-EIO`. Both events fire even if an observer panics.
pub(crate) fn execute(command: &dyn Command, seq: u64, context: &SharedContext) -> i32 {
    let name = command.name();
    let core = command.core();

    core.emit(&CommandEvent {
        command: name,
        seq,
        phase: CommandPhase::Started,
        code: 0,
    });

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        command.clear_payload();
        if !command.bypasses_queue() {
            return context.with(|ctx| command.run(ctx));
        }
        // Unlocked commands still honour teardown
        if context.is_sealed() {
            None
        } else {
            Some(command.run_unlocked())
        }
    }));
    let code = match outcome {
        Ok(Some(code)) => code,
        Ok(None) => Errno::ENODEV.as_code(),
        Err(_) => {
            warn!(command = name, seq, uri = context.uri(), "Command panicked during execution");
            Errno::EIO.as_code()
        }
    };

    core.set_return_code(code);
    core.executions.fetch_add(1, Ordering::SeqCst);
    trace!(command = name, seq, code, "Command executed");

    core.emit(&CommandEvent {
        command: name,
        seq,
        phase: CommandPhase::Finished,
        code,
    });
    code
}

/// Convert a backend result into a return code, storing the success value.
pub(crate) fn store<T>(result: Result<T, Errno>, on_ok: impl FnOnce(T) -> i32) -> i32 {
    match result {
        Ok(value) => on_ok(value),
        Err(errno) => errno.as_code(),
    }
}
