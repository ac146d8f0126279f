//! Hardware backend seam.
//!
//! The backend owns the actual device-tree protocol; this crate only needs the
//! operations listed on [`Context`]. A context is NOT safe for concurrent use, so the
//! trait takes `&mut self` for everything that talks to hardware and the crate keeps
//! each context behind a [`SharedContext`] that only the command queue touches.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ConnectionProvider / CommandQueueProvider    │
//! ├──────────────────────────────────────────────┤
//! │  CommandQueue  ──execute()──►  SharedContext  │
//! ├──────────────────────────────────────────────┤
//! │  Backend::create_context(uri) → Box<Context>  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Lookups (`find_device`, `find_channel`, enumeration) return [`Outcome`] so the
//! validity check is explicit at every call site. Hardware operations return
//! `Result<_, Errno>`; commands turn the errno into their negative return code.

pub mod mock;

use crate::error::Errno;
use crate::outcome::Outcome;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// Handles
// =============================================================================

/// Opaque device handle, valid only for the context that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub usize);

/// Opaque channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    /// Owning device
    pub device: DeviceId,
    /// Channel index within the device
    pub index: usize,
}

/// Opaque buffer handle returned by [`Context::create_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Cancels blocking operations on one buffer from any thread.
///
/// Unlike every other operation this does not need the context, so it can run
/// while a refill holds the context waiting for data.
pub trait Canceller: Send + Sync + fmt::Debug {
    /// Wake pending and future blocking operations on the buffer with an error.
    fn cancel(&self) -> Result<(), Errno>;
}

/// Shared cancellation handle, see [`Context::buffer_canceller`].
pub type BufferCanceller = Arc<dyn Canceller>;

// =============================================================================
// Backend Traits
// =============================================================================

/// One live connection to an instrumentation device tree.
///
/// Dropping the box destroys the backend context.
pub trait Context: Send {
    /// URI this context was created from
    fn uri(&self) -> &str;

    /// Names of all devices in the tree
    fn device_names(&self) -> Vec<String>;

    /// Look up a device by name
    fn find_device(&self, name: &str) -> Outcome<DeviceId>;

    /// Names of the device's attributes
    fn device_attr_names(&self, device: DeviceId) -> Outcome<Vec<String>>;

    /// Names of the device's channels
    fn channel_names(&self, device: DeviceId) -> Outcome<Vec<String>>;

    /// Look up a channel by name and direction
    fn find_channel(&self, device: DeviceId, name: &str, output: bool) -> Outcome<ChannelId>;

    /// Read a device attribute
    fn read_device_attr(&mut self, device: DeviceId, attr: &str) -> Result<String, Errno>;

    /// Write a device attribute, returning the number of bytes written
    fn write_device_attr(&mut self, device: DeviceId, attr: &str, value: &str)
        -> Result<usize, Errno>;

    /// Read a channel attribute
    fn read_channel_attr(&mut self, channel: ChannelId, attr: &str) -> Result<String, Errno>;

    /// Write a channel attribute, returning the number of bytes written
    fn write_channel_attr(
        &mut self,
        channel: ChannelId,
        attr: &str,
        value: &str,
    ) -> Result<usize, Errno>;

    /// Enable or disable a channel for buffered capture
    fn set_channel_enabled(&mut self, channel: ChannelId, enabled: bool) -> Result<(), Errno>;

    /// Create a sample buffer on a device
    fn create_buffer(
        &mut self,
        device: DeviceId,
        samples: usize,
        cyclic: bool,
    ) -> Result<BufferId, Errno>;

    /// Push output samples, returning the number of bytes pushed
    fn push_buffer(&mut self, buffer: BufferId, data: &[u8]) -> Result<usize, Errno>;

    /// Refill an input buffer, returning the captured bytes
    fn refill_buffer(&mut self, buffer: BufferId) -> Result<Vec<u8>, Errno>;

    /// Thread-safe handle that cancels blocking operations on a buffer
    fn buffer_canceller(&mut self, buffer: BufferId) -> Result<BufferCanceller, Errno>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), Errno>;

    /// Current trigger of a device, if any
    fn trigger(&mut self, device: DeviceId) -> Result<Option<DeviceId>, Errno>;

    /// Set or clear a device's trigger
    fn set_trigger(&mut self, device: DeviceId, trigger: Option<DeviceId>) -> Result<(), Errno>;

    /// Raw debug register read
    fn register_read(&mut self, device: DeviceId, address: u32) -> Result<u32, Errno>;

    /// Raw debug register write
    fn register_write(&mut self, device: DeviceId, address: u32, value: u32)
        -> Result<(), Errno>;

    /// Cheap round-trip used for liveness checks
    fn ping(&mut self) -> Result<(), Errno>;
}

/// Factory for contexts.
pub trait Backend: Send + Sync {
    /// Create a context for `uri`, or fail with the backend errno.
    fn create_context(&self, uri: &str) -> Result<Box<dyn Context>, Errno>;
}

// =============================================================================
// SharedContext
// =============================================================================

/// Identity of a [`SharedContext`], used as the legacy registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKey(usize);

struct SharedInner {
    uri: String,
    sealed: AtomicBool,
    slot: Mutex<Option<Box<dyn Context>>>,
}

/// A context slot shared between its owner and the command queue.
///
/// Access is serialised by the slot lock. [`SharedContext::seal`] stops all further
/// access while keeping the context alive; [`SharedContext::release`] destroys it.
/// Both wait for a command holding the context to return.
#[derive(Clone)]
pub struct SharedContext {
    inner: Arc<SharedInner>,
}

impl SharedContext {
    /// Wrap a freshly created context.
    pub fn new(context: Box<dyn Context>) -> Self {
        let uri = context.uri().to_string();
        Self {
            inner: Arc::new(SharedInner {
                uri,
                sealed: AtomicBool::new(false),
                slot: Mutex::new(Some(context)),
            }),
        }
    }

    /// URI of the wrapped context (kept after release).
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Identity key for this slot.
    pub fn key(&self) -> HandleKey {
        HandleKey(Arc::as_ptr(&self.inner) as *const () as usize)
    }

    /// True until [`release`](Self::release) runs.
    pub fn is_valid(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    /// True once [`seal`](Self::seal) or [`release`](Self::release) has run.
    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Run `f` against the context, or return `None` once sealed or released.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn Context) -> R) -> Option<R> {
        let mut slot = self.inner.slot.lock();
        if self.is_sealed() {
            return None;
        }
        match slot.as_deref_mut() {
            Some(context) => Some(f(context)),
            None => None,
        }
    }

    /// Refuse all further access without destroying the context.
    ///
    /// Returns once a caller currently inside [`with`](Self::with) has left it. Callers
    /// still waiting for the lock at that point get `None`.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
        drop(self.inner.slot.lock());
    }

    /// Destroy the wrapped context. Returns false if it was already released.
    pub fn release(&self) -> bool {
        self.inner.sealed.store(true, Ordering::SeqCst);
        let taken = self.inner.slot.lock().take();
        let released = taken.is_some();
        // Dropped outside the lock so backend teardown never runs while holding it.
        drop(taken);
        released
    }
}

impl fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContext")
            .field("uri", &self.inner.uri)
            .field("valid", &self.is_valid())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
