//! Buffer lifecycle commands.
//!
//! A refill blocks its worker, and the context, until data arrives. Cancelling it
//! therefore cannot wait in line: [`DeviceCreateBuffer`] captures the backend's
//! thread-safe [`BufferCanceller`] alongside the new buffer, and [`BufferCancel`]
//! fires that handle as soon as it is enqueued, ahead of the FIFO and without
//! taking the context.

use super::{len_code, resolve_device};
use crate::backend::{BufferCanceller, BufferId, Context};
use crate::command::{store, Command, CommandCore, Payload};
use std::sync::Arc;

/// Create a buffer on a device. Payload is the new [`BufferId`] and its canceller.
#[derive(Debug)]
pub struct DeviceCreateBuffer {
    core: CommandCore,
    device: String,
    samples: usize,
    cyclic: bool,
    buffer: Payload<BufferId>,
    canceller: Payload<BufferCanceller>,
}

impl DeviceCreateBuffer {
    /// Buffer of `samples` samples on `device`.
    pub fn new(device: impl Into<String>, samples: usize, cyclic: bool) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            device: device.into(),
            samples,
            cyclic,
            buffer: Payload::new(),
            canceller: Payload::new(),
        })
    }

    /// Buffer created by the most recent execution, if it succeeded.
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer.get()
    }

    /// Cancellation handle for [`buffer`](Self::buffer), if the backend offers one.
    pub fn canceller(&self) -> Option<BufferCanceller> {
        self.canceller.get()
    }
}

impl Command for DeviceCreateBuffer {
    fn name(&self) -> &'static str {
        "device_create_buffer"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let device = match resolve_device(context, &self.device) {
            Ok(device) => device,
            Err(code) => return code,
        };
        store(context.create_buffer(device, self.samples, self.cyclic), |buffer| {
            self.canceller.set(context.buffer_canceller(buffer).ok());
            self.buffer.set(Some(buffer));
            0
        })
    }

    fn clear_payload(&self) {
        self.buffer.clear();
        self.canceller.clear();
    }
}

/// Push output samples. Code is the number of bytes pushed.
#[derive(Debug)]
pub struct BufferPush {
    core: CommandCore,
    buffer: BufferId,
    data: Vec<u8>,
}

impl BufferPush {
    /// Push `data` into `buffer`.
    pub fn new(buffer: BufferId, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            buffer,
            data,
        })
    }
}

impl Command for BufferPush {
    fn name(&self) -> &'static str {
        "buffer_push"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        store(context.push_buffer(self.buffer, &self.data), len_code)
    }
}

/// Refill an input buffer. Code is the number of bytes captured.
#[derive(Debug)]
pub struct BufferRefill {
    core: CommandCore,
    buffer: BufferId,
    data: Payload<Vec<u8>>,
}

impl BufferRefill {
    /// Refill `buffer`.
    pub fn new(buffer: BufferId) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            buffer,
            data: Payload::new(),
        })
    }

    /// Bytes captured by the most recent execution, if it succeeded.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.data.get()
    }
}

impl Command for BufferRefill {
    fn name(&self) -> &'static str {
        "buffer_refill"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        store(context.refill_buffer(self.buffer), |data| {
            let code = len_code(data.len());
            self.data.set(Some(data));
            code
        })
    }

    fn clear_payload(&self) {
        self.data.clear();
    }
}

/// Cancel blocking operations on a buffer.
///
/// Runs on arrival, racing whatever command currently holds the context. A refill
/// blocked on the buffer returns `-EBADF`, as do later pushes and refills.
#[derive(Debug)]
pub struct BufferCancel {
    core: CommandCore,
    canceller: BufferCanceller,
}

impl BufferCancel {
    /// Cancel the buffer behind `canceller`, see [`DeviceCreateBuffer::canceller`].
    pub fn new(canceller: BufferCanceller) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            canceller,
        })
    }
}

impl Command for BufferCancel {
    fn name(&self) -> &'static str {
        "buffer_cancel"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, _context: &mut dyn Context) -> i32 {
        self.run_unlocked()
    }

    fn bypasses_queue(&self) -> bool {
        true
    }

    fn run_unlocked(&self) -> i32 {
        store(self.canceller.cancel(), |()| 0)
    }
}

/// Destroy a buffer.
#[derive(Debug)]
pub struct BufferDestroy {
    core: CommandCore,
    buffer: BufferId,
}

impl BufferDestroy {
    /// Destroy `buffer`.
    pub fn new(buffer: BufferId) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            buffer,
        })
    }
}

impl Command for BufferDestroy {
    fn name(&self) -> &'static str {
        "buffer_destroy"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        store(context.destroy_buffer(self.buffer), |()| 0)
    }
}
