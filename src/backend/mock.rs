//! Mock Backend Implementation
//!
//! Provides a simulated device tree for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockBackend` - context factory with a fixed device tree and unreachable URIs
//! - `MockContext` - one simulated connection, created by the backend
//! - `MockStats` - shared counters for context create/destroy and call accounting
//!
//! # Behaviour
//!
//! - Unknown devices, channels or attributes fail with `ENOENT`
//! - Refills of a cancelled buffer fail with `EBADF`
//! - With stalled refills, a refill blocks until its buffer is cancelled, like a
//!   capture waiting on a trigger that never fires
//! - While the link is marked down every hardware call fails with `ETIMEDOUT`
//! - An optional per-call delay simulates slow links (uses `std::thread::sleep`,
//!   since contexts are only ever driven from the blocking worker pool)
//!
//! # Example
//!
//! ```
//! use iio_link::backend::mock::{MockBackend, MockChannel, MockDevice};
//! use iio_link::backend::Backend;
//!
//! let backend = MockBackend::new().with_device(
//!     MockDevice::new("ad7124").channel(MockChannel::input("voltage0").attr("raw", "512")),
//! );
//! let mut ctx = backend.create_context("usb:1.2.3").unwrap();
//! let dev = ctx.find_device("ad7124").data();
//! let ch = ctx.find_channel(dev, "voltage0", false).data();
//! assert_eq!(ctx.read_channel_attr(ch, "raw").unwrap(), "512");
//! ```

use crate::backend::{
    Backend, BufferCanceller, BufferId, Canceller, ChannelId, Context, DeviceId,
};
use crate::error::Errno;
use crate::outcome::Outcome;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Device Tree Description
// =============================================================================

/// Simulated channel.
#[derive(Debug, Clone)]
pub struct MockChannel {
    name: String,
    output: bool,
    enabled: bool,
    attrs: BTreeMap<String, String>,
}

impl MockChannel {
    /// Input (capture) channel
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: false,
            enabled: false,
            attrs: BTreeMap::new(),
        }
    }

    /// Output (generation) channel
    pub fn output(name: impl Into<String>) -> Self {
        Self {
            output: true,
            ..Self::input(name)
        }
    }

    /// Add an attribute with an initial value
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }
}

/// Simulated device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    name: String,
    attrs: BTreeMap<String, String>,
    channels: Vec<MockChannel>,
    registers: HashMap<u32, u32>,
    trigger: Option<DeviceId>,
}

impl MockDevice {
    /// Device with no attributes or channels
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
            channels: Vec::new(),
            registers: HashMap::new(),
            trigger: None,
        }
    }

    /// Add a device attribute
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Add a channel
    pub fn channel(mut self, channel: MockChannel) -> Self {
        self.channels.push(channel);
        self
    }

    /// Preset a debug register
    pub fn register(mut self, address: u32, value: u32) -> Self {
        self.registers.insert(address, value);
        self
    }
}

// =============================================================================
// MockStats - Shared Counters
// =============================================================================

/// Counters shared by a backend and every context it creates.
#[derive(Debug, Default)]
pub struct MockStats {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    calls: AtomicUsize,
    link_down: AtomicBool,
}

impl MockStats {
    /// Contexts created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Contexts destroyed so far
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Contexts currently alive
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.destroyed())
    }

    /// Hardware calls issued across all contexts
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Simulate losing (or regaining) the physical link
    pub fn set_link_down(&self, down: bool) {
        self.link_down.store(down, Ordering::SeqCst);
    }
}

// =============================================================================
// MockBackend
// =============================================================================

/// Context factory serving a fixed device tree.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    devices: Vec<MockDevice>,
    unreachable: HashSet<String>,
    delay: Option<Duration>,
    stall_refills: bool,
    stats: Arc<MockStats>,
}

impl MockBackend {
    /// Backend with an empty device tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the tree every new context starts from
    pub fn with_device(mut self, device: MockDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Make context creation fail for `uri`
    pub fn with_unreachable(mut self, uri: impl Into<String>) -> Self {
        self.unreachable.insert(uri.into());
        self
    }

    /// Sleep this long inside every hardware call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block every refill until its buffer is cancelled
    pub fn with_stalled_refills(mut self) -> Self {
        self.stall_refills = true;
        self
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl Backend for MockBackend {
    fn create_context(&self, uri: &str) -> Result<Box<dyn Context>, Errno> {
        if self.unreachable.contains(uri) {
            return Err(Errno::ENOENT);
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            uri: uri.to_string(),
            devices: self.devices.clone(),
            buffers: HashMap::new(),
            next_buffer: 1,
            delay: self.delay,
            stall_refills: self.stall_refills,
            stats: Arc::clone(&self.stats),
        }))
    }
}

// =============================================================================
// MockContext
// =============================================================================

/// Cancellation flag shared between a buffer and its cancellers.
#[derive(Debug, Default)]
struct CancelSignal {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelSignal {
    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    fn wait_cancelled(&self) {
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            self.wake.wait(&mut cancelled);
        }
    }
}

impl Canceller for CancelSignal {
    fn cancel(&self) -> Result<(), Errno> {
        *self.cancelled.lock() = true;
        self.wake.notify_all();
        Ok(())
    }
}

#[derive(Debug)]
struct MockBuffer {
    device: DeviceId,
    samples: usize,
    signal: Arc<CancelSignal>,
    fills: u8,
}

/// One simulated connection.
#[derive(Debug)]
pub struct MockContext {
    uri: String,
    devices: Vec<MockDevice>,
    buffers: HashMap<u64, MockBuffer>,
    next_buffer: u64,
    delay: Option<Duration>,
    stall_refills: bool,
    stats: Arc<MockStats>,
}

impl MockContext {
    fn hardware_call(&self) -> Result<(), Errno> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.stats.link_down.load(Ordering::SeqCst) {
            return Err(Errno::ETIMEDOUT);
        }
        Ok(())
    }

    fn device(&self, id: DeviceId) -> Result<&MockDevice, Errno> {
        self.devices.get(id.0).ok_or(Errno::ENOENT)
    }

    fn device_mut(&mut self, id: DeviceId) -> Result<&mut MockDevice, Errno> {
        self.devices.get_mut(id.0).ok_or(Errno::ENOENT)
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut MockChannel, Errno> {
        self.device_mut(id.device)?
            .channels
            .get_mut(id.index)
            .ok_or(Errno::ENOENT)
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut MockBuffer, Errno> {
        self.buffers.get_mut(&id.0).ok_or(Errno::ENOENT)
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.stats.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Context for MockContext {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    fn find_device(&self, name: &str) -> Outcome<DeviceId> {
        match self.devices.iter().position(|d| d.name == name) {
            Some(index) => Outcome::valid(DeviceId(index)),
            None => Outcome::from_errno(Errno::ENOENT),
        }
    }

    fn device_attr_names(&self, device: DeviceId) -> Outcome<Vec<String>> {
        self.device(device)
            .map(|d| d.attrs.keys().cloned().collect())
            .into()
    }

    fn channel_names(&self, device: DeviceId) -> Outcome<Vec<String>> {
        self.device(device)
            .map(|d| d.channels.iter().map(|c| c.name.clone()).collect())
            .into()
    }

    fn find_channel(&self, device: DeviceId, name: &str, output: bool) -> Outcome<ChannelId> {
        let found = self.device(device).and_then(|d| {
            d.channels
                .iter()
                .position(|c| c.name == name && c.output == output)
                .ok_or(Errno::ENOENT)
        });
        found.map(|index| ChannelId { device, index }).into()
    }

    fn read_device_attr(&mut self, device: DeviceId, attr: &str) -> Result<String, Errno> {
        self.hardware_call()?;
        self.device(device)?
            .attrs
            .get(attr)
            .cloned()
            .ok_or(Errno::ENOENT)
    }

    fn write_device_attr(
        &mut self,
        device: DeviceId,
        attr: &str,
        value: &str,
    ) -> Result<usize, Errno> {
        self.hardware_call()?;
        let slot = self
            .device_mut(device)?
            .attrs
            .get_mut(attr)
            .ok_or(Errno::ENOENT)?;
        *slot = value.to_string();
        Ok(value.len())
    }

    fn read_channel_attr(&mut self, channel: ChannelId, attr: &str) -> Result<String, Errno> {
        self.hardware_call()?;
        self.channel_mut(channel)?
            .attrs
            .get(attr)
            .cloned()
            .ok_or(Errno::ENOENT)
    }

    fn write_channel_attr(
        &mut self,
        channel: ChannelId,
        attr: &str,
        value: &str,
    ) -> Result<usize, Errno> {
        self.hardware_call()?;
        let slot = self
            .channel_mut(channel)?
            .attrs
            .get_mut(attr)
            .ok_or(Errno::ENOENT)?;
        *slot = value.to_string();
        Ok(value.len())
    }

    fn set_channel_enabled(&mut self, channel: ChannelId, enabled: bool) -> Result<(), Errno> {
        self.hardware_call()?;
        self.channel_mut(channel)?.enabled = enabled;
        Ok(())
    }

    fn create_buffer(
        &mut self,
        device: DeviceId,
        samples: usize,
        _cyclic: bool,
    ) -> Result<BufferId, Errno> {
        self.hardware_call()?;
        let dev = self.device(device)?;
        if samples == 0 || !dev.channels.iter().any(|c| c.enabled) {
            return Err(Errno::EINVAL);
        }
        let id = self.next_buffer;
        self.next_buffer += 1;
        self.buffers.insert(
            id,
            MockBuffer {
                device,
                samples,
                signal: Arc::default(),
                fills: 0,
            },
        );
        Ok(BufferId(id))
    }

    fn push_buffer(&mut self, buffer: BufferId, data: &[u8]) -> Result<usize, Errno> {
        self.hardware_call()?;
        if self.buffer_mut(buffer)?.signal.is_cancelled() {
            return Err(Errno::EBADF);
        }
        Ok(data.len())
    }

    fn refill_buffer(&mut self, buffer: BufferId) -> Result<Vec<u8>, Errno> {
        self.hardware_call()?;
        let signal = Arc::clone(&self.buffer_mut(buffer)?.signal);
        if self.stall_refills {
            signal.wait_cancelled();
        }
        if signal.is_cancelled() {
            return Err(Errno::EBADF);
        }
        let buf = self.buffer_mut(buffer)?;
        buf.fills = buf.fills.wrapping_add(1);
        let (device, samples, fill) = (buf.device, buf.samples, buf.fills);
        let enabled = self
            .device(device)?
            .channels
            .iter()
            .filter(|c| c.enabled)
            .count();
        // Two bytes per sample per enabled channel, stamped with the fill counter
        Ok(vec![fill; samples * enabled * 2])
    }

    fn buffer_canceller(&mut self, buffer: BufferId) -> Result<BufferCanceller, Errno> {
        let signal: BufferCanceller = self.buffer_mut(buffer)?.signal.clone();
        Ok(signal)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), Errno> {
        self.hardware_call()?;
        self.buffers
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or(Errno::ENOENT)
    }

    fn trigger(&mut self, device: DeviceId) -> Result<Option<DeviceId>, Errno> {
        self.hardware_call()?;
        Ok(self.device(device)?.trigger)
    }

    fn set_trigger(&mut self, device: DeviceId, trigger: Option<DeviceId>) -> Result<(), Errno> {
        self.hardware_call()?;
        if let Some(trig) = trigger {
            self.device(trig)?;
        }
        self.device_mut(device)?.trigger = trigger;
        Ok(())
    }

    fn register_read(&mut self, device: DeviceId, address: u32) -> Result<u32, Errno> {
        self.hardware_call()?;
        Ok(self
            .device(device)?
            .registers
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    fn register_write(&mut self, device: DeviceId, address: u32, value: u32) -> Result<(), Errno> {
        self.hardware_call()?;
        self.device_mut(device)?.registers.insert(address, value);
        Ok(())
    }

    fn ping(&mut self) -> Result<(), Errno> {
        self.hardware_call()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MockBackend {
        MockBackend::new().with_device(
            MockDevice::new("adc")
                .attr("sampling_frequency", "1000")
                .channel(MockChannel::input("voltage0").attr("raw", "12"))
                .channel(MockChannel::output("voltage0").attr("raw", "0"))
                .register(0x10, 0xAB),
        )
    }

    #[test]
    fn unreachable_uri_fails_creation() {
        let backend = backend().with_unreachable("ip:10.0.0.1");
        assert!(matches!(
            backend.create_context("ip:10.0.0.1"),
            Err(Errno::ENOENT)
        ));
        assert_eq!(backend.stats().created(), 0);
    }

    #[test]
    fn channel_lookup_respects_direction() {
        let backend = backend();
        let ctx = backend.create_context("local:").unwrap();
        let dev = ctx.find_device("adc").data();
        let input = ctx.find_channel(dev, "voltage0", false).data();
        let output = ctx.find_channel(dev, "voltage0", true).data();
        assert_ne!(input, output);
        assert!(!ctx.find_channel(dev, "voltage9", false).ok());
    }

    #[test]
    fn buffer_lifecycle() {
        let backend = backend();
        let mut ctx = backend.create_context("local:").unwrap();
        let dev = ctx.find_device("adc").data();
        let ch = ctx.find_channel(dev, "voltage0", false).data();

        // No enabled channel yet
        assert_eq!(ctx.create_buffer(dev, 16, false), Err(Errno::EINVAL));

        ctx.set_channel_enabled(ch, true).unwrap();
        let buf = ctx.create_buffer(dev, 16, false).unwrap();
        assert_eq!(ctx.refill_buffer(buf).unwrap(), vec![1; 32]);

        ctx.buffer_canceller(buf).unwrap().cancel().unwrap();
        assert_eq!(ctx.refill_buffer(buf), Err(Errno::EBADF));
        ctx.destroy_buffer(buf).unwrap();
        assert_eq!(ctx.destroy_buffer(buf), Err(Errno::ENOENT));
    }

    #[test]
    fn stalled_refill_returns_once_cancelled() {
        let backend = backend().with_stalled_refills();
        let mut ctx = backend.create_context("local:").unwrap();
        let dev = ctx.find_device("adc").data();
        let ch = ctx.find_channel(dev, "voltage0", false).data();
        ctx.set_channel_enabled(ch, true).unwrap();
        let buf = ctx.create_buffer(dev, 4, false).unwrap();
        let canceller = ctx.buffer_canceller(buf).unwrap();

        let refill = std::thread::spawn(move || ctx.refill_buffer(buf));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!refill.is_finished());

        canceller.cancel().unwrap();
        assert_eq!(refill.join().unwrap(), Err(Errno::EBADF));
    }

    #[test]
    fn link_down_fails_hardware_calls() {
        let backend = backend();
        let mut ctx = backend.create_context("local:").unwrap();
        backend.stats().set_link_down(true);
        assert_eq!(ctx.ping(), Err(Errno::ETIMEDOUT));
        backend.stats().set_link_down(false);
        assert_eq!(ctx.ping(), Ok(()));
    }

    #[test]
    fn drop_counts_destruction() {
        let backend = backend();
        let stats = backend.stats();
        let ctx = backend.create_context("local:").unwrap();
        assert_eq!(stats.live(), 1);
        drop(ctx);
        assert_eq!(stats.live(), 0);
    }
}
