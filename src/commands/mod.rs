//! Concrete command variants, one per backend operation.
//!
//! | Variant | Inputs | Payload |
//! |---------|--------|---------|
//! | [`DeviceAttributeRead`] | device, attr | `String` |
//! | [`DeviceAttributeWrite`] | device, attr, value | bytes written (code) |
//! | [`ChannelAttributeRead`] | channel, attr | `String` |
//! | [`ChannelAttributeWrite`] | channel, attr, value | bytes written (code) |
//! | [`ChannelEnable`] | channel, enable | - |
//! | [`DeviceCreateBuffer`] | device, samples, cyclic | [`BufferId`], canceller |
//! | [`BufferPush`] | buffer, data | bytes pushed (code) |
//! | [`BufferRefill`] | buffer | `Vec<u8>` |
//! | [`BufferCancel`] | canceller | - |
//! | [`BufferDestroy`] | buffer | - |
//! | [`DeviceGetTrigger`] | device | trigger device name |
//! | [`DeviceSetTrigger`] | device, trigger | - |
//! | [`RegisterRead`] | device, address | `u32` |
//! | [`RegisterWrite`] | device, address, value | - |
//! | [`ContextPing`] | - | - |
//!
//! Devices and channels are addressed by name and resolved at execution time
//! through the context's lookups, so a command built before a connection exists
//! stays valid for whichever context ends up running it.
//!
//! Payloads describe the most recent execution only: a failed run leaves them empty.
//!
//! [`BufferId`]: crate::backend::BufferId

mod attribute;
mod buffer;
mod channel;
mod ping;
mod register;
mod trigger;

pub use attribute::{
    ChannelAttributeRead, ChannelAttributeWrite, DeviceAttributeRead, DeviceAttributeWrite,
};
pub use buffer::{BufferCancel, BufferDestroy, BufferPush, BufferRefill, DeviceCreateBuffer};
pub use channel::ChannelEnable;
pub use ping::ContextPing;
pub use register::{RegisterRead, RegisterWrite};
pub use trigger::{DeviceGetTrigger, DeviceSetTrigger};

use crate::backend::{ChannelId, Context, DeviceId};

/// Address of a channel within a context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelPath {
    /// Device name
    pub device: String,
    /// Channel name
    pub channel: String,
    /// Output (true) or input (false) channel
    pub output: bool,
}

impl ChannelPath {
    /// Input channel `channel` of `device`
    pub fn input(device: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            channel: channel.into(),
            output: false,
        }
    }

    /// Output channel `channel` of `device`
    pub fn output(device: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            output: true,
            ..Self::input(device, channel)
        }
    }

    fn key(&self) -> String {
        let dir = if self.output { "out" } else { "in" };
        format!("{}/{}/{}", self.device, dir, self.channel)
    }
}

/// Resolve a device name, or the lookup's error code.
fn resolve_device(context: &dyn Context, name: &str) -> Result<DeviceId, i32> {
    let found = context.find_device(name);
    if !found.ok() {
        return Err(found.error());
    }
    Ok(found.data())
}

/// Resolve a channel path, or the first failing lookup's error code.
fn resolve_channel(context: &dyn Context, path: &ChannelPath) -> Result<ChannelId, i32> {
    let device = resolve_device(context, &path.device)?;
    let found = context.find_channel(device, &path.channel, path.output);
    if !found.ok() {
        return Err(found.error());
    }
    Ok(found.data())
}

/// Saturating conversion of a byte count into a return code.
fn len_code(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_reports_lookup_codes() {
        let ctx = test_support::context();
        assert!(resolve_device(ctx.as_ref(), "ad74413r").is_ok());
        assert_eq!(resolve_device(ctx.as_ref(), "nope"), Err(-2));
        assert_eq!(
            resolve_channel(ctx.as_ref(), &ChannelPath::output("ad74413r", "voltage1")),
            Err(-2)
        );
    }

    #[test]
    fn channel_path_keys_include_direction() {
        assert_ne!(
            ChannelPath::input("dev", "voltage0").key(),
            ChannelPath::output("dev", "voltage0").key()
        );
    }
}
