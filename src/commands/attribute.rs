//! Device and channel attribute access.

use super::{len_code, resolve_channel, resolve_device, ChannelPath};
use crate::backend::Context;
use crate::command::{store, Command, CommandCore, Payload};
use std::sync::Arc;

/// Read a device attribute. Code is the value length on success.
#[derive(Debug)]
pub struct DeviceAttributeRead {
    core: CommandCore,
    device: String,
    attr: String,
    value: Payload<String>,
}

impl DeviceAttributeRead {
    /// Read `attr` of `device`.
    pub fn new(device: impl Into<String>, attr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            device: device.into(),
            attr: attr.into(),
            value: Payload::new(),
        })
    }

    /// Value read by the most recent execution, if it succeeded.
    pub fn value(&self) -> Option<String> {
        self.value.get()
    }
}

impl Command for DeviceAttributeRead {
    fn name(&self) -> &'static str {
        "device_attribute_read"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let device = match resolve_device(context, &self.device) {
            Ok(device) => device,
            Err(code) => return code,
        };
        store(context.read_device_attr(device, &self.attr), |value| {
            let code = len_code(value.len());
            self.value.set(Some(value));
            code
        })
    }

    fn clear_payload(&self) {
        self.value.clear();
    }
}

/// Write a device attribute. Code is the number of bytes written.
#[derive(Debug)]
pub struct DeviceAttributeWrite {
    core: CommandCore,
    device: String,
    attr: String,
    value: String,
}

impl DeviceAttributeWrite {
    /// Write `value` to `attr` of `device`.
    pub fn new(
        device: impl Into<String>,
        attr: impl Into<String>,
        value: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            device: device.into(),
            attr: attr.into(),
            value: value.into(),
        })
    }

    /// Value this command writes.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Command for DeviceAttributeWrite {
    fn name(&self) -> &'static str {
        "device_attribute_write"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let device = match resolve_device(context, &self.device) {
            Ok(device) => device,
            Err(code) => return code,
        };
        store(
            context.write_device_attr(device, &self.attr, &self.value),
            len_code,
        )
    }

    fn coalesce_key(&self) -> Option<String> {
        Some(format!("attr-write:{}/{}", self.device, self.attr))
    }
}

/// Read a channel attribute. Code is the value length on success.
#[derive(Debug)]
pub struct ChannelAttributeRead {
    core: CommandCore,
    channel: ChannelPath,
    attr: String,
    value: Payload<String>,
}

impl ChannelAttributeRead {
    /// Read `attr` of `channel`.
    pub fn new(channel: ChannelPath, attr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            channel,
            attr: attr.into(),
            value: Payload::new(),
        })
    }

    /// Value read by the most recent execution, if it succeeded.
    pub fn value(&self) -> Option<String> {
        self.value.get()
    }
}

impl Command for ChannelAttributeRead {
    fn name(&self) -> &'static str {
        "channel_attribute_read"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let channel = match resolve_channel(context, &self.channel) {
            Ok(channel) => channel,
            Err(code) => return code,
        };
        store(context.read_channel_attr(channel, &self.attr), |value| {
            let code = len_code(value.len());
            self.value.set(Some(value));
            code
        })
    }

    fn clear_payload(&self) {
        self.value.clear();
    }
}

/// Write a channel attribute. Code is the number of bytes written.
#[derive(Debug)]
pub struct ChannelAttributeWrite {
    core: CommandCore,
    channel: ChannelPath,
    attr: String,
    value: String,
}

impl ChannelAttributeWrite {
    /// Write `value` to `attr` of `channel`.
    pub fn new(
        channel: ChannelPath,
        attr: impl Into<String>,
        value: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            channel,
            attr: attr.into(),
            value: value.into(),
        })
    }

    /// Value this command writes.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Command for ChannelAttributeWrite {
    fn name(&self) -> &'static str {
        "channel_attribute_write"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let channel = match resolve_channel(context, &self.channel) {
            Ok(channel) => channel,
            Err(code) => return code,
        };
        store(
            context.write_channel_attr(channel, &self.attr, &self.value),
            len_code,
        )
    }

    fn coalesce_key(&self) -> Option<String> {
        Some(format!("attr-write:{}/{}", self.channel.key(), self.attr))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::context;
    use super::*;

    #[test]
    fn channel_read_stores_value_and_length() {
        let mut ctx = context();
        let cmd = ChannelAttributeRead::new(ChannelPath::input("ad74413r", "voltage1"), "raw");
        assert_eq!(cmd.run(ctx.as_mut()), 3);
        assert_eq!(cmd.value().as_deref(), Some("200"));
    }

    #[test]
    fn write_then_read_device_attr() {
        let mut ctx = context();
        let write = DeviceAttributeWrite::new("ad74413r", "sampling_frequency", "9600");
        assert_eq!(write.run(ctx.as_mut()), 4);

        let read = DeviceAttributeRead::new("ad74413r", "sampling_frequency");
        read.run(ctx.as_mut());
        assert_eq!(read.value().as_deref(), Some("9600"));
    }

    #[test]
    fn missing_attribute_fails_without_payload() {
        let mut ctx = context();
        let read = DeviceAttributeRead::new("ad74413r", "bogus");
        assert_eq!(read.run(ctx.as_mut()), -2);
        assert!(read.value().is_none());

        let path = ChannelPath::input("missing", "voltage0");
        let write = ChannelAttributeWrite::new(path, "raw", "1");
        assert_eq!(write.run(ctx.as_mut()), -2);
    }

    #[test]
    fn failed_read_clears_stale_value() {
        let ctx = crate::backend::SharedContext::new(context());
        let read = ChannelAttributeRead::new(ChannelPath::input("ad74413r", "voltage0"), "raw");
        assert_eq!(crate::command::execute(read.as_ref(), 0, &ctx), 3);
        assert_eq!(read.value().as_deref(), Some("100"));

        ctx.seal();
        assert_eq!(crate::command::execute(read.as_ref(), 1, &ctx), -19);
        assert_eq!(read.return_code(), -19);
        assert!(read.value().is_none());
    }

    #[test]
    fn writes_coalesce_per_attribute() {
        let a = ChannelAttributeWrite::new(ChannelPath::output("dac", "voltage0"), "raw", "1");
        let b = ChannelAttributeWrite::new(ChannelPath::output("dac", "voltage0"), "raw", "2");
        let c = ChannelAttributeWrite::new(ChannelPath::output("dac", "voltage0"), "scale", "2");
        assert_eq!(a.coalesce_key(), b.coalesce_key());
        assert_ne!(a.coalesce_key(), c.coalesce_key());
        assert!(ChannelAttributeRead::new(ChannelPath::input("dac", "voltage0"), "raw")
            .coalesce_key()
            .is_none());
    }
}
