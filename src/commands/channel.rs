use super::{resolve_channel, ChannelPath};
use crate::backend::Context;
use crate::command::{store, Command, CommandCore};
use std::sync::Arc;

/// Enable or disable a channel for buffered capture.
#[derive(Debug)]
pub struct ChannelEnable {
    core: CommandCore,
    channel: ChannelPath,
    enable: bool,
}

impl ChannelEnable {
    /// Set the enable state of `channel`.
    pub fn new(channel: ChannelPath, enable: bool) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            channel,
            enable,
        })
    }
}

impl Command for ChannelEnable {
    fn name(&self) -> &'static str {
        "channel_enable"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let channel = match resolve_channel(context, &self.channel) {
            Ok(channel) => channel,
            Err(code) => return code,
        };
        store(context.set_channel_enabled(channel, self.enable), |()| 0)
    }

    fn coalesce_key(&self) -> Option<String> {
        Some(format!("enable:{}", self.channel.key()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::context;
    use super::*;

    #[test]
    fn enable_unknown_channel_fails() {
        let mut ctx = context();
        let cmd = ChannelEnable::new(ChannelPath::input("ad74413r", "voltage7"), true);
        assert_eq!(cmd.run(ctx.as_mut()), -2);

        let cmd = ChannelEnable::new(ChannelPath::input("ad74413r", "voltage0"), true);
        assert_eq!(cmd.run(ctx.as_mut()), 0);
    }
}
