use super::resolve_device;
use crate::backend::Context;
use crate::command::{store, Command, CommandCore, Payload};
use std::sync::Arc;

/// Raw debug register read.
#[derive(Debug)]
pub struct RegisterRead {
    core: CommandCore,
    device: String,
    address: u32,
    value: Payload<u32>,
}

impl RegisterRead {
    /// Read register `address` of `device`.
    pub fn new(device: impl Into<String>, address: u32) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            device: device.into(),
            address,
            value: Payload::new(),
        })
    }

    /// Register value from the most recent execution, if it succeeded.
    pub fn value(&self) -> Option<u32> {
        self.value.get()
    }
}

impl Command for RegisterRead {
    fn name(&self) -> &'static str {
        "register_read"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let device = match resolve_device(context, &self.device) {
            Ok(device) => device,
            Err(code) => return code,
        };
        store(context.register_read(device, self.address), |value| {
            self.value.set(Some(value));
            0
        })
    }

    fn clear_payload(&self) {
        self.value.clear();
    }
}

/// Raw debug register write.
#[derive(Debug)]
pub struct RegisterWrite {
    core: CommandCore,
    device: String,
    address: u32,
    value: u32,
}

impl RegisterWrite {
    /// Write `value` to register `address` of `device`.
    pub fn new(device: impl Into<String>, address: u32, value: u32) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            device: device.into(),
            address,
            value,
        })
    }
}

impl Command for RegisterWrite {
    fn name(&self) -> &'static str {
        "register_write"
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
            context.register_write(device, self.address, self.value),
            |()| 0,
        )
    }

    fn coalesce_key(&self) -> Option<String> {
        Some(format!("reg-write:{}/{:#x}", self.device, self.address))
    }
}
