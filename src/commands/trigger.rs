use super::resolve_device;
use crate::backend::Context;
use crate::command::{store, Command, CommandCore, Payload};
use std::sync::Arc;

/// Read a device's current trigger. Payload is the trigger device name, if any.
#[derive(Debug)]
pub struct DeviceGetTrigger {
    core: CommandCore,
    device: String,
    trigger: Payload<Option<String>>,
}

impl DeviceGetTrigger {
    /// Query the trigger of `device`.
    pub fn new(device: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            device: device.into(),
            trigger: Payload::new(),
        })
    }

    /// `Some(None)` means the query succeeded and no trigger is set.
    pub fn trigger(&self) -> Option<Option<String>> {
        self.trigger.get()
    }
}

impl Command for DeviceGetTrigger {
    fn name(&self) -> &'static str {
        "device_get_trigger"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let device = match resolve_device(context, &self.device) {
            Ok(device) => device,
            Err(code) => return code,
        };
        let names = context.device_names();
        store(context.trigger(device), |trigger| {
            let name = trigger.and_then(|t| names.get(t.0).cloned());
            self.trigger.set(Some(name));
            0
        })
    }

    fn clear_payload(&self) {
        self.trigger.clear();
    }
}

/// Set or clear a device's trigger.
#[derive(Debug)]
pub struct DeviceSetTrigger {
    core: CommandCore,
    device: String,
    trigger: Option<String>,
}

impl DeviceSetTrigger {
    /// Use `trigger` as the trigger of `device`; `None` clears it.
    pub fn new(device: impl Into<String>, trigger: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            core: CommandCore::new(),
            device: device.into(),
            trigger,
        })
    }
}

impl Command for DeviceSetTrigger {
    fn name(&self) -> &'static str {
        "device_set_trigger"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        let device = match resolve_device(context, &self.device) {
            Ok(device) => device,
            Err(code) => return code,
        };
        let trigger = match self.trigger.as_deref() {
            Some(name) => match resolve_device(context, name) {
                Ok(trigger) => Some(trigger),
                Err(code) => return code,
            },
            None => None,
        };
        store(context.set_trigger(device, trigger), |()| 0)
    }

    fn coalesce_key(&self) -> Option<String> {
        Some(format!("trigger:{}", self.device))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::context;
    use super::*;

    #[test]
    fn set_then_get_trigger() {
        let mut ctx = context();
        let get = DeviceGetTrigger::new("ad74413r");
        assert_eq!(get.run(ctx.as_mut()), 0);
        assert_eq!(get.trigger(), Some(None));

        let set = DeviceSetTrigger::new("ad74413r", Some("trigger0".into()));
        assert_eq!(set.run(ctx.as_mut()), 0);
        get.run(ctx.as_mut());
        assert_eq!(get.trigger(), Some(Some("trigger0".to_string())));

        let clear = DeviceSetTrigger::new("ad74413r", None);
        assert_eq!(clear.run(ctx.as_mut()), 0);
        get.run(ctx.as_mut());
        assert_eq!(get.trigger(), Some(None));
    }

    #[test]
    fn unknown_trigger_device_fails() {
        let mut ctx = context();
        let set = DeviceSetTrigger::new("ad74413r", Some("trigger9".into()));
        assert_eq!(set.run(ctx.as_mut()), -2);
    }
}
