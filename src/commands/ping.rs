use crate::backend::Context;
use crate::command::{store, Command, CommandCore};
use std::sync::Arc;

/// Liveness round-trip. Meant to be built once and re-enqueued on every tick.
#[derive(Debug, Default)]
pub struct ContextPing {
    core: CommandCore,
}

impl ContextPing {
    /// New ping command.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Command for ContextPing {
    fn name(&self) -> &'static str {
        "context_ping"
    }

    fn core(&self) -> &CommandCore {
        &self.core
    }

    fn run(&self, context: &mut dyn Context) -> i32 {
        store(context.ping(), |()| 0)
    }
}
