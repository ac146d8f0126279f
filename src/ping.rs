//! Periodic liveness check for an open connection.
//!
//! A [`PingTask`] wakes every [`PingConfig::interval`], and unless the queue
//! completed a command within [`PingConfig::idle_threshold`], enqueues one shared
//! [`ContextPing`] on the connection's queue. A negative return code is reported
//! through the failure callback; the task keeps running so a recovered link is
//! picked up on the next tick. The task ends when the context is released or the
//! [`PingTask`] is dropped.

use crate::command::Command;
use crate::commands::ContextPing;
use crate::config::PingConfig;
use crate::error::Errno;
use crate::queue::{CommandQueue, WorkerPool};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Background ping loop bound to one queue.
#[derive(Debug)]
pub struct PingTask {
    ping: Arc<ContextPing>,
    handle: JoinHandle<()>,
}

impl PingTask {
    /// Start pinging `queue` on `pool`. Returns `None` when pings are disabled.
    pub fn spawn(
        queue: CommandQueue,
        pool: &WorkerPool,
        config: &PingConfig,
        on_failed: impl Fn(i32) + Send + Sync + 'static,
    ) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let ping = ContextPing::new();
        let interval = config.interval();
        let idle_threshold = config.idle_threshold();
        let shared = Arc::clone(&ping);

        let handle = pool.handle().spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if let Some(last) = queue.last_cmd_time() {
                    if last.elapsed() < idle_threshold {
                        trace!(uri = queue.context().uri(), "Link recently active, ping skipped");
                        continue;
                    }
                }

                match queue.enqueue(shared.clone()).wait().await {
                    Ok(code) if code == Errno::ENODEV.as_code() => {
                        debug!(uri = queue.context().uri(), "Context released, ping task ending");
                        break;
                    }
                    Ok(code) if code < 0 => {
                        warn!(uri = queue.context().uri(), code, "Ping failed");
                        on_failed(code);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(uri = queue.context().uri(), %err, "Ping not executed");
                    }
                }
            }
        });

        Some(Self { ping, handle })
    }

    /// Pings executed so far.
    pub fn pings(&self) -> u64 {
        self.ping.core().executions()
    }

    /// True once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop. A ping already enqueued still runs.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for PingTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
