//! Legacy registry handing out command queues keyed by context identity.
//!
//! Some call sites hold a raw [`SharedContext`] rather than a
//! [`Connection`](crate::connection::Connection). They share one queue per context
//! through this provider, with the same counting rules: the queue exists while its
//! count is above zero and is stopped and dropped when the count returns to zero.

use crate::backend::{HandleKey, SharedContext};
use crate::queue::{CommandQueue, WorkerPool};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

struct Registered {
    queue: CommandQueue,
    ref_count: usize,
}

/// Ref-counted map from context identity to [`CommandQueue`].
pub struct CommandQueueProvider {
    pool: WorkerPool,
    queues: Mutex<HashMap<HandleKey, Registered>>,
}

impl CommandQueueProvider {
    /// Empty registry; queues run on `pool`.
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue for `context`, created on first use. Increments its count.
    pub fn open(&self, context: &SharedContext) -> CommandQueue {
        let mut queues = self.queues.lock();
        let entry = queues.entry(context.key()).or_insert_with(|| {
            debug!(uri = context.uri(), "Command queue created");
            Registered {
                queue: CommandQueue::new(context.clone(), &self.pool),
                ref_count: 0,
            }
        });
        entry.ref_count += 1;
        entry.queue.clone()
    }

    /// Decrement the count for `context`. Returns the remaining count.
    ///
    /// At zero the queue stops dispatching and the registry drops it; a command
    /// already in flight still completes.
    pub fn close(&self, context: &SharedContext) -> usize {
        let removed = {
            let mut queues = self.queues.lock();
            let key = context.key();
            let Some(entry) = queues.get_mut(&key) else {
                warn!(uri = context.uri(), "Close called for a context with no queue");
                return 0;
            };
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return entry.ref_count;
            }
            queues.remove(&key)
        };

        if let Some(entry) = removed {
            entry.queue.request_stop();
            debug!(uri = context.uri(), "Command queue destroyed");
        }
        0
    }

    /// Open count for `context` (0 if it has no queue).
    pub fn ref_count(&self, context: &SharedContext) -> usize {
        self.queues
            .lock()
            .get(&context.key())
            .map_or(0, |entry| entry.ref_count)
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    /// True when no queue is registered.
    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}

impl std::fmt::Debug for CommandQueueProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueueProvider")
            .field("queues", &self.len())
            .finish()
    }
}
