//! Ref-counted connections and the registry that shares them.
//!
//! [`ConnectionProvider::open`] hands every caller the same [`Connection`] for a
//! URI and counts the opens; the matching [`ConnectionProvider::close`] that brings
//! the count to zero tears the connection down:
//!
//! 1. the connection is marked invalid, so [`WeakConnection::upgrade`] fails,
//! 2. the context is sealed once any in-flight command returns; from here on every
//!    command on the queue completes with `-ENODEV`,
//! 3. every "about to be destroyed" observer runs,
//! 4. the backend context is released.
//!
//! The URI stays reserved until step 4 is done. An `open` from another thread in
//! the meantime waits for it and then creates a fresh context, so one URI never
//! has two live contexts.
//!
//! The provider is an ordinary value: construct one per process (or per test) and
//! pass it to whatever needs it.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use iio_link::backend::mock::MockBackend;
//! use iio_link::config::WorkerConfig;
//! use iio_link::connection::ConnectionProvider;
//! use iio_link::queue::WorkerPool;
//!
//! let pool = WorkerPool::new(&WorkerConfig::default())?;
//! let provider = ConnectionProvider::new(Arc::new(MockBackend::new()), pool);
//!
//! let a = provider.open("usb:1.2.3")?;
//! let b = provider.open("usb:1.2.3")?;
//! assert!(Arc::ptr_eq(&a, &b));
//! assert_eq!(provider.ref_count("usb:1.2.3"), 2);
//!
//! provider.close("usb:1.2.3");
//! provider.close("usb:1.2.3");
//! assert!(!a.is_valid());
//! # Ok::<(), iio_link::LinkError>(())
//! ```

use crate::backend::{Backend, SharedContext};
use crate::error::{LinkError, LinkResult};
use crate::queue::{CommandQueue, WorkerPool};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Destruction observer callback type.
pub type DestroyObserver = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Handle used to detach a destruction observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

// =============================================================================
// Connection
// =============================================================================

/// Owner of one backend context and its command queue.
pub struct Connection {
    uri: String,
    context: SharedContext,
    queue: CommandQueue,
    ref_count: Mutex<usize>,
    valid: AtomicBool,
    next_watch: AtomicU64,
    observers: Mutex<Vec<(WatchId, DestroyObserver)>>,
    destroyed_tx: watch::Sender<bool>,
}

impl Connection {
    fn create(uri: &str, backend: &dyn Backend, pool: &WorkerPool) -> LinkResult<Self> {
        let raw = backend.create_context(uri).map_err(|errno| {
            error!(uri, %errno, "Context creation failed");
            LinkError::ContextCreation {
                uri: uri.to_string(),
                errno,
            }
        })?;
        let context = SharedContext::new(raw);
        let queue = CommandQueue::new(context.clone(), pool);
        let (destroyed_tx, _) = watch::channel(false);
        info!(uri, "Connection created");

        Ok(Self {
            uri: uri.to_string(),
            context,
            queue,
            ref_count: Mutex::new(0),
            valid: AtomicBool::new(true),
            next_watch: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
            destroyed_tx,
        })
    }

    /// URI this connection was opened with.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Queue serialising every operation on this connection's context.
    pub fn command_queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// The backend context slot. Direct access is serialised with queued commands
    /// and yields nothing once the connection is destroyed.
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Current open count.
    pub fn ref_count(&self) -> usize {
        *self.ref_count.lock()
    }

    /// False once teardown has started.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Run `observer` right before the context is released.
    ///
    /// By then the queue no longer reaches the context: commands the observer
    /// enqueues complete with `-ENODEV`.
    pub fn on_about_to_be_destroyed(
        &self,
        observer: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> WatchId {
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Detach a destruction observer. Returns false if it was not attached.
    pub fn disconnect(&self, id: WatchId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(wid, _)| *wid != id);
        observers.len() != before
    }

    /// Resolves once the connection has been torn down.
    pub async fn destroyed(&self) {
        let mut rx = self.destroyed_tx.subscribe();
        let _ = rx.wait_for(|destroyed| *destroyed).await;
    }

    /// Non-owning reference that stops upgrading at teardown.
    pub fn downgrade(self: &Arc<Self>) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(self),
        }
    }

    fn open(&self) -> usize {
        let mut count = self.ref_count.lock();
        *count += 1;
        debug!(uri = %self.uri, ref_count = *count, "Connection opened");
        *count
    }

    fn close(&self) -> usize {
        let mut count = self.ref_count.lock();
        if *count == 0 {
            warn!(uri = %self.uri, "Close called on connection with no open references");
            return 0;
        }
        *count -= 1;
        debug!(uri = %self.uri, ref_count = *count, "Connection closed");
        *count
    }

    fn close_all(&self) {
        *self.ref_count.lock() = 0;
    }

    fn teardown(&self) {
        if !self.valid.swap(false, Ordering::SeqCst) {
            return;
        }
        self.context.seal();

        let observers: Vec<DestroyObserver> = self
            .observers
            .lock()
            .drain(..)
            .map(|(_, observer)| observer)
            .collect();
        debug!(uri = %self.uri, observers = observers.len(), "Connection about to be destroyed");
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(self))).is_err() {
                warn!(uri = %self.uri, "Destruction observer panicked");
            }
        }
        self.destroyed_tx.send_replace(true);

        self.context.release();
        info!(uri = %self.uri, "Connection destroyed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.uri)
            .field("ref_count", &self.ref_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Non-owning reference to a [`Connection`].
#[derive(Debug, Clone)]
pub struct WeakConnection {
    inner: Weak<Connection>,
}

impl WeakConnection {
    /// The connection, if it still exists and has not begun teardown.
    pub fn upgrade(&self) -> Option<Arc<Connection>> {
        self.inner.upgrade().filter(|conn| conn.is_valid())
    }
}

// =============================================================================
// ConnectionProvider
// =============================================================================

enum Slot {
    Open(Arc<Connection>),
    /// Teardown running on this thread; the URI stays reserved until it ends
    Closing(ThreadId),
}

/// Registry mapping URIs to shared connections.
pub struct ConnectionProvider {
    backend: Arc<dyn Backend>,
    pool: WorkerPool,
    connections: Mutex<HashMap<String, Slot>>,
    settled: Condvar,
}

impl ConnectionProvider {
    /// Empty registry creating contexts through `backend` and running commands on `pool`.
    pub fn new(backend: Arc<dyn Backend>, pool: WorkerPool) -> Self {
        Self {
            backend,
            pool,
            connections: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
        }
    }

    /// Open (or share) the connection for `uri`, incrementing its count.
    ///
    /// If `uri` is being torn down, waits until its context is released. Calling
    /// this from a destruction observer of that same connection fails with
    /// [`LinkError::Closing`].
    pub fn open(&self, uri: &str) -> LinkResult<Arc<Connection>> {
        let mut connections = self.connections.lock();
        loop {
            let closer = match connections.get(uri) {
                Some(Slot::Open(conn)) => {
                    conn.open();
                    return Ok(Arc::clone(conn));
                }
                Some(Slot::Closing(closer)) => *closer,
                None => break,
            };
            if closer == thread::current().id() {
                warn!(uri, "Open called from the connection's own teardown");
                return Err(LinkError::Closing(uri.to_string()));
            }
            self.settled.wait(&mut connections);
        }

        let conn = Arc::new(Connection::create(uri, self.backend.as_ref(), &self.pool)?);
        conn.open();
        connections.insert(uri.to_string(), Slot::Open(Arc::clone(&conn)));
        Ok(conn)
    }

    /// Decrement the count for `uri`, tearing the connection down at zero.
    ///
    /// Returns the remaining count. Closing a URI that is not open logs a warning.
    pub fn close(&self, uri: &str) -> usize {
        let doomed = {
            let mut connections = self.connections.lock();
            let Some(Slot::Open(conn)) = connections.get(uri) else {
                warn!(uri, "Close called for a URI that is not open");
                return 0;
            };
            let remaining = conn.close();
            if remaining > 0 {
                return remaining;
            }
            let conn = Arc::clone(conn);
            connections.insert(uri.to_string(), Slot::Closing(thread::current().id()));
            conn
        };

        self.retire(uri, &doomed);
        0
    }

    /// Drop every reference to `uri` at once and tear the connection down.
    pub fn close_all(&self, uri: &str) -> LinkResult<()> {
        let doomed = {
            let mut connections = self.connections.lock();
            let Some(Slot::Open(conn)) = connections.get(uri) else {
                return Err(LinkError::NotOpen(uri.to_string()));
            };
            let conn = Arc::clone(conn);
            connections.insert(uri.to_string(), Slot::Closing(thread::current().id()));
            conn
        };

        doomed.close_all();
        self.retire(uri, &doomed);
        Ok(())
    }

    /// Tear down a connection whose slot is marked closing, then free the URI.
    ///
    /// Observers may call back into the provider, so this runs unlocked.
    fn retire(&self, uri: &str, conn: &Connection) {
        conn.teardown();
        self.connections.lock().remove(uri);
        self.settled.notify_all();
    }

    /// Open count for `uri` (0 if not open).
    pub fn ref_count(&self, uri: &str) -> usize {
        match self.connections.lock().get(uri) {
            Some(Slot::Open(conn)) => conn.ref_count(),
            _ => 0,
        }
    }

    /// True while `uri` has a live connection.
    pub fn is_open(&self, uri: &str) -> bool {
        matches!(self.connections.lock().get(uri), Some(Slot::Open(_)))
    }

    /// URIs with live connections.
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .connections
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(uri, _)| uri.clone())
            .collect();
        uris.sort();
        uris
    }

    /// Pool commands run on.
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }
}

impl Drop for ConnectionProvider {
    fn drop(&mut self) {
        let leftover: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Open(conn) => Some(conn),
                Slot::Closing(_) => None,
            })
            .collect();
        for conn in leftover {
            warn!(
                uri = conn.uri(),
                ref_count = conn.ref_count(),
                "Provider dropped with open connection"
            );
            conn.close_all();
            conn.teardown();
        }
    }
}

impl fmt::Debug for ConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProvider")
            .field("uris", &self.uris())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockChannel, MockDevice, MockStats};
    use crate::commands::{ChannelAttributeRead, ChannelPath};
    use crate::config::WorkerConfig;
    use std::sync::atomic::AtomicUsize;

    const URI: &str = "usb:1.2.3";

    fn provider() -> (ConnectionProvider, Arc<MockStats>) {
        let backend = MockBackend::new()
            .with_device(
                MockDevice::new("adc").channel(MockChannel::input("voltage0").attr("raw", "5")),
            )
            .with_unreachable("ip:192.168.2.1");
        let stats = backend.stats();
        let pool = WorkerPool::new(&WorkerConfig::default()).unwrap();
        (ConnectionProvider::new(Arc::new(backend), pool), stats)
    }

    #[test]
    fn k_opens_then_k_closes_create_and_destroy_once() {
        let (provider, stats) = provider();
        let first = provider.open(URI).unwrap();
        for _ in 0..4 {
            let again = provider.open(URI).unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(first.ref_count(), 5);
        assert_eq!(stats.created(), 1);

        for expected in (0..5).rev() {
            assert_eq!(provider.close(URI), expected);
        }
        assert_eq!(stats.created(), 1);
        assert_eq!(stats.destroyed(), 1);
        assert!(!provider.is_open(URI));
    }

    #[test]
    fn extra_close_never_goes_negative() {
        let (provider, stats) = provider();
        provider.open(URI).unwrap();
        assert_eq!(provider.close(URI), 0);
        assert_eq!(provider.close(URI), 0);
        assert_eq!(provider.ref_count(URI), 0);
        assert_eq!(stats.destroyed(), 1);
    }

    #[test]
    fn failed_creation_leaves_no_entry() {
        let (provider, stats) = provider();
        let err = provider.open("ip:192.168.2.1").unwrap_err();
        assert!(matches!(err, LinkError::ContextCreation { .. }));
        assert!(!provider.is_open("ip:192.168.2.1"));
        assert_eq!(stats.created(), 0);
    }

    #[test]
    fn destruction_notification_precedes_release() {
        let (provider, stats) = provider();
        let conn = provider.open(URI).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        let stats_seen = Arc::clone(&stats);
        conn.on_about_to_be_destroyed(move |c| {
            // Handle still alive but already out of reach
            assert!(c.context().is_valid());
            assert!(c.context().with(|_| ()).is_none());
            assert_eq!(stats_seen.destroyed(), 0);
            assert!(!c.is_valid());
            f.fetch_add(1, Ordering::SeqCst);
        });

        provider.close(URI);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!conn.context().is_valid());
        assert_eq!(stats.destroyed(), 1);

        // Commands enqueued afterwards never see a handle
        let read = ChannelAttributeRead::new(ChannelPath::input("adc", "voltage0"), "raw");
        let ticket = conn.command_queue().enqueue(read.clone());
        assert_eq!(ticket.blocking_wait().unwrap(), -19);
        assert!(read.value().is_none());
    }

    #[test]
    fn weak_holders_are_invalidated() {
        let (provider, _) = provider();
        let conn = provider.open(URI).unwrap();
        let weak = conn.downgrade();
        assert!(weak.upgrade().is_some());

        provider.close(URI);
        // Strong reference still alive, but the weak holder no longer upgrades
        assert!(weak.upgrade().is_none());
        drop(conn);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn observer_may_reenter_provider() {
        let (provider, stats) = provider();
        let provider = Arc::new(provider);
        let conn = provider.open(URI).unwrap();

        let p = Arc::clone(&provider);
        let reopened = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&reopened);
        conn.on_about_to_be_destroyed(move |_| {
            assert!(!p.is_open(URI));
            *sink.lock() = Some(p.open(URI).map(|_| ()));
        });
        provider.close(URI);

        // The URI stays reserved until its context is gone
        assert!(matches!(*reopened.lock(), Some(Err(LinkError::Closing(_)))));
        assert_eq!(stats.live(), 0);

        // Reopening after teardown builds a fresh connection
        let fresh = provider.open(URI).unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
        assert_eq!(stats.created(), 2);
        provider.close(URI);
    }

    #[test]
    fn open_during_teardown_waits_for_release() {
        let (provider, stats) = provider();
        let provider = Arc::new(provider);
        let conn = provider.open(URI).unwrap();

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        conn.on_about_to_be_destroyed(move |_| {
            entered_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
        });
        let closer = {
            let provider = Arc::clone(&provider);
            std::thread::spawn(move || provider.close(URI))
        };

        entered_rx.recv().unwrap();
        let fresh = provider.open(URI).unwrap();
        assert_eq!(stats.destroyed(), 1);
        assert_eq!(stats.live(), 1);
        assert!(!Arc::ptr_eq(&conn, &fresh));
        assert_eq!(closer.join().unwrap(), 0);
        assert_eq!(provider.ref_count(URI), 1);
    }

    #[test]
    fn close_all_forces_teardown() {
        let (provider, stats) = provider();
        provider.open(URI).unwrap();
        provider.open(URI).unwrap();
        provider.close_all(URI).unwrap();
        assert!(!provider.is_open(URI));
        assert_eq!(stats.destroyed(), 1);
        assert!(matches!(provider.close_all(URI), Err(LinkError::NotOpen(_))));
    }

    #[test]
    fn dropping_provider_tears_down_leftovers() {
        let (provider, stats) = provider();
        let conn = provider.open("local:").unwrap();
        provider.open(URI).unwrap();
        assert_eq!(provider.uris(), vec!["local:".to_string(), URI.to_string()]);
        drop(provider);
        assert_eq!(stats.live(), 0);
        assert!(!conn.is_valid());
    }
}
