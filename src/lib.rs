//! # IIO Link Core Library
//!
//! Shared, ref-counted connections to IIO contexts with a per-connection command
//! queue. Every hardware operation is wrapped in a [`Command`], enqueued on the
//! connection's [`CommandQueue`], and executed strictly in arrival order on a
//! worker pool, so no two operations ever touch the same context concurrently.
//!
//! ## Crate Structure
//!
//! - **`backend`**: The `Context`/`Backend` traits the hardware-wrapper layer
//!   implements, plus `SharedContext`, the releasable slot the queue runs against.
//!   `backend::mock` serves a simulated device tree.
//! - **`command`**: The `Command` trait and `CommandCore` (result code, overwrite
//!   flag, started/finished observers).
//! - **`commands`**: One command per backend operation (attributes, channels,
//!   buffers, triggers, registers, ping).
//! - **`queue`**: `CommandQueue`, its `Ticket`s, and the `WorkerPool` executor.
//! - **`connection`**: `Connection` and the `ConnectionProvider` registry.
//! - **`queue_provider`**: Legacy queue registry keyed by context identity.
//! - **`ping`**: Periodic liveness check for idle connections.
//! - **`outcome`**: `Outcome<T>`, the value-or-error-code type handle accessors return.
//! - **`error`**: `LinkError` and `Errno`.
//! - **`config`** / **`tracing_init`**: Figment configuration and logging setup.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use iio_link::backend::mock::{MockBackend, MockChannel, MockDevice};
//! use iio_link::commands::{ChannelAttributeRead, ChannelAttributeWrite, ChannelPath};
//! use iio_link::{ConnectionProvider, LinkConfig, WorkerPool};
//!
//! let backend = MockBackend::new().with_device(
//!     MockDevice::new("dac").channel(MockChannel::output("voltage0").attr("raw", "0")),
//! );
//! let config = LinkConfig::default();
//! let provider = ConnectionProvider::new(Arc::new(backend), WorkerPool::new(&config.workers)?);
//!
//! let conn = provider.open("usb:1.2.3")?;
//! let path = ChannelPath::output("dac", "voltage0");
//! let write = conn
//!     .command_queue()
//!     .enqueue(ChannelAttributeWrite::new(path.clone(), "raw", "100"));
//! let read = ChannelAttributeRead::new(path, "raw");
//! let done = conn.command_queue().enqueue(read.clone());
//!
//! assert!(write.blocking_wait()? > 0);
//! assert!(done.blocking_wait()? > 0);
//! assert_eq!(read.value().as_deref(), Some("100"));
//!
//! provider.close("usb:1.2.3");
//! # Ok::<(), iio_link::LinkError>(())
//! ```

pub mod backend;
pub mod command;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod outcome;
pub mod ping;
pub mod queue;
pub mod queue_provider;
pub mod tracing_init;

pub use backend::{Backend, Context, SharedContext};
pub use command::{Command, CommandCore, CommandEvent, CommandPhase, SharedCommand};
pub use config::LinkConfig;
pub use connection::{Connection, ConnectionProvider, WeakConnection};
pub use error::{Errno, LinkError, LinkResult};
pub use outcome::Outcome;
pub use ping::PingTask;
pub use queue::{CommandQueue, Ticket, WorkerPool};
pub use queue_provider::CommandQueueProvider;
