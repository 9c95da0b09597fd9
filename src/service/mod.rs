//! Service side: exposing methods to remote callers.
//!
//! - [`registry`]: the [`MethodTable`] of callable methods and their
//!   [`Arguments`].
//! - [`worker`]: a single [`Worker`] serving one request at a time.
//! - [`pool`]: a [`WorkerPool`] spreading requests over many workers, with
//!   optional dynamic sizing driven by [`sizing`].

pub mod pool;
pub mod registry;
pub mod sizing;
pub mod worker;

pub use pool::{PoolConfig, PoolSize, WorkerPool};
pub use registry::{Arguments, MethodTable, MethodTableBuilder};
pub use sizing::PoolSizer;
pub use worker::Worker;
