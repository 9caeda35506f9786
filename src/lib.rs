//! hopper: a durable, prioritized task queue on an ordered transactional
//! key-value store.
//!
//! Tasks are small parameter maps stored one row per parameter under a
//! caller-supplied key prefix. A [`bucket::TaskBucket`] hands out leases
//! with at-least-once semantics: claimed tasks move into a lease subspace
//! keyed by expiry version, timed-out leases are swept back into their
//! priority band, and completion happens in the same transaction as the
//! handler's effects. [`future::TaskFuture`] provides stored one-shot
//! synchronization points for chaining tasks: completion of upstream
//! tasks transactionally enqueues successors.
//!
//! The store itself is abstract (see [`store::Transaction`]); an embedded
//! in-memory implementation with optimistic snapshot transactions ships
//! in [`store::memory`].

pub mod bucket;
pub mod error;
pub mod future;
pub mod keys;
pub mod registry;
pub mod store;
pub mod task;
pub mod tunables;
pub mod tuple;

pub use bucket::{BucketOptions, TaskBucket};
pub use error::Error;
pub use future::{FutureBucket, TaskCompletionKey, TaskFuture};
pub use keys::{KeyRange, Subspace};
pub use registry::{TaskFunc, TaskRegistry};
pub use store::memory::MemoryDb;
pub use store::{run_transaction, Database, StoreError, Transaction};
pub use task::Task;
