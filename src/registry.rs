//! Handler registry: name to `TaskFunc` lookup, plus the built-in
//! scheduler handlers.
//!
//! The registry is built once at startup and read-only afterward; share
//! it as an `Arc` between the buckets and workers of a process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bucket::TaskBucket;
use crate::error::Error;
use crate::future::FutureBucket;
use crate::store::{Database, Transaction};
use crate::task::{reserved, Task};

/// A polymorphic task handler.
///
/// `execute` does the side-effectful work and runs outside any claim
/// transaction; `finish` runs inside the finish transaction and must be
/// idempotent under `TaskBucket::is_finished` (it is re-invoked from
/// scratch if the transaction retries).
#[async_trait]
pub trait TaskFunc: Send + Sync {
    /// Registry name; also the value of the task's `type` parameter.
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        db: &dyn Database,
        bucket: &TaskBucket,
        futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), Error>;

    async fn finish(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), Error>;
}

pub struct TaskRegistry {
    funcs: HashMap<Vec<u8>, Arc<dyn TaskFunc>>,
}

impl TaskRegistry {
    /// A registry with the built-in handlers pre-registered.
    pub fn new() -> Self {
        let mut registry = Self {
            funcs: HashMap::new(),
        };
        registry.register(Arc::new(IdleFunc));
        registry.register(Arc::new(AddTaskFunc));
        registry.register(Arc::new(UnblockFutureFunc));
        registry
    }

    /// Register a handler under its own name, replacing any previous
    /// registration.
    pub fn register(&mut self, func: Arc<dyn TaskFunc>) {
        self.funcs.insert(func.name().as_bytes().to_vec(), func);
    }

    pub fn get(&self, name: &[u8]) -> Option<Arc<dyn TaskFunc>> {
        self.funcs.get(name).cloned()
    }

    /// A task is runnable only if it names a handler.
    pub fn is_valid_task(task: &Task) -> bool {
        task.task_type().is_some_and(|t| !t.is_empty())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// No-op task used by the liveness probe to force a dequeue round.
pub struct IdleFunc;

pub const IDLE_TASK_VERSION: u32 = 1;

#[async_trait]
impl TaskFunc for IdleFunc {
    fn name(&self) -> &'static str {
        "idle"
    }

    async fn execute(
        &self,
        _db: &dyn Database,
        _bucket: &TaskBucket,
        _futures: &FutureBucket,
        _task: &mut Task,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn finish(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        _futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), Error> {
        bucket.finish(tr, task).await
    }
}

/// Tail of a "future fires, enqueue this task" chain: restores the
/// wrapped handler name and re-enqueues the task.
pub struct AddTaskFunc;

#[async_trait]
impl TaskFunc for AddTaskFunc {
    fn name(&self) -> &'static str {
        "AddTask"
    }

    async fn execute(
        &self,
        _db: &dyn Database,
        _bucket: &TaskBucket,
        _futures: &FutureBucket,
        _task: &mut Task,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn finish(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        _futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), Error> {
        if let Some(original) = task.param(reserved::ADD_TASK).cloned() {
            task.set_param(reserved::TYPE, original);
        }
        bucket.add_task(tr, task);
        Ok(())
    }
}

/// Releases one block of a future; fires the future's callbacks when the
/// last block is gone.
pub struct UnblockFutureFunc;

#[async_trait]
impl TaskFunc for UnblockFutureFunc {
    fn name(&self) -> &'static str {
        "UnblockFuture"
    }

    async fn execute(
        &self,
        _db: &dyn Database,
        _bucket: &TaskBucket,
        _futures: &FutureBucket,
        _task: &mut Task,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn finish(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), Error> {
        let Some(future_key) = task.param(reserved::FUTURE).cloned() else {
            tracing::warn!("unblock task carries no future reference");
            return Ok(());
        };
        let future = futures.unpack(&future_key);
        futures.set_options(tr);

        if let Some(block_id) = task.param(reserved::BLOCK_ID).cloned() {
            future.clear_block(tr, &block_id);
        }

        if future.is_set(tr).await? {
            future.perform_all_actions(tr, bucket).await?;
        }
        Ok(())
    }
}
