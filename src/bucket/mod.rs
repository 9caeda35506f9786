//! The task bucket: the keyspace state machine for enqueue, claim,
//! lease, and completion.
//!
//! Split across submodules:
//! - `dequeue`: random-probe task selection and claiming
//! - `lease`: lease extension and timed-out-lease requeue
//! - `worker`: the concurrency-bounded run loop and task driver
//!
//! Layout under the bucket's prefix `P`:
//! - `P/ac`: single-key heartbeat, rewritten on every claim
//! - `P/avp/<pri>/<uid>/<param>`: available tasks, one row per parameter
//! - `P/to/<lease>/<uid>/<param>`: claimed tasks, keyed by lease version
//! - `P/task_count`: little-endian counter maintained by atomic adds

mod dequeue;
mod lease;
mod worker;

use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::error::Error;
use crate::keys::{
    Subspace, ACTIVE_KEY, AVAILABLE_PRIORITIZED_KEY, TASK_COUNT_KEY, TIMEOUTS_KEY,
};
use crate::registry::TaskRegistry;
use crate::store::{
    decode_counter, run_transaction, Database, Transaction, TransactionOption, Watch,
};
use crate::task::{reserved, Task};
use crate::tunables;
use crate::tuple::Element;

/// Per-bucket behavior flags and lease length.
#[derive(Debug, Clone)]
pub struct BucketOptions {
    /// Apply `AccessSystemKeys` to every transaction the bucket opens.
    pub system_access: bool,
    /// Claim tasks at batch transaction priority.
    pub priority_batch: bool,
    /// Apply `LockAware` to every transaction the bucket opens.
    pub lock_aware: bool,
    /// Base lease length in versions for claimed tasks.
    pub timeout: i64,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            system_access: false,
            priority_batch: false,
            lock_aware: false,
            timeout: tunables::TIMEOUT_VERSIONS,
        }
    }
}

/// A random 32-hex-character uid, used for tasks, futures, blocks,
/// callbacks, and the active-key heartbeat value.
pub(crate) fn random_uid() -> Vec<u8> {
    Uuid::new_v4().simple().to_string().into_bytes()
}

pub struct TaskBucket {
    pub(crate) prefix: Subspace,
    pub(crate) active: Subspace,
    pub(crate) available_prioritized: Subspace,
    pub(crate) timeouts: Subspace,
    pub(crate) timeout: i64,
    registry: Arc<TaskRegistry>,
    system_access: bool,
    pub(crate) priority_batch: bool,
    lock_aware: bool,
}

impl TaskBucket {
    pub fn new(subspace: Subspace, registry: Arc<TaskRegistry>, options: BucketOptions) -> Self {
        Self {
            active: subspace.subspace(&[Element::bytes(ACTIVE_KEY)]),
            available_prioritized: subspace.subspace(&[Element::bytes(AVAILABLE_PRIORITIZED_KEY)]),
            timeouts: subspace.subspace(&[Element::bytes(TIMEOUTS_KEY)]),
            prefix: subspace,
            timeout: options.timeout,
            registry,
            system_access: options.system_access,
            priority_batch: options.priority_batch,
            lock_aware: options.lock_aware,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub(crate) fn set_options(&self, tr: &dyn Transaction) {
        if self.system_access {
            tr.set_option(TransactionOption::AccessSystemKeys);
        }
        if self.lock_aware {
            tr.set_option(TransactionOption::LockAware);
        }
    }

    /// The available subspace for one priority band.
    pub(crate) fn available_space(&self, priority: i64) -> Subspace {
        self.available_prioritized
            .subspace(&[Element::int(priority.clamp(0, tunables::MAX_PRIORITY))])
    }

    fn task_count_key(&self) -> Vec<u8> {
        self.prefix.pack(&[Element::bytes(TASK_COUNT_KEY)])
    }

    /// Enqueue `task` under a fresh uid and bump the task counter.
    /// Performs no reads; concurrent enqueues only touch the counter row,
    /// which is maintained by a conflict-free atomic add.
    pub fn add_task(&self, tr: &dyn Transaction, task: &Task) -> Vec<u8> {
        self.set_options(tr);
        let uid = random_uid();
        let task_space = self
            .available_space(task.priority())
            .subspace(&[Element::bytes(uid.clone())]);
        for (name, value) in task.params() {
            tr.set(&task_space.pack(&[Element::bytes(name)]), value);
        }
        tr.atomic_add(&self.task_count_key(), 1);
        uid
    }

    /// Stamp `task` with a validation predicate: it stays valid only while
    /// the store's value at `key` equals `value`.
    pub fn set_validation_condition(task: &mut Task, key: &[u8], value: &[u8]) {
        task.set_param(reserved::VALID_KEY, key.to_vec());
        task.set_param(reserved::VALID_VALUE, value.to_vec());
    }

    /// Enqueue with a validation predicate. When `validation_value` is not
    /// supplied it is read from the store; an absent key is an error since
    /// the task would be born invalid.
    pub async fn add_task_with_validation(
        &self,
        tr: &dyn Transaction,
        task: &mut Task,
        validation_key: &[u8],
        validation_value: Option<&[u8]>,
    ) -> Result<Vec<u8>, Error> {
        self.set_options(tr);
        let value = match validation_value {
            Some(v) => v.to_vec(),
            None => match tr.get(validation_key).await? {
                Some(v) => v.to_vec(),
                None => {
                    tracing::error!(
                        task_type = ?task.task_type(),
                        "validation key has no value in the store"
                    );
                    return Err(Error::InvalidValidation);
                }
            },
        };
        Self::set_validation_condition(task, validation_key, &value);
        Ok(self.add_task(tr, task))
    }

    /// Complete a claimed task: decrement the counter and drop its lease
    /// rows. A no-op if the task is already finished, so the counter is
    /// never decremented twice for one claim.
    pub async fn finish(&self, tr: &dyn Transaction, task: &Task) -> Result<(), Error> {
        self.set_options(tr);
        if self.is_finished(tr, task).await? {
            return Ok(());
        }
        tr.atomic_add(&self.task_count_key(), -1);
        tr.clear_range(&self.timeouts.range_of(&[
            Element::int(task.timeout),
            Element::bytes(task.key.clone()),
        ]));
        Ok(())
    }

    /// True when no lease rows remain for the task's `(lease, uid)`.
    pub async fn is_finished(&self, tr: &dyn Transaction, task: &Task) -> Result<bool, Error> {
        self.set_options(tr);
        let range = self.timeouts.range_of(&[
            Element::int(task.timeout),
            Element::bytes(task.key.clone()),
        ]);
        Ok(tr.get_range(&range, 1).await?.rows.is_empty())
    }

    /// Check the task's validation predicate against the store. Tasks
    /// missing either reserved parameter are reported invalid, with the
    /// missing piece logged.
    pub async fn is_verified(&self, tr: &dyn Transaction, task: &Task) -> Result<bool, Error> {
        let Some(valid_key) = task.param(reserved::VALID_KEY) else {
            tracing::warn!(
                task_type = ?task.task_type(),
                "validation check on a task with no validation key"
            );
            return Ok(false);
        };
        let Some(valid_value) = task.param(reserved::VALID_VALUE) else {
            tracing::warn!(
                task_type = ?task.task_type(),
                "validation check on a task with no validation value"
            );
            return Ok(false);
        };
        self.set_options(tr);
        match tr.get(valid_key).await? {
            None => {
                tracing::warn!(
                    task_type = ?task.task_type(),
                    "validation key missing from the store"
                );
                Ok(false)
            }
            Some(stored) if stored != *valid_value => {
                tracing::warn!(
                    task_type = ?task.task_type(),
                    "task aborted: validation value changed"
                );
                Ok(false)
            }
            Some(_) => Ok(true),
        }
    }

    /// Standalone retrying variant of [`TaskBucket::is_verified`].
    pub async fn verify(self: &Arc<Self>, db: &dyn Database, task: &Task) -> Result<bool, Error> {
        run_transaction(db, |tr| {
            let bucket = Arc::clone(self);
            let task = task.clone();
            Box::pin(async move { bucket.is_verified(tr, &task).await })
        })
        .await
    }

    /// True if any priority band has at least one available task.
    pub async fn is_busy(&self, tr: &dyn Transaction) -> Result<bool, Error> {
        self.set_options(tr);
        let probes = (0..=tunables::MAX_PRIORITY).map(|pri| {
            let range = self.available_space(pri).range();
            async move { tr.get_range(&range, 1).await }
        });
        for result in join_all(probes).await {
            if !result?.rows.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True when no tasks are available in any band and no leases are
    /// outstanding.
    pub async fn is_empty(&self, tr: &dyn Transaction) -> Result<bool, Error> {
        if self.is_busy(tr).await? {
            return Ok(false);
        }
        Ok(tr
            .get_range(&self.timeouts.range(), 1)
            .await?
            .rows
            .is_empty())
    }

    /// True if the active heartbeat key has changed from `previous`.
    pub async fn get_active_key(
        &self,
        tr: &dyn Transaction,
        previous: Option<&[u8]>,
    ) -> Result<bool, Error> {
        self.set_options(tr);
        let current = tr.get(self.active.key()).await?;
        Ok(current.as_deref() != previous)
    }

    fn add_idle(&self, tr: &dyn Transaction) -> Vec<u8> {
        self.set_options(tr);
        let mut task = Task::new(b"idle");
        task.set_version(crate::registry::IDLE_TASK_VERSION);
        self.add_task(tr, &task)
    }

    /// Liveness probe: enqueue an `idle` task if the bucket looks idle,
    /// then poll the active heartbeat for movement. Returns true as soon
    /// as any worker claims something.
    pub async fn check_active(self: &Arc<Self>, db: &dyn Database) -> Result<bool, Error> {
        let starting = run_transaction(db, |tr| {
            let bucket = Arc::clone(self);
            Box::pin(async move {
                bucket.set_options(tr);
                if !bucket.is_busy(tr).await? {
                    bucket.add_idle(tr);
                }
                Ok(tr.get(bucket.active.key()).await?)
            })
        })
        .await?;

        for _ in 0..tunables::CHECK_ACTIVE_AMOUNT {
            tokio::time::sleep(std::time::Duration::from_secs_f64(
                tunables::CHECK_ACTIVE_DELAY_SECS,
            ))
            .await;
            let changed = run_transaction(db, |tr| {
                let bucket = Arc::clone(self);
                let starting = starting.clone();
                Box::pin(async move { bucket.get_active_key(tr, starting.as_deref()).await })
            })
            .await?;
            if changed {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn get_task_count(&self, tr: &dyn Transaction) -> Result<i64, Error> {
        self.set_options(tr);
        Ok(tr
            .get(&self.task_count_key())
            .await?
            .map(|v| decode_counter(&v))
            .unwrap_or(0))
    }

    /// A watch that fires when the task counter next changes.
    pub fn watch_task_count(&self, tr: &dyn Transaction) -> Watch {
        self.set_options(tr);
        tr.watch(&self.task_count_key())
    }

    /// Drop every row of the bucket, including the counter.
    pub fn clear(&self, tr: &dyn Transaction) {
        self.set_options(tr);
        tr.clear_range(&self.prefix.range());
    }
}
