//! Task futures: one-shot synchronization points stored in the bucket's
//! sibling keyspace.
//!
//! A future owns two sub-spaces under `P_fb/<uid>`: `bl/<block>` rows,
//! whose emptiness means the future is set, and `cb/<callback>/<param>`
//! rows holding callback tasks recorded while unset. Callbacks fire in
//! the same transaction that clears the last block, so downstream
//! enqueues commit together with the completion that caused them.

use crate::bucket::{random_uid, TaskBucket};
use crate::error::Error;
use crate::keys::{Subspace, BLOCKS_KEY, CALLBACKS_KEY, MAX_UID};
use crate::registry::TaskRegistry;
use crate::store::{KeySelector, Transaction, TransactionOption};
use crate::task::{reserved, Task};
use crate::tunables;
use crate::tuple::{Element, TupleAccess};

#[derive(Debug, Clone)]
pub struct FutureBucket {
    prefix: Subspace,
    system_access: bool,
    lock_aware: bool,
}

impl FutureBucket {
    pub fn new(subspace: Subspace, system_access: bool, lock_aware: bool) -> Self {
        Self {
            prefix: subspace,
            system_access,
            lock_aware,
        }
    }

    pub(crate) fn set_options(&self, tr: &dyn Transaction) {
        if self.system_access {
            tr.set_option(TransactionOption::AccessSystemKeys);
        }
        if self.lock_aware {
            tr.set_option(TransactionOption::LockAware);
        }
    }

    /// Allocate a new future. It starts with a single primordial block so
    /// it is unset until explicitly set or joined.
    pub fn future(&self, tr: &dyn Transaction) -> TaskFuture {
        self.set_options(tr);
        let future = TaskFuture::new(self.clone(), random_uid());
        future.add_block(tr, b"");
        future
    }

    /// Rehydrate a future handle from its uid.
    pub fn unpack(&self, key: &[u8]) -> TaskFuture {
        TaskFuture::new(self.clone(), key.to_vec())
    }

    /// True when no future state exists in the bucket at all.
    pub async fn is_empty(&self, tr: &dyn Transaction) -> Result<bool, Error> {
        self.set_options(tr);
        let upper = self.prefix.pack(&[Element::bytes(MAX_UID.to_vec())]);
        let key = tr.get_key(KeySelector::last_less_or_equal(upper)).await?;
        Ok(!self.prefix.contains(&key))
    }

    /// Drop every future in the bucket.
    pub fn clear(&self, tr: &dyn Transaction) {
        self.set_options(tr);
        tr.clear_range(&self.prefix.range());
    }
}

/// Handle to one stored future.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    bucket: FutureBucket,
    pub key: Vec<u8>,
    blocks: Subspace,
    callbacks: Subspace,
}

impl TaskFuture {
    fn new(bucket: FutureBucket, key: Vec<u8>) -> Self {
        let prefix = bucket.prefix.subspace(&[Element::bytes(key.clone())]);
        Self {
            blocks: prefix.subspace(&[Element::bytes(BLOCKS_KEY)]),
            callbacks: prefix.subspace(&[Element::bytes(CALLBACKS_KEY)]),
            bucket,
            key,
        }
    }

    pub(crate) fn add_block(&self, tr: &dyn Transaction, block_id: &[u8]) {
        tr.set(&self.blocks.pack(&[Element::bytes(block_id)]), b"");
    }

    pub(crate) fn clear_block(&self, tr: &dyn Transaction, block_id: &[u8]) {
        tr.clear(&self.blocks.pack(&[Element::bytes(block_id)]));
    }

    /// A future is set iff it has no outstanding blocks.
    pub async fn is_set(&self, tr: &dyn Transaction) -> Result<bool, Error> {
        self.bucket.set_options(tr);
        Ok(tr.get_range(&self.blocks.range(), 1).await?.rows.is_empty())
    }

    /// Set the future now: clear every block and fire all pending
    /// callbacks in this same transaction.
    pub async fn set(&self, tr: &dyn Transaction, bucket: &TaskBucket) -> Result<(), Error> {
        self.bucket.set_options(tr);
        tr.clear_range(&self.blocks.range());
        self.perform_all_actions(tr, bucket).await
    }

    /// Run `task` when the future is set: immediately if it already is,
    /// otherwise record it as a pending callback.
    pub async fn on_set(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
    ) -> Result<(), Error> {
        self.bucket.set_options(tr);
        if self.is_set(tr).await? {
            self.perform_action(tr, bucket, task).await
        } else {
            let callback_space = self.callbacks.subspace(&[Element::bytes(random_uid())]);
            for (name, value) in task.params() {
                tr.set(&callback_space.pack(&[Element::bytes(name)]), value);
            }
            Ok(())
        }
    }

    /// Block this future on every future in `others`: each gets an
    /// unblock callback that releases one block of this future, so this
    /// future fires once all of them have fired. A no-op if this future
    /// is already set.
    pub async fn join(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        others: &[TaskFuture],
    ) -> Result<(), Error> {
        self.bucket.set_options(tr);
        if self.is_set(tr).await? {
            return Ok(());
        }

        // The primordial block is replaced by one block per input.
        self.clear_block(tr, b"");
        for other in others {
            let block_id = random_uid();
            self.add_block(tr, &block_id);
            let mut unblock = Task::new(b"UnblockFuture");
            unblock.set_param(reserved::FUTURE, self.key.clone());
            unblock.set_param(reserved::BLOCK_ID, block_id);
            other.on_set(tr, bucket, &mut unblock).await?;
        }
        Ok(())
    }

    /// A fresh future that becomes a new input of this one: this future
    /// will not fire until the returned future is set.
    pub async fn joined_future(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
    ) -> Result<TaskFuture, Error> {
        self.bucket.set_options(tr);
        let joined = self.bucket.future(tr);
        self.join(tr, bucket, std::slice::from_ref(&joined)).await?;
        Ok(joined)
    }

    /// Arrange for `task` to be enqueued when this future fires, by
    /// wrapping it in the add-task indirection.
    pub async fn on_set_add_task(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
    ) -> Result<(), Error> {
        self.bucket.set_options(tr);
        let original_type = task.task_type().cloned().unwrap_or_default();
        task.set_param(reserved::ADD_TASK, original_type);
        task.set_param(reserved::TYPE, &b"AddTask"[..]);
        self.on_set(tr, bucket, task).await
    }

    /// As [`TaskFuture::on_set_add_task`], with a validation predicate
    /// stamped on the wrapped task first. When `validation_value` is not
    /// supplied it is read from the store; an absent key is an error.
    pub async fn on_set_add_task_with_validation(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
        validation_key: &[u8],
        validation_value: Option<&[u8]>,
    ) -> Result<(), Error> {
        self.bucket.set_options(tr);
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
        TaskBucket::set_validation_condition(task, validation_key, &value);
        self.on_set_add_task(tr, bucket, task).await
    }

    /// Invoke one callback task's finish hook within this transaction.
    pub(crate) async fn perform_action(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
    ) -> Result<(), Error> {
        self.bucket.set_options(tr);
        if TaskRegistry::is_valid_task(task) {
            let task_type = task.task_type().cloned().unwrap_or_default();
            if let Some(func) = bucket.registry().get(&task_type) {
                func.finish(tr, bucket, &self.bucket, task).await?;
            }
        }
        Ok(())
    }

    /// Fire every pending callback, grouped by callback uid, and clear
    /// them, all in this transaction.
    pub async fn perform_all_actions(
        &self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
    ) -> Result<(), Error> {
        self.bucket.set_options(tr);
        let rows = tr
            .get_range(&self.callbacks.range(), tunables::TOO_MANY)
            .await?;
        tr.clear_range(&self.callbacks.range());

        // Rows are (callback uid, param) -> value.
        let mut pending: Vec<Task> = Vec::new();
        let mut current_uid: Vec<u8> = Vec::new();
        for row in &rows.rows {
            let elements = self.callbacks.unpack(&row.key)?;
            let callback_uid = elements.bytes_at(0)?;
            let param = elements.bytes_at(1)?;
            if callback_uid != current_uid.as_slice() || pending.is_empty() {
                current_uid = callback_uid.to_vec();
                pending.push(Task::default());
            }
            if let Some(task) = pending.last_mut() {
                task.set_param(param, row.value.clone());
            }
        }

        for mut task in pending {
            self.perform_action(tr, bucket, &mut task).await?;
        }
        Ok(())
    }
}

/// The completion key a producer hands to consumers of a chained task:
/// either an explicit signal key, or a future joined in lazily the first
/// time the key is needed.
#[derive(Debug, Clone)]
pub enum TaskCompletionKey {
    Signal(Vec<u8>),
    Joined(TaskFuture),
}

impl TaskCompletionKey {
    pub fn signal(key: impl Into<Vec<u8>>) -> Self {
        TaskCompletionKey::Signal(key.into())
    }

    pub fn joined(future: TaskFuture) -> Self {
        TaskCompletionKey::Joined(future)
    }

    /// Resolve to a future uid, joining a fresh future into the wrapped
    /// one on first use and caching the result.
    pub async fn get(
        &mut self,
        tr: &dyn Transaction,
        bucket: &TaskBucket,
    ) -> Result<Vec<u8>, Error> {
        match self {
            TaskCompletionKey::Signal(key) => Ok(key.clone()),
            TaskCompletionKey::Joined(future) => {
                let joined = future.joined_future(tr, bucket).await?;
                let key = joined.key.clone();
                *self = TaskCompletionKey::Signal(key.clone());
                Ok(key)
            }
        }
    }
}
