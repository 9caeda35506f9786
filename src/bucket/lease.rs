//! Lease extension and timed-out-lease requeue.

use crate::error::Error;
use crate::keys::KeyRange;
use crate::store::Transaction;
use crate::task::Task;
use crate::tunables;
use crate::tuple::{Element, TupleAccess};

use super::TaskBucket;

impl TaskBucket {
    /// True while the task still owns its lease rows.
    pub async fn keep_running(&self, tr: &dyn Transaction, task: &Task) -> Result<bool, Error> {
        Ok(!self.is_finished(tr, task).await?)
    }

    /// Re-lease a running task: drop the current lease rows and rewrite
    /// them under a fresh lease computed without jitter. Updates
    /// `task.timeout` in memory. Returns false if the task already lost
    /// its lease, in which case nothing is written.
    pub async fn save_and_extend(
        &self,
        tr: &dyn Transaction,
        task: &mut Task,
    ) -> Result<bool, Error> {
        self.set_options(tr);

        if !self.keep_running(tr, task).await? {
            return Ok(false);
        }

        tr.clear_range(&self.timeouts.range_of(&[
            Element::int(task.timeout),
            Element::bytes(task.key.clone()),
        ]));

        let version = tr.read_version().await?;
        task.timeout = version + self.timeout;
        let timeout_space = self
            .timeouts
            .subspace(&[Element::int(task.timeout), Element::bytes(task.key.clone())]);
        for (name, value) in task.params() {
            tr.set(&timeout_space.pack(&[Element::bytes(name)]), value);
        }

        Ok(true)
    }

    /// Move expired leases back to their priority bands.
    ///
    /// Reads up to `MAX_TASK_KEYS` rows of `to/0 .. to/<read version>`,
    /// groups rows by task uid, and reposts each fully-seen group under
    /// `avp/<priority>/<uid>`. When the scan is truncated, rows of the
    /// trailing partially-seen task are neither reposted nor cleared:
    /// the consumed prefix ends at that group's first key, so a task's
    /// rows never split across sweeps. Returns true iff anything moved.
    ///
    /// Safe under concurrent claims: a claimant's lease write conflicts
    /// with this sweep at commit, and the loser retries.
    pub async fn requeue_timed_out_tasks(&self, tr: &dyn Transaction) -> Result<bool, Error> {
        let end_version = tr.read_version().await?;
        let range = KeyRange {
            begin: self.timeouts.subspace(&[Element::int(0)]).range().begin,
            end: self
                .timeouts
                .subspace(&[Element::int(end_version)])
                .range()
                .end,
        };
        let result = tr.get_range(&range, tunables::MAX_TASK_KEYS).await?;

        // Rows are (lease, uid, param) -> value. A task's priority is one
        // of its params, so a group must be materialized before we know
        // which band to repost it into.
        let mut task = Task::default();
        let mut group_start: Vec<u8> = Vec::new();
        for row in &result.rows {
            let elements = self.timeouts.unpack(&row.key)?;
            let uid = elements.bytes_at(1)?;
            let param = elements.bytes_at(2)?;

            if uid != task.key.as_slice() {
                self.repost(tr, &task);
                task = Task::default();
                task.key = uid.to_vec();
                group_start = row.key.to_vec();
            }
            task.set_param(param, row.value.clone());
        }

        if !result.more {
            self.repost(tr, &task);
            if !result.rows.is_empty() {
                tr.clear_range(&range);
                return Ok(true);
            }
            return Ok(false);
        }

        debug_assert!(!group_start.is_empty());
        tr.clear_range(&KeyRange {
            begin: range.begin,
            end: group_start,
        });
        Ok(true)
    }

    /// Write a materialized task group back into its priority band.
    fn repost(&self, tr: &dyn Transaction, task: &Task) {
        if task.key.is_empty() || task.param_count() == 0 {
            return;
        }
        let space = self
            .available_space(task.priority())
            .subspace(&[Element::bytes(task.key.clone())]);
        for (name, value) in task.params() {
            tr.set(&space.pack(&[Element::bytes(name)]), value);
        }
    }
}
