//! Task selection: uniform random probes per priority band, claimed by
//! moving the winner's rows into the lease subspace.

use futures::stream::{FuturesOrdered, StreamExt};
use rand::Rng;

use crate::error::Error;
use crate::keys::MAX_UID;
use crate::store::{KeySelector, Transaction, TransactionOption};
use crate::task::Task;
use crate::tunables;
use crate::tuple::{Element, TupleAccess};

use super::{random_uid, TaskBucket};

impl TaskBucket {
    /// Probe one priority band for a uniformly random task row.
    ///
    /// Picks a random uid `R` and resolves the greatest key at or below
    /// the packed `R` within the band; failing that, the greatest key at
    /// or below the maximum possible uid. Either resolves to the last row
    /// of some existing task, giving approximately uniform sampling over
    /// tasks rather than keys.
    async fn get_task_key(
        &self,
        tr: &dyn Transaction,
        priority: i64,
    ) -> Result<Option<Vec<u8>>, Error> {
        let space = self.available_space(priority);

        let probe = space.pack(&[Element::bytes(random_uid())]);
        let key = tr.get_key(KeySelector::last_less_or_equal(probe)).await?;
        if space.contains(&key) {
            return Ok(Some(key));
        }

        let upper = space.pack(&[Element::bytes(MAX_UID.to_vec())]);
        let key = tr.get_key(KeySelector::last_less_or_equal(upper)).await?;
        if space.contains(&key) {
            return Ok(Some(key));
        }

        Ok(None)
    }

    /// Claim one task, preferring higher priority bands.
    ///
    /// Probes every band concurrently and awaits the results in strictly
    /// descending priority order; as soon as a band yields a key the
    /// remaining probes are dropped. When nothing is available, a
    /// timed-out-lease sweep runs; if it moved anything the selection is
    /// retried, otherwise the bucket is drained and `None` is returned.
    pub async fn get_one(&self, tr: &dyn Transaction) -> Result<Option<Task>, Error> {
        if self.priority_batch {
            tr.set_option(TransactionOption::PriorityBatch);
        }
        self.set_options(tr);

        loop {
            // Give timed-out tasks an occasional head start so a flood of
            // fresh enqueues cannot starve them forever.
            if rand::rng().random_bool(tunables::CHECK_TIMEOUT_CHANCE) {
                self.requeue_timed_out_tasks(tr).await?;
            }

            let mut probes = FuturesOrdered::new();
            for priority in (0..=tunables::MAX_PRIORITY).rev() {
                probes.push_back(async move { (priority, self.get_task_key(tr, priority).await) });
            }

            let mut found: Option<(i64, Vec<u8>)> = None;
            while let Some((priority, result)) = probes.next().await {
                if let Some(key) = result? {
                    found = Some((priority, key));
                    break;
                }
            }
            drop(probes);

            let Some((priority, task_key)) = found else {
                if self.requeue_timed_out_tasks(tr).await? {
                    continue;
                }
                return Ok(None);
            };

            let available_space = self.available_space(priority);
            let uid = available_space.unpack(&task_key)?.bytes_at(0)?.to_vec();
            let task_space = available_space.subspace(&[Element::bytes(uid.clone())]);

            let rows = tr.get_range(&task_space.range(), tunables::TOO_MANY).await?;
            let version = tr.read_version().await?;

            let jitter = tunables::TIMEOUT_JITTER_OFFSET
                + tunables::TIMEOUT_JITTER_RANGE * rand::rng().random::<f64>();
            let mut task = Task::default();
            task.key = uid.clone();
            task.timeout = version + (self.timeout as f64 * jitter) as i64;

            let timeout_space = self
                .timeouts
                .subspace(&[Element::int(task.timeout), Element::bytes(uid)]);
            for row in &rows.rows {
                let param = task_space.unpack(&row.key)?.bytes_at(0)?.to_vec();
                tr.set(&timeout_space.pack(&[Element::bytes(param.clone())]), &row.value);
                task.set_param(&param, row.value.clone());
            }

            tr.clear_range(&task_space.range());
            tr.set(self.active.key(), &random_uid());

            return Ok(Some(task));
        }
    }
}
