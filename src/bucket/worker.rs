//! The worker side: driving one claimed task to completion, and the
//! concurrency-bounded run loop with adaptive batch fetch.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinSet;

use crate::error::Error;
use crate::future::FutureBucket;
use crate::registry::TaskRegistry;
use crate::store::{run_transaction, Database};
use crate::task::Task;
use crate::tunables;

use super::TaskBucket;

/// Outcome of the pre-execution validation transaction.
enum Precheck {
    /// Validation failed; the task was finished without running.
    Aborted,
    /// Validation passed (or was not required) at this read version.
    Valid(i64),
}

impl TaskBucket {
    /// Claim one task and drive it to completion. Returns false when the
    /// bucket had nothing to hand out.
    pub async fn do_one(
        self: &Arc<Self>,
        db: &Arc<dyn Database>,
        futures: &Arc<FutureBucket>,
    ) -> Result<bool, Error> {
        let task = run_transaction(db.as_ref(), |tr| {
            let bucket = Arc::clone(self);
            Box::pin(async move { bucket.get_one(tr).await })
        })
        .await?;
        self.do_task(db, futures, task).await
    }

    /// Drive a claimed task: validate, race the handler's `execute`
    /// against lease expiry, then run the guarded finish transaction.
    ///
    /// Returns true when a task was processed, including tasks aborted by
    /// validation and tasks whose lease expired mid-execution (those are
    /// reclaimed by the timeout path; no finish is attempted). Returns
    /// false for a missing task, a task with no type, or an unregistered
    /// handler.
    pub async fn do_task(
        self: &Arc<Self>,
        db: &Arc<dyn Database>,
        futures: &Arc<FutureBucket>,
        task: Option<Task>,
    ) -> Result<bool, Error> {
        let Some(mut task) = task else {
            return Ok(false);
        };
        if !TaskRegistry::is_valid_task(&task) {
            tracing::warn!("claimed task carries no handler type");
            return Ok(false);
        }
        let task_type = task.task_type().cloned().unwrap_or_default();
        let Some(func) = self.registry().get(&task_type) else {
            tracing::warn!(task_type = ?task_type, "no handler registered for task");
            return Ok(false);
        };

        let verify = task.has_validation();
        let precheck = if verify {
            run_transaction(db.as_ref(), |tr| {
                let bucket = Arc::clone(self);
                let task = task.clone();
                Box::pin(async move {
                    bucket.set_options(tr);
                    if !bucket.is_verified(tr, &task).await? {
                        bucket.finish(tr, &task).await?;
                        return Ok(Precheck::Aborted);
                    }
                    Ok(Precheck::Valid(tr.read_version().await?))
                })
            })
            .await?
        } else {
            run_transaction(db.as_ref(), |tr| {
                let bucket = Arc::clone(self);
                Box::pin(async move {
                    bucket.set_options(tr);
                    Ok(Precheck::Valid(tr.read_version().await?))
                })
            })
            .await?
        };
        let version_now = match precheck {
            Precheck::Aborted => return Ok(true),
            Precheck::Valid(version) => version,
        };

        // Race the handler against lease expiry. The timer length is the
        // lease distance converted to seconds; when it fires we confirm
        // against a fresh read version before declaring the lease lost,
        // and re-arm otherwise.
        let timeout_version = task.timeout;
        let lease_secs = (timeout_version - version_now).max(0) as f64
            / tunables::VERSIONS_PER_SECOND as f64;
        {
            let mut execute = func.execute(db.as_ref(), self, futures, &mut task);
            let mut lease_timer = Box::pin(tokio::time::sleep(Duration::from_secs_f64(lease_secs)));
            loop {
                tokio::select! {
                    result = &mut execute => {
                        result?;
                        break;
                    }
                    _ = &mut lease_timer => {
                        let version = run_transaction(db.as_ref(), |tr| {
                            Box::pin(async move { Ok(tr.read_version().await?) })
                        })
                        .await?;
                        if version >= timeout_version {
                            tracing::warn!(
                                task_type = ?task_type,
                                "handler outran its lease; task will be requeued by timeout"
                            );
                            return Ok(true);
                        }
                        lease_timer =
                            Box::pin(tokio::time::sleep(Duration::from_secs_f64(lease_secs)));
                    }
                }
            }
        }

        // Finish transaction: early-exit if another party already finished
        // this lease, re-validate, and only then run the handler's finish.
        run_transaction(db.as_ref(), |tr| {
            let bucket = Arc::clone(self);
            let futures = Arc::clone(futures);
            let func = Arc::clone(&func);
            let mut task = task.clone();
            Box::pin(async move {
                bucket.set_options(tr);
                if bucket.is_finished(tr, &task).await? {
                    return Ok(());
                }
                let valid = if verify {
                    bucket.is_verified(tr, &task).await?
                } else {
                    true
                };
                if !valid {
                    bucket.finish(tr, &task).await
                } else {
                    func.finish(tr, &bucket, &futures, &mut task).await
                }
            })
        })
        .await?;

        Ok(true)
    }

    /// The worker loop: keep up to `max_concurrent` tasks in flight,
    /// fetching in adaptively-sized batches and polling with a jittered
    /// delay when idle. Runs until the enclosing future is cancelled;
    /// in-flight handlers are not aborted by fetch errors.
    pub async fn run(
        self: Arc<Self>,
        db: Arc<dyn Database>,
        futures: Arc<FutureBucket>,
        poll_delay: f64,
        max_concurrent: usize,
    ) {
        let max_concurrent = max_concurrent.max(1);
        let mut running: JoinSet<Result<bool, Error>> = JoinSet::new();
        let mut batch_size: usize = 1;

        loop {
            // Fill free slots while fetches keep producing tasks. A miss
            // or an error ends the round and resets the batch size; a full
            // batch doubles it, capped at the concurrency limit.
            while running.len() < max_concurrent {
                let want = batch_size.min(max_concurrent - running.len());
                let fetches = futures::future::join_all((0..want).map(|_| {
                    let bucket = Arc::clone(&self);
                    let db = Arc::clone(&db);
                    async move {
                        run_transaction(db.as_ref(), |tr| {
                            let bucket = Arc::clone(&bucket);
                            Box::pin(async move { bucket.get_one(tr).await })
                        })
                        .await
                    }
                }))
                .await;

                let mut full_batch = true;
                for fetched in fetches {
                    match fetched {
                        Ok(Some(task)) => {
                            let bucket = Arc::clone(&self);
                            let db = Arc::clone(&db);
                            let futures = Arc::clone(&futures);
                            running
                                .spawn(async move { bucket.do_task(&db, &futures, Some(task)).await });
                        }
                        Ok(None) => full_batch = false,
                        Err(error) => {
                            tracing::debug!(error = %error, "task fetch failed");
                            full_batch = false;
                        }
                    }
                }

                if !full_batch {
                    batch_size = 1;
                    break;
                }
                batch_size = (batch_size * 2).min(max_concurrent);
            }

            // Wait for a slot to complete; if slots are free, also wake on
            // the jittered poll delay to rescan for work.
            let jittered = Duration::from_secs_f64(
                poll_delay * (0.9 + rand::rng().random::<f64>() / 5.0),
            );
            if running.is_empty() {
                tokio::time::sleep(jittered).await;
            } else if running.len() < max_concurrent {
                tokio::select! {
                    joined = running.join_next() => log_completion(joined),
                    _ = tokio::time::sleep(jittered) => {}
                }
            } else {
                log_completion(running.join_next().await);
            }
            while let Some(joined) = running.try_join_next() {
                log_completion(Some(joined));
            }
        }
    }
}

fn log_completion(result: Option<Result<Result<bool, Error>, tokio::task::JoinError>>) {
    match result {
        Some(Ok(Err(error))) => tracing::warn!(error = %error, "task execution failed"),
        Some(Err(join_error)) => tracing::warn!(error = %join_error, "task panicked"),
        _ => {}
    }
}
