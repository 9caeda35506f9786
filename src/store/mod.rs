//! The ordered transactional key-value store the queue runs against.
//!
//! The store itself is an external collaborator; this module pins down the
//! capabilities the scheduler needs as object-safe traits, plus the retry
//! helper every transactional step goes through. An embedded in-memory
//! implementation lives in [`memory`].

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::keys::KeyRange;
use crate::tunables;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// Snapshot conflict detected at commit; the transaction did not apply.
    #[error("transaction conflict, not committed")]
    Conflict,
    /// The transaction was already committed and must be reset before reuse.
    #[error("transaction used after commit")]
    UsedAfterCommit,
    /// `on_error` gave up after the configured number of retries.
    #[error("transaction retry limit exceeded")]
    RetryLimitExceeded,
    /// A watch's transaction was reset or dropped before committing.
    #[error("watch abandoned before commit")]
    WatchLost,
}

impl StoreError {
    /// Whether `on_error` may back off and retry the transaction closure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }
}

/// Resolves a key relative to the committed+uncommitted view of the store.
#[derive(Debug, Clone)]
pub enum KeySelector {
    LastLessOrEqual(Vec<u8>),
    LastLessThan(Vec<u8>),
    FirstGreaterOrEqual(Vec<u8>),
    FirstGreaterThan(Vec<u8>),
}

impl KeySelector {
    pub fn last_less_or_equal(key: impl Into<Vec<u8>>) -> Self {
        KeySelector::LastLessOrEqual(key.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

/// Rows from a range read, plus whether the range has more rows past the
/// limit.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    pub rows: Vec<KeyValue>,
    pub more: bool,
}

/// Transaction options the bucket applies per its flags. The embedded
/// store accepts and records them; a networked store would map them to
/// its own knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOption {
    PriorityBatch,
    AccessSystemKeys,
    LockAware,
}

/// A watch armed when its transaction commits; fires on the next committed
/// mutation of the watched key.
#[derive(Debug)]
pub struct Watch {
    pub(crate) rx: oneshot::Receiver<()>,
}

impl Watch {
    /// Wait for the watched key to change. Returns an error if the watch
    /// was abandoned (its transaction reset without committing, or the
    /// store dropped).
    pub async fn wait(self) -> Result<(), StoreError> {
        self.rx.await.map_err(|_| StoreError::WatchLost)
    }
}

/// One transaction against the store: snapshot reads, buffered writes,
/// optimistic commit. Reads observe the transaction's own writes.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Resolve a key selector. Returns an empty key when the selector
    /// falls before the first key in the store.
    async fn get_key(&self, selector: KeySelector) -> Result<Vec<u8>, StoreError>;

    /// Read up to `limit` rows of `[begin, end)` in ascending key order.
    async fn get_range(
        &self,
        range: &KeyRange,
        limit: usize,
    ) -> Result<RangeResult, StoreError>;

    /// The transaction's snapshot version, also the logical clock used for
    /// lease arithmetic.
    async fn read_version(&self) -> Result<i64, StoreError>;

    fn set(&self, key: &[u8], value: &[u8]);

    fn clear(&self, key: &[u8]);

    fn clear_range(&self, range: &KeyRange);

    /// Atomically add `delta` to the 64-bit little-endian counter at `key`.
    /// Does not create a read conflict, so concurrent adds never collide.
    fn atomic_add(&self, key: &[u8], delta: i64);

    fn watch(&self, key: &[u8]) -> Watch;

    fn set_option(&self, option: TransactionOption);

    /// Commit buffered writes; fails with a retryable error on conflict.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Arbitrate a failed attempt: back off and reset for retryable
    /// errors, propagate everything else.
    async fn on_error(&mut self, error: StoreError) -> Result<(), StoreError>;
}

/// Handle to a store that can open transactions.
pub trait Database: Send + Sync {
    fn transaction(&self) -> Box<dyn Transaction>;
}

/// Encode a counter value the way `atomic_add` expects it.
pub fn encode_counter(value: i64) -> [u8; 8] {
    value.to_le_bytes()
}

/// Decode a counter value; short or absent bytes read as zero.
pub fn decode_counter(bytes: &[u8]) -> i64 {
    if bytes.len() >= 8 {
        let arr: [u8; 8] = bytes[..8].try_into().unwrap_or([0; 8]);
        i64::from_le_bytes(arr)
    } else {
        0
    }
}

/// Run `body` in a fresh transaction until it commits.
///
/// The closure must be idempotent: it is re-invoked from scratch after any
/// retryable failure, with the transaction reset in between. Non-retryable
/// errors and domain errors propagate immediately.
pub async fn run_transaction<T, F>(db: &dyn Database, mut body: F) -> Result<T, Error>
where
    F: for<'t> FnMut(&'t dyn Transaction) -> BoxFuture<'t, Result<T, Error>>,
{
    let mut tr = db.transaction();
    loop {
        match body(tr.as_ref()).await {
            Ok(value) => match tr.commit().await {
                Ok(()) => return Ok(value),
                Err(e) => tr.on_error(e).await?,
            },
            Err(Error::Store(e)) => tr.on_error(e).await?,
            Err(other) => return Err(other),
        }
    }
}

/// Backoff for the `attempt`-th retry, capped.
pub(crate) fn retry_backoff(attempt: u32) -> std::time::Duration {
    let ms = tunables::RETRY_BACKOFF_INITIAL_MS
        .saturating_mul(1u64 << attempt.min(32))
        .min(tunables::RETRY_BACKOFF_MAX_MS);
    std::time::Duration::from_millis(ms)
}
