//! Embedded in-memory store with optimistic snapshot transactions.
//!
//! This is the store the test suite (and simple embeddings) run against.
//! Transactions buffer writes locally, observe their own writes, and
//! validate their read set at commit: if any key or range read has been
//! mutated by a commit newer than the transaction's snapshot version, the
//! commit fails with a retryable conflict and nothing is applied.
//!
//! The version clock advances with the tokio clock at a fixed
//! `versions_per_second` rate, so paused-clock tests can drive lease
//! expiry by advancing time.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use super::{
    decode_counter, encode_counter, retry_backoff, Database, KeySelector, KeyValue, RangeResult,
    StoreError, Transaction, TransactionOption, Watch,
};
use crate::keys::KeyRange;
use crate::tunables;

/// An ordered in-memory key-value store.
pub struct MemoryDb {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    versions_per_second: f64,
    epoch: tokio::time::Instant,
}

#[derive(Default)]
struct State {
    data: BTreeMap<Vec<u8>, Bytes>,
    /// Last commit version that mutated each key, for conflict checks.
    mutations: BTreeMap<Vec<u8>, i64>,
    last_commit_version: i64,
    watches: HashMap<Vec<u8>, Vec<oneshot::Sender<()>>>,
}

impl MemoryDb {
    /// Open a store whose clock advances at the standard rate. Must be
    /// called within a tokio runtime.
    pub fn new() -> Self {
        Self::with_versions_per_second(tunables::VERSIONS_PER_SECOND as f64)
    }

    pub fn with_versions_per_second(versions_per_second: f64) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                versions_per_second,
                epoch: tokio::time::Instant::now(),
            }),
        }
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    /// Current logical version: wall-clock driven, never behind the last
    /// commit so snapshots always observe prior commits.
    fn clock_version(&self, state: &State) -> i64 {
        let elapsed = self.epoch.elapsed().as_secs_f64();
        let v = (elapsed * self.versions_per_second) as i64;
        v.max(state.last_commit_version)
    }
}

impl Database for MemoryDb {
    fn transaction(&self) -> Box<dyn Transaction> {
        Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            tx: Mutex::new(TxState::default()),
        })
    }
}

enum ReadRecord {
    Key(Vec<u8>),
    /// `[begin, end)`; `None` end means unbounded.
    Range(Vec<u8>, Option<Vec<u8>>),
}

enum Mutation {
    Set(Vec<u8>, Bytes),
    Clear(Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
    Add(Vec<u8>, i64),
}

#[derive(Default)]
struct TxState {
    read_version: Option<i64>,
    reads: Vec<ReadRecord>,
    ops: Vec<Mutation>,
    watches: Vec<(Vec<u8>, oneshot::Sender<()>)>,
    committed: bool,
    retries: u32,
    options: Vec<TransactionOption>,
}

pub struct MemoryTransaction {
    shared: Arc<Shared>,
    tx: Mutex<TxState>,
}

/// The smallest key strictly greater than `key`.
fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0x00);
    next
}

fn bounds<'a>(begin: &'a [u8], end: Option<&'a [u8]>) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
    let upper = match end {
        Some(e) => Bound::Excluded(e),
        None => Bound::Unbounded,
    };
    (Bound::Included(begin), upper)
}

/// Fold buffered mutations into a per-key overlay over the committed data.
/// `Some(v)` overrides with `v`; `None` hides the committed value.
fn overlay(ops: &[Mutation], data: &BTreeMap<Vec<u8>, Bytes>) -> BTreeMap<Vec<u8>, Option<Bytes>> {
    let mut map: BTreeMap<Vec<u8>, Option<Bytes>> = BTreeMap::new();
    for op in ops {
        match op {
            Mutation::Set(k, v) => {
                map.insert(k.clone(), Some(v.clone()));
            }
            Mutation::Clear(k) => {
                map.insert(k.clone(), None);
            }
            Mutation::ClearRange(b, e) => {
                let doomed: Vec<Vec<u8>> = map
                    .range::<[u8], _>(bounds(b, Some(e.as_slice())))
                    .map(|(k, _)| k.clone())
                    .chain(
                        data.range::<[u8], _>(bounds(b, Some(e.as_slice())))
                            .map(|(k, _)| k.clone()),
                    )
                    .collect();
                for k in doomed {
                    map.insert(k, None);
                }
            }
            Mutation::Add(k, delta) => {
                let current = match map.get(k) {
                    Some(Some(v)) => decode_counter(v),
                    Some(None) => 0,
                    None => data.get(k).map(|v| decode_counter(v)).unwrap_or(0),
                };
                let value = Bytes::copy_from_slice(&encode_counter(current.wrapping_add(*delta)));
                map.insert(k.clone(), Some(value));
            }
        }
    }
    map
}

/// Committed data merged with the transaction's own writes, over a range.
fn merged_range(
    ops: &[Mutation],
    data: &BTreeMap<Vec<u8>, Bytes>,
    begin: &[u8],
    end: Option<&[u8]>,
) -> BTreeMap<Vec<u8>, Bytes> {
    let over = overlay(ops, data);
    let mut merged: BTreeMap<Vec<u8>, Bytes> = data
        .range::<[u8], _>(bounds(begin, end))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, slot) in over.range::<[u8], _>(bounds(begin, end)) {
        match slot {
            Some(v) => {
                merged.insert(k.clone(), v.clone());
            }
            None => {
                merged.remove(k);
            }
        }
    }
    merged
}

impl MemoryTransaction {
    fn ensure_read_version(&self, state: &State, tx: &mut TxState) -> i64 {
        *tx.read_version
            .get_or_insert_with(|| self.shared.clock_version(state))
    }
}

#[async_trait::async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let state = self.shared.state.lock().unwrap();
        let mut tx = self.tx.lock().unwrap();
        if tx.committed {
            return Err(StoreError::UsedAfterCommit);
        }
        self.ensure_read_version(&state, &mut tx);
        tx.reads.push(ReadRecord::Key(key.to_vec()));
        let over = overlay(&tx.ops, &state.data);
        Ok(match over.get(key) {
            Some(slot) => slot.clone(),
            None => state.data.get(key).cloned(),
        })
    }

    async fn get_key(&self, selector: KeySelector) -> Result<Vec<u8>, StoreError> {
        let state = self.shared.state.lock().unwrap();
        let mut tx = self.tx.lock().unwrap();
        if tx.committed {
            return Err(StoreError::UsedAfterCommit);
        }
        self.ensure_read_version(&state, &mut tx);

        let (resolved, conflict) = match &selector {
            KeySelector::LastLessOrEqual(k) => {
                let upper = key_successor(k);
                let merged = merged_range(&tx.ops, &state.data, &[], Some(upper.as_slice()));
                let found = merged.keys().next_back().cloned();
                let lower = found.clone().unwrap_or_default();
                (found, ReadRecord::Range(lower, Some(upper)))
            }
            KeySelector::LastLessThan(k) => {
                let merged = merged_range(&tx.ops, &state.data, &[], Some(k.as_slice()));
                let found = merged.keys().next_back().cloned();
                let lower = found.clone().unwrap_or_default();
                (found, ReadRecord::Range(lower, Some(k.clone())))
            }
            KeySelector::FirstGreaterOrEqual(k) => {
                let merged = merged_range(&tx.ops, &state.data, k, None);
                let found = merged.keys().next().cloned();
                let upper = found.as_deref().map(key_successor);
                (found, ReadRecord::Range(k.clone(), upper))
            }
            KeySelector::FirstGreaterThan(k) => {
                let lower = key_successor(k);
                let merged = merged_range(&tx.ops, &state.data, &lower, None);
                let found = merged.keys().next().cloned();
                let upper = found.as_deref().map(key_successor);
                (found, ReadRecord::Range(lower, upper))
            }
        };
        tx.reads.push(conflict);
        Ok(resolved.unwrap_or_default())
    }

    async fn get_range(&self, range: &KeyRange, limit: usize) -> Result<RangeResult, StoreError> {
        let state = self.shared.state.lock().unwrap();
        let mut tx = self.tx.lock().unwrap();
        if tx.committed {
            return Err(StoreError::UsedAfterCommit);
        }
        self.ensure_read_version(&state, &mut tx);

        let merged = merged_range(&tx.ops, &state.data, &range.begin, Some(range.end.as_slice()));
        let mut rows = Vec::new();
        let mut more = false;
        for (k, v) in merged.iter() {
            if rows.len() == limit {
                more = true;
                break;
            }
            rows.push(KeyValue {
                key: Bytes::copy_from_slice(k),
                value: v.clone(),
            });
        }
        // Conflict only on the portion actually observed.
        let read_end = if more {
            rows.last()
                .map(|kv| key_successor(&kv.key))
                .unwrap_or_else(|| range.end.clone())
        } else {
            range.end.clone()
        };
        tx.reads
            .push(ReadRecord::Range(range.begin.clone(), Some(read_end)));
        Ok(RangeResult { rows, more })
    }

    async fn read_version(&self) -> Result<i64, StoreError> {
        let state = self.shared.state.lock().unwrap();
        let mut tx = self.tx.lock().unwrap();
        if tx.committed {
            return Err(StoreError::UsedAfterCommit);
        }
        Ok(self.ensure_read_version(&state, &mut tx))
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        let mut tx = self.tx.lock().unwrap();
        tx.ops.push(Mutation::Set(
            key.to_vec(),
            Bytes::copy_from_slice(value),
        ));
    }

    fn clear(&self, key: &[u8]) {
        let mut tx = self.tx.lock().unwrap();
        tx.ops.push(Mutation::Clear(key.to_vec()));
    }

    fn clear_range(&self, range: &KeyRange) {
        let mut tx = self.tx.lock().unwrap();
        tx.ops
            .push(Mutation::ClearRange(range.begin.clone(), range.end.clone()));
    }

    fn atomic_add(&self, key: &[u8], delta: i64) {
        let mut tx = self.tx.lock().unwrap();
        tx.ops.push(Mutation::Add(key.to_vec(), delta));
    }

    fn watch(&self, key: &[u8]) -> Watch {
        let (sender, rx) = oneshot::channel();
        let mut tx = self.tx.lock().unwrap();
        tx.watches.push((key.to_vec(), sender));
        Watch { rx }
    }

    fn set_option(&self, option: TransactionOption) {
        let mut tx = self.tx.lock().unwrap();
        if !tx.options.contains(&option) {
            tx.options.push(option);
        }
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock().unwrap();
        let mut tx = self.tx.lock().unwrap();
        if tx.committed {
            return Err(StoreError::UsedAfterCommit);
        }

        // Validate the read set against commits newer than our snapshot.
        if let Some(read_version) = tx.read_version {
            for read in &tx.reads {
                let conflicted = match read {
                    ReadRecord::Key(k) => state
                        .mutations
                        .get(k)
                        .is_some_and(|&v| v > read_version),
                    ReadRecord::Range(b, e) => state
                        .mutations
                        .range::<[u8], _>(bounds(b, e.as_deref()))
                        .any(|(_, &v)| v > read_version),
                };
                if conflicted {
                    return Err(StoreError::Conflict);
                }
            }
        }

        // Apply mutations in order.
        let mut mutated: Vec<Vec<u8>> = Vec::new();
        let ops = std::mem::take(&mut tx.ops);
        for op in ops {
            match op {
                Mutation::Set(k, v) => {
                    state.data.insert(k.clone(), v);
                    mutated.push(k);
                }
                Mutation::Clear(k) => {
                    state.data.remove(&k);
                    mutated.push(k);
                }
                Mutation::ClearRange(b, e) => {
                    let doomed: Vec<Vec<u8>> = state
                        .data
                        .range::<[u8], _>(bounds(&b, Some(e.as_slice())))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        state.data.remove(&k);
                        mutated.push(k);
                    }
                }
                Mutation::Add(k, delta) => {
                    let current = state.data.get(&k).map(|v| decode_counter(v)).unwrap_or(0);
                    let value =
                        Bytes::copy_from_slice(&encode_counter(current.wrapping_add(delta)));
                    state.data.insert(k.clone(), value);
                    mutated.push(k);
                }
            }
        }

        let commit_version = self
            .shared
            .clock_version(&state)
            .max(state.last_commit_version + 1);
        state.last_commit_version = commit_version;
        for k in &mutated {
            state.mutations.insert(k.clone(), commit_version);
        }

        // Fire watches on mutated keys, then arm the ones this transaction
        // registered.
        for k in &mutated {
            if let Some(senders) = state.watches.remove(k) {
                for sender in senders {
                    let _ = sender.send(());
                }
            }
        }
        for (k, sender) in tx.watches.drain(..) {
            state.watches.entry(k).or_default().push(sender);
        }

        tx.committed = true;
        Ok(())
    }

    async fn on_error(&mut self, error: StoreError) -> Result<(), StoreError> {
        let retries = {
            let tx = self.tx.lock().unwrap();
            tx.retries
        };
        if !error.is_retryable() {
            return Err(error);
        }
        if retries >= tunables::TRANSACTION_RETRY_LIMIT {
            return Err(StoreError::RetryLimitExceeded);
        }
        tokio::time::sleep(retry_backoff(retries)).await;
        let mut tx = self.tx.lock().unwrap();
        let retries = tx.retries + 1;
        *tx = TxState {
            retries,
            ..TxState::default()
        };
        Ok(())
    }
}
