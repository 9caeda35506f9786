//! The task value: an ordered parameter map plus claim-time lease state.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::tunables;

/// Reserved parameter names carrying scheduler metadata.
pub mod reserved {
    /// Handler name used for registry lookup.
    pub const TYPE: &[u8] = b"type";
    /// Unsigned 32-bit handler version stamp.
    pub const VERSION: &[u8] = b"version";
    /// Priority band, clamped to the configured maximum.
    pub const PRIORITY: &[u8] = b"priority";
    /// Optional sentinel marking completion-only rows.
    pub const DONE: &[u8] = b"done";
    /// Future uid referenced by an unblock task.
    pub const FUTURE: &[u8] = b"future";
    /// Block id an unblock task releases.
    pub const BLOCK_ID: &[u8] = b"blockid";
    /// Original handler name saved by the add-task indirection.
    pub const ADD_TASK: &[u8] = b"_add_task";
    /// Validation predicate: the task is valid only while the store's
    /// value at `_validkey` equals `_validvalue`.
    pub const VALID_KEY: &[u8] = b"_validkey";
    pub const VALID_VALUE: &[u8] = b"_validvalue";
}

/// A unit of work: opaque parameter bytes keyed by opaque names. The
/// `key` (uid) and `timeout` (lease version) are attached out-of-band
/// when the task is claimed; they are not parameters.
#[derive(Debug, Clone, Default)]
pub struct Task {
    /// Uid of the task in the store; empty until claimed or enqueued.
    pub key: Vec<u8>,
    /// Lease version; the task may run until the store clock passes it.
    pub timeout: i64,
    params: BTreeMap<Vec<u8>, Bytes>,
}

impl Task {
    /// A new task with an empty parameter map. Defaults (priority 0,
    /// version 0) are not materialized as parameters.
    pub fn new(task_type: &[u8]) -> Self {
        let mut task = Task::default();
        if !task_type.is_empty() {
            task.set_param(reserved::TYPE, task_type.to_vec());
        }
        task
    }

    pub fn set_param(&mut self, name: &[u8], value: impl Into<Bytes>) {
        self.params.insert(name.to_vec(), value.into());
    }

    pub fn param(&self, name: &[u8]) -> Option<&Bytes> {
        self.params.get(name)
    }

    pub fn remove_param(&mut self, name: &[u8]) -> Option<Bytes> {
        self.params.remove(name)
    }

    pub fn has_param(&self, name: &[u8]) -> bool {
        self.params.contains_key(name)
    }

    pub fn params(&self) -> impl Iterator<Item = (&[u8], &Bytes)> {
        self.params.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn clear_params(&mut self) {
        self.params.clear();
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Handler name, if present. A task without a type cannot be run.
    pub fn task_type(&self) -> Option<&Bytes> {
        self.param(reserved::TYPE)
    }

    /// Handler version stamp; zero when absent.
    pub fn version(&self) -> u32 {
        match self.param(reserved::VERSION) {
            Some(v) if v.len() >= 4 => {
                let arr: [u8; 4] = v[..4].try_into().unwrap_or([0; 4]);
                u32::from_le_bytes(arr)
            }
            Some(_) => {
                tracing::warn!("task version parameter is malformed");
                0
            }
            None => 0,
        }
    }

    pub fn set_version(&mut self, version: u32) {
        if version > 0 {
            self.set_param(reserved::VERSION, version.to_le_bytes().to_vec());
        }
    }

    /// Priority band, clamped to the configured maximum; zero when absent.
    pub fn priority(&self) -> i64 {
        match self.param(reserved::PRIORITY) {
            Some(v) if v.len() >= 8 => {
                let arr: [u8; 8] = v[..8].try_into().unwrap_or([0; 8]);
                i64::from_le_bytes(arr).clamp(0, tunables::MAX_PRIORITY)
            }
            _ => 0,
        }
    }

    pub fn set_priority(&mut self, priority: i64) {
        let priority = priority.clamp(0, tunables::MAX_PRIORITY);
        if priority != 0 {
            self.set_param(reserved::PRIORITY, priority.to_le_bytes().to_vec());
        }
    }

    /// Whether the task carries a validation predicate.
    pub fn has_validation(&self) -> bool {
        self.has_param(reserved::VALID_KEY)
    }
}
