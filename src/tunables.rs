//! Process-wide scheduler constants.
//!
//! These are fixed at compile time and shared by every bucket in the
//! process. Per-bucket deviations (notably the lease length) go through
//! [`crate::bucket::BucketOptions`] instead.

/// Logical store versions per wall-clock second. Used to convert a lease
/// version distance into a local timer duration.
pub const VERSIONS_PER_SECOND: i64 = 1_000_000;

/// Highest priority band, inclusive. Task priorities are clamped to this.
pub const MAX_PRIORITY: i64 = 5;

/// Base lease length in versions granted to a claimed task.
pub const TIMEOUT_VERSIONS: i64 = 60 * VERSIONS_PER_SECOND;

/// Lease jitter: the claim-time lease is `TIMEOUT_VERSIONS` scaled by a
/// multiplier drawn uniformly from `[JITTER_OFFSET, JITTER_OFFSET + JITTER_RANGE]`.
/// Extension via `save_and_extend` applies no jitter.
pub const TIMEOUT_JITTER_OFFSET: f64 = 0.9;
pub const TIMEOUT_JITTER_RANGE: f64 = 0.2;

/// Probability that a dequeue attempt first sweeps timed-out leases, so
/// stale tasks get a chance against a flood of fresh enqueues.
pub const CHECK_TIMEOUT_CHANCE: f64 = 0.02;

/// Liveness probe: number of polls and the delay between them.
pub const CHECK_ACTIVE_AMOUNT: usize = 10;
pub const CHECK_ACTIVE_DELAY_SECS: f64 = 0.5;

/// Maximum rows consumed by one timed-out-lease sweep. Keep this generous
/// relative to the largest per-task parameter count so a sweep rarely cuts
/// inside a task's row group.
pub const MAX_TASK_KEYS: usize = 1000;

/// Row limit meaning "read everything" for ranges known to be small.
pub const TOO_MANY: usize = 1_000_000;

/// Transaction retry ceiling and backoff bounds for the retry helper.
pub const TRANSACTION_RETRY_LIMIT: u32 = 100;
pub const RETRY_BACKOFF_INITIAL_MS: u64 = 2;
pub const RETRY_BACKOFF_MAX_MS: u64 = 1000;
