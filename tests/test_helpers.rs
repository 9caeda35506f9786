use std::sync::Arc;

use hopper::keys::{KeyRange, Subspace, AVAILABLE_PRIORITIZED_KEY, TIMEOUTS_KEY};
use hopper::tuple::Element;
use hopper::{BucketOptions, Database, FutureBucket, MemoryDb, TaskBucket, TaskRegistry};

// Helper: enforce a timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub const BUCKET_PREFIX: &[u8] = b"tb";
pub const FUTURE_PREFIX: &[u8] = b"fb";

pub fn open_env() -> (Arc<dyn Database>, Arc<TaskBucket>, Arc<FutureBucket>) {
    open_env_with(TaskRegistry::new(), BucketOptions::default())
}

/// Log to stdout during tests. Respect RUST_LOG if set, else default to info.
fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .try_init();
}

pub fn open_env_with(
    registry: TaskRegistry,
    options: BucketOptions,
) -> (Arc<dyn Database>, Arc<TaskBucket>, Arc<FutureBucket>) {
    init_tracing();
    let db: Arc<dyn Database> = Arc::new(MemoryDb::new());
    let bucket = Arc::new(TaskBucket::new(
        Subspace::new(BUCKET_PREFIX),
        Arc::new(registry),
        options,
    ));
    let futures = Arc::new(FutureBucket::new(Subspace::new(FUTURE_PREFIX), false, false));
    (db, bucket, futures)
}

/// Options with a lease short enough to expire under a paused test clock.
pub fn short_lease_options(seconds: i64) -> BucketOptions {
    BucketOptions {
        timeout: seconds * hopper::tunables::VERSIONS_PER_SECOND,
        ..BucketOptions::default()
    }
}

pub fn available_range() -> KeyRange {
    Subspace::new(BUCKET_PREFIX)
        .subspace(&[Element::bytes(AVAILABLE_PRIORITIZED_KEY)])
        .range()
}

pub fn timeouts_range() -> KeyRange {
    Subspace::new(BUCKET_PREFIX)
        .subspace(&[Element::bytes(TIMEOUTS_KEY)])
        .range()
}

pub async fn count_range(db: &Arc<dyn Database>, range: &KeyRange) -> usize {
    let tr = db.transaction();
    tr.get_range(range, 1_000_000).await.unwrap().rows.len()
}

pub async fn task_count(db: &Arc<dyn Database>, bucket: &TaskBucket) -> i64 {
    let tr = db.transaction();
    bucket.get_task_count(tr.as_ref()).await.unwrap()
}

/// Write a bare key-value pair outside any bucket subspace.
pub async fn put_raw(db: &Arc<dyn Database>, key: &[u8], value: &[u8]) {
    let mut tr = db.transaction();
    tr.set(key, value);
    tr.commit().await.unwrap();
}
