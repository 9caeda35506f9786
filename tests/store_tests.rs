use std::sync::Arc;
use std::time::Duration;

use hopper::keys::KeyRange;
use hopper::store::{decode_counter, KeySelector, StoreError};
use hopper::{run_transaction, Database, MemoryDb};

fn range(begin: &[u8], end: &[u8]) -> KeyRange {
    KeyRange {
        begin: begin.to_vec(),
        end: end.to_vec(),
    }
}

#[tokio::test]
async fn committed_writes_are_visible_to_later_transactions() {
    let db = MemoryDb::new();

    let mut tr = db.transaction();
    tr.set(b"k1", b"v1");
    tr.set(b"k2", b"v2");
    tr.commit().await.unwrap();

    let tr = db.transaction();
    assert_eq!(tr.get(b"k1").await.unwrap().as_deref(), Some(&b"v1"[..]));
    assert_eq!(tr.get(b"missing").await.unwrap(), None);
}

#[tokio::test]
async fn transactions_read_their_own_writes() {
    let db = MemoryDb::new();
    let mut tr = db.transaction();
    tr.set(b"a/1", b"one");
    tr.set(b"a/2", b"two");
    assert_eq!(tr.get(b"a/1").await.unwrap().as_deref(), Some(&b"one"[..]));

    tr.clear_range(&range(b"a/", b"a0"));
    assert_eq!(tr.get(b"a/1").await.unwrap(), None);

    tr.set(b"a/3", b"three");
    let rows = tr.get_range(&range(b"a/", b"a0"), 10).await.unwrap();
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(&rows.rows[0].key[..], b"a/3");

    tr.commit().await.unwrap();
    let tr = db.transaction();
    assert_eq!(tr.get(b"a/1").await.unwrap(), None);
    assert_eq!(
        tr.get(b"a/3").await.unwrap().as_deref(),
        Some(&b"three"[..])
    );
}

#[tokio::test]
async fn conflicting_commit_fails_and_retries_cleanly() {
    let db = MemoryDb::new();
    let mut tr = db.transaction();
    tr.set(b"k", b"0");
    tr.commit().await.unwrap();

    // Reader snapshots k, then a writer commits a newer value.
    let mut reader = db.transaction();
    let _ = reader.get(b"k").await.unwrap();

    let mut writer = db.transaction();
    writer.set(b"k", b"1");
    writer.commit().await.unwrap();

    reader.set(b"other", b"x");
    let err = reader.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict));

    // on_error resets the transaction; the rerun commits.
    reader.on_error(err).await.unwrap();
    let _ = reader.get(b"k").await.unwrap();
    reader.set(b"other", b"x");
    reader.commit().await.unwrap();
}

#[tokio::test]
async fn blind_writes_do_not_conflict() {
    let db = MemoryDb::new();
    let mut a = db.transaction();
    let mut b = db.transaction();
    a.set(b"k", b"a");
    b.set(b"k", b"b");
    a.commit().await.unwrap();
    // No reads were made, so the later writer wins without conflict.
    b.commit().await.unwrap();

    let tr = db.transaction();
    assert_eq!(tr.get(b"k").await.unwrap().as_deref(), Some(&b"b"[..]));
}

#[tokio::test]
async fn atomic_adds_compose_without_conflicts() {
    let db = MemoryDb::new();

    let mut a = db.transaction();
    let mut b = db.transaction();
    // Both transactions read something else to acquire a snapshot.
    let _ = a.get(b"unrelated").await.unwrap();
    let _ = b.get(b"unrelated2").await.unwrap();
    a.atomic_add(b"counter", 5);
    b.atomic_add(b"counter", -2);
    a.commit().await.unwrap();
    b.commit().await.unwrap();

    let tr = db.transaction();
    let value = tr.get(b"counter").await.unwrap().unwrap();
    assert_eq!(decode_counter(&value), 3);
}

#[tokio::test]
async fn get_key_resolves_last_less_or_equal() {
    let db = MemoryDb::new();
    let mut tr = db.transaction();
    tr.set(b"b", b"1");
    tr.set(b"d", b"2");
    tr.commit().await.unwrap();

    let tr = db.transaction();
    let exact = tr
        .get_key(KeySelector::last_less_or_equal(&b"b"[..]))
        .await
        .unwrap();
    assert_eq!(exact, b"b".to_vec());

    let between = tr
        .get_key(KeySelector::last_less_or_equal(&b"c"[..]))
        .await
        .unwrap();
    assert_eq!(between, b"b".to_vec());

    let before_everything = tr
        .get_key(KeySelector::last_less_or_equal(&b"a"[..]))
        .await
        .unwrap();
    assert!(before_everything.is_empty());
}

#[tokio::test]
async fn get_range_reports_truncation() {
    let db = MemoryDb::new();
    let mut tr = db.transaction();
    for i in 0..5u8 {
        tr.set(&[b'r', b'/', b'0' + i], b"v");
    }
    tr.commit().await.unwrap();

    let tr = db.transaction();
    let result = tr.get_range(&range(b"r/", b"r0"), 3).await.unwrap();
    assert_eq!(result.rows.len(), 3);
    assert!(result.more);

    let result = tr.get_range(&range(b"r/", b"r0"), 10).await.unwrap();
    assert_eq!(result.rows.len(), 5);
    assert!(!result.more);
}

#[tokio::test(start_paused = true)]
async fn read_versions_advance_with_time() {
    let db = MemoryDb::new();
    let tr = db.transaction();
    let v1 = tr.read_version().await.unwrap();

    tokio::time::advance(Duration::from_secs(1)).await;
    let tr = db.transaction();
    let v2 = tr.read_version().await.unwrap();
    assert!(
        v2 - v1 >= 900_000,
        "expected ~1M versions per second, got {}",
        v2 - v1
    );
}

#[tokio::test]
async fn watch_fires_on_next_mutation() {
    let db = MemoryDb::new();
    let mut tr = db.transaction();
    let watch = tr.watch(b"watched");
    tr.commit().await.unwrap();

    let waiter = tokio::spawn(async move { watch.wait().await });

    let mut tr = db.transaction();
    tr.set(b"watched", b"new");
    tr.commit().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("watch timed out")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn run_transaction_commits_and_propagates_domain_errors() {
    let db: Arc<dyn Database> = Arc::new(MemoryDb::new());

    let value = run_transaction(db.as_ref(), |tr| {
        Box::pin(async move {
            tr.set(b"k", b"v");
            Ok(42u32)
        })
    })
    .await
    .unwrap();
    assert_eq!(value, 42);

    let tr = db.transaction();
    assert_eq!(tr.get(b"k").await.unwrap().as_deref(), Some(&b"v"[..]));

    let err = run_transaction(db.as_ref(), |tr| {
        Box::pin(async move {
            let _ = tr.get(b"k").await?;
            Err::<(), _>(hopper::Error::InvalidValidation)
        })
    })
    .await
    .unwrap_err();
    assert!(matches!(err, hopper::Error::InvalidValidation));
}
