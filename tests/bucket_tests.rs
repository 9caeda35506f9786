mod test_helpers;

use hopper::task::reserved;
use hopper::{Error, Task};

use test_helpers::*;

#[tokio::test]
async fn enqueue_dequeue_round_trip() {
    with_timeout!(20000, {
        let (db, bucket, _futures) = open_env();

        let mut task = Task::new(b"X");
        task.set_priority(2);
        task.set_param(b"p", &b"v"[..]);

        let mut tr = db.transaction();
        let uid = bucket.add_task(tr.as_ref(), &task);
        tr.commit().await.unwrap();
        assert_eq!(uid.len(), 32);
        assert_eq!(task_count(&db, &bucket).await, 1);

        let mut tr = db.transaction();
        let claimed = bucket
            .get_one(tr.as_ref())
            .await
            .unwrap()
            .expect("task available");
        tr.commit().await.unwrap();

        assert_eq!(claimed.key, uid);
        assert_eq!(
            claimed.task_type().map(|t| t.as_ref()),
            Some(&b"X"[..])
        );
        assert_eq!(claimed.priority(), 2);
        assert_eq!(claimed.param(b"p").map(|v| v.as_ref()), Some(&b"v"[..]));
        assert!(claimed.timeout > 0);

        // Claiming moves rows but does not complete the task.
        assert_eq!(task_count(&db, &bucket).await, 1);
        assert_eq!(count_range(&db, &available_range()).await, 0);
        assert!(count_range(&db, &timeouts_range()).await > 0);
    });
}

#[tokio::test]
async fn higher_priority_claims_first() {
    with_timeout!(20000, {
        let (db, bucket, _futures) = open_env();

        let mut low = Task::new(b"low");
        low.set_priority(0);
        let mut high = Task::new(b"high");
        high.set_priority(3);

        let mut tr = db.transaction();
        bucket.add_task(tr.as_ref(), &low);
        bucket.add_task(tr.as_ref(), &high);
        tr.commit().await.unwrap();

        let mut tr = db.transaction();
        let first = bucket.get_one(tr.as_ref()).await.unwrap().expect("first");
        tr.commit().await.unwrap();
        assert_eq!(first.task_type().map(|t| t.as_ref()), Some(&b"high"[..]));

        let mut tr = db.transaction();
        bucket.finish(tr.as_ref(), &first).await.unwrap();
        tr.commit().await.unwrap();

        let mut tr = db.transaction();
        let second = bucket.get_one(tr.as_ref()).await.unwrap().expect("second");
        tr.commit().await.unwrap();
        assert_eq!(second.task_type().map(|t| t.as_ref()), Some(&b"low"[..]));
        assert_eq!(task_count(&db, &bucket).await, 1);
    });
}

#[tokio::test]
async fn priority_is_clamped_to_the_maximum_band() {
    let mut task = Task::new(b"X");
    task.set_priority(99);
    assert_eq!(task.priority(), hopper::tunables::MAX_PRIORITY);

    with_timeout!(20000, {
        let (db, bucket, _futures) = open_env();
        let mut tr = db.transaction();
        bucket.add_task(tr.as_ref(), &task);
        tr.commit().await.unwrap();

        let mut tr = db.transaction();
        let claimed = bucket.get_one(tr.as_ref()).await.unwrap().expect("task");
        tr.commit().await.unwrap();
        assert_eq!(claimed.priority(), hopper::tunables::MAX_PRIORITY);
    });
}

#[tokio::test]
async fn empty_bucket_hands_out_nothing() {
    with_timeout!(20000, {
        let (db, bucket, _futures) = open_env();
        let mut tr = db.transaction();
        assert!(bucket.get_one(tr.as_ref()).await.unwrap().is_none());
        tr.commit().await.unwrap();
        assert_eq!(task_count(&db, &bucket).await, 0);
    });
}

#[tokio::test]
async fn busy_empty_and_clear_track_bucket_state() {
    with_timeout!(20000, {
        let (db, bucket, _futures) = open_env();

        let tr = db.transaction();
        assert!(!bucket.is_busy(tr.as_ref()).await.unwrap());
        assert!(bucket.is_empty(tr.as_ref()).await.unwrap());

        let mut tr = db.transaction();
        bucket.add_task(tr.as_ref(), &Task::new(b"X"));
        tr.commit().await.unwrap();

        let tr = db.transaction();
        assert!(bucket.is_busy(tr.as_ref()).await.unwrap());
        assert!(!bucket.is_empty(tr.as_ref()).await.unwrap());

        let mut tr = db.transaction();
        let claimed = bucket.get_one(tr.as_ref()).await.unwrap().expect("task");
        tr.commit().await.unwrap();

        // Claimed: not busy (nothing available) but not empty (lease outstanding).
        let tr = db.transaction();
        assert!(!bucket.is_busy(tr.as_ref()).await.unwrap());
        assert!(!bucket.is_empty(tr.as_ref()).await.unwrap());
        drop(claimed);

        let mut tr = db.transaction();
        bucket.clear(tr.as_ref());
        tr.commit().await.unwrap();

        let tr = db.transaction();
        assert!(bucket.is_empty(tr.as_ref()).await.unwrap());
        assert_eq!(task_count(&db, &bucket).await, 0);
    });
}

#[tokio::test]
async fn watch_task_count_fires_on_enqueue() {
    with_timeout!(20000, {
        let (db, bucket, _futures) = open_env();

        let mut tr = db.transaction();
        let watch = bucket.watch_task_count(tr.as_ref());
        tr.commit().await.unwrap();

        let waiter = tokio::spawn(async move { watch.wait().await });

        let mut tr = db.transaction();
        bucket.add_task(tr.as_ref(), &Task::new(b"X"));
        tr.commit().await.unwrap();

        waiter.await.unwrap().unwrap();
    });
}

#[tokio::test]
async fn validated_enqueue_requires_a_live_key() {
    with_timeout!(20000, {
        let (db, bucket, _futures) = open_env();

        // Absent validation key: the task would be born invalid.
        let tr = db.transaction();
        let mut task = Task::new(b"X");
        let err = bucket
            .add_task_with_validation(tr.as_ref(), &mut task, b"cfg/lock", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidValidation));
        drop(tr);

        put_raw(&db, b"cfg/lock", b"gen-1").await;

        let mut tr = db.transaction();
        let mut task = Task::new(b"X");
        bucket
            .add_task_with_validation(tr.as_ref(), &mut task, b"cfg/lock", None)
            .await
            .unwrap();
        tr.commit().await.unwrap();

        assert_eq!(
            task.param(reserved::VALID_KEY).map(|v| v.as_ref()),
            Some(&b"cfg/lock"[..])
        );
        assert_eq!(
            task.param(reserved::VALID_VALUE).map(|v| v.as_ref()),
            Some(&b"gen-1"[..])
        );

        let mut tr = db.transaction();
        let claimed = bucket.get_one(tr.as_ref()).await.unwrap().expect("task");
        tr.commit().await.unwrap();

        let tr = db.transaction();
        assert!(bucket.is_verified(tr.as_ref(), &claimed).await.unwrap());
    });
}
