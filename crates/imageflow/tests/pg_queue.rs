// tests/pg_queue.rs
mod common;

use common::setup_db;
use serial_test::serial;
use sqlx::PgPool;
use std::time::Duration;

use imageflow::jobs::JobId;
use imageflow::queue::{PgWorkQueue, QueueError, QueueSettings, WorkQueue};

fn queue(pool: &PgPool, lease: Duration) -> PgWorkQueue {
    PgWorkQueue::new(
        pool.clone(),
        QueueSettings {
            queue: "test_queue".into(),
            lease,
            poll_interval: Duration::from_millis(20),
            reap_interval: Duration::from_millis(0),
        },
    )
}

#[tokio::test]
#[serial]
async fn two_consumers_never_claim_the_same_message() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let q = queue(&pool, Duration::from_secs(30));
    q.publish(JobId(1)).await.unwrap();

    let (a, b) = tokio::join!(q.lease_one("worker-a"), q.lease_one("worker-b"));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.is_some() ^ b.is_some(), "exactly one consumer should lease");
    let delivery = a.or(b).unwrap();
    assert_eq!(delivery.payload, "1");
    assert_eq!(delivery.delivery_count, 1);

    let depth = q.depth().await.unwrap();
    assert_eq!((depth.ready, depth.in_flight), (0, 1));
}

#[tokio::test]
#[serial]
async fn messages_are_delivered_in_publish_order() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let q = queue(&pool, Duration::from_secs(30));
    for id in 1..=3 {
        q.publish(JobId(id)).await.unwrap();
    }

    for expected in ["1", "2", "3"] {
        let d = q.consume("worker-a").await.unwrap();
        assert_eq!(d.payload, expected);
        q.ack(&d.handle).await.unwrap();
    }
    assert_eq!(q.depth().await.unwrap().ready, 0);
}

#[tokio::test]
#[serial]
async fn expired_lease_is_redelivered_and_old_handle_loses_ack() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let q = queue(&pool, Duration::from_millis(300));
    q.publish_payload("7").await.unwrap();

    let first = q.lease_one("crashed").await.unwrap().expect("leased");
    assert!(q.lease_one("other").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(q.reap_expired_leases().await.unwrap(), 1);

    let second = q.lease_one("other").await.unwrap().expect("redelivered");
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.delivery_count, 2);
    assert!(second.is_redelivery());

    let err = q.ack(&first.handle).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost { message_id } if message_id == first.message_id));

    q.ack(&second.handle).await.unwrap();
    let depth = q.depth().await.unwrap();
    assert_eq!((depth.ready, depth.in_flight), (0, 0));
}

#[tokio::test]
#[serial]
async fn consume_waits_for_a_publish() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let q = std::sync::Arc::new(queue(&pool, Duration::from_secs(30)));

    let consumer = {
        let q = q.clone();
        tokio::spawn(async move { q.consume("worker-a").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    q.publish(JobId(11)).await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consume did not return")
        .unwrap()
        .unwrap();
    assert_eq!(delivery.payload, "11");
}

#[tokio::test]
#[serial]
async fn queues_are_isolated_by_name() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let q = queue(&pool, Duration::from_secs(30));
    let other = PgWorkQueue::new(
        pool.clone(),
        QueueSettings {
            queue: "other_queue".into(),
            ..QueueSettings::default()
        },
    );

    other.publish(JobId(5)).await.unwrap();
    assert!(q.lease_one("worker-a").await.unwrap().is_none());
    assert_eq!(other.depth().await.unwrap().ready, 1);
}
