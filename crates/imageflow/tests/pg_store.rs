// tests/pg_store.rs
mod common;

use common::setup_db;
use serial_test::serial;

use imageflow::jobs::{JobId, JobStatus, JobStore, JobsRepo, NewJob};

#[tokio::test]
#[serial]
async fn create_then_get_returns_uploaded_job() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let repo = JobsRepo::new(pool);

    let id = repo
        .create(NewJob::for_upload("uploads/cat.jpg", "a@example.com"))
        .await
        .unwrap();
    let job = repo.get(id).await.unwrap().expect("job exists");

    assert_eq!(job.id, id);
    assert_eq!(job.filename, "cat.jpg");
    assert_eq!(job.file_path, "uploads/cat.jpg");
    assert_eq!(job.email, "a@example.com");
    assert_eq!(job.status, JobStatus::Uploaded);
    assert!(job.converted_path.is_none());

    assert!(repo.get(JobId(id.as_i64() + 1000)).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn converted_is_write_once_and_terminal() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let repo = JobsRepo::new(pool);
    let id = repo
        .create(NewJob::for_upload("uploads/cat.jpg", "a@example.com"))
        .await
        .unwrap();

    assert!(repo.set_converted(id, "converted_images/cat.png").await.unwrap());
    // same write again is a no-op
    assert!(repo.set_converted(id, "converted_images/cat.png").await.unwrap());
    assert!(!repo.set_converted(id, "elsewhere/cat.png").await.unwrap());
    assert!(!repo.set_status(id, JobStatus::Failed).await.unwrap());
    assert!(!repo.set_status(id, JobStatus::Uploaded).await.unwrap());

    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Converted);
    assert_eq!(job.converted_path.as_deref(), Some("converted_images/cat.png"));
}

#[tokio::test]
#[serial]
async fn failed_is_terminal() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let repo = JobsRepo::new(pool);
    let id = repo
        .create(NewJob::for_upload("uploads/cat.jpg", "a@example.com"))
        .await
        .unwrap();

    assert!(repo.set_status(id, JobStatus::Failed).await.unwrap());
    assert!(repo.set_status(id, JobStatus::Failed).await.unwrap());
    assert!(!repo.set_converted(id, "converted_images/cat.png").await.unwrap());

    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.converted_path.is_none());
}

#[tokio::test]
#[serial]
async fn set_status_refuses_converted_without_path() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let repo = JobsRepo::new(pool);
    let id = repo
        .create(NewJob::for_upload("uploads/cat.jpg", "a@example.com"))
        .await
        .unwrap();

    assert!(repo.set_status(id, JobStatus::Converted).await.is_err());
    assert_eq!(repo.get(id).await.unwrap().unwrap().status, JobStatus::Uploaded);
}

#[tokio::test]
#[serial]
async fn converted_requires_a_non_empty_path() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let repo = JobsRepo::new(pool.clone());
    let id = repo
        .create(NewJob::for_upload("uploads/cat.jpg", "a@example.com"))
        .await
        .unwrap();

    assert!(repo.set_converted(id, "").await.is_err());

    // the table refuses it even without the repo check
    let raw = sqlx::query(
        "UPDATE images SET status = 'Converted', converted_path = '' WHERE id = $1",
    )
    .bind(id.as_i64())
    .execute(&pool)
    .await;
    assert!(raw.is_err());

    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Uploaded);
    assert!(job.converted_path.is_none());
}

#[tokio::test]
#[serial]
async fn transitions_on_missing_job_report_false() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let repo = JobsRepo::new(pool);

    assert!(!repo.set_status(JobId(42), JobStatus::Failed).await.unwrap());
    assert!(!repo.set_converted(JobId(42), "x.png").await.unwrap());
}

#[tokio::test]
#[serial]
async fn status_counts_group_by_status() {
    let Some(pool) = setup_db().await else {
        return;
    };
    let repo = JobsRepo::new(pool);

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            repo.create(NewJob::for_upload(format!("uploads/{i}.jpg"), "a@example.com"))
                .await
                .unwrap(),
        );
    }
    repo.set_converted(ids[0], "converted_images/0.png").await.unwrap();
    repo.set_status(ids[1], JobStatus::Failed).await.unwrap();

    let counts = repo.status_counts().await.unwrap();
    assert_eq!(counts.uploaded, 2);
    assert_eq!(counts.converted, 1);
    assert_eq!(counts.failed, 1);
}
