//! Postgres adapter checks. Run with `DATABASE_URL` set and `--ignored`.

mod common;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use mailpress::{
    application::{
        jobs::RENDER_JOB_TYPE,
        repos::{DocumentStore, JobQueue, RepoError},
    },
    domain::{
        entities::{NewDocument, NewRenderJob},
        types::JobState,
    },
    infra::{db::PostgresRepositories, storage::DocumentStorage},
};
use sqlx::PgPool;
use time::OffsetDateTime;

use common::payload;

fn repositories(pool: PgPool) -> (PostgresRepositories, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = DocumentStorage::new(dir.path().to_path_buf()).expect("storage");
    (PostgresRepositories::new(pool, Arc::new(storage)), dir)
}

fn job(message_id: &str, priority: i32) -> NewRenderJob {
    NewRenderJob {
        payload: payload(message_id),
        priority,
        max_attempts: 3,
        run_at: OffsetDateTime::now_utc() - Duration::from_secs(1),
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn render_jobs_live_in_the_apalis_table(pool: PgPool) {
    PostgresRepositories::run_migrations(&pool)
        .await
        .expect("apalis schema");
    let (repos, _dir) = repositories(pool.clone());

    let id = repos.enqueue(job("m1", 10)).await.expect("enqueue");
    let record = repos.find(&id).await.expect("find").expect("exists");
    assert_eq!(record.state, JobState::Pending);
    assert_eq!(record.priority, 10);
    assert_eq!(record.max_attempts, 3);
    assert_eq!(record.payload.message_id, "m1");

    let job_type: String = sqlx::query_scalar("SELECT job_type FROM apalis.jobs WHERE id = $1")
        .bind(&id)
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(job_type, RENDER_JOB_TYPE);

    let later = OffsetDateTime::now_utc() + Duration::from_secs(3600);
    repos.defer(&id, later).await.expect("defer");
    let record = repos.find(&id).await.expect("find").expect("exists");
    assert!(record.run_at > OffsetDateTime::now_utc() + Duration::from_secs(3000));

    assert!(matches!(
        repos.defer("missing", later).await,
        Err(RepoError::NotFound)
    ));
    assert_eq!(repos.counts().await.expect("counts").waiting, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn counts_follow_apalis_statuses(pool: PgPool) {
    PostgresRepositories::run_migrations(&pool)
        .await
        .expect("apalis schema");
    let (repos, _dir) = repositories(pool.clone());

    let done = repos.enqueue(job("done", 0)).await.expect("enqueue");
    let aborted = repos.enqueue(job("aborted", 0)).await.expect("enqueue");
    let retrying = repos.enqueue(job("retrying", 0)).await.expect("enqueue");
    let exhausted = repos.enqueue(job("exhausted", 0)).await.expect("enqueue");
    repos.enqueue(job("pending", 0)).await.expect("enqueue");

    for (id, status, attempts) in [
        (&done, "Done", 1),
        (&aborted, "Killed", 1),
        (&retrying, "Failed", 1),
        (&exhausted, "Killed", 3),
    ] {
        sqlx::query("UPDATE apalis.jobs SET status = $2, attempts = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(attempts)
            .execute(&pool)
            .await
            .expect("update");
    }

    let counts = repos.counts().await.expect("counts");
    assert_eq!(counts.waiting, 2);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 2);
    assert_eq!(counts.dead_lettered, 1);

    let record = repos.find(&exhausted).await.expect("find").expect("exists");
    assert_eq!(record.state, JobState::Killed);
    let record = repos.find(&aborted).await.expect("find").expect("exists");
    assert_eq!(record.state, JobState::Failed);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn second_document_for_same_message_is_duplicate(pool: PgPool) {
    let (repos, dir) = repositories(pool);
    let message = payload("m1");
    let pdf = Bytes::from_static(b"%PDF-1.7\n");

    let stored = repos
        .create_document(NewDocument::from_payload(&message, pdf.clone()))
        .await
        .expect("first insert");
    assert!(dir.path().join(&stored.stored_path).exists());
    assert_eq!(
        repos
            .find_existing("tenant-a", "m1")
            .await
            .expect("lookup"),
        Some(stored.id)
    );

    let err = repos
        .create_document(NewDocument::from_payload(&message, pdf))
        .await
        .expect_err("second insert must conflict");
    assert!(matches!(err, RepoError::Duplicate { .. }));
}
