//! PostgreSQL integration tests for the job store.
//!
//! Run with a migrated database:
//! `DATABASE_URL=postgres://... cargo test -p handbook-db -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use handbook_db::test_fixtures::TestDatabase;
use handbook_db::{
    Document, DocumentSource, JobKind, JobOutput, JobStatus, JobStore, NewJob,
};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_concurrent_claim_has_single_winner() {
    let test_db = Arc::new(TestDatabase::new().await);
    let id = test_db.enqueue(NewJob::ocr("uploads/race.pdf")).await;

    let claims = (0..8).map(|i| {
        let test_db = test_db.clone();
        async move {
            test_db
                .db
                .jobs
                .claim(JobKind::Ocr, id, &format!("worker-{}", i))
                .await
                .unwrap()
        }
    });
    let won: Vec<bool> = join_all(claims).await;
    assert_eq!(won.iter().filter(|w| **w).count(), 1);

    let job = test_db.db.jobs.get(JobKind::Ocr, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.claimed_by.unwrap().starts_with("worker-"));

    if let Ok(test_db) = Arc::try_unwrap(test_db) {
        test_db.cleanup().await;
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_ocr_complete_is_idempotent() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let id = test_db.enqueue(NewJob::ocr("uploads/a.pdf")).await;

    assert!(jobs.claim(JobKind::Ocr, id, "w1").await.unwrap());
    let output = JobOutput::Text("Regel 1\nRegel 2".into());
    assert!(jobs.complete(JobKind::Ocr, id, "w1", &output).await.unwrap());
    let first = jobs.get(JobKind::Ocr, id).await.unwrap().unwrap();

    assert!(!jobs.complete(JobKind::Ocr, id, "w1", &output).await.unwrap());
    assert!(!jobs.fail(JobKind::Ocr, id, "w1", "late").await.unwrap());
    let second = jobs.get(JobKind::Ocr, id).await.unwrap().unwrap();

    assert_eq!(first.status, JobStatus::Done);
    assert_eq!(second.result, Some(output));
    assert_eq!(first.updated_at, second.updated_at);
    assert!(second.error_message.is_none());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_analyze_round_trip_with_inline_text() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let document_id = Uuid::new_v4();
    let id = test_db
        .enqueue(
            NewJob::analyze(document_id).with_text("Regel 1", Some(json!({"pages": 1}))),
        )
        .await;

    let job = jobs.get(JobKind::Analyze, id).await.unwrap().unwrap();
    assert_eq!(job.input_reference, document_id.to_string());
    assert_eq!(job.input_text.as_deref(), Some("Regel 1"));
    assert_eq!(job.max_attempts, 3);

    assert!(jobs.claim(JobKind::Analyze, id, "w1").await.unwrap());
    let output = JobOutput::Json(json!({"sections": [{"title": "Regler"}], "chunks": 1}));
    assert!(jobs.complete(JobKind::Analyze, id, "w1", &output).await.unwrap());

    let job = jobs.get(JobKind::Analyze, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.result, Some(output));
    assert_eq!(job.attempts, 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_requeue_hides_job_until_due() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let id = test_db.enqueue(NewJob::ocr("uploads/slow.pdf")).await;

    assert!(jobs.claim(JobKind::Ocr, id, "w1").await.unwrap());
    assert!(jobs
        .requeue(JobKind::Ocr, id, "w1", "Vision returned 503", Duration::from_secs(3600))
        .await
        .unwrap());

    let job = jobs.get(JobKind::Ocr, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("Vision returned 503"));
    assert!(job.run_after > chrono::Utc::now());

    // Other pending rows may exist; only assert ours is not handed out.
    if let Some(polled) = jobs.poll_once(JobKind::Ocr).await.unwrap() {
        assert_ne!(polled.id, id);
    }

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_sweeper_requeues_and_abandons_stale_jobs() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let retryable = test_db
        .enqueue(NewJob::ocr("uploads/r.pdf").with_max_attempts(3))
        .await;
    let exhausted = test_db
        .enqueue(NewJob::ocr("uploads/e.pdf").with_max_attempts(1))
        .await;

    for id in [retryable, exhausted] {
        assert!(jobs.claim(JobKind::Ocr, id, "crashed").await.unwrap());
        sqlx::query(
            "UPDATE ocr_jobs SET heartbeat_at = now() - interval '1 hour' WHERE id = $1",
        )
        .bind(id)
        .execute(test_db.db.pool())
        .await
        .unwrap();
    }

    let report = jobs
        .requeue_stale(JobKind::Ocr, Duration::from_secs(300))
        .await
        .unwrap();
    assert!(report.requeued >= 1);
    assert!(report.abandoned >= 1);

    let job = jobs.get(JobKind::Ocr, retryable).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.claimed_by.is_none());

    let job = jobs.get(JobKind::Ocr, exhausted).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error_message.unwrap().contains("crashed"));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_document_lookup() {
    let test_db = TestDatabase::new().await;
    let doc = Document {
        id: Uuid::new_v4(),
        file_name: Some("ordningsregler.pdf".into()),
        extracted_text: Some("Regel 1".into()),
        metadata: Some(json!({"pages": 2})),
    };
    test_db.db.documents.upsert(&doc).await.unwrap();

    let found = test_db.db.documents.get_document(doc.id).await.unwrap().unwrap();
    assert_eq!(found.extracted_text.as_deref(), Some("Regel 1"));
    assert!(test_db
        .db
        .documents
        .get_document(Uuid::new_v4())
        .await
        .unwrap()
        .is_none());

    sqlx::query("DELETE FROM document_imports WHERE id = $1")
        .bind(doc.id)
        .execute(test_db.db.pool())
        .await
        .unwrap();
    test_db.cleanup().await;
}
