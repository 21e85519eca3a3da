//! PostgreSQL store tests
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p kex-store -- --ignored`.

use chrono::Utc;
use kex_core::{
    Activity, ActivityStatus, Batch, BatchEvent, BatchItem, BatchState, KexError, SourceDocument,
    SourceKey, StatusPatch, WorkflowStatus,
};
use kex_store::{
    BatchRepository, DocumentRepository, ItemPatch, NewExecution, PgStore, WorkflowRepository,
};
use serde_json::json;
use uuid::Uuid;

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PgStore::connect(&url, 5).await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn source(org: Uuid, content: &str) -> SourceDocument {
    SourceDocument::new(SourceKey::new(org, "gmail:jane", "msg-1"), content)
}

fn new_execution(org: Uuid) -> NewExecution {
    NewExecution {
        organization_id: org,
        workflow_type: "knowledge_extraction".to_string(),
        version: 1,
        input: json!({ "organizationId": org }),
        dedupe_key: Uuid::new_v4().to_string(),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_materialize_idempotent_and_versioned() {
    let store = store().await;
    let org = Uuid::new_v4();

    let first = store.materialize(&source(org, "Jane Doe met with Acme Corp.")).await.unwrap();
    let again = store.materialize(&source(org, "Jane Doe met with Acme Corp.")).await.unwrap();
    assert!(first.created_document && first.created_version);
    assert!(!again.created_document && !again.created_version);
    assert_eq!(first.version.id, again.version.id);

    let changed = store.materialize(&source(org, "Jane Doe left Acme Corp.")).await.unwrap();
    assert!(changed.created_version);
    assert_eq!(changed.version.version_number, 2);
    assert_eq!(store.count_documents(org).await.unwrap(), (1, 2));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_concurrent_materialize_creates_one_document() {
    let store = store().await;
    let org = Uuid::new_v4();
    let doc = source(org, "Concurrent body.");

    let (a, b) = tokio::join!(store.materialize(&doc), store.materialize(&doc));
    assert_eq!(a.unwrap().version.id, b.unwrap().version.id);
    assert_eq!(store.count_documents(org).await.unwrap(), (1, 1));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_execution_dedupe_cas_and_checkpoint() {
    let store = store().await;
    let new = new_execution(Uuid::new_v4());

    let (execution, created) = store.create_execution(new.clone()).await.unwrap();
    let (same, created_again) = store.create_execution(new).await.unwrap();
    assert!(created && !created_again);
    assert_eq!(execution.id, same.id);
    assert_eq!(execution.status, WorkflowStatus::Queued);

    let running = store
        .transition_status(execution.id, WorkflowStatus::Queued, WorkflowStatus::Running, StatusPatch::started())
        .await
        .unwrap();
    assert!(running.started_at.is_some());

    let stale = store
        .transition_status(execution.id, WorkflowStatus::Queued, WorkflowStatus::Running, StatusPatch::started())
        .await;
    assert!(matches!(stale, Err(KexError::InvalidTransition { .. })));

    store
        .complete_activity(execution.id, Activity::Chunk, json!({ "chunks": [] }))
        .await
        .unwrap();
    assert!(store
        .complete_activity(execution.id, Activity::Chunk, json!({}))
        .await
        .is_err());

    let loaded = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(loaded.current_activity, Some(Activity::Chunk));
    assert_eq!(loaded.checkpoint, Some(json!({ "chunks": [] })));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_activity_log_and_signals() {
    let store = store().await;
    let (execution, _) = store.create_execution(new_execution(Uuid::new_v4())).await.unwrap();

    let record = store
        .start_activity(execution.id, Activity::Mentions, 1, json!({ "chunks": 1 }))
        .await
        .unwrap();
    store
        .finish_activity(record.id, ActivityStatus::Failed, None, Some("timeout".to_string()))
        .await
        .unwrap();
    let activities = store.list_activities(execution.id).await.unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].status, ActivityStatus::Failed);
    assert_eq!(activities[0].error.as_deref(), Some("timeout"));

    store
        .record_signal(execution.id, "progress", json!({ "stage": "chunk" }))
        .await
        .unwrap();
    assert_eq!(store.list_signals(execution.id).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_batch_item_start_is_exclusive() {
    let store = store().await;
    let org = Uuid::new_v4();
    let doc = store.materialize(&source(org, "Batch body.")).await.unwrap();
    let batch = Batch {
        id: Uuid::new_v4(),
        organization_id: org,
        ontology_id: "meetings".to_string(),
        ontology_hash: "h".to_string(),
        created_at: Utc::now(),
    };
    let item = BatchItem {
        id: Uuid::new_v4(),
        batch_id: batch.id,
        document_id: doc.document.id,
        document_version_id: doc.version.id,
        workflow_execution_id: None,
        state: BatchState::Queued,
        attempts: 0,
        last_error: None,
        updated_at: Utc::now(),
    };
    store.create_batch(&batch, std::slice::from_ref(&item)).await.unwrap();

    let (a, b) = tokio::join!(
        store.transition_item(item.id, BatchEvent::Start, ItemPatch::default()),
        store.transition_item(item.id, BatchEvent::Start, ItemPatch::default()),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let failed = store
        .transition_item(item.id, BatchEvent::Fail, ItemPatch::error("boom"))
        .await
        .unwrap();
    assert_eq!(failed.state, BatchState::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.last_error.as_deref(), Some("boom"));
}
