//! End-to-end workflow tests over the in-memory store with rule-backed and
//! scripted LLM stages, plus restart recovery of batch items

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kex_core::{
    Activity, ActivityRecord, ActivityStatus, Batch, BatchEvent, BatchItem, BatchSettings,
    BatchState, BulletEvidence, DocumentVersion, Entity, EvidenceKind, EvidenceQuery, EvidenceSpan,
    KexError, KnowledgeGraph, MaterializedDocument, Mention, ProgressStatus, Relation, Result,
    SignalRecord, SourceDocument, SourceKey, StatusPatch, WorkflowExecution, WorkflowStatus,
};
use kex_extractor::{
    BatchOptions, ExtractionStage, MentionInput, MentionStage, RetryPolicy, RuleSet, ScriptedLlm,
    StageSet,
};
use kex_ontology::{InMemorySource, OntologyContext, OntologyRegistry};
use kex_store::{
    BatchRepository, DocumentRepository, EvidenceRepository, InMemoryStore, ItemPatch,
    NewExecution, PersistReport, Store, WorkflowRepository,
};
use kex_vector::{InMemoryVectorStore, LocalHashEmbedding};
use kex_workflow::{
    BatchOrchestrator, ExtractionSummary, Orchestrator, Pipeline, RunOptions, RunOutcome,
};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

const MEETINGS: &str = r#"
@prefix ex: <http://example.org/meetings#> .
@prefix owl: <http://www.w3.org/2002/07/owl#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .

ex:Agent a owl:Class ; rdfs:label "Agent" .
ex:Person a owl:Class ; rdfs:subClassOf ex:Agent ; rdfs:label "Person" .
ex:Organization a owl:Class ; rdfs:subClassOf ex:Agent ; rdfs:label "Organization" .

ex:meetingWith a owl:ObjectProperty ;
    rdfs:label "meeting with" ;
    rdfs:domain ex:Person ;
    rdfs:range ex:Organization .
"#;

const RULES: &str = r#"
[[terms]]
text = "Jane Doe"
class = "Person"

[[terms]]
text = "Acme Corp"
class = "Organization"

[[relations]]
subject = "Person"
object = "Organization"
predicate = "meetingWith"
keywords = ["met with"]
max_distance = 30
"#;

const CONTENT: &str = "Jane Doe met with Acme Corp on March 3.";
const PERSON: &str = "http://example.org/meetings#Person";
const ORGANIZATION: &str = "http://example.org/meetings#Organization";
const MEETING_WITH: &str = "http://example.org/meetings#meetingWith";

// ============================================================================
// Harness
// ============================================================================

fn org() -> Uuid {
    Uuid::from_u128(7)
}

fn source(source_id: &str, content: &str) -> SourceDocument {
    SourceDocument::new(SourceKey::new(org(), "gmail:jane", source_id), content)
}

fn registry() -> OntologyRegistry {
    OntologyRegistry::new(Arc::new(InMemorySource::new().with_ontology("meetings", MEETINGS)))
}

fn rule_stages() -> StageSet {
    StageSet::rules(&RuleSet::from_toml(RULES).unwrap()).unwrap()
}

fn orchestrator(store: Arc<dyn Store>, stages: StageSet) -> Orchestrator {
    let pipeline = Pipeline::new(store, stages, Arc::new(LocalHashEmbedding::new(64)), 0.2)
        .unwrap()
        .with_batch_options(BatchOptions {
            concurrency: 2,
            retry: RetryPolicy::none(),
        })
        .with_vector_store(Arc::new(InMemoryVectorStore::new()));
    Orchestrator::new(pipeline, registry()).with_retry(RetryPolicy::none())
}

fn summary(outcome: &RunOutcome) -> ExtractionSummary {
    serde_json::from_value(outcome.execution().output.clone().unwrap()).unwrap()
}

/// Graph contents without run-specific ids
async fn normalized_graph(store: &dyn Store, version_id: Uuid) -> Vec<String> {
    let entities = store.list_entities(org(), version_id).await.unwrap();
    let relations = store.list_relations(org(), version_id).await.unwrap();
    let name_of = |id: Uuid| {
        entities
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.name.clone())
            .unwrap_or_default()
    };

    let mut rows: Vec<String> = entities
        .iter()
        .map(|e| format!("entity {} {:?}", e.name, e.types))
        .collect();
    rows.extend(relations.iter().map(|r| {
        format!(
            "relation {} {} {:?} {}..{}",
            name_of(r.subject_id),
            r.predicate,
            r.object.entity_id().map(name_of),
            r.start,
            r.end
        )
    }));
    rows.sort();
    rows
}

/// Mention stage that blocks on its first call until cancelled
struct BlockingMentions {
    inner: Arc<MentionStage>,
    started: Arc<Notify>,
    blocked: AtomicBool,
}

#[async_trait]
impl ExtractionStage for BlockingMentions {
    type Input = MentionInput;
    type Output = Vec<Mention>;

    fn name(&self) -> &'static str {
        "mentions"
    }

    async fn extract(&self, input: &MentionInput, ontology: &OntologyContext) -> Result<Vec<Mention>> {
        if !self.blocked.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
            std::future::pending::<()>().await;
        }
        self.inner.extract(input, ontology).await
    }
}

/// Mention stage that fails a fixed number of calls
struct FlakyMentions {
    inner: Arc<MentionStage>,
    failures_left: AtomicU32,
}

#[async_trait]
impl ExtractionStage for FlakyMentions {
    type Input = MentionInput;
    type Output = Vec<Mention>;

    fn name(&self) -> &'static str {
        "mentions"
    }

    async fn extract(&self, input: &MentionInput, ontology: &OntologyContext) -> Result<Vec<Mention>> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(KexError::Llm("provider unavailable".to_string()));
        }
        self.inner.extract(input, ontology).await
    }
}

fn flaky_stages(failures: u32) -> StageSet {
    let mut stages = rule_stages();
    stages.mentions = Arc::new(FlakyMentions {
        inner: Arc::clone(&stages.mentions),
        failures_left: AtomicU32::new(failures),
    });
    stages
}

/// Mention stage that records how many calls overlap
struct OverlapMentions {
    inner: Arc<MentionStage>,
    in_flight: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl ExtractionStage for OverlapMentions {
    type Input = MentionInput;
    type Output = Vec<Mention>;

    fn name(&self) -> &'static str {
        "mentions"
    }

    async fn extract(&self, input: &MentionInput, ontology: &OntologyContext) -> Result<Vec<Mention>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.extract(input, ontology).await
    }
}

/// In-memory store whose signal log is unavailable
#[derive(Default)]
struct SignalOutageStore {
    inner: InMemoryStore,
}

#[async_trait]
impl DocumentRepository for SignalOutageStore {
    async fn materialize(&self, source: &SourceDocument) -> Result<MaterializedDocument> {
        self.inner.materialize(source).await
    }

    async fn get_version(&self, organization_id: Uuid, version_id: Uuid) -> Result<Option<DocumentVersion>> {
        self.inner.get_version(organization_id, version_id).await
    }

    async fn count_documents(&self, organization_id: Uuid) -> Result<(usize, usize)> {
        self.inner.count_documents(organization_id).await
    }
}

#[async_trait]
impl EvidenceRepository for SignalOutageStore {
    async fn persist_graph(&self, graph: &KnowledgeGraph) -> Result<PersistReport> {
        self.inner.persist_graph(graph).await
    }

    async fn record_bullet_evidence(&self, rows: &[BulletEvidence]) -> Result<()> {
        self.inner.record_bullet_evidence(rows).await
    }

    async fn list_evidence(&self, query: &EvidenceQuery) -> Result<Vec<EvidenceSpan>> {
        self.inner.list_evidence(query).await
    }

    async fn list_entities(&self, organization_id: Uuid, version_id: Uuid) -> Result<Vec<Entity>> {
        self.inner.list_entities(organization_id, version_id).await
    }

    async fn list_relations(&self, organization_id: Uuid, version_id: Uuid) -> Result<Vec<Relation>> {
        self.inner.list_relations(organization_id, version_id).await
    }
}

#[async_trait]
impl WorkflowRepository for SignalOutageStore {
    async fn create_execution(&self, new: NewExecution) -> Result<(WorkflowExecution, bool)> {
        self.inner.create_execution(new).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>> {
        self.inner.get_execution(id).await
    }

    async fn list_executions(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowExecution>> {
        self.inner.list_executions(status).await
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
        patch: StatusPatch,
    ) -> Result<WorkflowExecution> {
        self.inner.transition_status(id, from, to, patch).await
    }

    async fn complete_activity(&self, id: Uuid, activity: Activity, checkpoint: serde_json::Value) -> Result<()> {
        self.inner.complete_activity(id, activity, checkpoint).await
    }

    async fn start_activity(
        &self,
        execution_id: Uuid,
        activity: Activity,
        attempt_number: i32,
        input: serde_json::Value,
    ) -> Result<ActivityRecord> {
        self.inner
            .start_activity(execution_id, activity, attempt_number, input)
            .await
    }

    async fn finish_activity(
        &self,
        record_id: Uuid,
        status: ActivityStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        self.inner.finish_activity(record_id, status, output, error).await
    }

    async fn list_activities(&self, execution_id: Uuid) -> Result<Vec<ActivityRecord>> {
        self.inner.list_activities(execution_id).await
    }

    async fn record_signal(
        &self,
        _execution_id: Uuid,
        _signal_name: &str,
        _payload: serde_json::Value,
    ) -> Result<SignalRecord> {
        Err(KexError::Database("signal log unavailable".to_string()))
    }

    async fn list_signals(&self, execution_id: Uuid) -> Result<Vec<SignalRecord>> {
        self.inner.list_signals(execution_id).await
    }
}

#[async_trait]
impl BatchRepository for SignalOutageStore {
    async fn create_batch(&self, batch: &Batch, items: &[BatchItem]) -> Result<()> {
        self.inner.create_batch(batch, items).await
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        self.inner.get_batch(id).await
    }

    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        self.inner.list_items(batch_id).await
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<BatchItem>> {
        self.inner.get_item(id).await
    }

    async fn transition_item(&self, id: Uuid, event: BatchEvent, patch: ItemPatch) -> Result<BatchItem> {
        self.inner.transition_item(id, event, patch).await
    }
}

// ============================================================================
// Extraction
// ============================================================================

#[tokio::test]
async fn test_meeting_scenario_graph_and_evidence() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), rule_stages());

    let outcome = orch.extract(&source("msg-1", CONTENT), "meetings").await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");
    let execution = outcome.execution();
    assert_eq!(execution.current_activity, Some(Activity::Index));
    assert!(execution.error.is_none());

    let stats = summary(&outcome);
    assert_eq!(stats.entities, 2);
    assert_eq!(stats.relations, 1);
    assert_eq!(stats.skipped_chunks, 0);
    assert_eq!(stats.indexed, 2);

    let input: kex_workflow::WorkflowInput = serde_json::from_value(execution.input.clone()).unwrap();
    let entities = store.list_entities(org(), input.document_version_id).await.unwrap();
    assert_eq!(entities.len(), 2);
    let jane = entities.iter().find(|e| e.name == "Jane Doe").unwrap();
    let acme = entities.iter().find(|e| e.name == "Acme Corp").unwrap();
    assert_eq!(jane.types, vec![PERSON.to_string()]);
    assert_eq!(acme.types, vec![ORGANIZATION.to_string()]);

    let relations = store.list_relations(org(), input.document_version_id).await.unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].predicate, MEETING_WITH);
    assert_eq!(relations[0].subject_id, jane.id);
    assert_eq!(relations[0].object.entity_id(), Some(acme.id));

    let jane_spans = store
        .list_evidence(&EvidenceQuery::entity(org(), jane.id))
        .await
        .unwrap();
    assert_eq!(jane_spans.len(), 1);
    assert_eq!((jane_spans[0].start_char, jane_spans[0].end_char), (0, 8));
    assert_eq!(jane_spans[0].text, "Jane Doe");

    let acme_spans = store
        .list_evidence(&EvidenceQuery::entity(org(), acme.id))
        .await
        .unwrap();
    assert_eq!((acme_spans[0].start_char, acme_spans[0].end_char), (18, 27));

    let relation_spans = store
        .list_evidence(&EvidenceQuery::relation(org(), relations[0].id))
        .await
        .unwrap();
    assert_eq!(relation_spans.len(), 1);
    assert_eq!((relation_spans[0].start_char, relation_spans[0].end_char), (0, 27));
    assert_eq!(relation_spans[0].text, "Jane Doe met with Acme Corp");
}

#[tokio::test]
async fn test_scripted_llm_stages_build_the_same_entities() {
    let llm = Arc::new(
        ScriptedLlm::new()
            .respond(
                "mentions",
                json!({"mentions": [
                    {"text": "Jane Doe", "types": ["Person"], "confidence": 0.95},
                    {"text": "Acme Corp", "types": ["Organization"], "confidence": 0.9}
                ]}),
            )
            .respond(
                "entities",
                json!({"entities": [
                    {"mentions": [0], "name": "Jane Doe", "types": ["Person"], "confidence": 0.9},
                    {"mentions": [1], "name": "Acme Corp", "types": ["Organization"], "confidence": 0.9}
                ]}),
            )
            .respond(
                "relations",
                json!({"relations": [
                    {"subject": 0, "predicate": "ex:meetingWith", "object": 1,
                     "confidence": 0.9, "evidence": "Jane Doe met with Acme Corp"}
                ]}),
            ),
    );
    llm.fail_next("mentions", 1);

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), StageSet::llm(llm.clone()));
    let outcome = orch.extract(&source("msg-llm", CONTENT), "meetings").await.unwrap();

    // The transient failure fails the only chunk, so the activity fails.
    assert_eq!(outcome.execution().status, WorkflowStatus::Failed);
    let outcome = orch.resume(outcome.execution().id, RunOptions::default()).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(llm.calls("mentions"), 2);
    assert_eq!(llm.calls("relations"), 1);

    let input: kex_workflow::WorkflowInput =
        serde_json::from_value(outcome.execution().input.clone()).unwrap();
    let rows = normalized_graph(store.as_ref(), input.document_version_id).await;
    let entity_rows: Vec<_> = rows.iter().filter(|r| r.starts_with("entity")).collect();
    assert_eq!(entity_rows.len(), 2);

    let relations = store.list_relations(org(), input.document_version_id).await.unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].predicate, MEETING_WITH);
    let spans = store
        .list_evidence(&EvidenceQuery::relation(org(), relations[0].id))
        .await
        .unwrap();
    assert!(!spans.is_empty());
    for span in spans {
        assert_eq!(&CONTENT[span.start_char..span.end_char], span.text);
    }
}

#[tokio::test]
async fn test_evidence_resolves_against_version_content() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), rule_stages());
    let outcome = orch.extract(&source("msg-1", CONTENT), "meetings").await.unwrap();
    assert!(outcome.is_completed());

    let input: kex_workflow::WorkflowInput =
        serde_json::from_value(outcome.execution().input.clone()).unwrap();
    let spans = store
        .list_evidence(&EvidenceQuery::document(org(), input.document_id))
        .await
        .unwrap();
    let kinds: Vec<EvidenceKind> = spans.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![EvidenceKind::Mention, EvidenceKind::Relation, EvidenceKind::Mention]
    );

    for span in &spans {
        let version = store
            .get_version(org(), span.document_version_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&version.content[span.start_char..span.end_char], span.text);
    }

    let other_org = store
        .list_evidence(&EvidenceQuery::document(Uuid::from_u128(99), input.document_id))
        .await
        .unwrap();
    assert!(other_org.is_empty());
}

#[tokio::test]
async fn test_resubmission_is_idempotent() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), rule_stages());

    let first = orch.extract(&source("msg-1", CONTENT), "meetings").await.unwrap();
    let second = orch.extract(&source("msg-1", CONTENT), "meetings").await.unwrap();

    assert_eq!(first.execution().id, second.execution().id);
    assert_eq!(store.count_documents(org()).await.unwrap(), (1, 1));
    assert_eq!(store.list_executions(None).await.unwrap().len(), 1);

    // A completed execution is returned without running activities again
    let activities = store.list_activities(first.execution().id).await.unwrap();
    assert_eq!(activities.len(), Activity::ALL.len());
}

#[tokio::test]
async fn test_changed_content_extracts_new_version() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), rule_stages());

    let first = orch.extract(&source("msg-1", CONTENT), "meetings").await.unwrap();
    let second = orch
        .extract(&source("msg-1", "Acme Corp hired Jane Doe."), "meetings")
        .await
        .unwrap();

    assert_ne!(first.execution().id, second.execution().id);
    assert_eq!(store.count_documents(org()).await.unwrap(), (1, 2));
    assert_eq!(summary(&second).relations, 0);
}

#[tokio::test]
async fn test_ontology_change_fails_pinned_execution() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), rule_stages());
    let materialized = store.materialize(&source("msg-1", CONTENT)).await.unwrap();
    let mut input = orch.prepare(&materialized.version, "meetings").await.unwrap();
    input.ontology_hash = "stale".to_string();

    let execution = orch.start(input).await.unwrap();
    let outcome = orch.run(execution.id, RunOptions::default()).await.unwrap();

    match outcome {
        RunOutcome::Failed(execution) => {
            assert!(execution.error.unwrap().contains("changed since the execution started"));
            assert_eq!(execution.current_activity, None);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

// ============================================================================
// Checkpoints and resumption
// ============================================================================

#[tokio::test]
async fn test_resume_from_every_checkpoint_matches_uninterrupted_run() {
    let baseline_store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let baseline = orchestrator(Arc::clone(&baseline_store), rule_stages())
        .extract(&source("msg-1", CONTENT), "meetings")
        .await
        .unwrap();
    let baseline_input: kex_workflow::WorkflowInput =
        serde_json::from_value(baseline.execution().input.clone()).unwrap();
    let expected = normalized_graph(baseline_store.as_ref(), baseline_input.document_version_id).await;
    assert_eq!(expected.len(), 3);

    for &stop in &Activity::ALL[..Activity::ALL.len() - 1] {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let first = orchestrator(Arc::clone(&store), rule_stages());
        let materialized = store.materialize(&source("msg-1", CONTENT)).await.unwrap();
        let input = first.prepare(&materialized.version, "meetings").await.unwrap();
        let execution = first.start(input.clone()).await.unwrap();

        let suspended = first
            .run(execution.id, RunOptions::suspend_after(stop))
            .await
            .unwrap();
        match &suspended {
            RunOutcome::Suspended(e) => {
                assert_eq!(e.status, WorkflowStatus::Running);
                assert_eq!(e.current_activity, Some(stop));
                assert!(e.checkpoint.is_some());
            }
            other => panic!("expected suspension after {stop}, got {other:?}"),
        }
        drop(first);

        // A new process picks the execution up from its checkpoint
        let second = orchestrator(Arc::clone(&store), rule_stages());
        let recovered = second.recover_incomplete().await.unwrap();
        assert_eq!(recovered.len(), 1, "after {stop}");
        assert!(recovered[0].is_completed(), "after {stop}");

        let activities = store.list_activities(execution.id).await.unwrap();
        assert_eq!(activities.len(), Activity::ALL.len(), "no activity repeated after {stop}");
        assert_eq!(
            normalized_graph(store.as_ref(), input.document_version_id).await,
            expected,
            "after {stop}"
        );
    }
}

#[tokio::test]
async fn test_failed_execution_resumes_at_failed_activity() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), flaky_stages(1));

    let failed = orch.extract(&source("msg-1", CONTENT), "meetings").await.unwrap();
    let execution = match failed {
        RunOutcome::Failed(e) => e,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(execution.current_activity, Some(Activity::Chunk));
    assert!(execution.error.as_deref().unwrap().contains("mentions"));

    let resumed = orch.resume(execution.id, RunOptions::default()).await.unwrap();
    assert!(resumed.is_completed());
    assert!(resumed.execution().error.is_none());

    let activities = store.list_activities(execution.id).await.unwrap();
    let chunk_runs = activities.iter().filter(|a| a.activity == Activity::Chunk).count();
    let mention_runs: Vec<ActivityStatus> = activities
        .iter()
        .filter(|a| a.activity == Activity::Mentions)
        .map(|a| a.status)
        .collect();
    assert_eq!(chunk_runs, 1);
    assert_eq!(mention_runs, vec![ActivityStatus::Failed, ActivityStatus::Completed]);
}

#[tokio::test]
async fn test_activity_retry_within_budget() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), flaky_stages(1)).with_retry(RetryPolicy::new(3, 1, 5));

    let outcome = orch.extract(&source("msg-1", CONTENT), "meetings").await.unwrap();
    assert!(outcome.is_completed());

    let attempts: Vec<i32> = store
        .list_activities(outcome.execution().id)
        .await
        .unwrap()
        .iter()
        .filter(|a| a.activity == Activity::Mentions)
        .map(|a| a.attempt_number)
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_completed_execution_cannot_resume() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), rule_stages());
    let outcome = orch.extract(&source("msg-1", CONTENT), "meetings").await.unwrap();

    let err = orch
        .resume(outcome.execution().id, RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KexError::InvalidTransition { .. }));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_in_flight_activity_then_resume() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let started = Arc::new(Notify::new());
    let mut stages = rule_stages();
    stages.mentions = Arc::new(BlockingMentions {
        inner: Arc::clone(&stages.mentions),
        started: Arc::clone(&started),
        blocked: AtomicBool::new(false),
    });
    let orch = Arc::new(orchestrator(Arc::clone(&store), stages));

    let runner = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.extract(&source("msg-1", CONTENT), "meetings").await })
    };
    started.notified().await;

    let running = store.list_executions(Some(WorkflowStatus::Running)).await.unwrap();
    assert_eq!(running.len(), 1);
    let id = running[0].id;
    assert!(orch.is_running(id));
    orch.cancel(id).await.unwrap();

    let outcome = runner.await.unwrap().unwrap();
    match &outcome {
        RunOutcome::Cancelled(e) => assert_eq!(e.current_activity, Some(Activity::Chunk)),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(!orch.is_running(id));

    let resumed = orch.resume(id, RunOptions::default()).await.unwrap();
    assert!(resumed.is_completed());
    assert_eq!(summary(&resumed).relations, 1);
}

#[tokio::test]
async fn test_cancel_queued_execution() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), rule_stages());
    let materialized = store.materialize(&source("msg-1", CONTENT)).await.unwrap();
    let input = orch.prepare(&materialized.version, "meetings").await.unwrap();
    let execution = orch.start(input).await.unwrap();

    let cancelled = orch.cancel(execution.id).await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert!(orch.run(execution.id, RunOptions::default()).await.is_err());
}

// ============================================================================
// Progress signals
// ============================================================================

#[tokio::test]
async fn test_progress_signals_follow_activities() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orch = orchestrator(Arc::clone(&store), rule_stages());
    let materialized = store.materialize(&source("msg-1", CONTENT)).await.unwrap();
    let input = orch.prepare(&materialized.version, "meetings").await.unwrap();
    let execution = orch.start(input).await.unwrap();

    let mut subscription = orch.signals().subscribe(execution.id);
    let listener = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(signal) = subscription.recv().await {
            received.push(signal);
        }
        received
    });

    let outcome = orch.run(execution.id, RunOptions::default()).await.unwrap();
    assert!(outcome.is_completed());

    let received = listener.await.unwrap();
    let stages: Vec<Activity> = received.iter().map(|s| s.stage).collect();
    assert_eq!(stages, Activity::ALL.to_vec());
    assert!(received.iter().all(|s| s.status == ProgressStatus::Completed));
    assert!(received.windows(2).all(|w| w[0].progress < w[1].progress));
    assert_eq!(received.last().unwrap().progress, 1.0);
    assert_eq!(orch.signals().topic_count(), 0);

    let recorded = store.list_signals(execution.id).await.unwrap();
    assert_eq!(recorded.len(), Activity::ALL.len());
}

#[tokio::test]
async fn test_signal_log_outage_does_not_fail_workflow() {
    let store: Arc<dyn Store> = Arc::new(SignalOutageStore::default());
    let orch = orchestrator(Arc::clone(&store), rule_stages());
    let materialized = store.materialize(&source("msg-1", CONTENT)).await.unwrap();
    let input = orch.prepare(&materialized.version, "meetings").await.unwrap();
    let execution = orch.start(input).await.unwrap();

    let mut subscription = orch.signals().subscribe(execution.id);
    let listener = tokio::spawn(async move {
        let mut received = 0;
        while subscription.recv().await.is_some() {
            received += 1;
        }
        received
    });

    let outcome = orch.run(execution.id, RunOptions::default()).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(summary(&outcome).relations, 1);

    // Live subscribers still hear every activity
    assert_eq!(listener.await.unwrap(), Activity::ALL.len());
    assert!(store.list_signals(execution.id).await.unwrap().is_empty());
}

// ============================================================================
// Batches
// ============================================================================

/// Store an item as a stopped process leaves it: `processing`, with its
/// execution run up to `stop_after`
async fn processing_item(store: &Arc<dyn Store>, stop_after: Option<Activity>) -> (Uuid, Uuid) {
    let first = orchestrator(Arc::clone(store), rule_stages());
    let materialized = store.materialize(&source("msg-1", CONTENT)).await.unwrap();
    let ontology = registry().load("meetings").await.unwrap();
    let batch = Batch {
        id: Uuid::new_v4(),
        organization_id: org(),
        ontology_id: "meetings".to_string(),
        ontology_hash: ontology.content_hash().to_string(),
        created_at: Utc::now(),
    };
    let item = BatchItem {
        id: Uuid::new_v4(),
        batch_id: batch.id,
        document_id: materialized.document.id,
        document_version_id: materialized.version.id,
        workflow_execution_id: None,
        state: BatchState::Queued,
        attempts: 0,
        last_error: None,
        updated_at: Utc::now(),
    };
    store.create_batch(&batch, std::slice::from_ref(&item)).await.unwrap();

    let input = first.prepare(&materialized.version, "meetings").await.unwrap();
    let execution = first.start(input).await.unwrap();
    store
        .transition_item(item.id, BatchEvent::Start, ItemPatch::execution(execution.id))
        .await
        .unwrap();
    let options = match stop_after {
        Some(activity) => RunOptions::suspend_after(activity),
        None => RunOptions::default(),
    };
    first.run(execution.id, options).await.unwrap();
    (batch.id, execution.id)
}

#[tokio::test]
async fn test_recover_continues_processing_item_after_restart() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let (batch_id, execution_id) = processing_item(&store, Some(Activity::Chunk)).await;

    let batches = BatchOrchestrator::new(Arc::new(orchestrator(Arc::clone(&store), rule_stages())));
    assert_eq!(batches.summary(batch_id).await.unwrap().processing, 1);
    assert_eq!(batches.recover(batch_id).await.unwrap(), 1);

    let summary = batches.wait(batch_id).await.unwrap();
    assert_eq!((summary.completed, summary.processing), (1, 0));
    let item = &store.list_items(batch_id).await.unwrap()[0];
    assert_eq!(item.workflow_execution_id, Some(execution_id));
    assert_eq!(item.attempts, 1);

    // The chunk checkpoint was reused, not recomputed
    let activities = store.list_activities(execution_id).await.unwrap();
    assert_eq!(activities.iter().filter(|a| a.activity == Activity::Chunk).count(), 1);
    assert_eq!(store.list_executions(None).await.unwrap().len(), 1);

    // Nothing left to recover
    assert_eq!(batches.recover(batch_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_recover_settles_item_whose_execution_finished() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let (batch_id, execution_id) = processing_item(&store, None).await;
    let activities_before = store.list_activities(execution_id).await.unwrap().len();

    let batches = BatchOrchestrator::new(Arc::new(orchestrator(Arc::clone(&store), rule_stages())));
    assert_eq!(batches.recover(batch_id).await.unwrap(), 1);
    let summary = batches.wait(batch_id).await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(store.list_activities(execution_id).await.unwrap().len(), activities_before);
}

#[tokio::test]
async fn test_batch_concurrency_is_capped() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let peak = Arc::new(AtomicUsize::new(0));
    let mut stages = rule_stages();
    stages.mentions = Arc::new(OverlapMentions {
        inner: Arc::clone(&stages.mentions),
        in_flight: AtomicUsize::new(0),
        peak: Arc::clone(&peak),
    });
    let batches = BatchOrchestrator::new(Arc::new(orchestrator(Arc::clone(&store), stages)))
        .with_settings(&BatchSettings {
            concurrency: 2,
            max_attempts: 3,
        });

    let sources: Vec<SourceDocument> = (1..=6)
        .map(|day| source(&format!("msg-{day}"), &format!("Jane Doe met with Acme Corp on May {day}.")))
        .collect();
    let batch_id = batches.queue_batch(org(), "meetings", &sources).await.unwrap();
    let summary = batches.wait(batch_id).await.unwrap();

    assert_eq!(summary.completed, 6);
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak in-flight {peak}");
}

#[tokio::test]
async fn test_batch_skips_duplicate_documents() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let batches = BatchOrchestrator::new(Arc::new(orchestrator(Arc::clone(&store), rule_stages())));
    let sources = vec![source("msg-1", CONTENT), source("msg-1", CONTENT)];

    let batch_id = batches.queue_batch(org(), "meetings", &sources).await.unwrap();
    let summary = batches.wait(batch_id).await.unwrap();

    assert_eq!((summary.total, summary.completed, summary.failed), (1, 1, 0));
    assert_eq!(store.list_executions(None).await.unwrap().len(), 1);
}

fn batch_sources() -> Vec<SourceDocument> {
    vec![
        source("msg-1", CONTENT),
        source("msg-2", "Jane Doe met with Acme Corp again on April 9."),
    ]
}

#[tokio::test]
async fn test_batch_completes_all_items() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let batches = BatchOrchestrator::new(Arc::new(orchestrator(Arc::clone(&store), rule_stages())));

    let batch_id = batches.queue_batch(org(), "meetings", &batch_sources()).await.unwrap();
    let summary = batches.wait(batch_id).await.unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 2);
    assert!(summary.is_settled());
    for item in store.list_items(batch_id).await.unwrap() {
        assert_eq!(item.attempts, 1);
        assert!(item.workflow_execution_id.is_some());
    }
}

#[tokio::test]
async fn test_batch_retry_is_safe_to_repeat() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let batches = BatchOrchestrator::new(Arc::new(orchestrator(Arc::clone(&store), flaky_stages(1))))
        .with_settings(&BatchSettings {
            concurrency: 1,
            max_attempts: 3,
        });

    let batch_id = batches.queue_batch(org(), "meetings", &batch_sources()).await.unwrap();
    let summary = batches.wait(batch_id).await.unwrap();
    assert_eq!((summary.completed, summary.failed), (1, 1));

    let failed = store
        .list_items(batch_id)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.state == BatchState::Failed)
        .unwrap();
    assert!(failed.last_error.is_some());
    let execution_id = failed.workflow_execution_id.unwrap();

    let first = batches.retry_failed(batch_id).await.unwrap();
    let second = batches.retry_failed(batch_id).await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(second.retried, 0);

    let summary = batches.wait(batch_id).await.unwrap();
    assert_eq!(summary.completed, 2);

    let item = store.get_item(failed.id).await.unwrap().unwrap();
    assert_eq!(item.attempts, 2);
    assert!(item.last_error.is_none());
    // The retry resumed the same execution
    assert_eq!(item.workflow_execution_id, Some(execution_id));
    assert_eq!(store.list_executions(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_batch_item_abandoned_after_max_attempts() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let batches = BatchOrchestrator::new(Arc::new(orchestrator(Arc::clone(&store), flaky_stages(1))))
        .with_settings(&BatchSettings {
            concurrency: 2,
            max_attempts: 1,
        });

    let batch_id = batches
        .queue_batch(org(), "meetings", &[source("msg-1", CONTENT)])
        .await
        .unwrap();
    assert_eq!(batches.wait(batch_id).await.unwrap().failed, 1);

    let report = batches.retry_failed(batch_id).await.unwrap();
    assert_eq!((report.retried, report.abandoned), (0, 1));

    let summary = batches.summary(batch_id).await.unwrap();
    assert_eq!(summary.abandoned, 1);
    assert!(summary.is_settled());
}

#[tokio::test]
async fn test_batch_rejects_foreign_documents() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let batches = BatchOrchestrator::new(Arc::new(orchestrator(Arc::clone(&store), rule_stages())));
    let foreign = SourceDocument::new(SourceKey::new(Uuid::from_u128(99), "gmail:x", "m"), CONTENT);

    let err = batches.queue_batch(org(), "meetings", &[foreign]).await.unwrap_err();
    assert!(matches!(err, KexError::Validation(_)));
    assert!(matches!(
        batches.summary(Uuid::new_v4()).await.unwrap_err(),
        KexError::NotFound(_)
    ));
}
