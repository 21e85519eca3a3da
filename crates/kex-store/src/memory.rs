//! In-memory store
//!
//! Behaves like [`crate::PgStore`]: the same idempotency, compare-and-set,
//! and validation rules, with one `RwLock` standing in for transactions.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use kex_core::{
    content_hash, Activity, ActivityRecord, ActivityStatus, Batch, BatchEvent, BatchItem,
    BulletEvidence, Document, DocumentVersion, Entity, EvidenceFilter, EvidenceQuery,
    EvidenceSpan, KexError, KnowledgeGraph, MaterializedDocument, Mention, MentionEvidence,
    Relation, RelationEvidence, Result, SignalRecord, SourceDocument, SourceKey, StatusPatch,
    WorkflowExecution, WorkflowStatus, validate_span,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    check_graph, sort_spans, BatchRepository, DocumentRepository, EvidenceRepository, ItemPatch,
    NewExecution, PersistReport, WorkflowRepository,
};

/// A graph row with the version it was extracted from
#[derive(Debug, Clone)]
struct Scoped<T> {
    organization_id: Uuid,
    document_version_id: Uuid,
    row: T,
}

impl<T> Scoped<T> {
    fn in_graph(graph: &KnowledgeGraph, row: T) -> Self {
        Self {
            organization_id: graph.organization_id,
            document_version_id: graph.document_version_id,
            row,
        }
    }
}

/// Append-only table keyed by id, in insertion order
#[derive(Debug)]
struct Table<T> {
    ids: HashSet<Uuid>,
    rows: Vec<T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            ids: HashSet::new(),
            rows: Vec::new(),
        }
    }
}

impl<T> Table<T> {
    /// Insert unless the id exists; `true` if inserted
    fn insert(&mut self, id: Uuid, row: T) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.rows.push(row);
        true
    }
}

#[derive(Default)]
struct Inner {
    documents: HashMap<Uuid, Document>,
    document_keys: HashMap<SourceKey, Uuid>,
    versions: HashMap<Uuid, DocumentVersion>,

    mentions: Table<Scoped<Mention>>,
    entities: Table<Scoped<Entity>>,
    relations: Table<Scoped<Relation>>,
    mention_evidence: Table<MentionEvidence>,
    relation_evidence: Table<RelationEvidence>,
    bullet_evidence: Table<BulletEvidence>,

    executions: HashMap<Uuid, WorkflowExecution>,
    execution_order: Vec<Uuid>,
    dedupe_keys: HashMap<String, Uuid>,
    activities: Vec<ActivityRecord>,
    signals: Vec<SignalRecord>,

    batches: HashMap<Uuid, Batch>,
    items: Vec<BatchItem>,
}

/// Store backed by process memory
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// Documents
// ============================================================================

#[async_trait]
impl DocumentRepository for InMemoryStore {
    async fn materialize(&self, source: &SourceDocument) -> Result<MaterializedDocument> {
        let mut inner = self.inner.write().await;
        let hash = content_hash(&source.content);
        let now = Utc::now();

        let (document, created_document) = match inner.document_keys.get(&source.key).copied() {
            Some(id) => {
                let document = inner
                    .documents
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| KexError::NotFound(format!("document {id}")))?;
                (document, false)
            }
            None => {
                let document = Document {
                    id: Uuid::new_v4(),
                    organization_id: source.key.organization_id,
                    provider_account_id: source.key.provider_account_id.clone(),
                    source_id: source.key.source_id.clone(),
                    created_at: now,
                };
                inner.document_keys.insert(source.key.clone(), document.id);
                inner.documents.insert(document.id, document.clone());
                (document, true)
            }
        };

        let latest = inner
            .versions
            .values()
            .filter(|v| v.document_id == document.id)
            .max_by_key(|v| v.version_number)
            .cloned();

        if let Some(version) = latest.as_ref().filter(|v| v.content_hash == hash) {
            return Ok(MaterializedDocument {
                document,
                version: version.clone(),
                created_document,
                created_version: false,
            });
        }

        let version = DocumentVersion {
            id: Uuid::new_v4(),
            document_id: document.id,
            organization_id: document.organization_id,
            version_number: latest.map_or(1, |v| v.version_number + 1),
            content_hash: hash,
            content: source.content.clone(),
            created_at: now,
        };
        inner.versions.insert(version.id, version.clone());

        Ok(MaterializedDocument {
            document,
            version,
            created_document,
            created_version: true,
        })
    }

    async fn get_version(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Option<DocumentVersion>> {
        let inner = self.inner.read().await;
        Ok(inner
            .versions
            .get(&document_version_id)
            .filter(|v| v.organization_id == organization_id)
            .cloned())
    }

    async fn count_documents(&self, organization_id: Uuid) -> Result<(usize, usize)> {
        let inner = self.inner.read().await;
        let documents = inner
            .documents
            .values()
            .filter(|d| d.organization_id == organization_id)
            .count();
        let versions = inner
            .versions
            .values()
            .filter(|v| v.organization_id == organization_id)
            .count();
        Ok((documents, versions))
    }
}

// ============================================================================
// Evidence
// ============================================================================

#[async_trait]
impl EvidenceRepository for InMemoryStore {
    async fn persist_graph(&self, graph: &KnowledgeGraph) -> Result<PersistReport> {
        let mut inner = self.inner.write().await;
        let version = inner
            .versions
            .get(&graph.document_version_id)
            .ok_or_else(|| {
                KexError::NotFound(format!("document version {}", graph.document_version_id))
            })?;
        check_graph(graph, version)?;

        let mut report = PersistReport::default();
        for m in &graph.mentions {
            report.mentions += usize::from(inner.mentions.insert(m.id, Scoped::in_graph(graph, m.clone())));
        }
        for e in &graph.entities {
            report.entities += usize::from(inner.entities.insert(e.id, Scoped::in_graph(graph, e.clone())));
        }
        for r in &graph.relations {
            report.relations += usize::from(inner.relations.insert(r.id, Scoped::in_graph(graph, r.clone())));
        }
        for row in &graph.mention_evidence {
            report.mention_evidence += usize::from(inner.mention_evidence.insert(row.id, row.clone()));
        }
        for row in &graph.relation_evidence {
            report.relation_evidence +=
                usize::from(inner.relation_evidence.insert(row.id, row.clone()));
        }
        Ok(report)
    }

    async fn record_bullet_evidence(&self, rows: &[BulletEvidence]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for row in rows {
            let version = inner
                .versions
                .get(&row.document_version_id)
                .filter(|v| {
                    v.organization_id == row.organization_id && v.document_id == row.document_id
                })
                .ok_or_else(|| {
                    KexError::NotFound(format!("document version {}", row.document_version_id))
                })?;
            validate_span(&version.content, row.start_char, row.end_char, &row.text)?;
        }
        for row in rows {
            inner.bullet_evidence.insert(row.id, row.clone());
        }
        Ok(())
    }

    async fn list_evidence(&self, query: &EvidenceQuery) -> Result<Vec<EvidenceSpan>> {
        let inner = self.inner.read().await;
        let org = query.organization_id;
        let mut spans: Vec<EvidenceSpan> = match query.filter {
            EvidenceFilter::EntityId(id) => inner
                .mention_evidence
                .rows
                .iter()
                .filter(|r| r.organization_id == org && r.entity_id == id)
                .map(EvidenceSpan::from)
                .collect(),
            EvidenceFilter::RelationId(id) => inner
                .relation_evidence
                .rows
                .iter()
                .filter(|r| r.organization_id == org && r.relation_id == id)
                .map(EvidenceSpan::from)
                .collect(),
            EvidenceFilter::MeetingPrepBulletId(id) => inner
                .bullet_evidence
                .rows
                .iter()
                .filter(|r| r.organization_id == org && r.bullet_id == id)
                .map(EvidenceSpan::from)
                .collect(),
            EvidenceFilter::DocumentId(id) => {
                let mentions = inner
                    .mention_evidence
                    .rows
                    .iter()
                    .filter(|r| r.organization_id == org && r.document_id == id)
                    .map(EvidenceSpan::from);
                let relations = inner
                    .relation_evidence
                    .rows
                    .iter()
                    .filter(|r| r.organization_id == org && r.document_id == id)
                    .map(EvidenceSpan::from);
                let bullets = inner
                    .bullet_evidence
                    .rows
                    .iter()
                    .filter(|r| r.organization_id == org && r.document_id == id)
                    .map(EvidenceSpan::from);
                mentions.chain(relations).chain(bullets).collect()
            }
        };
        sort_spans(&mut spans);
        Ok(spans)
    }

    async fn list_entities(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entities
            .rows
            .iter()
            .filter(|s| {
                s.organization_id == organization_id && s.document_version_id == document_version_id
            })
            .map(|s| s.row.clone())
            .collect())
    }

    async fn list_relations(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Vec<Relation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relations
            .rows
            .iter()
            .filter(|s| {
                s.organization_id == organization_id && s.document_version_id == document_version_id
            })
            .map(|s| s.row.clone())
            .collect())
    }
}

// ============================================================================
// Workflows
// ============================================================================

fn status_mismatch(current: WorkflowStatus, to: WorkflowStatus) -> KexError {
    KexError::InvalidTransition {
        machine: "workflow",
        from: current.to_string(),
        event: to.to_string(),
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryStore {
    async fn create_execution(&self, new: NewExecution) -> Result<(WorkflowExecution, bool)> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .dedupe_keys
            .get(&new.dedupe_key)
            .and_then(|id| inner.executions.get(id))
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let execution = WorkflowExecution {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            workflow_type: new.workflow_type,
            version: new.version,
            status: WorkflowStatus::Queued,
            current_activity: None,
            checkpoint: None,
            input: new.input,
            output: None,
            error: None,
            dedupe_key: new.dedupe_key,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.dedupe_keys.insert(execution.dedupe_key.clone(), execution.id);
        inner.execution_order.push(execution.id);
        inner.executions.insert(execution.id, execution.clone());
        Ok((execution, true))
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>> {
        Ok(self.inner.read().await.executions.get(&id).cloned())
    }

    async fn list_executions(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowExecution>> {
        let inner = self.inner.read().await;
        Ok(inner
            .execution_order
            .iter()
            .filter_map(|id| inner.executions.get(id))
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
        patch: StatusPatch,
    ) -> Result<WorkflowExecution> {
        from.validate_transition(to)?;
        let mut inner = self.inner.write().await;
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or_else(|| KexError::NotFound(format!("workflow execution {id}")))?;
        if execution.status != from {
            return Err(status_mismatch(execution.status, to));
        }

        let now = Utc::now();
        execution.status = to;
        if let Some(output) = patch.output {
            execution.output = Some(output);
        }
        if let Some(error) = patch.error {
            execution.error = error;
        }
        if patch.mark_started && execution.started_at.is_none() {
            execution.started_at = Some(now);
        }
        if patch.mark_completed {
            execution.completed_at = Some(now);
        }
        execution.updated_at = now;
        Ok(execution.clone())
    }

    async fn complete_activity(
        &self,
        id: Uuid,
        activity: Activity,
        checkpoint: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or_else(|| KexError::NotFound(format!("workflow execution {id}")))?;
        if execution.status != WorkflowStatus::Running {
            return Err(KexError::Validation(format!(
                "execution {id} is {}, not running",
                execution.status
            )));
        }
        if execution.current_activity.is_some_and(|current| activity <= current) {
            return Err(KexError::Validation(format!(
                "checkpoint for {activity} would not advance past {}",
                execution.current_activity.map_or("none", |a| a.as_str())
            )));
        }
        execution.current_activity = Some(activity);
        execution.checkpoint = Some(checkpoint);
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn start_activity(
        &self,
        execution_id: Uuid,
        activity: Activity,
        attempt_number: i32,
        input: serde_json::Value,
    ) -> Result<ActivityRecord> {
        let record = ActivityRecord {
            id: Uuid::new_v4(),
            workflow_execution_id: execution_id,
            activity,
            status: ActivityStatus::Running,
            attempt_number,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.inner.write().await.activities.push(record.clone());
        Ok(record)
    }

    async fn finish_activity(
        &self,
        record_id: Uuid,
        status: ActivityStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .activities
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| KexError::NotFound(format!("activity record {record_id}")))?;
        record.status = status;
        record.output = output;
        record.error = error;
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn list_activities(&self, execution_id: Uuid) -> Result<Vec<ActivityRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .activities
            .iter()
            .filter(|r| r.workflow_execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn record_signal(
        &self,
        execution_id: Uuid,
        signal_name: &str,
        payload: serde_json::Value,
    ) -> Result<SignalRecord> {
        let record = SignalRecord {
            id: Uuid::new_v4(),
            workflow_execution_id: execution_id,
            signal_name: signal_name.to_string(),
            payload,
            created_at: Utc::now(),
        };
        self.inner.write().await.signals.push(record.clone());
        Ok(record)
    }

    async fn list_signals(&self, execution_id: Uuid) -> Result<Vec<SignalRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .signals
            .iter()
            .filter(|s| s.workflow_execution_id == execution_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Batches
// ============================================================================

#[async_trait]
impl BatchRepository for InMemoryStore {
    async fn create_batch(&self, batch: &Batch, items: &[BatchItem]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.batches.contains_key(&batch.id) {
            return Err(KexError::Validation(format!("batch {} already exists", batch.id)));
        }
        inner.batches.insert(batch.id, batch.clone());
        inner.items.extend(items.iter().cloned());
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        Ok(self.inner.read().await.batches.get(&id).cloned())
    }

    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        let inner = self.inner.read().await;
        Ok(inner
            .items
            .iter()
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<BatchItem>> {
        let inner = self.inner.read().await;
        Ok(inner.items.iter().find(|i| i.id == id).cloned())
    }

    async fn transition_item(&self, id: Uuid, event: BatchEvent, patch: ItemPatch) -> Result<BatchItem> {
        let mut inner = self.inner.write().await;
        let item = inner
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| KexError::NotFound(format!("batch item {id}")))?;

        let next = item.state.apply(event)?;
        if next == kex_core::BatchState::Processing {
            item.attempts += 1;
        }
        item.state = next;
        if let Some(execution_id) = patch.workflow_execution_id {
            item.workflow_execution_id = Some(execution_id);
        }
        if let Some(error) = patch.error {
            item.last_error = error;
        }
        item.updated_at = Utc::now();
        Ok(item.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kex_core::{BatchState, EvidenceKind, RelationObject};

    const CONTENT: &str = "Jane Doe met with Acme Corp on March 3.";

    fn source(org: Uuid, content: &str) -> SourceDocument {
        SourceDocument::new(SourceKey::new(org, "gmail:jane", "msg-1"), content)
    }

    /// Jane Doe (0..8), Acme Corp (18..27), meetingWith over 0..27
    fn graph(version: &DocumentVersion) -> KnowledgeGraph {
        let mention = |start: usize, end: usize| Mention {
            id: Uuid::new_v4(),
            chunk_index: 0,
            text: CONTENT[start..end].to_string(),
            start,
            end,
            candidate_types: vec!["ex:Person".to_string()],
            confidence: 0.9,
            source: "test".to_string(),
        };
        let jane_m = mention(0, 8);
        let acme_m = mention(18, 27);
        let entity = |m: &Mention| Entity {
            id: Uuid::new_v4(),
            chunk_index: 0,
            mention_ids: vec![m.id],
            name: m.text.clone(),
            types: m.candidate_types.clone(),
            attributes: Default::default(),
            confidence: 0.9,
            grounding_confidence: Some(0.85),
        };
        let jane = entity(&jane_m);
        let acme = entity(&acme_m);
        let relation = Relation {
            id: Uuid::new_v4(),
            chunk_index: 0,
            subject_id: jane.id,
            predicate: "ex:meetingWith".to_string(),
            object: RelationObject::Entity(acme.id),
            confidence: 0.8,
            start: 0,
            end: 27,
            text: CONTENT[0..27].to_string(),
            grounding_similarity: Some(0.85),
            source: "test".to_string(),
        };
        let mention_evidence = [(&jane_m, &jane), (&acme_m, &acme)]
            .into_iter()
            .map(|(m, e)| MentionEvidence {
                id: Uuid::new_v4(),
                organization_id: version.organization_id,
                entity_id: e.id,
                mention_id: m.id,
                document_id: version.document_id,
                document_version_id: version.id,
                start_char: m.start,
                end_char: m.end,
                text: m.text.clone(),
                confidence: Some(m.confidence),
                extraction_id: None,
                source: "test".to_string(),
            })
            .collect();
        let relation_evidence = vec![RelationEvidence {
            id: Uuid::new_v4(),
            organization_id: version.organization_id,
            relation_id: relation.id,
            document_id: version.document_id,
            document_version_id: version.id,
            start_char: 0,
            end_char: 27,
            text: relation.text.clone(),
            confidence: Some(0.8),
            extraction_id: None,
            source: "test".to_string(),
        }];
        KnowledgeGraph {
            organization_id: version.organization_id,
            document_id: version.document_id,
            document_version_id: version.id,
            extraction_id: Uuid::new_v4(),
            ontology_hash: "h".to_string(),
            mentions: vec![jane_m, acme_m],
            entities: vec![jane, acme],
            relations: vec![relation],
            mention_evidence,
            relation_evidence,
        }
    }

    #[tokio::test]
    async fn test_materialize_idempotent() {
        let store = InMemoryStore::new();
        let org = Uuid::new_v4();
        let first = store.materialize(&source(org, CONTENT)).await.unwrap();
        assert!(first.created_document && first.created_version);

        let second = store.materialize(&source(org, CONTENT)).await.unwrap();
        assert!(!second.created_document && !second.created_version);
        assert_eq!(second.version.id, first.version.id);
        assert_eq!(store.count_documents(org).await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_changed_content_creates_new_version() {
        let store = InMemoryStore::new();
        let org = Uuid::new_v4();
        let v1 = store.materialize(&source(org, CONTENT)).await.unwrap();
        let v2 = store.materialize(&source(org, "Updated body.")).await.unwrap();
        assert!(!v2.created_document && v2.created_version);
        assert_eq!(v2.version.version_number, 2);

        // The first version's content is untouched
        let old = store.get_version(org, v1.version.id).await.unwrap().unwrap();
        assert_eq!(old.content, CONTENT);
        assert!(store.get_version(Uuid::new_v4(), v1.version.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_graph_and_list_evidence() {
        let store = InMemoryStore::new();
        let org = Uuid::new_v4();
        let doc = store.materialize(&source(org, CONTENT)).await.unwrap();
        let graph = graph(&doc.version);

        let report = store.persist_graph(&graph).await.unwrap();
        assert_eq!(report.entities, 2);
        assert_eq!(report.relation_evidence, 1);
        // Re-persisting writes nothing new
        assert_eq!(store.persist_graph(&graph).await.unwrap().total(), 0);

        let jane = &graph.entities[0];
        let spans = store.list_evidence(&EvidenceQuery::entity(org, jane.id)).await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "Jane Doe");
        assert_eq!((spans[0].start_char, spans[0].end_char), (0, 8));
        assert_eq!(spans[0].kind, EvidenceKind::Mention);

        let relation = &graph.relations[0];
        let spans = store
            .list_evidence(&EvidenceQuery::relation(org, relation.id))
            .await
            .unwrap();
        assert_eq!(spans[0].text, "Jane Doe met with Acme Corp");

        let all = store
            .list_evidence(&EvidenceQuery::document(org, doc.document.id))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind, EvidenceKind::Mention);
        assert_eq!(all[1].kind, EvidenceKind::Relation);

        // Other organizations see nothing
        let foreign = store
            .list_evidence(&EvidenceQuery::entity(Uuid::new_v4(), jane.id))
            .await
            .unwrap();
        assert!(foreign.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_rows_are_scoped_to_graph() {
        let store = InMemoryStore::new();
        let org = Uuid::new_v4();
        let doc = store.materialize(&source(org, CONTENT)).await.unwrap();
        let other = store.materialize(&source(org, "Updated body.")).await.unwrap();
        store.persist_graph(&graph(&doc.version)).await.unwrap();

        assert_eq!(store.list_entities(org, doc.version.id).await.unwrap().len(), 2);
        assert_eq!(store.list_relations(org, doc.version.id).await.unwrap().len(), 1);
        assert!(store.list_entities(org, other.version.id).await.unwrap().is_empty());
        assert!(store.list_relations(org, other.version.id).await.unwrap().is_empty());
        let stranger = Uuid::new_v4();
        assert!(store.list_entities(stranger, doc.version.id).await.unwrap().is_empty());
        assert!(store.list_relations(stranger, doc.version.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_rejects_drifted_span() {
        let store = InMemoryStore::new();
        let org = Uuid::new_v4();
        let doc = store.materialize(&source(org, CONTENT)).await.unwrap();
        let mut graph = graph(&doc.version);
        graph.mention_evidence[0].end_char = 9;

        assert!(matches!(
            store.persist_graph(&graph).await,
            Err(KexError::Validation(_))
        ));
        assert!(store.list_entities(org, doc.version.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bullet_evidence() {
        let store = InMemoryStore::new();
        let org = Uuid::new_v4();
        let doc = store.materialize(&source(org, CONTENT)).await.unwrap();
        let bullet_id = Uuid::new_v4();
        let row = BulletEvidence {
            id: Uuid::new_v4(),
            organization_id: org,
            bullet_id,
            document_id: doc.document.id,
            document_version_id: doc.version.id,
            start_char: 31,
            end_char: 38,
            text: "March 3".to_string(),
            confidence: None,
            source: "meeting-prep".to_string(),
        };
        store.record_bullet_evidence(&[row.clone()]).await.unwrap();
        let spans = store.list_evidence(&EvidenceQuery::bullet(org, bullet_id)).await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, EvidenceKind::Bullet);

        let bad = BulletEvidence {
            text: "March 4".to_string(),
            ..row
        };
        assert!(store.record_bullet_evidence(&[bad]).await.is_err());
    }

    fn new_execution(key: &str) -> NewExecution {
        NewExecution {
            organization_id: Uuid::new_v4(),
            workflow_type: "knowledge_extraction".to_string(),
            version: 1,
            input: serde_json::json!({}),
            dedupe_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_execution_dedupe_and_cas() {
        let store = InMemoryStore::new();
        let (exec, created) = store.create_execution(new_execution("k")).await.unwrap();
        assert!(created);
        let (again, created) = store.create_execution(new_execution("k")).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, exec.id);

        let running = store
            .transition_status(exec.id, WorkflowStatus::Queued, WorkflowStatus::Running, StatusPatch::started())
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        // Stale compare-and-set
        let stale = store
            .transition_status(exec.id, WorkflowStatus::Queued, WorkflowStatus::Running, StatusPatch::started())
            .await;
        assert!(matches!(stale, Err(KexError::InvalidTransition { .. })));

        store
            .transition_status(
                exec.id,
                WorkflowStatus::Running,
                WorkflowStatus::Completed,
                StatusPatch::completed(serde_json::json!({"ok": true})),
            )
            .await
            .unwrap();
        let back = store
            .transition_status(exec.id, WorkflowStatus::Completed, WorkflowStatus::Running, StatusPatch::started())
            .await;
        assert!(back.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_monotonic() {
        let store = InMemoryStore::new();
        let (exec, _) = store.create_execution(new_execution("m")).await.unwrap();
        assert!(store
            .complete_activity(exec.id, Activity::Chunk, serde_json::json!({}))
            .await
            .is_err());

        store
            .transition_status(exec.id, WorkflowStatus::Queued, WorkflowStatus::Running, StatusPatch::started())
            .await
            .unwrap();
        store
            .complete_activity(exec.id, Activity::Chunk, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        store
            .complete_activity(exec.id, Activity::Mentions, serde_json::json!({"n": 2}))
            .await
            .unwrap();
        assert!(store
            .complete_activity(exec.id, Activity::Mentions, serde_json::json!({"n": 3}))
            .await
            .is_err());
        assert!(store
            .complete_activity(exec.id, Activity::Chunk, serde_json::json!({"n": 4}))
            .await
            .is_err());

        let exec = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(exec.current_activity, Some(Activity::Mentions));
        assert_eq!(exec.checkpoint, Some(serde_json::json!({"n": 2})));
    }

    #[tokio::test]
    async fn test_activity_log() {
        let store = InMemoryStore::new();
        let (exec, _) = store.create_execution(new_execution("a")).await.unwrap();
        let record = store
            .start_activity(exec.id, Activity::Chunk, 1, serde_json::json!({"len": 39}))
            .await
            .unwrap();
        store
            .finish_activity(record.id, ActivityStatus::Completed, Some(serde_json::json!({"chunks": 1})), None)
            .await
            .unwrap();
        let log = store.list_activities(exec.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, ActivityStatus::Completed);
        assert!(log[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_batch_item_transitions() {
        let store = InMemoryStore::new();
        let batch = Batch {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            ontology_id: "meetings".to_string(),
            ontology_hash: "h".to_string(),
            created_at: Utc::now(),
        };
        let item = BatchItem {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            document_id: Uuid::new_v4(),
            document_version_id: Uuid::new_v4(),
            workflow_execution_id: None,
            state: BatchState::Queued,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        };
        store.create_batch(&batch, &[item.clone()]).await.unwrap();

        let exec_id = Uuid::new_v4();
        let processing = store
            .transition_item(item.id, BatchEvent::Start, ItemPatch::execution(exec_id))
            .await
            .unwrap();
        assert_eq!(processing.state, BatchState::Processing);
        assert_eq!(processing.attempts, 1);
        assert_eq!(processing.workflow_execution_id, Some(exec_id));

        let failed = store
            .transition_item(item.id, BatchEvent::Fail, ItemPatch::error("boom"))
            .await
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert!(store
            .transition_item(item.id, BatchEvent::Complete, ItemPatch::default())
            .await
            .is_err());
        store
            .transition_item(item.id, BatchEvent::Retry, ItemPatch::default())
            .await
            .unwrap();
        let again = store
            .transition_item(item.id, BatchEvent::Start, ItemPatch::default())
            .await
            .unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(store.list_items(batch.id).await.unwrap().len(), 1);
    }
}
