//! kex Store - Evidence-of-record persistence
//!
//! Repositories for:
//! - Documents and immutable document versions
//! - The knowledge graph and its evidence rows (`Evidence.List`)
//! - Workflow executions, the activity audit log, and signals
//! - Batches and their per-document state
//!
//! [`PgStore`] persists to PostgreSQL; [`InMemoryStore`] implements the same
//! contracts for tests and offline runs.

use async_trait::async_trait;
use kex_core::{
    Activity, ActivityRecord, ActivityStatus, Batch, BatchEvent, BatchItem, BulletEvidence,
    DocumentVersion, Entity, EvidenceKind, EvidenceQuery, EvidenceSpan, KexError, KnowledgeGraph,
    MaterializedDocument, Relation, Result, SignalRecord, SourceDocument, StatusPatch,
    WorkflowExecution, WorkflowStatus, validate_span,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

// ============================================================================
// Documents
// ============================================================================

/// Document materialization and version lookup
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Create or reuse the document for `source.key`
    ///
    /// Idempotent on `(organization_id, provider_account_id, source_id)`. The
    /// latest version is reused when its content hash matches; otherwise a
    /// new version is inserted. Version content is never updated.
    async fn materialize(&self, source: &SourceDocument) -> Result<MaterializedDocument>;

    async fn get_version(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Option<DocumentVersion>>;

    /// Number of documents and versions stored for an organization
    async fn count_documents(&self, organization_id: Uuid) -> Result<(usize, usize)>;
}

// ============================================================================
// Evidence
// ============================================================================

/// Rows written by [`EvidenceRepository::persist_graph`]
///
/// Counts only rows that did not exist before; re-persisting the same graph
/// writes nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistReport {
    pub mentions: usize,
    pub entities: usize,
    pub relations: usize,
    pub mention_evidence: usize,
    pub relation_evidence: usize,
}

impl PersistReport {
    pub fn total(&self) -> usize {
        self.mentions + self.entities + self.relations + self.mention_evidence + self.relation_evidence
    }
}

/// The knowledge graph and its provenance
#[async_trait]
pub trait EvidenceRepository: Send + Sync {
    /// Write a graph and its evidence in one transaction
    ///
    /// Every span is checked against the version content first; a graph with
    /// any unresolvable span is rejected whole.
    async fn persist_graph(&self, graph: &KnowledgeGraph) -> Result<PersistReport>;

    /// Store evidence for meeting-prep bullets
    async fn record_bullet_evidence(&self, rows: &[BulletEvidence]) -> Result<()>;

    /// `Evidence.List`
    async fn list_evidence(&self, query: &EvidenceQuery) -> Result<Vec<EvidenceSpan>>;

    async fn list_entities(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Vec<Entity>>;

    async fn list_relations(
        &self,
        organization_id: Uuid,
        document_version_id: Uuid,
    ) -> Result<Vec<Relation>>;
}

/// Check a graph against the version it claims to come from
///
/// Ownership must match, and every mention, relation, and evidence span
/// must read exactly its text from the version content.
pub fn check_graph(graph: &KnowledgeGraph, version: &DocumentVersion) -> Result<()> {
    if version.organization_id != graph.organization_id || version.document_id != graph.document_id {
        return Err(KexError::Validation(format!(
            "graph for document {} does not belong to version {}",
            graph.document_id, version.id
        )));
    }
    for mention in &graph.mentions {
        validate_span(&version.content, mention.start, mention.end, &mention.text)?;
    }
    for relation in &graph.relations {
        validate_span(&version.content, relation.start, relation.end, &relation.text)?;
    }
    graph.validate_evidence(&version.content)
}

/// Canonical `Evidence.List` ordering
pub(crate) fn sort_spans(spans: &mut [EvidenceSpan]) {
    fn rank(kind: EvidenceKind) -> u8 {
        match kind {
            EvidenceKind::Mention => 0,
            EvidenceKind::Relation => 1,
            EvidenceKind::Bullet => 2,
        }
    }
    spans.sort_by(|a, b| {
        a.document_version_id
            .cmp(&b.document_version_id)
            .then(a.start_char.cmp(&b.start_char))
            .then(a.end_char.cmp(&b.end_char))
            .then(rank(a.kind).cmp(&rank(b.kind)))
            .then_with(|| a.text.cmp(&b.text))
    });
}

// ============================================================================
// Workflows
// ============================================================================

/// Values for a new workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecution {
    pub organization_id: Uuid,
    pub workflow_type: String,
    pub version: i32,
    pub input: serde_json::Value,
    pub dedupe_key: String,
}

/// Workflow execution state, activity log, and signals
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Insert a `queued` execution, or return the one with the same dedupe key
    ///
    /// The flag is `true` when a row was inserted.
    async fn create_execution(&self, new: NewExecution) -> Result<(WorkflowExecution, bool)>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>>;

    async fn list_executions(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowExecution>>;

    /// Compare-and-set the status from `from` to `to`
    ///
    /// Fails with `InvalidTransition` if the pair is not in the transition
    /// table or the stored status is no longer `from`.
    async fn transition_status(
        &self,
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
        patch: StatusPatch,
    ) -> Result<WorkflowExecution>;

    /// Advance `current_activity` and store the checkpoint atomically
    ///
    /// Rejects an activity that does not come after the stored one, and
    /// executions that are not `running`.
    async fn complete_activity(
        &self,
        id: Uuid,
        activity: Activity,
        checkpoint: serde_json::Value,
    ) -> Result<()>;

    /// Open an activity attempt in the audit log
    async fn start_activity(
        &self,
        execution_id: Uuid,
        activity: Activity,
        attempt_number: i32,
        input: serde_json::Value,
    ) -> Result<ActivityRecord>;

    /// Close an activity attempt
    async fn finish_activity(
        &self,
        record_id: Uuid,
        status: ActivityStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()>;

    async fn list_activities(&self, execution_id: Uuid) -> Result<Vec<ActivityRecord>>;

    async fn record_signal(
        &self,
        execution_id: Uuid,
        signal_name: &str,
        payload: serde_json::Value,
    ) -> Result<SignalRecord>;

    async fn list_signals(&self, execution_id: Uuid) -> Result<Vec<SignalRecord>>;
}

// ============================================================================
// Batches
// ============================================================================

/// Fields to update together with a batch item transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub workflow_execution_id: Option<Uuid>,
    /// `Some(None)` clears the last error
    pub error: Option<Option<String>>,
}

impl ItemPatch {
    pub fn execution(id: Uuid) -> Self {
        Self {
            workflow_execution_id: Some(id),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            ..Default::default()
        }
    }
}

/// Batch runs and per-document batch state
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create_batch(&self, batch: &Batch, items: &[BatchItem]) -> Result<()>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>>;

    /// Items in insertion order
    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>>;

    async fn get_item(&self, id: Uuid) -> Result<Option<BatchItem>>;

    /// Apply `event` to the item's stored state, compare-and-set
    ///
    /// Entering `processing` increments `attempts`.
    async fn transition_item(&self, id: Uuid, event: BatchEvent, patch: ItemPatch) -> Result<BatchItem>;
}

/// Everything the pipeline persists
pub trait Store: DocumentRepository + EvidenceRepository + WorkflowRepository + BatchRepository {}

impl<T> Store for T where T: DocumentRepository + EvidenceRepository + WorkflowRepository + BatchRepository {}
