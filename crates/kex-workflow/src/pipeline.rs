//! Extraction pipeline activities
//!
//! Each [`Activity`] reads and extends a [`PipelineState`]. The state is the
//! checkpoint: after an activity succeeds the orchestrator persists the whole
//! state, so a resumed execution starts from exactly what the last completed
//! activity produced.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kex_core::{
    content_hash, Activity, AppConfig, Chunk, Entity, ExtractionScope, KexError, KnowledgeGraph,
    Mention, Relation, Result,
};
use kex_extractor::{
    assemble_with_report, chunk, extract_batch, BatchOptions, BatchOutcome, ChunkConfig,
    EntityInput, MentionInput, RelationInput, RetryPolicy, StageSet,
};
use kex_ontology::OntologyContext;
use kex_store::{PersistReport, Store};
use kex_vector::{EmbeddingClient, EntityVector, Grounder, TaskType, VectorStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `workflow_execution.workflow_type` of extraction runs
pub const WORKFLOW_TYPE: &str = "knowledge_extraction";

// ============================================================================
// Execution input and checkpoint
// ============================================================================

/// Stored as `workflow_execution.input`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInput {
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    /// Registry id the ontology is fetched by
    pub ontology_id: String,
    /// Content hash the execution is pinned to
    pub ontology_hash: String,
}

impl WorkflowInput {
    /// One execution per (organization, version, ontology, workflow version)
    pub fn dedupe_key(&self, workflow_version: i32) -> String {
        content_hash(&format!(
            "{}|{}|{}|{}",
            self.organization_id, self.document_version_id, self.ontology_hash, workflow_version
        ))
    }

    pub fn scope(&self, extraction_id: Uuid) -> ExtractionScope {
        ExtractionScope {
            organization_id: self.organization_id,
            document_id: self.document_id,
            document_version_id: self.document_version_id,
            ontology_hash: self.ontology_hash.clone(),
            extraction_id,
        }
    }
}

/// A chunk excluded from this run's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedChunk {
    pub stage: String,
    pub chunk_index: usize,
    pub attempts: u32,
    pub error: String,
}

/// Everything the completed activities have produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub chunks: Vec<Chunk>,
    pub mentions: Vec<Mention>,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub rejected_relations: usize,
    pub skipped_chunks: Vec<SkippedChunk>,
    /// Set by `assemble`; owns the mentions, entities, and relations from then on
    pub graph: Option<KnowledgeGraph>,
    pub persisted: Option<PersistReport>,
    pub indexed: usize,
}

impl PipelineState {
    fn is_skipped(&self, chunk_index: usize) -> bool {
        self.skipped_chunks.iter().any(|s| s.chunk_index == chunk_index)
    }

    /// Record failed chunks and drop what earlier stages produced for them
    fn skip_failed<O>(&mut self, outcome: &BatchOutcome<O>) {
        for failure in &outcome.failures {
            self.skipped_chunks.push(SkippedChunk {
                stage: failure.stage.to_string(),
                chunk_index: failure.chunk_index,
                attempts: failure.attempts,
                error: failure.error.to_string(),
            });
        }
        let skipped: BTreeSet<usize> = self.skipped_chunks.iter().map(|s| s.chunk_index).collect();
        self.mentions.retain(|m| !skipped.contains(&m.chunk_index));
        self.entities.retain(|e| !skipped.contains(&e.chunk_index));
    }

    /// Chunks that every stage so far has succeeded on
    fn live_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(|c| !self.is_skipped(c.chunk_index))
    }

    pub fn summary(&self) -> ExtractionSummary {
        let (mentions, entities, relations) = match &self.graph {
            Some(graph) => (graph.mentions.len(), graph.entities.len(), graph.relations.len()),
            None => (self.mentions.len(), self.entities.len(), self.relations.len()),
        };
        ExtractionSummary {
            chunks: self.chunks.len(),
            mentions,
            entities,
            relations,
            rejected_relations: self.rejected_relations,
            skipped_chunks: self.skipped_chunks.len(),
            persisted: self.persisted.unwrap_or_default(),
            indexed: self.indexed,
        }
    }
}

/// Stored as `workflow_execution.output` on completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionSummary {
    pub chunks: usize,
    pub mentions: usize,
    pub entities: usize,
    pub relations: usize,
    pub rejected_relations: usize,
    pub skipped_chunks: usize,
    pub persisted: PersistReport,
    pub indexed: usize,
}

// ============================================================================
// Pipeline
// ============================================================================

/// The collaborators one extraction run needs
pub struct Pipeline {
    store: Arc<dyn Store>,
    stages: StageSet,
    embedder: Arc<dyn EmbeddingClient>,
    grounder: Grounder,
    vectors: Option<Arc<dyn VectorStore>>,
    chunking: ChunkConfig,
    batch: BatchOptions,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        stages: StageSet,
        embedder: Arc<dyn EmbeddingClient>,
        grounding_threshold: f32,
    ) -> Result<Self> {
        let grounder = Grounder::new(Arc::clone(&embedder), grounding_threshold)?;
        Ok(Self {
            store,
            stages,
            embedder,
            grounder,
            vectors: None,
            chunking: ChunkConfig::default(),
            batch: BatchOptions::default(),
        })
    }

    /// Chunking, stage fan-out, and grounding settings from configuration
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn Store>,
        stages: StageSet,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Result<Self> {
        let extraction = &config.extraction;
        let chunking = ChunkConfig::from(extraction);
        chunking.validate()?;
        Ok(Self::new(store, stages, embedder, config.grounding.threshold)?
            .with_chunking(chunking)
            .with_batch_options(BatchOptions {
                concurrency: extraction.stage_concurrency,
                retry: RetryPolicy::new(
                    extraction.chunk_max_attempts,
                    extraction.retry_initial_backoff_ms,
                    extraction.retry_max_backoff_ms,
                ),
            }))
    }

    /// Store entity embeddings during the `index` activity
    pub fn with_vector_store(mut self, vectors: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_batch_options(mut self, batch: BatchOptions) -> Self {
        self.batch = batch;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run one activity, extending `state`
    ///
    /// Returns a small JSON summary for the activity log. On error `state`
    /// may be partially modified; callers run activities on a copy.
    pub async fn execute(
        &self,
        activity: Activity,
        scope: &Arc<ExtractionScope>,
        ontology: &OntologyContext,
        state: &mut PipelineState,
    ) -> Result<serde_json::Value> {
        match activity {
            Activity::Chunk => self.chunk(scope, state).await,
            Activity::Mentions => self.mentions(scope, ontology, state).await,
            Activity::Entities => self.entities(scope, ontology, state).await,
            Activity::Relations => self.relations(scope, ontology, state).await,
            Activity::Ground => self.ground(ontology, state).await,
            Activity::Assemble => Ok(self.assemble(scope, state)),
            Activity::Persist => self.persist(state).await,
            Activity::Index => self.index(scope, state).await,
        }
    }

    async fn chunk(&self, scope: &ExtractionScope, state: &mut PipelineState) -> Result<serde_json::Value> {
        let version = self
            .store
            .get_version(scope.organization_id, scope.document_version_id)
            .await?
            .ok_or_else(|| {
                KexError::NotFound(format!("document version {}", scope.document_version_id))
            })?;
        if version.document_id != scope.document_id {
            return Err(KexError::Validation(format!(
                "version {} does not belong to document {}",
                version.id, scope.document_id
            )));
        }

        state.chunks = chunk(&version.content, &self.chunking)?.collect();
        debug!(
            version = %version.id,
            bytes = version.content.len(),
            chunks = state.chunks.len(),
            "Chunked document"
        );
        Ok(json!({ "chunks": state.chunks.len(), "bytes": version.content.len() }))
    }

    async fn mentions(
        &self,
        scope: &Arc<ExtractionScope>,
        ontology: &OntologyContext,
        state: &mut PipelineState,
    ) -> Result<serde_json::Value> {
        let inputs: Vec<MentionInput> = state
            .live_chunks()
            .map(|chunk| MentionInput {
                scope: Arc::clone(scope),
                chunk: chunk.clone(),
            })
            .collect();

        let outcome = extract_batch(self.stages.mentions.as_ref(), &inputs, ontology, &self.batch).await;
        state.skip_failed(&outcome);
        let failed = outcome.failures.len();
        state.mentions = outcome.into_outputs()?.into_iter().flat_map(|(_, m)| m).collect();

        Ok(json!({ "mentions": state.mentions.len(), "failedChunks": failed }))
    }

    async fn entities(
        &self,
        scope: &Arc<ExtractionScope>,
        ontology: &OntologyContext,
        state: &mut PipelineState,
    ) -> Result<serde_json::Value> {
        let mut by_chunk = group_by_chunk(&state.mentions, |m| m.chunk_index);
        let inputs: Vec<EntityInput> = state
            .live_chunks()
            .map(|chunk| EntityInput {
                scope: Arc::clone(scope),
                chunk: chunk.clone(),
                mentions: by_chunk.remove(&chunk.chunk_index).unwrap_or_default(),
            })
            .collect();

        let outcome = extract_batch(self.stages.entities.as_ref(), &inputs, ontology, &self.batch).await;
        state.skip_failed(&outcome);
        let failed = outcome.failures.len();
        state.entities = outcome.into_outputs()?.into_iter().flat_map(|(_, e)| e).collect();

        Ok(json!({ "entities": state.entities.len(), "failedChunks": failed }))
    }

    async fn relations(
        &self,
        scope: &Arc<ExtractionScope>,
        ontology: &OntologyContext,
        state: &mut PipelineState,
    ) -> Result<serde_json::Value> {
        let mut mentions = group_by_chunk(&state.mentions, |m| m.chunk_index);
        let mut entities = group_by_chunk(&state.entities, |e| e.chunk_index);
        let inputs: Vec<RelationInput> = state
            .live_chunks()
            .map(|chunk| RelationInput {
                scope: Arc::clone(scope),
                chunk: chunk.clone(),
                entities: entities.remove(&chunk.chunk_index).unwrap_or_default(),
                mentions: mentions.remove(&chunk.chunk_index).unwrap_or_default(),
            })
            .collect();

        let outcome = extract_batch(self.stages.relations.as_ref(), &inputs, ontology, &self.batch).await;
        state.skip_failed(&outcome);
        let failed = outcome.failures.len();
        state.relations = outcome.into_outputs()?.into_iter().flat_map(|(_, r)| r).collect();

        Ok(json!({ "relations": state.relations.len(), "failedChunks": failed }))
    }

    async fn ground(&self, ontology: &OntologyContext, state: &mut PipelineState) -> Result<serde_json::Value> {
        let candidates = std::mem::take(&mut state.relations);
        let result = self
            .grounder
            .ground(&state.chunks, &state.entities, candidates, ontology)
            .await?;
        state.relations = result.accepted;
        state.rejected_relations = result.rejected.len();

        Ok(json!({
            "accepted": state.relations.len(),
            "rejected": state.rejected_relations,
            "threshold": self.grounder.threshold(),
        }))
    }

    fn assemble(&self, scope: &ExtractionScope, state: &mut PipelineState) -> serde_json::Value {
        let (graph, report) = assemble_with_report(
            scope,
            std::mem::take(&mut state.mentions),
            std::mem::take(&mut state.entities),
            std::mem::take(&mut state.relations),
        );
        if !report.is_clean() {
            debug!(
                entities_merged = report.entities_merged,
                entities_dropped = report.entities_dropped,
                relations_dropped = report.relations_dropped,
                mentions_dropped = report.mentions_dropped,
                "Assembly merged or dropped items"
            );
        }
        let output = json!({
            "mentions": graph.mentions.len(),
            "entities": graph.entities.len(),
            "relations": graph.relations.len(),
            "entitiesMerged": report.entities_merged,
        });
        state.graph = Some(graph);
        output
    }

    async fn persist(&self, state: &mut PipelineState) -> Result<serde_json::Value> {
        let graph = assembled(state)?;
        let report = self.store.persist_graph(graph).await?;
        info!(
            version = %graph.document_version_id,
            new_rows = report.total(),
            "Persisted knowledge graph"
        );
        state.persisted = Some(report);
        Ok(serde_json::to_value(report)?)
    }

    async fn index(&self, scope: &ExtractionScope, state: &mut PipelineState) -> Result<serde_json::Value> {
        let Some(vectors) = &self.vectors else {
            return Ok(json!({ "indexed": 0 }));
        };
        let graph = assembled(state)?;
        if graph.entities.is_empty() {
            return Ok(json!({ "indexed": 0 }));
        }

        let names: Vec<String> = graph.entities.iter().map(|e| e.name.clone()).collect();
        let embeddings = self
            .embedder
            .embed_batch(&names, TaskType::RetrievalDocument)
            .await?;
        if embeddings.len() != graph.entities.len() {
            warn!(
                expected = graph.entities.len(),
                got = embeddings.len(),
                "Embedding count mismatch"
            );
            return Err(KexError::Embedding(format!(
                "expected {} embeddings, got {}",
                graph.entities.len(),
                embeddings.len()
            )));
        }

        let points: Vec<EntityVector> = graph
            .entities
            .iter()
            .zip(embeddings)
            .map(|(entity, vector)| EntityVector {
                id: entity.id,
                organization_id: scope.organization_id,
                document_id: scope.document_id,
                document_version_id: scope.document_version_id,
                name: entity.name.clone(),
                types: entity.types.clone(),
                vector,
            })
            .collect();
        vectors.upsert(&points).await?;
        state.indexed = points.len();
        Ok(json!({ "indexed": state.indexed, "model": self.embedder.model_id() }))
    }
}

fn assembled(state: &PipelineState) -> Result<&KnowledgeGraph> {
    state
        .graph
        .as_ref()
        .ok_or_else(|| KexError::Validation("no assembled graph in checkpoint".to_string()))
}

fn group_by_chunk<T: Clone>(items: &[T], key: impl Fn(&T) -> usize) -> BTreeMap<usize, Vec<T>> {
    let mut groups: BTreeMap<usize, Vec<T>> = BTreeMap::new();
    for item in items {
        groups.entry(key(item)).or_default().push(item.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> WorkflowInput {
        WorkflowInput {
            organization_id: Uuid::from_u128(1),
            document_id: Uuid::from_u128(2),
            document_version_id: Uuid::from_u128(3),
            ontology_id: "meetings".to_string(),
            ontology_hash: "abc".to_string(),
        }
    }

    #[test]
    fn test_dedupe_key_covers_version_and_ontology() {
        let base = input();
        assert_eq!(base.dedupe_key(1), input().dedupe_key(1));
        assert_ne!(base.dedupe_key(1), base.dedupe_key(2));

        let mut other_version = input();
        other_version.document_version_id = Uuid::from_u128(4);
        assert_ne!(base.dedupe_key(1), other_version.dedupe_key(1));

        let mut other_ontology = input();
        other_ontology.ontology_hash = "def".to_string();
        assert_ne!(base.dedupe_key(1), other_ontology.dedupe_key(1));
    }

    #[test]
    fn test_input_round_trips_as_camel_case() {
        let value = serde_json::to_value(input()).unwrap();
        assert_eq!(value["ontologyId"], "meetings");
        let back: WorkflowInput = serde_json::from_value(value).unwrap();
        assert_eq!(back, input());
    }

    #[test]
    fn test_summary_prefers_assembled_graph() {
        let mut state = PipelineState::default();
        state.rejected_relations = 2;
        assert_eq!(state.summary().relations, 0);

        state.graph = Some(KnowledgeGraph::default());
        state.indexed = 3;
        let summary = state.summary();
        assert_eq!(summary.entities, 0);
        assert_eq!(summary.rejected_relations, 2);
        assert_eq!(summary.indexed, 3);
    }

    #[test]
    fn test_group_by_chunk() {
        let groups = group_by_chunk(&[(0, "a"), (2, "b"), (0, "c")], |(i, _)| *i);
        assert_eq!(groups[&0], vec![(0, "a"), (0, "c")]);
        assert_eq!(groups[&2], vec![(2, "b")]);
        assert!(!groups.contains_key(&1));
    }
}
