//! Relation grounding
//!
//! A relation is rendered as a `"Subject predicate label Object"` statement,
//! embedded, and compared with the embedding of the chunk it came from.
//! Relations below the similarity threshold are dropped before persistence.

use std::collections::HashMap;
use std::sync::Arc;

use kex_core::{Chunk, Entity, KexError, Relation, RelationObject, Result};
use kex_ontology::{split_camel_case, vocab, OntologyContext};
use ndarray::ArrayView1;
use tracing::{debug, info};
use uuid::Uuid;

use crate::embedding::{EmbeddingClient, TaskType};

/// Cosine similarity `dot / (|a| * |b|)`; zero-length vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(KexError::Embedding(format!(
            "dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    let norm = a.dot(&a).sqrt() * b.dot(&b).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Ok(0.0);
    }
    Ok((a.dot(&b) / norm).clamp(-1.0, 1.0))
}

/// Result of comparing one relation against its source chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GroundingOutcome {
    Accepted(f32),
    Rejected(f32),
}

impl GroundingOutcome {
    /// Accept iff `similarity >= threshold`
    pub fn decide(similarity: f32, threshold: f32) -> Self {
        if similarity >= threshold {
            Self::Accepted(similarity)
        } else {
            Self::Rejected(similarity)
        }
    }

    pub fn similarity(&self) -> f32 {
        match self {
            Self::Accepted(s) | Self::Rejected(s) => *s,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// A relation that failed grounding
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRelation {
    pub relation: Relation,
    pub similarity: f32,
}

/// Relations split by grounding outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundingResult {
    /// Accepted relations with `grounding_similarity` set
    pub accepted: Vec<Relation>,
    pub rejected: Vec<RejectedRelation>,
}

/// Natural-language statement for a relation
///
/// Returns `None` when the subject or object entity is unknown.
pub fn relation_statement(
    relation: &Relation,
    entities: &HashMap<Uuid, &Entity>,
    ontology: &OntologyContext,
) -> Option<String> {
    let subject = entities.get(&relation.subject_id)?;
    let label = match ontology.find_property(&relation.predicate) {
        Some(property) => property.display_label(),
        None => split_camel_case(vocab::local_name(&relation.predicate)),
    };
    let object = match &relation.object {
        RelationObject::Entity(id) => entities.get(id)?.name.clone(),
        RelationObject::Literal(value) => value.clone(),
    };
    Some(format!("{} {} {}", subject.name, label, object))
}

/// Grounds relations against their source chunks
pub struct Grounder {
    embedder: Arc<dyn EmbeddingClient>,
    threshold: f32,
}

impl Grounder {
    pub fn new(embedder: Arc<dyn EmbeddingClient>, threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(KexError::Config(format!(
                "grounding threshold {threshold} outside [0, 1]"
            )));
        }
        Ok(Self {
            embedder,
            threshold,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub async fn ground(
        &self,
        chunks: &[Chunk],
        entities: &[Entity],
        relations: Vec<Relation>,
        ontology: &OntologyContext,
    ) -> Result<GroundingResult> {
        let mut result = GroundingResult::default();
        if relations.is_empty() {
            return Ok(result);
        }

        let by_id: HashMap<Uuid, &Entity> = entities.iter().map(|e| (e.id, e)).collect();
        let chunk_texts: HashMap<usize, &str> =
            chunks.iter().map(|c| (c.chunk_index, c.text.as_str())).collect();

        // Relations with an unknown endpoint or chunk cannot be grounded
        let mut pending = Vec::new();
        for relation in relations {
            let statement = relation_statement(&relation, &by_id, ontology);
            match (statement, chunk_texts.get(&relation.chunk_index)) {
                (Some(statement), Some(_)) => pending.push((relation, statement)),
                _ => {
                    debug!(relation = %relation.id, "Relation has no resolvable statement");
                    result.rejected.push(RejectedRelation {
                        relation,
                        similarity: 0.0,
                    });
                }
            }
        }
        if pending.is_empty() {
            return Ok(result);
        }

        let mut chunk_indices: Vec<usize> = pending.iter().map(|(r, _)| r.chunk_index).collect();
        chunk_indices.sort_unstable();
        chunk_indices.dedup();
        let texts: Vec<String> = chunk_indices
            .iter()
            .filter_map(|i| chunk_texts.get(i).map(|t| t.to_string()))
            .collect();
        let chunk_vectors = self
            .embedder
            .embed_batch(&texts, TaskType::RetrievalDocument)
            .await?;
        let chunk_vectors: HashMap<usize, Vec<f32>> =
            chunk_indices.into_iter().zip(chunk_vectors).collect();

        let statements: Vec<String> = pending.iter().map(|(_, s)| s.clone()).collect();
        let statement_vectors = self
            .embedder
            .embed_batch(&statements, TaskType::SemanticSimilarity)
            .await?;

        for ((mut relation, statement), vector) in pending.into_iter().zip(statement_vectors) {
            let similarity = match chunk_vectors.get(&relation.chunk_index) {
                Some(chunk_vector) => cosine_similarity(&vector, chunk_vector)?,
                None => 0.0,
            };
            match GroundingOutcome::decide(similarity, self.threshold) {
                GroundingOutcome::Accepted(s) => {
                    relation.grounding_similarity = Some(s);
                    result.accepted.push(relation);
                }
                GroundingOutcome::Rejected(s) => {
                    debug!(
                        relation = %relation.id,
                        statement = %statement,
                        similarity = s,
                        threshold = self.threshold,
                        "Grounding rejected relation"
                    );
                    result.rejected.push(RejectedRelation {
                        relation,
                        similarity: s,
                    });
                }
            }
        }

        info!(
            accepted = result.accepted.len(),
            rejected = result.rejected.len(),
            threshold = self.threshold,
            "Grounding complete"
        );
        Ok(result)
    }
}
