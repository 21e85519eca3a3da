//! Knowledge-graph, document, and evidence models
//!
//! Offsets are UTF-8 byte offsets into `DocumentVersion::content` and always
//! fall on char boundaries, so `&content[start..end]` is the exact span text.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{KexError, Result};

// ============================================================================
// Documents
// ============================================================================

/// Idempotency key at the document-materialization boundary
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub organization_id: Uuid,
    pub provider_account_id: String,
    pub source_id: String,
}

impl SourceKey {
    pub fn new(
        organization_id: Uuid,
        provider_account_id: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id,
            provider_account_id: provider_account_id.into(),
            source_id: source_id.into(),
        }
    }
}

/// A source document (one per `SourceKey`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider_account_id: String,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable content snapshot of a document
///
/// `content` never changes once the row exists; a changed source produces a
/// new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub organization_id: Uuid,
    pub version_number: i32,
    pub content_hash: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Result of materializing a source document
#[derive(Debug, Clone)]
pub struct MaterializedDocument {
    pub document: Document,
    pub version: DocumentVersion,
    /// A new `Document` row was inserted
    pub created_document: bool,
    /// A new `DocumentVersion` row was inserted
    pub created_version: bool,
}

/// Source text submitted for extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub key: SourceKey,
    pub content: String,
}

impl SourceDocument {
    pub fn new(key: SourceKey, content: impl Into<String>) -> Self {
        Self {
            key,
            content: content.into(),
        }
    }
}

// ============================================================================
// Extraction Models
// ============================================================================

/// Identity of one extraction run, used to derive stable ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionScope {
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub ontology_hash: String,
    /// Workflow execution that produced the output
    pub extraction_id: Uuid,
}

/// A span of source text handed to the extraction stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// Absolute offset of `text` in the document version
    pub start_offset: usize,
    pub chunk_index: usize,
}

impl Chunk {
    /// Absolute end offset (exclusive)
    pub fn end_offset(&self) -> usize {
        self.start_offset + self.text.len()
    }
}

/// A typed surface span found in one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub id: Uuid,
    pub chunk_index: usize,
    pub text: String,
    /// Absolute start offset
    pub start: usize,
    /// Absolute end offset (exclusive)
    pub end: usize,
    /// Ontology class IRIs, sorted
    pub candidate_types: Vec<String>,
    pub confidence: f32,
    /// Stage implementation that produced the mention
    pub source: String,
}

/// One or more merged mentions with a set of ontology types
///
/// Entities reference mentions by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub chunk_index: usize,
    pub mention_ids: Vec<Uuid>,
    /// Canonical surface text
    pub name: String,
    /// Ontology class IRIs, sorted
    pub types: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub confidence: f32,
    #[serde(default)]
    pub grounding_confidence: Option<f32>,
}

/// Object of a relation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RelationObject {
    Entity(Uuid),
    Literal(String),
}

impl RelationObject {
    pub fn entity_id(&self) -> Option<Uuid> {
        match self {
            Self::Entity(id) => Some(*id),
            Self::Literal(_) => None,
        }
    }
}

/// A typed edge `(subject, predicate, object)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: Uuid,
    pub chunk_index: usize,
    pub subject_id: Uuid,
    /// Ontology property IRI
    pub predicate: String,
    pub object: RelationObject,
    pub confidence: f32,
    /// Absolute evidence span start
    pub start: usize,
    /// Absolute evidence span end (exclusive)
    pub end: usize,
    /// Evidence span text
    pub text: String,
    /// Cosine similarity assigned by grounding
    #[serde(default)]
    pub grounding_similarity: Option<f32>,
    pub source: String,
}

// ============================================================================
// Evidence
// ============================================================================

/// Provenance row for one mention of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionEvidence {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub entity_id: Uuid,
    pub mention_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub confidence: Option<f32>,
    pub extraction_id: Option<Uuid>,
    pub source: String,
}

/// Provenance row for a relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEvidence {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub relation_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub confidence: Option<f32>,
    pub extraction_id: Option<Uuid>,
    pub source: String,
}

/// Provenance row for a meeting-prep bullet produced by a reporting collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulletEvidence {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub bullet_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub confidence: Option<f32>,
    pub source: String,
}

/// Kind of evidence returned by `Evidence.List`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Mention,
    Relation,
    Bullet,
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mention => write!(f, "mention"),
            Self::Relation => write!(f, "relation"),
            Self::Bullet => write!(f, "bullet"),
        }
    }
}

/// One element of an `Evidence.List` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceSpan {
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub confidence: Option<f32>,
    pub kind: EvidenceKind,
    pub source: String,
}

impl From<&MentionEvidence> for EvidenceSpan {
    fn from(row: &MentionEvidence) -> Self {
        Self {
            document_id: row.document_id,
            document_version_id: row.document_version_id,
            start_char: row.start_char,
            end_char: row.end_char,
            text: row.text.clone(),
            confidence: row.confidence,
            kind: EvidenceKind::Mention,
            source: row.source.clone(),
        }
    }
}

impl From<&RelationEvidence> for EvidenceSpan {
    fn from(row: &RelationEvidence) -> Self {
        Self {
            document_id: row.document_id,
            document_version_id: row.document_version_id,
            start_char: row.start_char,
            end_char: row.end_char,
            text: row.text.clone(),
            confidence: row.confidence,
            kind: EvidenceKind::Relation,
            source: row.source.clone(),
        }
    }
}

impl From<&BulletEvidence> for EvidenceSpan {
    fn from(row: &BulletEvidence) -> Self {
        Self {
            document_id: row.document_id,
            document_version_id: row.document_version_id,
            start_char: row.start_char,
            end_char: row.end_char,
            text: row.text.clone(),
            confidence: row.confidence,
            kind: EvidenceKind::Bullet,
            source: row.source.clone(),
        }
    }
}

/// Filter of an `Evidence.List` request; exactly one per request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvidenceFilter {
    EntityId(Uuid),
    RelationId(Uuid),
    MeetingPrepBulletId(Uuid),
    DocumentId(Uuid),
}

/// `Evidence.List` request, always scoped by organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceQuery {
    pub organization_id: Uuid,
    pub filter: EvidenceFilter,
}

impl EvidenceQuery {
    pub fn entity(organization_id: Uuid, entity_id: Uuid) -> Self {
        Self {
            organization_id,
            filter: EvidenceFilter::EntityId(entity_id),
        }
    }

    pub fn relation(organization_id: Uuid, relation_id: Uuid) -> Self {
        Self {
            organization_id,
            filter: EvidenceFilter::RelationId(relation_id),
        }
    }

    pub fn bullet(organization_id: Uuid, bullet_id: Uuid) -> Self {
        Self {
            organization_id,
            filter: EvidenceFilter::MeetingPrepBulletId(bullet_id),
        }
    }

    pub fn document(organization_id: Uuid, document_id: Uuid) -> Self {
        Self {
            organization_id,
            filter: EvidenceFilter::DocumentId(document_id),
        }
    }
}

/// Check that `[start, end)` is a non-empty span of `content` whose text is
/// exactly `text`
pub fn validate_span(content: &str, start: usize, end: usize, text: &str) -> Result<()> {
    if start >= end || end > content.len() {
        return Err(KexError::Validation(format!(
            "span {start}..{end} out of bounds for content of length {}",
            content.len()
        )));
    }
    match content.get(start..end) {
        Some(slice) if slice == text => Ok(()),
        Some(slice) => Err(KexError::Validation(format!(
            "span {start}..{end} reads {slice:?}, expected {text:?}"
        ))),
        None => Err(KexError::Validation(format!(
            "span {start}..{end} is not on a char boundary"
        ))),
    }
}

// ============================================================================
// Knowledge Graph
// ============================================================================

/// The assembled output of one extraction run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub extraction_id: Uuid,
    pub ontology_hash: String,
    pub mentions: Vec<Mention>,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub mention_evidence: Vec<MentionEvidence>,
    pub relation_evidence: Vec<RelationEvidence>,
}

impl KnowledgeGraph {
    pub fn entity(&self, id: Uuid) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn entity_by_name(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Check every evidence row against the version content, and that every
    /// entity and relation has at least one evidence row.
    pub fn validate_evidence(&self, content: &str) -> Result<()> {
        for row in &self.mention_evidence {
            validate_span(content, row.start_char, row.end_char, &row.text)?;
        }
        for row in &self.relation_evidence {
            validate_span(content, row.start_char, row.end_char, &row.text)?;
        }
        for entity in &self.entities {
            if !self.mention_evidence.iter().any(|e| e.entity_id == entity.id) {
                return Err(KexError::Validation(format!(
                    "entity {} has no mention evidence",
                    entity.id
                )));
            }
        }
        for relation in &self.relations {
            if !self
                .relation_evidence
                .iter()
                .any(|e| e.relation_id == relation.id)
            {
                return Err(KexError::Validation(format!(
                    "relation {} has no relation evidence",
                    relation.id
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
