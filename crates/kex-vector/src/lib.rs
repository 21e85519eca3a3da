//! kex Vector - Embeddings, grounding, and vector storage
//!
//! Provides:
//! - Embedding clients (OpenAI, Ollama, local hashing)
//! - A content-hash keyed embedding cache
//! - Relation grounding by cosine similarity against source chunks
//! - Entity vector storage (Qdrant, in-memory)

use async_trait::async_trait;
use kex_core::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod cache;
pub mod embedding;
pub mod grounding;
pub mod memory_store;
pub mod qdrant_store;

pub use cache::{CacheStats, CacheStatsReport, CachedEmbedder, EmbeddingCache, EmbeddingKey};
pub use embedding::{
    create_embedding_client, EmbeddingClient, LocalHashEmbedding, OllamaEmbedding,
    OpenAiEmbedding, TaskType,
};
pub use grounding::{
    cosine_similarity, relation_statement, Grounder, GroundingOutcome, GroundingResult,
    RejectedRelation,
};
pub use memory_store::InMemoryVectorStore;
pub use qdrant_store::QdrantStore;

/// An entity embedding with the metadata needed to scope searches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVector {
    /// Entity id, also the point id
    pub id: Uuid,
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub name: String,
    pub types: Vec<String>,
    pub vector: Vec<f32>,
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub entity_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub name: String,
    pub score: f32,
}

/// Trait for vector database operations
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace vectors by entity id
    async fn upsert(&self, vectors: &[EntityVector]) -> Result<()>;

    /// Nearest entities within one organization
    async fn search(
        &self,
        organization_id: Uuid,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>>;

    /// Remove every vector extracted from a document version
    async fn delete_by_version(&self, document_version_id: Uuid) -> Result<()>;
}
