//! In-memory vector store for tests and offline runs

use std::collections::HashMap;

use async_trait::async_trait;
use kex_core::Result;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::grounding::cosine_similarity;
use crate::{EntityVector, VectorMatch, VectorStore};

/// Brute-force cosine search over a map of entity vectors
#[derive(Default)]
pub struct InMemoryVectorStore {
    vectors: RwLock<HashMap<Uuid, EntityVector>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vectors.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, vectors: &[EntityVector]) -> Result<()> {
        let mut map = self.vectors.write().await;
        for v in vectors {
            map.insert(v.id, v.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        organization_id: Uuid,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>> {
        let map = self.vectors.read().await;
        let mut matches = Vec::new();
        for v in map.values().filter(|v| v.organization_id == organization_id) {
            matches.push(VectorMatch {
                entity_id: v.id,
                document_id: v.document_id,
                document_version_id: v.document_version_id,
                name: v.name.clone(),
                score: cosine_similarity(query, &v.vector)?,
            });
        }
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete_by_version(&self, document_version_id: Uuid) -> Result<()> {
        self.vectors
            .write()
            .await
            .retain(|_, v| v.document_version_id != document_version_id);
        Ok(())
    }
}
