//! Qdrant implementation for entity vectors

use async_trait::async_trait;
use kex_core::{DatabaseConfig, KexError, Result};
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{EntityVector, VectorMatch, VectorStore};

/// Qdrant vector store implementation
pub struct QdrantStore {
    client: Qdrant,
    collection: String,
    dimension: usize,
}

impl QdrantStore {
    /// Create a new Qdrant connection
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .qdrant_url
            .as_deref()
            .ok_or_else(|| KexError::Config("Qdrant URL required".to_string()))?;
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| KexError::Database(format!("Qdrant connection failed: {e}")))?;

        Ok(Self {
            client,
            collection: config.qdrant_collection.clone(),
            dimension: config.vector_dimension,
        })
    }

    /// Create the collection if it does not exist
    pub async fn init_collection(&self) -> Result<()> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| KexError::Database(format!("Failed to list collections: {e}")))?;

        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);

        if !exists {
            debug!(collection = %self.collection, dimension = self.dimension, "Creating collection");
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| KexError::Database(format!("Failed to create collection: {e}")))?;
        }

        Ok(())
    }
}

/// Payload stored with each vector
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityPayload {
    entity_id: String,
    organization_id: String,
    document_id: String,
    document_version_id: String,
    name: String,
    types: Vec<String>,
}

fn payload_map(
    payload: &EntityPayload,
) -> Result<std::collections::HashMap<String, qdrant_client::qdrant::Value>> {
    let value = serde_json::to_value(payload)?;
    Ok(value
        .as_object()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into()))
        .collect())
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, vectors: &[EntityVector]) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }

        let mut points = Vec::with_capacity(vectors.len());
        for v in vectors {
            if v.vector.len() != self.dimension {
                return Err(KexError::Embedding(format!(
                    "vector for entity {} has dimension {}, collection expects {}",
                    v.id,
                    v.vector.len(),
                    self.dimension
                )));
            }
            let payload = EntityPayload {
                entity_id: v.id.to_string(),
                organization_id: v.organization_id.to_string(),
                document_id: v.document_id.to_string(),
                document_version_id: v.document_version_id.to_string(),
                name: v.name.clone(),
                types: v.types.clone(),
            };
            points.push(PointStruct::new(
                v.id.to_string(),
                v.vector.clone(),
                payload_map(&payload)?,
            ));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|e| KexError::Database(format!("Failed to upsert vectors: {e}")))?;

        Ok(())
    }

    async fn search(
        &self,
        organization_id: Uuid,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>> {
        let filter = Filter::must([Condition::matches(
            "organization_id",
            organization_id.to_string(),
        )]);
        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query.to_vec(), limit as u64)
                    .filter(filter)
                    .with_payload(true),
            )
            .await
            .map_err(|e| KexError::Database(format!("Vector search failed: {e}")))?;

        let uuid_of = |payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
                       key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
        };

        Ok(results
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload;
                Some(VectorMatch {
                    entity_id: uuid_of(&payload, "entity_id")?,
                    document_id: uuid_of(&payload, "document_id")?,
                    document_version_id: uuid_of(&payload, "document_version_id")?,
                    name: payload
                        .get("name")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    score: point.score,
                })
            })
            .collect())
    }

    async fn delete_by_version(&self, document_version_id: Uuid) -> Result<()> {
        let filter = Filter::must([Condition::matches(
            "document_version_id",
            document_version_id.to_string(),
        )]);

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| KexError::Database(format!("Failed to delete vectors: {e}")))?;

        Ok(())
    }
}
