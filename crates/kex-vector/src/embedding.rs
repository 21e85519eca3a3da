//! Embedding clients
//!
//! Supports OpenAI and Ollama embedding APIs, plus a deterministic local
//! feature-hashing embedder for offline runs.

use async_trait::async_trait;
use kex_core::{KexError, LlmConfig, LlmProvider, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

// ============================================================================
// Embedding Trait
// ============================================================================

/// What an embedding will be used for
///
/// Advisory: providers that distinguish query and document embeddings may
/// use it. It is not part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RetrievalDocument,
    RetrievalQuery,
    SemanticSimilarity,
    Clustering,
}

/// Trait for embedding generation
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str, task: TaskType) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, in input order
    async fn embed_batch(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>>;

    /// Identifier of the model; part of the cache key
    fn model_id(&self) -> &str;

    /// Get embedding dimension
    fn dimension(&self) -> usize;
}

// ============================================================================
// OpenAI Embedding Client
// ============================================================================

/// OpenAI embedding API client
pub struct OpenAiEmbedding {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAiEmbedding {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimension = match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };

        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model,
            dimension,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| KexError::Config("OpenAI API key required".to_string()))?;

        let mut client = Self::new(api_key.clone(), config.embedding_model.clone());
        if let Some(url) = &config.openai_base_url {
            client.base_url = url.clone();
        }
        Ok(client)
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedding {
    async fn embed(&self, text: &str, task: TaskType) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text.to_string()], task).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| KexError::Embedding("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String], _task: TaskType) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = OpenAiEmbeddingRequest {
            input: texts,
            model: &self.model,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| KexError::Embedding(format!("Embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(KexError::Embedding(format!(
                "OpenAI embedding error: {error_text}"
            )));
        }

        let result: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| KexError::Embedding(format!("Failed to parse embedding response: {e}")))?;

        if result.data.len() != texts.len() {
            return Err(KexError::Embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                result.data.len()
            )));
        }

        let mut embeddings = result.data;
        embeddings.sort_by_key(|e| e.index);
        Ok(embeddings.into_iter().map(|e| e.embedding).collect())
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Ollama Embedding Client
// ============================================================================

/// Ollama embedding API client
pub struct OllamaEmbedding {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedding {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimension = match model.as_str() {
            "mxbai-embed-large" => 1024,
            "all-minilm" => 384,
            _ => 768,
        };

        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model,
            dimension,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.ollama_url.clone(), config.embedding_model.clone())
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbedding {
    async fn embed(&self, text: &str, _task: TaskType) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| KexError::Embedding(format!("Ollama embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(KexError::Embedding(format!(
                "Ollama embedding error: {error_text}"
            )));
        }

        let result: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| KexError::Embedding(format!("Failed to parse embedding response: {e}")))?;

        Ok(result.embedding)
    }

    async fn embed_batch(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>> {
        // Ollama has no batch endpoint
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text, task).await?);
        }
        Ok(results)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Local hashing embedder
// ============================================================================

/// Deterministic bag-of-features embedder
///
/// Hashes lowercase word unigrams, word bigrams and character trigrams into
/// a signed fixed-width vector, then L2-normalizes. Similarity is lexical
/// overlap, so thresholds tuned for neural models are too strict for it.
#[derive(Debug, Clone)]
pub struct LocalHashEmbedding {
    dimension: usize,
    model_id: String,
}

impl LocalHashEmbedding {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(8);
        Self {
            dimension,
            model_id: format!("local-hash-{dimension}"),
        }
    }

    /// Embed synchronously
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dimension];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            self.add(&mut out, "w", word, 1.0);
            let chars: Vec<char> = format!("^{word}$").chars().collect();
            for gram in chars.windows(3) {
                self.add(&mut out, "c", &gram.iter().collect::<String>(), 0.5);
            }
        }
        for pair in words.windows(2) {
            self.add(&mut out, "b", &format!("{} {}", pair[0], pair[1]), 0.75);
        }

        let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            out.iter_mut().for_each(|x| *x /= norm);
        }
        out
    }

    fn add(&self, out: &mut [f32], kind: &str, feature: &str, weight: f32) {
        let digest = Sha256::new()
            .chain_update(kind.as_bytes())
            .chain_update([0u8])
            .chain_update(feature.as_bytes())
            .finalize();
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        out[index] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingClient for LocalHashEmbedding {
    async fn embed(&self, text: &str, _task: TaskType) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }

    async fn embed_batch(&self, texts: &[String], _task: TaskType) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an embedding client from config
///
/// `local_dimension` sizes the hashing embedder used by the `local` provider.
pub fn create_embedding_client(
    config: &LlmConfig,
    local_dimension: usize,
) -> Result<Arc<dyn EmbeddingClient>> {
    match config.provider {
        LlmProvider::OpenAI | LlmProvider::Azure => {
            Ok(Arc::new(OpenAiEmbedding::from_config(config)?))
        }
        LlmProvider::Ollama => Ok(Arc::new(OllamaEmbedding::from_config(config))),
        LlmProvider::Local => Ok(Arc::new(LocalHashEmbedding::new(local_dimension))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grounding::cosine_similarity;

    #[test]
    fn test_openai_dimension() {
        let client = OpenAiEmbedding::new("test-key", "text-embedding-3-small");
        assert_eq!(client.dimension(), 1536);

        let client = OpenAiEmbedding::new("test-key", "text-embedding-3-large");
        assert_eq!(client.dimension(), 3072);
    }

    #[test]
    fn test_ollama_dimension() {
        let client = OllamaEmbedding::new("http://localhost:11434", "nomic-embed-text");
        assert_eq!(client.dimension(), 768);
        assert_eq!(client.model_id(), "nomic-embed-text");
    }

    #[test]
    fn test_local_embedding_is_deterministic_and_normalized() {
        let embedder = LocalHashEmbedding::new(256);
        let a = embedder.vector("Jane Doe met with Acme Corp");
        let b = embedder.vector("Jane Doe met with Acme Corp");
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(embedder.vector("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_local_embedding_reflects_overlap() {
        let embedder = LocalHashEmbedding::new(512);
        let chunk = embedder.vector("Jane Doe met with Acme Corp on March 3.");
        let related = embedder.vector("Jane Doe meeting with Acme Corp");
        let unrelated = embedder.vector("quarterly revenue forecast spreadsheet");
        let close = cosine_similarity(&chunk, &related).unwrap();
        let far = cosine_similarity(&chunk, &unrelated).unwrap();
        assert!(close > far);
        assert!(close > 0.4);
    }

    #[test]
    fn test_factory_local() {
        let config = LlmConfig {
            provider: LlmProvider::Local,
            ..LlmConfig::default()
        };
        let client = create_embedding_client(&config, 64).unwrap();
        assert_eq!(client.dimension(), 64);
        assert_eq!(client.model_id(), "local-hash-64");
    }
}
