//! kex Core - Domain models, state machines, and shared traits
//!
//! This crate defines the core abstractions used throughout the kex system:
//! - Knowledge-graph models (chunks, mentions, entities, relations)
//! - Evidence spans and the `Evidence.List` query contract
//! - Workflow and batch state machines with explicit transition tables
//! - Common error types
//! - Collaborator traits (structured-generation LLM)
//! - Configuration management

pub mod config;
pub mod hash;
pub mod model;
pub mod workflow;

pub use config::{
    AppConfig, BatchSettings, CacheSettings, ConfigError, DatabaseConfig, ExtractionConfig,
    GroundingConfig, LlmConfig, LlmProvider, LoggingConfig, WorkflowConfig,
};
pub use hash::{content_hash, stable_id};
pub use model::*;
pub use workflow::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for kex operations
#[derive(Error, Debug)]
pub enum KexError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed ontology source. Fatal to the run.
    #[error("Ontology parse error: {message} (near `{fragment}`)")]
    OntologyParse { fragment: String, message: String },

    /// One chunk's LLM or validation failure.
    #[error("Stage {stage} failed on chunk {chunk_index}: {message}")]
    StageExtraction {
        stage: String,
        chunk_index: usize,
        message: String,
    },

    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Wraps a failure once an activity's retry budget is exhausted.
    #[error("Activity {activity} failed after {attempts} attempt(s): {message}")]
    ActivityFailure {
        activity: String,
        attempts: u32,
        message: String,
    },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid {machine} transition: {from} --{event}-->")]
    InvalidTransition {
        machine: &'static str,
        from: String,
        event: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KexError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StageExtraction { .. } | Self::Embedding(_) | Self::Llm(_) | Self::Database(_)
        )
    }
}

impl From<serde_json::Error> for KexError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("JSON error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, KexError>;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// A structured-generation request: the provider must answer with a JSON
/// value conforming to `schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredRequest {
    /// Schema name, used by providers that require one
    pub schema_name: String,

    /// JSON Schema the response must conform to
    pub schema: serde_json::Value,

    /// Rendered prompt
    pub prompt: String,
}

/// Trait for LLM providers (`generateObject(schema, prompt)`)
///
/// Output is untrusted; callers validate it before use.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a JSON object for the given schema and prompt
    async fn generate_object(&self, request: &StructuredRequest) -> Result<serde_json::Value>;

    /// Identifier of the underlying model
    fn model_id(&self) -> &str;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retry_classification() {
        let stage = KexError::StageExtraction {
            stage: "mentions".to_string(),
            chunk_index: 2,
            message: "timeout".to_string(),
        };
        assert!(stage.is_retryable());
        assert!(KexError::Embedding("503".to_string()).is_retryable());

        let parse = KexError::OntologyParse {
            fragment: "ex:Foo a".to_string(),
            message: "unexpected end of input".to_string(),
        };
        assert!(!parse.is_retryable());
        assert!(!KexError::Cancelled.is_retryable());
        assert!(!KexError::Validation("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = KexError::ActivityFailure {
            activity: "relations".to_string(),
            attempts: 3,
            message: "LLM error: rate limited".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Activity relations failed after 3 attempt(s): LLM error: rate limited"
        );
    }
}
