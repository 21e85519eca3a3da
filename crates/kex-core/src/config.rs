//! kex Configuration Management
//!
//! Handles configuration from environment variables and TOML config files
//! with sensible defaults for development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Database connections
    pub database: DatabaseConfig,

    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Chunking and extraction-stage configuration
    pub extraction: ExtractionConfig,

    /// Relation grounding configuration
    pub grounding: GroundingConfig,

    /// Workflow orchestrator configuration
    pub workflow: WorkflowConfig,

    /// Batch orchestrator configuration
    pub batch: BatchSettings,

    /// Cache sizing
    pub cache: CacheSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // PostgreSQL
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.postgres_url = Some(url);
        }

        // Qdrant
        if let Ok(url) = std::env::var("QDRANT_URL") {
            config.database.qdrant_url = Some(url);
        }

        // LLM
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider.parse()?;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.llm.openai_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.llm.openai_base_url = Some(url);
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            config.llm.ollama_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }

        // Pipeline tuning
        if let Ok(v) = std::env::var("KEX_GROUNDING_THRESHOLD") {
            config.grounding.threshold = parse_env("KEX_GROUNDING_THRESHOLD", v)?;
        }
        if let Ok(v) = std::env::var("KEX_STAGE_CONCURRENCY") {
            config.extraction.stage_concurrency = parse_env("KEX_STAGE_CONCURRENCY", v)?;
        }
        if let Ok(v) = std::env::var("KEX_BATCH_CONCURRENCY") {
            config.batch.concurrency = parse_env("KEX_BATCH_CONCURRENCY", v)?;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        let env_config = Self::from_env()?;

        if env_config.database.postgres_url.is_some() {
            self.database.postgres_url = env_config.database.postgres_url;
        }
        if env_config.database.qdrant_url.is_some() {
            self.database.qdrant_url = env_config.database.qdrant_url;
        }
        if std::env::var("LLM_PROVIDER").is_ok() {
            self.llm.provider = env_config.llm.provider;
        }
        if env_config.llm.model != LlmConfig::default().model {
            self.llm.model = env_config.llm.model;
        }
        if env_config.llm.embedding_model != LlmConfig::default().embedding_model {
            self.llm.embedding_model = env_config.llm.embedding_model;
        }
        if env_config.grounding.threshold != GroundingConfig::default().threshold {
            self.grounding.threshold = env_config.grounding.threshold;
        }
        if env_config.batch.concurrency != BatchSettings::default().concurrency {
            self.batch.concurrency = env_config.batch.concurrency;
        }

        // Always use env for sensitive values
        if env_config.llm.openai_api_key.is_some() {
            self.llm.openai_api_key = env_config.llm.openai_api_key;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.grounding.threshold) {
            return Err(ConfigError::InvalidValue {
                key: "grounding.threshold".to_string(),
                value: self.grounding.threshold.to_string(),
            });
        }
        if self.extraction.max_chars == 0 {
            return Err(ConfigError::InvalidValue {
                key: "extraction.max_chars".to_string(),
                value: "0".to_string(),
            });
        }
        if self.extraction.overlap_chars >= self.extraction.max_chars {
            return Err(ConfigError::InvalidValue {
                key: "extraction.overlap_chars".to_string(),
                value: self.extraction.overlap_chars.to_string(),
            });
        }
        if self.extraction.stage_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "extraction.stage_concurrency".to_string(),
                value: "0".to_string(),
            });
        }
        if self.batch.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch.concurrency".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; the in-memory store is used when unset
    pub postgres_url: Option<String>,

    /// PostgreSQL connection pool size
    pub postgres_pool_size: u32,

    /// Qdrant gRPC URL; the in-memory vector store is used when unset
    pub qdrant_url: Option<String>,

    /// Qdrant collection name
    pub qdrant_collection: String,

    /// Vector dimension (must match embedding model)
    pub vector_dimension: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: None,
            postgres_pool_size: 10,
            qdrant_url: None,
            qdrant_collection: "kex_entities".to_string(),
            vector_dimension: 1536, // OpenAI text-embedding-3-small
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// LLM provider to use
    pub provider: LlmProvider,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL (for Azure or compatible APIs)
    pub openai_base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Model name to use
    pub model: String,

    /// Embedding model name
    pub embedding_model: String,

    /// Maximum tokens for completion
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            openai_api_key: None,
            openai_base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            max_tokens: 2048,
            temperature: 0.0,
            timeout_secs: 60,
        }
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Ollama,
    Azure,
    /// Offline: rule-backed stages and the hashing embedder
    Local,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            "azure" => Ok(Self::Azure),
            "local" => Ok(Self::Local),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Chunking and extraction-stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Maximum chunk length in bytes
    pub max_chars: usize,

    /// Overlap carried into the next chunk
    pub overlap_chars: usize,

    /// How far back from `max_chars` to look for a sentence boundary
    /// (0 means half of `max_chars`)
    pub boundary_tolerance_chars: usize,

    /// Concurrent chunk extractions per stage
    pub stage_concurrency: usize,

    /// Attempts per chunk before it is recorded as failed
    pub chunk_max_attempts: u32,

    /// Initial retry backoff
    pub retry_initial_backoff_ms: u64,

    /// Retry backoff ceiling
    pub retry_max_backoff_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            overlap_chars: 200,
            boundary_tolerance_chars: 0,
            stage_concurrency: 5,
            chunk_max_attempts: 3,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 5000,
        }
    }
}

/// Relation grounding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingConfig {
    /// Minimum cosine similarity for a relation to be accepted
    pub threshold: f32,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self { threshold: 0.8 }
    }
}

/// Workflow orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Attempts per activity before the execution fails
    pub activity_max_attempts: u32,

    /// Initial backoff between activity attempts
    pub activity_backoff_ms: u64,

    /// Backoff ceiling between activity attempts
    pub activity_max_backoff_ms: u64,

    /// Workflow definition version, part of the dedupe key
    pub workflow_version: i32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            activity_max_attempts: 3,
            activity_backoff_ms: 500,
            activity_max_backoff_ms: 10_000,
            workflow_version: 1,
        }
    }
}

/// Batch orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Concurrent workflow executions per batch
    pub concurrency: usize,

    /// Processing attempts per item; `retry_failed` abandons items beyond it
    pub max_attempts: i32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
        }
    }
}

/// Cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of cached embeddings
    pub embedding_max_capacity: u64,

    /// Time-to-live for cached embeddings (in seconds)
    pub embedding_ttl_seconds: u64,

    /// Maximum number of parsed ontologies kept
    pub ontology_max_capacity: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            // 10k embeddings @ ~6KB each = ~60MB
            embedding_max_capacity: 10_000,
            embedding_ttl_seconds: 3600,
            ontology_max_capacity: 64,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.grounding.threshold, 0.8);
        assert_eq!(config.batch.concurrency, 5);
        assert_eq!(config.extraction.stage_concurrency, 5);
        assert_eq!(config.database.vector_dimension, 1536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_llm_provider_parse() {
        assert_eq!(
            "openai".parse::<LlmProvider>().unwrap(),
            LlmProvider::OpenAI
        );
        assert_eq!("LOCAL".parse::<LlmProvider>().unwrap(), LlmProvider::Local);
        assert!("invalid".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_overlap() {
        let mut config = AppConfig::default();
        config.extraction.overlap_chars = config.extraction.max_chars;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut config = AppConfig::default();
        config.grounding.threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[grounding]\nthreshold = 0.65\n\n[batch]\nconcurrency = 2\n\n[llm]\nprovider = \"local\""
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.grounding.threshold, 0.65);
        assert_eq!(config.batch.concurrency, 2);
        assert_eq!(config.llm.provider, LlmProvider::Local);
        // Untouched sections keep their defaults
        assert_eq!(config.extraction.max_chars, 2000);
    }

    #[test]
    fn test_from_file_missing() {
        let err = AppConfig::from_file("/nonexistent/kex.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }
}
