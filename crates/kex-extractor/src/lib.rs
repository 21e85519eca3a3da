//! kex Extractor - Ontology-constrained knowledge extraction
//!
//! Turns document text into a validated knowledge graph:
//! - Chunking with sentence-aware boundaries and absolute offsets
//! - Mention, entity, and relation stages (LLM-backed or rule-backed)
//! - Validation of untrusted stage output against the ontology
//! - Bounded per-chunk fan-out with retry
//! - Graph assembly with evidence rows

pub mod assembler;
pub mod chunker;
pub mod entity;
pub mod llm;
pub mod mention;
pub mod prompt;
pub mod relation;
pub mod retry;
pub mod rules;
pub mod stage;
pub mod testing;
pub mod validation;

#[cfg(test)]
mod fixtures;

pub use assembler::{assemble, assemble_with_report, AssemblyReport};
pub use chunker::{chunk, ChunkConfig, Chunks};
pub use entity::{LlmEntityExtractor, MentionPromotion};
pub use llm::{create_llm_client, OllamaClient, OpenAiClient};
pub use mention::{GazetteerMentionExtractor, LlmMentionExtractor};
pub use prompt::PromptBuilder;
pub use relation::{LlmRelationExtractor, PatternRelationExtractor};
pub use retry::{Exhausted, RetryPolicy};
pub use rules::RuleSet;
pub use stage::{
    extract_batch, BatchOptions, BatchOutcome, ChunkFailure, ChunkScoped, EntityInput,
    EntityStage, ExtractionStage, MentionInput, MentionStage, RelationInput, RelationStage,
};
pub use testing::ScriptedLlm;

use std::sync::Arc;

use kex_core::{LlmClient, Result};

/// The three extraction stages used by one pipeline
#[derive(Clone)]
pub struct StageSet {
    pub mentions: Arc<MentionStage>,
    pub entities: Arc<EntityStage>,
    pub relations: Arc<RelationStage>,
}

impl StageSet {
    /// LLM-backed stages sharing one client
    pub fn llm(client: Arc<dyn LlmClient>) -> Self {
        Self {
            mentions: Arc::new(LlmMentionExtractor::new(Arc::clone(&client))),
            entities: Arc::new(LlmEntityExtractor::new(Arc::clone(&client))),
            relations: Arc::new(LlmRelationExtractor::new(client)),
        }
    }

    /// Rule-backed stages for offline runs
    pub fn rules(rules: &RuleSet) -> Result<Self> {
        Ok(Self {
            mentions: Arc::new(GazetteerMentionExtractor::new(rules)?),
            entities: Arc::new(MentionPromotion),
            relations: Arc::new(PatternRelationExtractor::new(rules)),
        })
    }
}
