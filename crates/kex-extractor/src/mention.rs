//! Mention extraction
//!
//! - [`LlmMentionExtractor`]: structured generation constrained to the
//!   ontology's class names
//! - [`GazetteerMentionExtractor`]: dictionary terms and regex patterns from
//!   a [`RuleSet`], for offline runs

use std::sync::Arc;

use async_trait::async_trait;
use kex_core::{LlmClient, Mention, Result, StructuredRequest};
use kex_ontology::OntologyContext;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::prompt::PromptBuilder;
use crate::rules::RuleSet;
use crate::stage::{ExtractionStage, MentionInput, MENTIONS};
use crate::validation::{parse_items, validate_mentions, RawMention};

// ============================================================================
// LLM-backed
// ============================================================================

/// Mention stage backed by an [`LlmClient`]
pub struct LlmMentionExtractor {
    client: Arc<dyn LlmClient>,
    source: String,
}

impl LlmMentionExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        let source = format!("llm:{}", client.model_id());
        Self { client, source }
    }

    fn request(&self, input: &MentionInput, ontology: &OntologyContext) -> StructuredRequest {
        let class_names: Vec<String> = ontology.classes().map(|c| ontology.compact(&c.iri)).collect();

        let prompt = PromptBuilder::new()
            .task("Identify every span of the text that refers to an instance of an ontology class.")
            .section("ontology", ontology.schema_summary())
            .section("text", &input.chunk.text)
            .add_instruction("Copy each mention's text exactly as it appears, including case")
            .add_instruction("Set start to the byte offset of the mention within the text when known")
            .add_instruction("Use only the class names listed in the ontology")
            .add_instruction("Give a confidence between 0 and 1")
            .build();

        StructuredRequest {
            schema_name: "mentions".to_string(),
            schema: mention_schema(&class_names),
            prompt,
        }
    }
}

fn mention_schema(class_names: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "mentions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "start": { "type": "integer", "minimum": 0 },
                        "types": {
                            "type": "array",
                            "items": { "type": "string", "enum": class_names }
                        },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
                    },
                    "required": ["text", "types", "confidence"]
                }
            }
        },
        "required": ["mentions"]
    })
}

#[async_trait]
impl ExtractionStage for LlmMentionExtractor {
    type Input = MentionInput;
    type Output = Vec<Mention>;

    fn name(&self) -> &'static str {
        MENTIONS
    }

    async fn extract(&self, input: &MentionInput, ontology: &OntologyContext) -> Result<Vec<Mention>> {
        let response = self.client.generate_object(&self.request(input, ontology)).await?;
        let raw: Vec<RawMention> = parse_items(MENTIONS, input.chunk.chunk_index, response)?;
        validate_mentions(raw, &input.chunk, &input.scope, ontology, &self.source)
    }
}

// ============================================================================
// Rule-backed
// ============================================================================

struct CompiledRule {
    regex: Regex,
    class: String,
    confidence: f64,
}

/// Mention stage driven by dictionary terms and regex patterns
pub struct GazetteerMentionExtractor {
    rules: Vec<CompiledRule>,
}

impl GazetteerMentionExtractor {
    pub const SOURCE: &'static str = "gazetteer";

    pub fn new(rules: &RuleSet) -> Result<Self> {
        let mut compiled = Vec::new();
        for term in &rules.terms {
            for text in std::iter::once(&term.text).chain(term.aliases.iter()) {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(text.trim()));
                compiled.push(CompiledRule {
                    regex: compile(&pattern)?,
                    class: term.class.clone(),
                    confidence: term.confidence,
                });
            }
        }
        for pattern in &rules.patterns {
            compiled.push(CompiledRule {
                regex: compile(&pattern.regex)?,
                class: pattern.class.clone(),
                confidence: pattern.confidence,
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Non-overlapping matches, preferring higher confidence then longer spans
    fn candidates(&self, text: &str, ontology: &OntologyContext) -> Vec<RawMention> {
        let mut found: Vec<(usize, usize, &CompiledRule)> = Vec::new();
        for rule in &self.rules {
            if ontology.resolve_class(&rule.class).is_none() {
                debug!(class = %rule.class, "Skipping rule for class not in ontology");
                continue;
            }
            for m in rule.regex.find_iter(text) {
                if !m.as_str().trim().is_empty() {
                    found.push((m.start(), m.end(), rule));
                }
            }
        }

        found.sort_by(|a, b| {
            b.2.confidence
                .total_cmp(&a.2.confidence)
                .then((b.1 - b.0).cmp(&(a.1 - a.0)))
                .then(a.0.cmp(&b.0))
        });

        let mut kept: Vec<(usize, usize, &CompiledRule)> = Vec::new();
        for candidate in found {
            let overlaps = kept.iter().any(|k| candidate.0 < k.1 && k.0 < candidate.1);
            if !overlaps {
                kept.push(candidate);
            }
        }
        kept.sort_by_key(|k| k.0);

        kept.into_iter()
            .map(|(start, end, rule)| RawMention {
                text: text[start..end].to_string(),
                start: Some(start),
                types: vec![rule.class.clone()],
                confidence: rule.confidence,
            })
            .collect()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| kex_core::KexError::Config(format!("Invalid pattern {pattern:?}: {e}")))
}

#[async_trait]
impl ExtractionStage for GazetteerMentionExtractor {
    type Input = MentionInput;
    type Output = Vec<Mention>;

    fn name(&self) -> &'static str {
        MENTIONS
    }

    async fn extract(&self, input: &MentionInput, ontology: &OntologyContext) -> Result<Vec<Mention>> {
        let raw = self.candidates(&input.chunk.text, ontology);
        validate_mentions(raw, &input.chunk, &input.scope, ontology, Self::SOURCE)
    }
}

// ============================================================================
// Tests
// ============================================================================
