//! Relation extraction
//!
//! - [`LlmRelationExtractor`]: structured generation over numbered entities,
//!   constrained to the ontology's property names
//! - [`PatternRelationExtractor`]: keyword rules between typed entity pairs

use std::sync::Arc;

use async_trait::async_trait;
use kex_core::{Entity, LlmClient, Relation, Result, StructuredRequest};
use kex_ontology::OntologyContext;
use serde_json::{json, Value};
use tracing::debug;

use crate::prompt::PromptBuilder;
use crate::rules::{RelationRule, RuleSet};
use crate::stage::{ExtractionStage, RelationInput, RELATIONS};
use crate::validation::{parse_items, validate_relations, RawRelation};

// ============================================================================
// LLM-backed
// ============================================================================

/// Relation stage backed by an [`LlmClient`]
pub struct LlmRelationExtractor {
    client: Arc<dyn LlmClient>,
    source: String,
}

impl LlmRelationExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        let source = format!("llm:{}", client.model_id());
        Self { client, source }
    }

    fn request(&self, input: &RelationInput, ontology: &OntologyContext) -> StructuredRequest {
        let property_names: Vec<String> = ontology
            .properties()
            .map(|p| ontology.compact(&p.iri))
            .collect();

        let listing = input
            .entities
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let types: Vec<String> = e.types.iter().map(|t| ontology.compact(t)).collect();
                format!("[{i}] {} ({})", e.name, types.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = PromptBuilder::new()
            .task("Extract the relations the text states between the numbered entities.")
            .section("ontology", ontology.schema_summary())
            .section("text", &input.chunk.text)
            .section("entities", listing)
            .add_instruction("Refer to entities only by their number")
            .add_instruction("Use only the property names listed in the ontology, respecting domain and range")
            .add_instruction("Use object for entity values and literal for datatype values")
            .add_instruction("Quote the supporting text verbatim in evidence")
            .add_instruction("Give a confidence between 0 and 1")
            .build();

        StructuredRequest {
            schema_name: "relations".to_string(),
            schema: relation_schema(&property_names),
            prompt,
        }
    }
}

fn relation_schema(property_names: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "relations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "subject": { "type": "integer", "minimum": 0 },
                        "predicate": { "type": "string", "enum": property_names },
                        "object": { "type": "integer", "minimum": 0 },
                        "literal": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "evidence": { "type": "string" }
                    },
                    "required": ["subject", "predicate", "confidence"]
                }
            }
        },
        "required": ["relations"]
    })
}

#[async_trait]
impl ExtractionStage for LlmRelationExtractor {
    type Input = RelationInput;
    type Output = Vec<Relation>;

    fn name(&self) -> &'static str {
        RELATIONS
    }

    async fn extract(&self, input: &RelationInput, ontology: &OntologyContext) -> Result<Vec<Relation>> {
        if input.entities.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.client.generate_object(&self.request(input, ontology)).await?;
        let raw: Vec<RawRelation> = parse_items(RELATIONS, input.chunk.chunk_index, response)?;
        validate_relations(raw, input, ontology, &self.source)
    }
}

// ============================================================================
// Rule-backed
// ============================================================================

/// Relation stage matching keywords between typed entity pairs
///
/// A rule fires when a subject-typed and an object-typed entity appear in
/// either order, no more than `max_distance` bytes apart, with one of the
/// rule's keywords in between.
pub struct PatternRelationExtractor {
    rules: Vec<RelationRule>,
}

impl PatternRelationExtractor {
    pub const SOURCE: &'static str = "pattern";

    pub fn new(rules: &RuleSet) -> Self {
        Self {
            rules: rules.relations.clone(),
        }
    }

    /// Chunk-relative span of the entity's first mention
    fn span_of(entity: &Entity, input: &RelationInput) -> Option<(usize, usize)> {
        input
            .mentions
            .iter()
            .filter(|m| entity.mention_ids.contains(&m.id))
            .min_by_key(|m| m.start)
            .and_then(|m| {
                let start = m.start.checked_sub(input.chunk.start_offset)?;
                let end = m.end.checked_sub(input.chunk.start_offset)?;
                (end <= input.chunk.text.len()).then_some((start, end))
            })
    }

    fn candidates(&self, input: &RelationInput, ontology: &OntologyContext) -> Vec<RawRelation> {
        let has_type = |entity: &Entity, class: &str| {
            entity.types.iter().any(|t| ontology.is_sub_class_of(t, class))
        };
        let text = &input.chunk.text;
        let mut raw = Vec::new();

        for rule in &self.rules {
            let (Some(subject_class), Some(object_class)) = (
                ontology.resolve_class(&rule.subject),
                ontology.resolve_class(&rule.object),
            ) else {
                debug!(predicate = %rule.predicate, "Skipping rule with classes not in ontology");
                continue;
            };
            let keywords: Vec<String> = rule.keywords.iter().map(|k| k.to_lowercase()).collect();

            for (si, subject) in input.entities.iter().enumerate() {
                if !has_type(subject, &subject_class.iri) {
                    continue;
                }
                for (oi, object) in input.entities.iter().enumerate() {
                    if si == oi || !has_type(object, &object_class.iri) {
                        continue;
                    }
                    let (Some(s), Some(o)) = (Self::span_of(subject, input), Self::span_of(object, input))
                    else {
                        continue;
                    };
                    let (first, second) = if s.0 <= o.0 { (s, o) } else { (o, s) };
                    if second.0 < first.1 || second.0 - first.1 > rule.max_distance {
                        continue;
                    }
                    let between = text[first.1..second.0].to_lowercase();
                    if keywords.iter().any(|k| between.contains(k.as_str())) {
                        raw.push(RawRelation {
                            subject: si,
                            predicate: rule.predicate.clone(),
                            object: Some(oi),
                            literal: None,
                            confidence: rule.confidence,
                            evidence: None,
                        });
                    }
                }
            }
        }
        raw
    }
}

#[async_trait]
impl ExtractionStage for PatternRelationExtractor {
    type Input = RelationInput;
    type Output = Vec<Relation>;

    fn name(&self) -> &'static str {
        RELATIONS
    }

    async fn extract(&self, input: &RelationInput, ontology: &OntologyContext) -> Result<Vec<Relation>> {
        let raw = self.candidates(input, ontology);
        validate_relations(raw, input, ontology, Self::SOURCE)
    }
}
