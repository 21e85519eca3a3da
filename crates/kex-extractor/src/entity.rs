//! Entity extraction: grouping a chunk's mentions into typed entities

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kex_core::{Entity, LlmClient, Result, StructuredRequest};
use kex_ontology::OntologyContext;
use serde_json::{json, Value};

use crate::prompt::PromptBuilder;
use crate::stage::{EntityInput, ExtractionStage, ENTITIES};
use crate::validation::{parse_items, validate_entities, RawEntity};

/// Entity stage backed by an [`LlmClient`]
pub struct LlmEntityExtractor {
    client: Arc<dyn LlmClient>,
}

impl LlmEntityExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn request(&self, input: &EntityInput, ontology: &OntologyContext) -> StructuredRequest {
        let class_names: Vec<String> = ontology.classes().map(|c| ontology.compact(&c.iri)).collect();
        let property_names: Vec<String> = ontology
            .properties()
            .filter(|p| ontology.range_allows_literal(p))
            .map(|p| ontology.compact(&p.iri))
            .collect();

        let listing = input
            .mentions
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let types: Vec<String> = m.candidate_types.iter().map(|t| ontology.compact(t)).collect();
                format!("[{i}] \"{}\" ({})", m.text, types.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = PromptBuilder::new()
            .task("Group the numbered mentions into the distinct real-world entities they refer to.")
            .section("ontology", ontology.schema_summary())
            .section("text", &input.chunk.text)
            .section("mentions", listing)
            .add_instruction("Refer to mentions only by their number")
            .add_instruction("Put mentions of the same entity into one group")
            .add_instruction("Use only the class names listed in the ontology")
            .add_instruction("Attributes may only use datatype properties, with values stated in the text")
            .build();

        StructuredRequest {
            schema_name: "entities".to_string(),
            schema: entity_schema(&class_names, &property_names),
            prompt,
        }
    }
}

fn entity_schema(class_names: &[String], property_names: &[String]) -> Value {
    let attributes: serde_json::Map<String, Value> = property_names
        .iter()
        .map(|p| (p.clone(), json!({ "type": ["string", "number", "boolean"] })))
        .collect();
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "mentions": { "type": "array", "items": { "type": "integer", "minimum": 0 } },
                        "name": { "type": "string" },
                        "types": {
                            "type": "array",
                            "items": { "type": "string", "enum": class_names }
                        },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "attributes": { "type": "object", "properties": attributes }
                    },
                    "required": ["mentions", "types", "confidence"]
                }
            }
        },
        "required": ["entities"]
    })
}

#[async_trait]
impl ExtractionStage for LlmEntityExtractor {
    type Input = EntityInput;
    type Output = Vec<Entity>;

    fn name(&self) -> &'static str {
        ENTITIES
    }

    async fn extract(&self, input: &EntityInput, ontology: &OntologyContext) -> Result<Vec<Entity>> {
        if input.mentions.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.client.generate_object(&self.request(input, ontology)).await?;
        let raw: Vec<RawEntity> = parse_items(ENTITIES, input.chunk.chunk_index, response)?;
        validate_entities(raw, input, ontology)
    }
}

/// Entity stage that promotes mentions directly
///
/// Mentions with the same case-folded text and types become one entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct MentionPromotion;

#[async_trait]
impl ExtractionStage for MentionPromotion {
    type Input = EntityInput;
    type Output = Vec<Entity>;

    fn name(&self) -> &'static str {
        ENTITIES
    }

    async fn extract(&self, input: &EntityInput, ontology: &OntologyContext) -> Result<Vec<Entity>> {
        let mut groups: BTreeMap<(String, Vec<String>), RawEntity> = BTreeMap::new();
        for (i, mention) in input.mentions.iter().enumerate() {
            let key = (mention.text.to_lowercase(), mention.candidate_types.clone());
            let entry = groups.entry(key).or_insert_with(|| RawEntity {
                mentions: Vec::new(),
                name: Some(mention.text.clone()),
                types: Vec::new(),
                confidence: 0.0,
                attributes: BTreeMap::new(),
            });
            entry.mentions.push(i);
            entry.confidence = entry.confidence.max(f64::from(mention.confidence));
        }

        let mut raw: Vec<RawEntity> = groups.into_values().collect();
        raw.sort_by_key(|e| e.mentions[0]);
        validate_entities(raw, input, ontology)
    }
}
