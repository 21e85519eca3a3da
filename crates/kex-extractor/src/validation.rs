//! Validation of untrusted stage output
//!
//! Raw items come from an LLM or a rule engine. Everything that survives
//! here names only ontology classes and properties, has confidence in
//! `[0, 1]`, and carries an absolute span that reads back exactly from the
//! source text. Items that fail a check are dropped and logged; confidence
//! outside `[0, 1]` fails the whole chunk so it is retried.

use std::collections::{BTreeMap, HashSet};

use kex_core::{
    stable_id, Chunk, Entity, ExtractionScope, KexError, Mention, Relation, RelationObject,
    Result,
};
use kex_ontology::OntologyContext;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::stage::{EntityInput, RelationInput, ENTITIES, MENTIONS, RELATIONS};

// ============================================================================
// Raw shapes
// ============================================================================

/// A mention as proposed by a stage implementation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMention {
    pub text: String,
    /// Chunk-relative start hint
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub types: Vec<String>,
    pub confidence: f64,
}

/// An entity grouping mentions by index into the stage input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    pub mentions: Vec<usize>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// A relation between entities, by index into the stage input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRelation {
    pub subject: usize,
    pub predicate: String,
    #[serde(default)]
    pub object: Option<usize>,
    #[serde(default)]
    pub literal: Option<String>,
    pub confidence: f64,
    /// Verbatim supporting text
    #[serde(default)]
    pub evidence: Option<String>,
}

/// Pull the array under `stage` out of a structured response
pub fn parse_items<T: DeserializeOwned>(
    stage: &'static str,
    chunk_index: usize,
    mut value: Value,
) -> Result<Vec<T>> {
    let items = value
        .get_mut(stage)
        .map(Value::take)
        .ok_or_else(|| stage_error(stage, chunk_index, format!("response has no `{stage}` array")))?;
    serde_json::from_value(items)
        .map_err(|e| stage_error(stage, chunk_index, format!("malformed {stage}: {e}")))
}

fn stage_error(stage: &str, chunk_index: usize, message: String) -> KexError {
    KexError::StageExtraction {
        stage: stage.to_string(),
        chunk_index,
        message,
    }
}

/// Confidence must be a finite number in `[0, 1]`
pub fn validate_confidence(stage: &str, chunk_index: usize, value: f64) -> Result<f32> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value as f32)
    } else {
        Err(stage_error(
            stage,
            chunk_index,
            format!("confidence {value} outside [0, 1]"),
        ))
    }
}

/// Find `needle` in `haystack`, preferring the occurrence nearest `hint`
///
/// Falls back to an ASCII case-insensitive match, which keeps byte offsets.
pub fn locate(haystack: &str, needle: &str, hint: Option<usize>) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    if let Some(h) = hint {
        let exact = h
            .checked_add(needle.len())
            .and_then(|end| haystack.get(h..end));
        if exact == Some(needle) {
            return Some(h);
        }
    }

    let mut candidates: Vec<usize> = haystack.match_indices(needle).map(|(i, _)| i).collect();
    if candidates.is_empty() {
        let lowered = haystack.to_ascii_lowercase();
        candidates = lowered
            .match_indices(&needle.to_ascii_lowercase())
            .map(|(i, _)| i)
            .collect();
    }
    match hint {
        Some(h) => candidates.into_iter().min_by_key(|i| i.abs_diff(h)),
        None => candidates.into_iter().next(),
    }
}

fn resolve_classes(ontology: &OntologyContext, names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = names
        .iter()
        .filter_map(|name| match ontology.resolve_class(name) {
            Some(class) => Some(class.iri.clone()),
            None => {
                debug!(class = %name, "Dropping unknown class");
                None
            }
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

// ============================================================================
// Mentions
// ============================================================================

pub fn mention_id(scope: &ExtractionScope, chunk_index: usize, start: usize, end: usize, types: &[String]) -> uuid::Uuid {
    stable_id(&[
        "mention",
        &scope.document_version_id.to_string(),
        &scope.ontology_hash,
        &chunk_index.to_string(),
        &start.to_string(),
        &end.to_string(),
        &types.join(","),
    ])
}

/// Turn raw mentions into located, typed mentions with absolute offsets
pub fn validate_mentions(
    raw: Vec<RawMention>,
    chunk: &Chunk,
    scope: &ExtractionScope,
    ontology: &OntologyContext,
    source: &str,
) -> Result<Vec<Mention>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for item in raw {
        let confidence = validate_confidence(MENTIONS, chunk.chunk_index, item.confidence)?;
        let needle = item.text.trim();
        let types = resolve_classes(ontology, &item.types);
        if types.is_empty() {
            debug!(chunk_index = chunk.chunk_index, text = needle, "Dropping untyped mention");
            continue;
        }
        let Some(rel) = locate(&chunk.text, needle, item.start) else {
            debug!(chunk_index = chunk.chunk_index, text = needle, "Dropping mention not found in chunk");
            continue;
        };

        let start = chunk.start_offset + rel;
        let end = start + needle.len();
        let id = mention_id(scope, chunk.chunk_index, start, end, &types);
        if !seen.insert(id) {
            continue;
        }
        out.push(Mention {
            id,
            chunk_index: chunk.chunk_index,
            text: chunk.text[rel..rel + needle.len()].to_string(),
            start,
            end,
            candidate_types: types,
            confidence,
            source: source.to_string(),
        });
    }

    out.sort_by_key(|m| (m.start, m.end));
    Ok(out)
}

// ============================================================================
// Entities
// ============================================================================

/// Turn raw entities into typed entities over the input's mentions
pub fn validate_entities(
    raw: Vec<RawEntity>,
    input: &EntityInput,
    ontology: &OntologyContext,
) -> Result<Vec<Entity>> {
    let chunk_index = input.chunk.chunk_index;
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for item in raw {
        let confidence = validate_confidence(ENTITIES, chunk_index, item.confidence)?;

        let mut mentions: Vec<&Mention> = item
            .mentions
            .iter()
            .filter_map(|&i| input.mentions.get(i))
            .collect();
        mentions.sort_by_key(|m| (m.start, m.end));
        mentions.dedup_by_key(|m| m.id);
        let Some(first) = mentions.first() else {
            debug!(chunk_index, "Dropping entity without valid mentions");
            continue;
        };

        let types = if item.types.is_empty() {
            mentions
                .iter()
                .flat_map(|m| m.candidate_types.iter().cloned())
                .collect()
        } else {
            resolve_classes(ontology, &item.types)
        };
        let types = ontology.most_specific(&types);
        if types.is_empty() {
            debug!(chunk_index, name = ?item.name, "Dropping untyped entity");
            continue;
        }

        let name = item
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map_or_else(|| first.text.clone(), str::to_string);

        let id = stable_id(&[
            "entity",
            &input.scope.document_version_id.to_string(),
            &input.scope.ontology_hash,
            &chunk_index.to_string(),
            &first.start.to_string(),
            &first.end.to_string(),
            &types.join(","),
        ]);
        if !seen.insert(id) {
            continue;
        }

        let attributes = validate_attributes(ontology, &types, item.attributes);
        out.push(Entity {
            id,
            chunk_index,
            mention_ids: mentions.iter().map(|m| m.id).collect(),
            name,
            types,
            attributes,
            confidence,
            grounding_confidence: None,
        });
    }
    Ok(out)
}

/// Keep attributes naming a literal-valued property applicable to `types`
fn validate_attributes(
    ontology: &OntologyContext,
    types: &[String],
    attributes: BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    attributes
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .filter_map(|(key, value)| {
            let property = ontology.resolve_property(&key)?;
            (ontology.range_allows_literal(property) && ontology.domain_allows(property, types))
                .then(|| (property.iri.clone(), value))
        })
        .collect()
}

// ============================================================================
// Relations
// ============================================================================

/// Turn raw relations into typed, ontology-conformant relations
pub fn validate_relations(
    raw: Vec<RawRelation>,
    input: &RelationInput,
    ontology: &OntologyContext,
    source: &str,
) -> Result<Vec<Relation>> {
    let chunk = &input.chunk;
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for item in raw {
        let confidence = validate_confidence(RELATIONS, chunk.chunk_index, item.confidence)?;

        let Some(subject) = input.entities.get(item.subject) else {
            debug!(chunk_index = chunk.chunk_index, "Dropping relation with unknown subject");
            continue;
        };
        let Some(property) = ontology.resolve_property(&item.predicate) else {
            debug!(predicate = %item.predicate, "Dropping relation with unknown predicate");
            continue;
        };
        if !ontology.domain_allows(property, &subject.types) {
            debug!(predicate = %property.iri, subject = %subject.name, "Domain violation");
            continue;
        }

        let object_entity = item.object.and_then(|i| input.entities.get(i));
        let literal = item.literal.as_deref().map(str::trim).filter(|l| !l.is_empty());
        let object = match (object_entity, literal) {
            (Some(object), _) => {
                if object.id == subject.id {
                    debug!(subject = %subject.name, "Dropping self relation");
                    continue;
                }
                if !ontology.range_allows_entity(property, &object.types) {
                    debug!(predicate = %property.iri, object = %object.name, "Range violation");
                    continue;
                }
                RelationObject::Entity(object.id)
            }
            (None, Some(value)) => {
                if !ontology.range_allows_literal(property) {
                    debug!(predicate = %property.iri, "Literal not allowed by range");
                    continue;
                }
                RelationObject::Literal(value.to_string())
            }
            (None, None) => {
                debug!(predicate = %property.iri, "Dropping relation without object");
                continue;
            }
        };

        let Some((rel_start, rel_end)) =
            evidence_span(chunk, item.evidence.as_deref(), subject, &object, input)
        else {
            debug!(predicate = %property.iri, "Dropping relation without locatable evidence");
            continue;
        };

        let object_key = match &object {
            RelationObject::Entity(id) => id.to_string(),
            RelationObject::Literal(value) => format!("literal:{value}"),
        };
        let id = stable_id(&[
            "relation",
            &input.scope.document_version_id.to_string(),
            &input.scope.ontology_hash,
            &chunk.chunk_index.to_string(),
            &subject.id.to_string(),
            &property.iri,
            &object_key,
        ]);
        if !seen.insert(id) {
            continue;
        }

        out.push(Relation {
            id,
            chunk_index: chunk.chunk_index,
            subject_id: subject.id,
            predicate: property.iri.clone(),
            object,
            confidence,
            start: chunk.start_offset + rel_start,
            end: chunk.start_offset + rel_end,
            text: chunk.text[rel_start..rel_end].to_string(),
            grounding_similarity: None,
            source: source.to_string(),
        });
    }

    out.sort_by(|a, b| (a.start, &a.predicate).cmp(&(b.start, &b.predicate)));
    Ok(out)
}

/// Chunk-relative evidence span for a relation
///
/// The stated evidence text when it can be found, otherwise the smallest
/// span covering the first mention of the subject and of the object.
fn evidence_span(
    chunk: &Chunk,
    evidence: Option<&str>,
    subject: &Entity,
    object: &RelationObject,
    input: &RelationInput,
) -> Option<(usize, usize)> {
    if let Some(text) = evidence.map(str::trim).filter(|t| !t.is_empty()) {
        if let Some(rel) = locate(&chunk.text, text, None) {
            return Some((rel, rel + text.len()));
        }
    }

    let first_mention = |entity: &Entity| {
        input
            .mentions
            .iter()
            .filter(|m| entity.mention_ids.contains(&m.id))
            .filter(|m| m.start >= chunk.start_offset && m.end <= chunk.end_offset())
            .min_by_key(|m| m.start)
            .map(|m| (m.start - chunk.start_offset, m.end - chunk.start_offset))
    };

    let mut spans = vec![first_mention(subject)?];
    match object {
        RelationObject::Entity(id) => {
            let entity = input.entities.iter().find(|e| e.id == *id)?;
            spans.push(first_mention(entity)?);
        }
        RelationObject::Literal(value) => {
            if let Some(rel) = locate(&chunk.text, value, None) {
                spans.push((rel, rel + value.len()));
            }
        }
    }

    let start = spans.iter().map(|s| s.0).min()?;
    let end = spans.iter().map(|s| s.1).max()?;
    Some((start, end))
}

// ============================================================================
// Tests
// ============================================================================
