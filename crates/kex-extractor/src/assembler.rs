//! Graph Assembler
//!
//! Merges per-chunk stage output into one [`KnowledgeGraph`] and attaches
//! an evidence row to every surviving mention and relation.
//!
//! Entity deduplication is chunk-local: two entities merge only when they
//! come from the same chunk, cover exactly the same mention spans, and have
//! the same type set. Identity across chunks is left alone.

use std::collections::{BTreeMap, HashMap, HashSet};

use kex_core::{
    stable_id, Entity, ExtractionScope, KnowledgeGraph, Mention, MentionEvidence, Relation,
    RelationEvidence, RelationObject,
};
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Assembly statistics
// ============================================================================

/// What assembly dropped or merged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub entities_merged: usize,
    pub entities_dropped: usize,
    pub relations_dropped: usize,
    pub mentions_dropped: usize,
}

impl AssemblyReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

// ============================================================================
// Assembler
// ============================================================================

/// Assemble a graph; see [`assemble_with_report`]
pub fn assemble(
    scope: &ExtractionScope,
    mentions: Vec<Mention>,
    entities: Vec<Entity>,
    relations: Vec<Relation>,
) -> KnowledgeGraph {
    assemble_with_report(scope, mentions, entities, relations).0
}

/// Assemble a graph and report what was merged or dropped
///
/// Output is deterministic for a given input set regardless of input order:
/// mentions by offset, entities by first-mention offset, relations by
/// (subject offset, predicate).
pub fn assemble_with_report(
    scope: &ExtractionScope,
    mentions: Vec<Mention>,
    entities: Vec<Entity>,
    relations: Vec<Relation>,
) -> (KnowledgeGraph, AssemblyReport) {
    let mut report = AssemblyReport::default();

    let mention_index: HashMap<Uuid, Mention> = mentions.into_iter().map(|m| (m.id, m)).collect();

    // Entities: resolve mentions, merge exact-span duplicates
    let mut merged: BTreeMap<(usize, Vec<(usize, usize)>, Vec<String>), Entity> = BTreeMap::new();
    let mut remap: HashMap<Uuid, Uuid> = HashMap::new();
    let mut sorted_entities = entities;
    sorted_entities.sort_by_key(|e| e.id);

    for mut entity in sorted_entities {
        entity.mention_ids.retain(|id| mention_index.contains_key(id));
        entity.mention_ids.sort_by_key(|id| {
            let m = &mention_index[id];
            (m.start, m.end, m.id)
        });
        entity.mention_ids.dedup();
        if entity.mention_ids.is_empty() {
            report.entities_dropped += 1;
            continue;
        }

        let spans: Vec<(usize, usize)> = entity
            .mention_ids
            .iter()
            .map(|id| (mention_index[id].start, mention_index[id].end))
            .collect();
        let mut types = entity.types.clone();
        types.sort();
        let key = (entity.chunk_index, spans, types);

        match merged.get_mut(&key) {
            Some(kept) => {
                remap.insert(entity.id, kept.id);
                kept.confidence = kept.confidence.max(entity.confidence);
                for (k, v) in entity.attributes {
                    kept.attributes.entry(k).or_insert(v);
                }
                report.entities_merged += 1;
            }
            None => {
                remap.insert(entity.id, entity.id);
                merged.insert(key, entity);
            }
        }
    }

    let mut entities: Vec<Entity> = merged.into_values().collect();
    let first_offset: HashMap<Uuid, usize> = entities
        .iter()
        .map(|e| (e.id, mention_index[&e.mention_ids[0]].start))
        .collect();

    // Relations: remap endpoints, drop dangling and self edges
    let mut seen = HashSet::new();
    let mut kept_relations = Vec::new();
    for mut relation in relations {
        let Some(&subject) = remap.get(&relation.subject_id) else {
            report.relations_dropped += 1;
            continue;
        };
        relation.subject_id = subject;
        if let RelationObject::Entity(object) = relation.object {
            match remap.get(&object) {
                Some(&object) if object != subject => relation.object = RelationObject::Entity(object),
                _ => {
                    report.relations_dropped += 1;
                    continue;
                }
            }
        }
        if !seen.insert(relation.id) {
            report.relations_dropped += 1;
            continue;
        }
        kept_relations.push(relation);
    }
    kept_relations.sort_by(|a, b| {
        (first_offset[&a.subject_id], &a.predicate, a.start, a.id)
            .cmp(&(first_offset[&b.subject_id], &b.predicate, b.start, b.id))
    });

    // Entity grounding confidence: best similarity of any touching relation
    for entity in &mut entities {
        entity.grounding_confidence = kept_relations
            .iter()
            .filter(|r| r.subject_id == entity.id || r.object.entity_id() == Some(entity.id))
            .filter_map(|r| r.grounding_similarity)
            .reduce(f32::max);
    }
    entities.sort_by_key(|e| (first_offset[&e.id], e.id));

    // Mentions: keep those backing a surviving entity
    let used: HashSet<Uuid> = entities.iter().flat_map(|e| e.mention_ids.iter().copied()).collect();
    report.mentions_dropped = mention_index.len() - used.len();
    let mut mentions: Vec<Mention> = mention_index
        .into_values()
        .filter(|m| used.contains(&m.id))
        .collect();
    mentions.sort_by_key(|m| (m.start, m.end, m.id));

    let mention_evidence = mention_evidence(scope, &entities, &mentions);
    let relation_evidence = kept_relations
        .iter()
        .map(|r| RelationEvidence {
            id: stable_id(&["relation_evidence", &r.id.to_string()]),
            organization_id: scope.organization_id,
            relation_id: r.id,
            document_id: scope.document_id,
            document_version_id: scope.document_version_id,
            start_char: r.start,
            end_char: r.end,
            text: r.text.clone(),
            confidence: Some(r.confidence),
            extraction_id: Some(scope.extraction_id),
            source: r.source.clone(),
        })
        .collect();

    if !report.is_clean() {
        debug!(?report, "Assembly merged or dropped items");
    }

    let graph = KnowledgeGraph {
        organization_id: scope.organization_id,
        document_id: scope.document_id,
        document_version_id: scope.document_version_id,
        extraction_id: scope.extraction_id,
        ontology_hash: scope.ontology_hash.clone(),
        mentions,
        entities,
        relations: kept_relations,
        mention_evidence,
        relation_evidence,
    };
    (graph, report)
}

fn mention_evidence(
    scope: &ExtractionScope,
    entities: &[Entity],
    mentions: &[Mention],
) -> Vec<MentionEvidence> {
    let by_id: HashMap<Uuid, &Mention> = mentions.iter().map(|m| (m.id, m)).collect();
    entities
        .iter()
        .flat_map(|entity| {
            entity.mention_ids.iter().filter_map(|id| by_id.get(id)).map(|m| MentionEvidence {
                id: stable_id(&["mention_evidence", &m.id.to_string(), &entity.id.to_string()]),
                organization_id: scope.organization_id,
                entity_id: entity.id,
                mention_id: m.id,
                document_id: scope.document_id,
                document_version_id: scope.document_version_id,
                start_char: m.start,
                end_char: m.end,
                text: m.text.clone(),
                confidence: Some(m.confidence),
                extraction_id: Some(scope.extraction_id),
                source: m.source.clone(),
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
