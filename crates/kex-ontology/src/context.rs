//! Ontology Context
//!
//! Read-only index of the classes and properties declared in an ontology
//! source. Built once per source by [`OntologyContext::load`] and shared
//! across concurrent stage invocations without locking.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use kex_core::{content_hash, Result};

use crate::turtle::{self, Term, Triple};
use crate::vocab;

// ============================================================================
// Definitions
// ============================================================================

/// Ontology class definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDef {
    pub iri: String,
    pub label: Option<String>,
    pub comment: Option<String>,
    /// Direct parent classes
    pub parents: Vec<String>,
    /// Properties whose declared domain names this class directly
    pub properties: Vec<String>,
}

impl ClassDef {
    /// Label, falling back to the IRI's local name
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| vocab::local_name(&self.iri).to_string())
    }
}

/// Kind of a property, from its declaration or inferred from its range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Object,
    Datatype,
    Untyped,
}

/// Ontology property definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub iri: String,
    pub label: Option<String>,
    pub comment: Option<String>,
    pub kind: PropertyKind,
    pub domains: Vec<String>,
    pub ranges: Vec<String>,
    pub parents: Vec<String>,
}

impl PropertyDef {
    /// Natural-language label: `rdfs:label`, else the de-camel-cased local name
    pub fn display_label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => split_camel_case(vocab::local_name(&self.iri)),
        }
    }
}

/// `meetingWith` -> `meeting with`, `worksFor_HQ` -> `works for HQ`
pub fn split_camel_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if matches!(c, '_' | '-' | ' ') {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        let boundary = c.is_uppercase()
            && i > 0
            && (chars[i - 1].is_lowercase()
                || chars[i - 1].is_ascii_digit()
                || (chars[i - 1].is_uppercase()
                    && chars.get(i + 1).is_some_and(|n| n.is_lowercase())));
        if boundary && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .into_iter()
        .map(|w| {
            let acronym = w.chars().count() > 1 && w.chars().all(|c| !c.is_lowercase());
            if acronym {
                w
            } else {
                w.to_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Ontology Context
// ============================================================================

/// Immutable index over one ontology source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyContext {
    content_hash: String,
    prefixes: BTreeMap<String, String>,
    classes: BTreeMap<String, ClassDef>,
    properties: BTreeMap<String, PropertyDef>,
    class_names: HashMap<String, Vec<String>>,
    property_names: HashMap<String, Vec<String>>,
}

impl OntologyContext {
    /// Parse Turtle source and index its classes and properties
    pub fn load(source: &str) -> Result<Self> {
        let doc = turtle::parse(source)?;
        Ok(Self::from_triples(
            content_hash(source),
            doc.prefixes,
            &doc.triples,
        ))
    }

    fn from_triples(
        content_hash: String,
        prefixes: BTreeMap<String, String>,
        triples: &[Triple],
    ) -> Self {
        let mut by_subject: HashMap<&Term, Vec<(&str, &Term)>> = HashMap::new();
        for t in triples {
            by_subject
                .entry(&t.subject)
                .or_default()
                .push((t.predicate.as_str(), &t.object));
        }

        let mut class_iris = BTreeSet::new();
        let mut property_iris = BTreeSet::new();
        for t in triples {
            let Some(subject) = t.subject.as_iri() else {
                continue;
            };
            match (t.predicate.as_str(), t.object.as_iri()) {
                (vocab::RDF_TYPE, Some(vocab::RDFS_CLASS | vocab::OWL_CLASS)) => {
                    class_iris.insert(subject.to_string());
                }
                (
                    vocab::RDF_TYPE,
                    Some(
                        vocab::RDF_PROPERTY
                        | vocab::OWL_OBJECT_PROPERTY
                        | vocab::OWL_DATATYPE_PROPERTY,
                    ),
                ) => {
                    property_iris.insert(subject.to_string());
                }
                (vocab::RDFS_SUB_CLASS_OF, _) => {
                    class_iris.insert(subject.to_string());
                }
                (vocab::RDFS_DOMAIN | vocab::RDFS_RANGE | vocab::RDFS_SUB_PROPERTY_OF, _) => {
                    property_iris.insert(subject.to_string());
                }
                _ => {}
            }
        }

        let mut properties = BTreeMap::new();
        for iri in &property_iris {
            let subject = Term::Iri(iri.clone());
            let facts = by_subject.get(&subject).map(Vec::as_slice).unwrap_or(&[]);
            let declared_kind = facts.iter().find_map(|(p, o)| match (*p, o.as_iri()) {
                (vocab::RDF_TYPE, Some(vocab::OWL_OBJECT_PROPERTY)) => Some(PropertyKind::Object),
                (vocab::RDF_TYPE, Some(vocab::OWL_DATATYPE_PROPERTY)) => {
                    Some(PropertyKind::Datatype)
                }
                _ => None,
            });
            let domains = class_refs(facts, vocab::RDFS_DOMAIN, &by_subject);
            let ranges = class_refs(facts, vocab::RDFS_RANGE, &by_subject);
            let kind = declared_kind.unwrap_or_else(|| {
                if ranges.is_empty() {
                    PropertyKind::Untyped
                } else if ranges.iter().all(|r| vocab::is_datatype(r)) {
                    PropertyKind::Datatype
                } else {
                    PropertyKind::Object
                }
            });
            properties.insert(
                iri.clone(),
                PropertyDef {
                    iri: iri.clone(),
                    label: label_of(facts),
                    comment: literal_of(facts, vocab::RDFS_COMMENT),
                    kind,
                    domains,
                    ranges,
                    parents: iri_objects(facts, vocab::RDFS_SUB_PROPERTY_OF, iri),
                },
            );
        }

        let mut classes = BTreeMap::new();
        for iri in &class_iris {
            let subject = Term::Iri(iri.clone());
            let facts = by_subject.get(&subject).map(Vec::as_slice).unwrap_or(&[]);
            let parents = iri_objects(facts, vocab::RDFS_SUB_CLASS_OF, iri)
                .into_iter()
                .filter(|p| p != vocab::OWL_THING && p != vocab::RDFS_RESOURCE)
                .collect();
            let direct_properties = properties
                .values()
                .filter(|p: &&PropertyDef| p.domains.iter().any(|d| d == iri))
                .map(|p| p.iri.clone())
                .collect();
            classes.insert(
                iri.clone(),
                ClassDef {
                    iri: iri.clone(),
                    label: label_of(facts),
                    comment: literal_of(facts, vocab::RDFS_COMMENT),
                    parents,
                    properties: direct_properties,
                },
            );
        }

        let class_names = name_index(classes.values().map(|c| (&c.iri, c.label.as_deref())));
        let property_names =
            name_index(properties.values().map(|p| (&p.iri, p.label.as_deref())));

        Self {
            content_hash,
            prefixes,
            classes,
            properties,
            class_names,
            property_names,
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// SHA-256 of the source text
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn prefixes(&self) -> &BTreeMap<String, String> {
        &self.prefixes
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values()
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.values()
    }

    pub fn find_class(&self, iri: &str) -> Option<&ClassDef> {
        self.classes.get(iri)
    }

    pub fn find_property(&self, iri: &str) -> Option<&PropertyDef> {
        self.properties.get(iri)
    }

    /// Properties applicable to `iri`: those whose domain names the class or
    /// one of its ancestors, plus properties without a domain
    pub fn get_properties_for_class(&self, iri: &str) -> Vec<&PropertyDef> {
        if !self.classes.contains_key(iri) {
            return Vec::new();
        }
        let mut lineage: HashSet<String> = self.get_ancestors(iri).into_iter().collect();
        lineage.insert(iri.to_string());

        self.properties
            .values()
            .filter(|p| p.domains.is_empty() || p.domains.iter().any(|d| lineage.contains(d)))
            .collect()
    }

    /// Reflexive, transitive subclass test
    pub fn is_sub_class_of(&self, a: &str, b: &str) -> bool {
        a == b || self.get_ancestors(a).iter().any(|x| x == b)
    }

    /// All transitive parents of `iri`, breadth-first, excluding `iri`
    ///
    /// Cycles in `rdfs:subClassOf` terminate.
    pub fn get_ancestors(&self, iri: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::from([iri]);
        let mut queue: VecDeque<&str> = VecDeque::from([iri]);
        let mut ancestors = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(class) = self.classes.get(current) else {
                continue;
            };
            for parent in &class.parents {
                if seen.insert(parent.as_str()) {
                    ancestors.push(parent.clone());
                    queue.push_back(parent.as_str());
                }
            }
        }
        ancestors
    }

    /// Drop types that are strict ancestors of another type in the set
    pub fn most_specific(&self, types: &[String]) -> Vec<String> {
        let mut out: Vec<String> = types
            .iter()
            .filter(|t| {
                !types
                    .iter()
                    .any(|u| u != *t && self.is_sub_class_of(u, t))
            })
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }

    // ------------------------------------------------------------------
    // Name resolution
    // ------------------------------------------------------------------

    /// Resolve a full IRI, prefixed name, or unambiguous local name/label
    pub fn resolve_class(&self, name: &str) -> Option<&ClassDef> {
        resolve(name, &self.classes, &self.class_names, &self.prefixes)
    }

    /// Resolve a full IRI, prefixed name, or unambiguous local name/label
    pub fn resolve_property(&self, name: &str) -> Option<&PropertyDef> {
        resolve(name, &self.properties, &self.property_names, &self.prefixes)
    }

    /// Shorten `iri` with a declared prefix when one matches
    pub fn compact(&self, iri: &str) -> String {
        self.prefixes
            .iter()
            .filter(|(_, ns)| !ns.is_empty() && iri.starts_with(ns.as_str()))
            .max_by_key(|(_, ns)| ns.len())
            .map(|(prefix, ns)| format!("{prefix}:{}", &iri[ns.len()..]))
            .unwrap_or_else(|| iri.to_string())
    }

    // ------------------------------------------------------------------
    // Domain / range checks
    // ------------------------------------------------------------------

    /// Whether an entity with `subject_types` may be the subject of `property`
    pub fn domain_allows(&self, property: &PropertyDef, subject_types: &[String]) -> bool {
        property.domains.is_empty()
            || subject_types
                .iter()
                .any(|t| property.domains.iter().any(|d| self.is_sub_class_of(t, d)))
    }

    /// Whether an entity with `object_types` may be the object of `property`
    pub fn range_allows_entity(&self, property: &PropertyDef, object_types: &[String]) -> bool {
        if property.kind == PropertyKind::Datatype {
            return false;
        }
        let class_ranges: Vec<&String> = property
            .ranges
            .iter()
            .filter(|r| !vocab::is_datatype(r))
            .collect();
        if class_ranges.is_empty() {
            return property.ranges.is_empty();
        }
        object_types
            .iter()
            .any(|t| class_ranges.iter().any(|r| self.is_sub_class_of(t, r)))
    }

    /// Whether `property` may take a literal object
    pub fn range_allows_literal(&self, property: &PropertyDef) -> bool {
        match property.kind {
            PropertyKind::Object => false,
            PropertyKind::Datatype => true,
            PropertyKind::Untyped => {
                property.ranges.is_empty() || property.ranges.iter().any(|r| vocab::is_datatype(r))
            }
        }
    }

    /// Compact listing of classes and properties for prompts
    pub fn schema_summary(&self) -> String {
        let mut out = String::from("Classes:\n");
        for class in self.classes.values() {
            out.push_str(&format!("- {}", self.compact(&class.iri)));
            if !class.parents.is_empty() {
                let parents: Vec<String> = class.parents.iter().map(|p| self.compact(p)).collect();
                out.push_str(&format!(" (subclass of {})", parents.join(", ")));
            }
            if let Some(comment) = &class.comment {
                out.push_str(&format!(": {comment}"));
            }
            out.push('\n');
        }
        out.push_str("Properties:\n");
        for property in self.properties.values() {
            let side = |v: &[String]| {
                if v.is_empty() {
                    "Any".to_string()
                } else {
                    v.iter().map(|x| self.compact(x)).collect::<Vec<_>>().join(" | ")
                }
            };
            out.push_str(&format!(
                "- {}: {} -> {}\n",
                self.compact(&property.iri),
                side(&property.domains),
                side(&property.ranges)
            ));
        }
        out
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn resolve<'a, T>(
    name: &str,
    defs: &'a BTreeMap<String, T>,
    names: &HashMap<String, Vec<String>>,
    prefixes: &BTreeMap<String, String>,
) -> Option<&'a T> {
    let name = name.trim();
    if let Some(def) = defs.get(name) {
        return Some(def);
    }
    if let Some((prefix, local)) = name.split_once(':') {
        if let Some(ns) = prefixes.get(prefix) {
            if let Some(def) = defs.get(&format!("{ns}{local}")) {
                return Some(def);
            }
        }
    }
    match names.get(&name.to_lowercase()) {
        Some(iris) if iris.len() == 1 => defs.get(&iris[0]),
        _ => None,
    }
}

fn name_index<'a>(
    entries: impl Iterator<Item = (&'a String, Option<&'a str>)>,
) -> HashMap<String, Vec<String>> {
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    for (iri, label) in entries {
        let mut keys = vec![vocab::local_name(iri).to_lowercase()];
        if let Some(label) = label {
            keys.push(label.to_lowercase());
        }
        keys.dedup();
        for key in keys {
            let iris = index.entry(key).or_default();
            if !iris.contains(iri) {
                iris.push(iri.clone());
            }
        }
    }
    index
}

fn label_of(facts: &[(&str, &Term)]) -> Option<String> {
    let labels: Vec<(&str, Option<&str>)> = facts
        .iter()
        .filter(|(p, _)| *p == vocab::RDFS_LABEL || *p == vocab::SKOS_PREF_LABEL)
        .filter_map(|(_, o)| match o {
            Term::Literal { value, lang, .. } => Some((value.as_str(), lang.as_deref())),
            _ => None,
        })
        .collect();

    labels
        .iter()
        .find(|(_, lang)| lang.map_or(true, |l| l == "en" || l.starts_with("en-")))
        .or_else(|| labels.first())
        .map(|(value, _)| value.to_string())
}

fn literal_of(facts: &[(&str, &Term)], predicate: &str) -> Option<String> {
    facts
        .iter()
        .filter(|(p, _)| *p == predicate)
        .find_map(|(_, o)| o.as_literal().map(str::to_string))
}

fn iri_objects(facts: &[(&str, &Term)], predicate: &str, exclude: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for (p, o) in facts {
        if *p != predicate {
            continue;
        }
        if let Some(iri) = o.as_iri() {
            if iri != exclude && !out.iter().any(|x| x == iri) {
                out.push(iri.to_string());
            }
        }
    }
    out
}

/// Domain/range objects: plain IRIs or blank nodes with `owl:unionOf` lists
fn class_refs(
    facts: &[(&str, &Term)],
    predicate: &str,
    by_subject: &HashMap<&Term, Vec<(&str, &Term)>>,
) -> Vec<String> {
    let mut out = Vec::new();
    for (p, o) in facts {
        if *p != predicate {
            continue;
        }
        match o {
            Term::Iri(iri) => out.push(iri.clone()),
            Term::Blank(_) => {
                let union = by_subject
                    .get(*o)
                    .and_then(|f| f.iter().find(|(p, _)| *p == vocab::OWL_UNION_OF))
                    .map(|(_, list)| *list);
                if let Some(list) = union {
                    out.extend(list_items(list, by_subject));
                }
            }
            Term::Literal { .. } => {}
        }
    }
    out.retain(|iri| iri != vocab::OWL_THING && iri != vocab::RDFS_RESOURCE);
    out.sort();
    out.dedup();
    out
}

fn list_items(head: &Term, by_subject: &HashMap<&Term, Vec<(&str, &Term)>>) -> Vec<String> {
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut node = head;
    while let Term::Blank(_) = node {
        if !seen.insert(node) {
            break;
        }
        let Some(facts) = by_subject.get(node) else {
            break;
        };
        if let Some(iri) = facts
            .iter()
            .find(|(p, _)| *p == vocab::RDF_FIRST)
            .and_then(|(_, o)| o.as_iri())
        {
            items.push(iri.to_string());
        }
        match facts.iter().find(|(p, _)| *p == vocab::RDF_REST) {
            Some((_, rest)) => node = *rest,
            None => break,
        }
    }
    items
}

// ============================================================================
// Tests
// ============================================================================
