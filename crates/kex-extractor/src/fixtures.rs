//! Shared test fixtures

use std::sync::Arc;

use kex_core::{Chunk, ExtractionScope};
use kex_ontology::OntologyContext;
use uuid::Uuid;

pub const MEETINGS: &str = r#"
@prefix ex: <http://example.org/meetings#> .
@prefix owl: <http://www.w3.org/2002/07/owl#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
@prefix xsd: <http://www.w3.org/2001/XMLSchema#> .

ex:Agent a owl:Class ; rdfs:label "Agent" .
ex:Person a owl:Class ; rdfs:subClassOf ex:Agent ; rdfs:label "Person" .
ex:Organization a owl:Class ; rdfs:subClassOf ex:Agent ; rdfs:label "Organization" .

ex:meetingWith a owl:ObjectProperty ;
    rdfs:label "meeting with" ;
    rdfs:domain ex:Person ;
    rdfs:range ex:Organization .

ex:memberOf a owl:ObjectProperty ;
    rdfs:domain ex:Agent ;
    rdfs:range ex:Organization .

ex:meetingDate a owl:DatatypeProperty ;
    rdfs:domain ex:Person ;
    rdfs:range xsd:string .

ex:title a owl:DatatypeProperty ;
    rdfs:domain ex:Person ;
    rdfs:range xsd:string .
"#;

pub const PERSON: &str = "http://example.org/meetings#Person";
pub const ORGANIZATION: &str = "http://example.org/meetings#Organization";
pub const AGENT: &str = "http://example.org/meetings#Agent";
pub const MEETING_WITH: &str = "http://example.org/meetings#meetingWith";
pub const MEETING_DATE: &str = "http://example.org/meetings#meetingDate";

pub const SENTENCE: &str = "Jane Doe met with Acme Corp on March 3.";

pub fn ontology() -> OntologyContext {
    OntologyContext::load(MEETINGS).unwrap()
}

pub fn scope() -> Arc<ExtractionScope> {
    Arc::new(ExtractionScope {
        organization_id: Uuid::from_u128(1),
        document_id: Uuid::from_u128(2),
        document_version_id: Uuid::from_u128(3),
        ontology_hash: "test-ontology".to_string(),
        extraction_id: Uuid::from_u128(4),
    })
}

pub fn chunk_at(text: &str, start_offset: usize, chunk_index: usize) -> Chunk {
    Chunk {
        text: text.to_string(),
        start_offset,
        chunk_index,
    }
}
