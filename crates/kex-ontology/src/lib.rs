//! kex Ontology - Ontology loading and indexing
//!
//! Parses Turtle ontology sources into an immutable [`OntologyContext`] that
//! extraction stages consult to constrain their output to declared classes
//! and properties.

pub mod cache;
pub mod context;
pub mod source;
pub mod turtle;
pub mod vocab;

pub use cache::OntologyCache;
pub use context::{split_camel_case, ClassDef, OntologyContext, PropertyDef, PropertyKind};
pub use source::{DirectorySource, InMemorySource, OntologyRegistry, OntologySource};
