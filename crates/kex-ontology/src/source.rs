//! Ontology-content providers
//!
//! An [`OntologySource`] returns Turtle text for a registry id; the
//! [`OntologyRegistry`] pairs a source with the [`OntologyCache`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use kex_core::{KexError, Result};

use crate::{OntologyCache, OntologyContext};

/// Provider of ontology source text by registry id
#[async_trait]
pub trait OntologySource: Send + Sync {
    /// Fetch the Turtle text registered under `registry_id`
    async fn fetch(&self, registry_id: &str) -> Result<String>;
}

/// Serves `<root>/<registry_id>.ttl`
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl OntologySource for DirectorySource {
    async fn fetch(&self, registry_id: &str) -> Result<String> {
        if registry_id.is_empty()
            || registry_id.contains(['/', '\\'])
            || registry_id.contains("..")
        {
            return Err(KexError::Validation(format!(
                "invalid ontology id: {registry_id}"
            )));
        }
        let path = self.root.join(format!("{registry_id}.ttl"));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KexError::NotFound(
                format!("ontology {registry_id} ({})", path.display()),
            )),
            Err(e) => Err(KexError::Other(anyhow::Error::new(e).context(format!(
                "failed to read ontology {}",
                path.display()
            )))),
        }
    }
}

/// In-memory registry, for tests and embedded ontologies
#[derive(Default)]
pub struct InMemorySource {
    ontologies: HashMap<String, String>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ontology(mut self, registry_id: impl Into<String>, turtle: impl Into<String>) -> Self {
        self.ontologies.insert(registry_id.into(), turtle.into());
        self
    }
}

#[async_trait]
impl OntologySource for InMemorySource {
    async fn fetch(&self, registry_id: &str) -> Result<String> {
        self.ontologies
            .get(registry_id)
            .cloned()
            .ok_or_else(|| KexError::NotFound(format!("ontology {registry_id}")))
    }
}

/// Fetches ontologies by registry id and parses them through the cache
#[derive(Clone)]
pub struct OntologyRegistry {
    source: Arc<dyn OntologySource>,
    cache: OntologyCache,
}

impl OntologyRegistry {
    pub fn new(source: Arc<dyn OntologySource>) -> Self {
        Self {
            source,
            cache: OntologyCache::default(),
        }
    }

    pub fn with_cache(mut self, cache: OntologyCache) -> Self {
        self.cache = cache;
        self
    }

    /// Fetch and parse the ontology registered under `registry_id`
    pub async fn load(&self, registry_id: &str) -> Result<Arc<OntologyContext>> {
        let text = self.source.fetch(registry_id).await?;
        let ctx = self.cache.get_or_load(&text).await?;
        debug!(registry_id, hash = %ctx.content_hash(), "Ontology loaded");
        Ok(ctx)
    }

    pub fn cache(&self) -> &OntologyCache {
        &self.cache
    }
}
